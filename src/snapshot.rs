use serde_json::Value;

use crate::error::{Result, SupervisionError};

/// A point-in-time, read-only view of an agency subtree.
///
/// The supervisor refreshes one snapshot per tick; the health checker and
/// every job take it by shared borrow and never outlive it. Key order of
/// the agency is preserved, so `children` iterates in a stable order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    root: Value,
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl Snapshot {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Look up the node at `path`, if present.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for seg in segments(path) {
            node = node.as_object()?.get(seg)?;
        }
        Some(node)
    }

    pub fn get(&self, path: &str) -> Result<&Value> {
        self.lookup(path)
            .ok_or_else(|| SupervisionError::NotFound(path.to_string()))
    }

    pub fn has(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// How many leading segments of `path` resolve. A full match returns
    /// the segment count, a completely absent path returns 0.
    pub fn exists(&self, path: &str) -> usize {
        let mut node = &self.root;
        let mut depth = 0;
        for seg in segments(path) {
            match node.as_object().and_then(|o| o.get(seg)) {
                Some(child) => {
                    node = child;
                    depth += 1;
                }
                None => break,
            }
        }
        depth
    }

    /// Named children of the object at `path`, in agency key order.
    /// Empty if the path is absent or not an object.
    pub fn children<'a>(&'a self, path: &str) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        self.lookup(path)
            .and_then(Value::as_object)
            .into_iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn string_at(&self, path: &str) -> Option<&str> {
        self.lookup(path).and_then(Value::as_str)
    }

    pub fn uint_at(&self, path: &str) -> Option<u64> {
        self.lookup(path).and_then(Value::as_u64)
    }

    pub fn bool_at(&self, path: &str) -> Option<bool> {
        self.lookup(path).and_then(Value::as_bool)
    }

    pub fn array_at(&self, path: &str) -> Option<&Vec<Value>> {
        self.lookup(path).and_then(Value::as_array)
    }

    /// Array of strings at `path`; non-string elements are skipped.
    pub fn string_array_at(&self, path: &str) -> Option<Vec<String>> {
        self.array_at(path).map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Snapshot {
        Snapshot::new(json!({
            "Plan": {
                "DBServers": {"PRMR-a": {}, "PRMR-b": {}},
                "Version": 7,
                "Collections": {
                    "db": {
                        "c1": {
                            "replicationFactor": 3,
                            "shards": {"s1": ["PRMR-a", "PRMR-b"]}
                        }
                    }
                }
            },
            "Shutdown": true
        }))
    }

    #[test]
    fn test_lookup_and_typed_accessors() {
        let snap = sample();
        assert_eq!(snap.uint_at("/Plan/Version"), Some(7));
        assert_eq!(snap.bool_at("/Shutdown"), Some(true));
        assert_eq!(
            snap.uint_at("/Plan/Collections/db/c1/replicationFactor"),
            Some(3)
        );
        assert!(snap.lookup("/Plan/Nope").is_none());
        assert!(snap.get("/Plan/Nope").is_err());
    }

    #[test]
    fn test_exists_depth() {
        let snap = sample();
        assert_eq!(snap.exists("/Plan/DBServers/PRMR-a"), 3);
        assert_eq!(snap.exists("/Plan/DBServers/PRMR-z"), 2);
        assert_eq!(snap.exists("/Nope/Nope"), 0);
    }

    #[test]
    fn test_children_order() {
        let snap = sample();
        let names: Vec<&str> = snap.children("/Plan/DBServers").map(|(k, _)| k).collect();
        assert_eq!(names, vec!["PRMR-a", "PRMR-b"]);
        assert_eq!(snap.children("/Plan/Version").count(), 0);
    }

    #[test]
    fn test_string_array() {
        let snap = sample();
        assert_eq!(
            snap.string_array_at("/Plan/Collections/db/c1/shards/s1"),
            Some(vec!["PRMR-a".to_string(), "PRMR-b".to_string()])
        );
    }
}
