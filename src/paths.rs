//! Agency namespace layout. All paths are relative to the configured
//! agency prefix; `absolute` joins them for writes.

pub const SYNC_SERVER_STATES: &str = "/Sync/ServerStates";
pub const SYNC_LATEST_ID: &str = "/Sync/LatestID";

pub const HEALTH: &str = "/Supervision/Health";
pub const BLOCKED_SERVERS: &str = "/Supervision/DBServers";
pub const BLOCKED_SHARDS: &str = "/Supervision/Shards";

pub const PLAN_DB_SERVERS: &str = "/Plan/DBServers";
pub const PLAN_COORDINATORS: &str = "/Plan/Coordinators";
pub const PLAN_COLLECTIONS: &str = "/Plan/Collections";
pub const PLAN_VERSION: &str = "/Plan/Version";

pub const CURRENT_COLLECTIONS: &str = "/Current/Collections";
pub const CURRENT_SERVERS_REGISTERED: &str = "/Current/ServersRegistered";
pub const FOXXMASTER: &str = "/Current/Foxxmaster";

pub const TARGET_TODO: &str = "/Target/ToDo";
pub const TARGET_PENDING: &str = "/Target/Pending";
pub const TARGET_FINISHED: &str = "/Target/Finished";
pub const TARGET_FAILED: &str = "/Target/Failed";
pub const TARGET_FAILED_SERVERS: &str = "/Target/FailedServers";
pub const TARGET_CLEANED_SERVERS: &str = "/Target/CleanedServers";
pub const TARGET_NUM_DB_SERVERS: &str = "/Target/NumberOfDBServers";
pub const TARGET_SHORT_ID: &str = "/Target/MapUniqueToShortID";

pub const SHUTDOWN: &str = "/Shutdown";

pub fn join(base: &str, key: &str) -> String {
    format!("{}/{}", base, key)
}

pub fn absolute(prefix: &str, path: &str) -> String {
    format!("{}{}", prefix, path)
}

pub fn plan_shard(database: &str, collection: &str, shard: &str) -> String {
    format!(
        "{}/{}/{}/shards/{}",
        PLAN_COLLECTIONS, database, collection, shard
    )
}

pub fn plan_collection(database: &str, collection: &str) -> String {
    format!("{}/{}/{}", PLAN_COLLECTIONS, database, collection)
}

pub fn current_shard_servers(database: &str, collection: &str, shard: &str) -> String {
    format!(
        "{}/{}/{}/{}/servers",
        CURRENT_COLLECTIONS, database, collection, shard
    )
}

pub fn health_status(server: &str) -> String {
    format!("{}/{}/Status", HEALTH, server)
}

pub fn short_name(server: &str) -> String {
    format!("{}/{}/ShortName", TARGET_SHORT_ID, server)
}

/// Server role, inferred from the ID prefix convention. The two-letter
/// discriminant is the only significant part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    DbServer,
    Coordinator,
}

impl ServerRole {
    pub fn from_id(server_id: &str) -> Option<Self> {
        match server_id.get(0..2) {
            Some("PR") => Some(ServerRole::DbServer),
            Some("CR") => Some(ServerRole::Coordinator),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::DbServer => "DBServer",
            ServerRole::Coordinator => "Coordinator",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_id() {
        assert_eq!(ServerRole::from_id("PRMR-abc"), Some(ServerRole::DbServer));
        assert_eq!(
            ServerRole::from_id("CRDN-xyz"),
            Some(ServerRole::Coordinator)
        );
        assert_eq!(ServerRole::from_id("X"), None);
    }

    #[test]
    fn test_path_builders() {
        assert_eq!(
            plan_shard("db", "col", "s1"),
            "/Plan/Collections/db/col/shards/s1"
        );
        assert_eq!(
            current_shard_servers("db", "col", "s1"),
            "/Current/Collections/db/col/s1/servers"
        );
        assert_eq!(absolute("/arango", "/Plan/Version"), "/arango/Plan/Version");
    }
}
