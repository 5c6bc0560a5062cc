use std::time::Duration;

/// Runtime configuration of the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisionConfig {
    /// Tick period of the control loop.
    pub frequency: Duration,
    /// Minimum time before a BAD server may be failed, and minimum time
    /// after leadership acquisition before any status mutation.
    pub grace_period: Duration,
    /// All agency paths are relative to this prefix.
    pub agency_prefix: String,
    /// Seed for replacement-server selection. When set, every tick draws
    /// from a freshly seeded generator so test runs are reproducible.
    pub random_seed: Option<u64>,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
            agency_prefix: "/arango".to_string(),
            random_seed: None,
        }
    }
}

impl SupervisionConfig {
    pub fn new(agency_prefix: impl Into<String>) -> Self {
        Self {
            agency_prefix: agency_prefix.into(),
            ..Default::default()
        }
    }

    pub fn with_frequency(mut self, frequency: Duration) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }
}
