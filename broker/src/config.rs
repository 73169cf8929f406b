//! Broker-wide settings.

use std::time::Duration;

/// Broker-wide settings. The binary fills this from its command line;
/// tests use the defaults.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Identity baked into the `Name` tag of every instance
    pub broker_id: String,
    /// Account owning the base machine images
    pub image_owner_id: String,
    /// Key pair installed on created instances
    pub key_pair: String,
    /// Security group created instances join
    pub security_group: String,
    /// Boot payload for created instances
    pub user_data: Option<String>,
    /// Scheduler tick of the run loop
    pub poll_interval: Duration,
    /// Bound on concurrent cross-region pool operations
    pub pool_workers: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: "1".to_string(),
            image_owner_id: "595879546273".to_string(),
            key_pair: "loads".to_string(),
            security_group: "loads".to_string(),
            user_data: None,
            poll_interval: Duration::from_millis(1500),
            pool_workers: 15,
        }
    }
}
