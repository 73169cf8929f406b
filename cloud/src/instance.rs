use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{EnumString, ToString};

use crate::tags;
use crate::Region;

/// Window during which a Pending instance still counts as usable.
/// Anything Pending for longer is considered stalled and left for the
/// reaper.
pub const PENDING_GRACE: i64 = 120;

/// Identifier the IaaS assigned to one machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        InstanceId(id.to_string())
    }
}

/// Lifecycle state of one machine as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, ToString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

/// One IaaS machine as the broker sees it.
///
/// This is a snapshot: `state` is whatever the last describe call
/// returned, not a live view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInstance {
    /// IaaS-assigned identifier
    pub id: InstanceId,
    /// Region the machine lives in
    pub region: Region,
    /// Machine type, e.g. `t1.micro`
    pub instance_type: String,
    /// Public address, present once Running
    pub public_ip: Option<String>,
    /// Private address, present once Running
    pub private_ip: Option<String>,
    /// Last observed lifecycle state
    pub state: InstanceState,
    /// When the IaaS launched the machine
    pub launch_time: Option<DateTime<Utc>>,
    /// Tags attached to the machine; these are the recovery protocol
    pub tags: HashMap<String, String>,
}

impl CloudInstance {
    /// Look up one tag value
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|value| value.as_str())
    }

    /// An instance is allocated iff it carries both the run and step
    /// tags
    pub fn is_allocated(&self) -> bool {
        self.tag(tags::RUN_ID).map_or(false, |v| !v.is_empty())
            && self.tag(tags::STEP_ID).map_or(false, |v| !v.is_empty())
    }

    /// Whether the instance is usable for allocation at `now`: Running,
    /// or Pending for strictly less than the grace window.
    pub fn available(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            InstanceState::Running => true,
            InstanceState::Pending => match self.launch_time {
                Some(launched) => now - launched < Duration::seconds(PENDING_GRACE),
                None => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(state: InstanceState, pending_for: i64) -> CloudInstance {
        CloudInstance {
            id: InstanceId::from("i-0123456789abcdef0"),
            region: Region::UsWest2,
            instance_type: "t1.micro".to_string(),
            public_ip: None,
            private_ip: None,
            state,
            launch_time: Some(Utc::now() - Duration::seconds(pending_for)),
            tags: HashMap::new(),
        }
    }

    #[test]
    fn running_is_available() {
        assert!(instance(InstanceState::Running, 9999).available(Utc::now()));
    }

    #[test]
    fn fresh_pending_is_available() {
        assert!(instance(InstanceState::Pending, 30).available(Utc::now()));
    }

    #[test]
    fn pending_at_exactly_the_grace_window_is_not() {
        let now = Utc::now();
        let mut inst = instance(InstanceState::Pending, 0);
        inst.launch_time = Some(now - Duration::seconds(PENDING_GRACE));
        assert!(!inst.available(now));
    }

    #[test]
    fn terminal_states_are_not_available() {
        for state in &[
            InstanceState::Stopping,
            InstanceState::Stopped,
            InstanceState::Terminated,
        ] {
            assert!(!instance(*state, 0).available(Utc::now()));
        }
    }

    #[test]
    fn allocation_needs_both_tags() {
        let mut inst = instance(InstanceState::Running, 0);
        assert!(!inst.is_allocated());
        inst.tags.insert(tags::RUN_ID.to_string(), "r".to_string());
        assert!(!inst.is_allocated());
        inst.tags.insert(tags::STEP_ID.to_string(), "s".to_string());
        assert!(inst.is_allocated());
        inst.tags.insert(tags::STEP_ID.to_string(), String::new());
        assert!(!inst.is_allocated());
    }
}
