//! The tag protocol.
//!
//! The IaaS tag store is the authoritative recovery log: every piece
//! of instance ownership state must round-trip through these tags,
//! otherwise it cannot survive a broker restart. Spelling matters.

/// Tag carrying the broker fleet name
pub const NAME: &str = "Name";
/// Tag marking an instance as belonging to this system
pub const PROJECT: &str = "Project";
/// Value of the [`PROJECT`] tag
pub const PROJECT_VALUE: &str = "loads";
/// Tag carrying the run an instance is allocated to
pub const RUN_ID: &str = "RunId";
/// Tag carrying the step record an instance is allocated to
pub const STEP_ID: &str = "Uuid";
/// Optional tag carrying the submitting owner
pub const OWNER: &str = "Owner";

/// Fleet name for a broker, `loads-<brokerId>[-<owner>]`
pub fn fleet_name(broker_id: &str, owner: Option<&str>) -> String {
    match owner {
        Some(owner) if !owner.is_empty() => format!("loads-{}-{}", broker_id, owner),
        _ => format!("loads-{}", broker_id),
    }
}

/// The full tag set stamped onto every allocated instance
pub fn allocation(
    broker_id: &str,
    run_id: &str,
    step_id: &str,
    owner: Option<&str>,
) -> Vec<(String, String)> {
    let mut tags = vec![
        (NAME.to_string(), fleet_name(broker_id, owner)),
        (PROJECT.to_string(), PROJECT_VALUE.to_string()),
        (RUN_ID.to_string(), run_id.to_string()),
        (STEP_ID.to_string(), step_id.to_string()),
    ];
    if let Some(owner) = owner {
        if !owner.is_empty() {
            tags.push((OWNER.to_string(), owner.to_string()));
        }
    }
    tags
}

/// Tags written back when a collection is released: clearing the run
/// and step tags returns the instance to the free pool
pub fn release() -> Vec<(String, String)> {
    vec![
        (RUN_ID.to_string(), String::new()),
        (STEP_ID.to_string(), String::new()),
    ]
}

/// Describe filters matching every instance this broker has ever
/// tagged
pub fn fleet_filters(broker_id: &str) -> Vec<(String, Vec<String>)> {
    vec![
        (
            format!("tag:{}", NAME),
            vec![format!("{}*", fleet_name(broker_id, None))],
        ),
        (
            format!("tag:{}", PROJECT),
            vec![PROJECT_VALUE.to_string()],
        ),
    ]
}

/// Describe filter selecting a set of instances by id
pub fn id_filter(ids: &[crate::InstanceId]) -> Vec<(String, Vec<String>)> {
    vec![(
        "instance-id".to_string(),
        ids.iter().map(|id| id.0.clone()).collect(),
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fleet_name_includes_owner_when_present() {
        assert_eq!(fleet_name("b1", None), "loads-b1");
        assert_eq!(fleet_name("b1", Some("")), "loads-b1");
        assert_eq!(fleet_name("b1", Some("alex")), "loads-b1-alex");
    }

    #[test]
    fn allocation_tags_round_trip_through_a_tag_map() {
        let tags = allocation("b1", "run-1", "step-1", Some("alex"));
        let map: std::collections::HashMap<_, _> = tags.into_iter().collect();
        assert_eq!(map[RUN_ID], "run-1");
        assert_eq!(map[STEP_ID], "step-1");
        assert_eq!(map[PROJECT], PROJECT_VALUE);
        assert_eq!(map[OWNER], "alex");
    }
}
