//! Initial-state loader: a JSON or TOML file enumerating projects,
//! plans, and steps, reconciled against the repository at startup.
//! Existing plans (matched by name within their project) are
//! preserved unchanged; new projects and plans are added.

use std::path::Path;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use tracing::info;
use uuid::Uuid;

use crate::db::{DbError, Plan, Project, Repository};

/// Initial-state loading errors
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum StateError {
    #[snafu(display("Failed to read state file {:?}", path))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse JSON state file {:?}", path))]
    ParseJson {
        path: std::path::PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("Failed to parse TOML state file {:?}", path))]
    ParseToml {
        path: std::path::PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to store initial state"))]
    Store { source: DbError },
}

#[derive(Deserialize, Debug)]
struct StateFile {
    #[serde(default)]
    projects: Vec<Project>,
}

/// Parse the state file at `path`; the extension picks the format
pub fn load_state_file(path: &Path) -> Result<Vec<Project>, StateError> {
    let raw = std::fs::read_to_string(path).context(ReadFile { path })?;
    let state: StateFile = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&raw).context(ParseToml { path })?,
        _ => serde_json::from_str(&raw).context(ParseJson { path })?,
    };
    Ok(state.projects)
}

/// Reconcile `projects` with the repository
pub async fn reconcile(
    repository: &dyn Repository,
    projects: Vec<Project>,
) -> Result<(), StateError> {
    let existing = repository.projects().await.context(Store)?;
    for mut project in projects {
        match existing.iter().find(|candidate| candidate.name == project.name) {
            None => {
                info!("Seeding project '{}'", project.name);
                let _ = repository.create_project(project).await.context(Store)?;
            }
            Some(current) => {
                let new_plans: Vec<Plan> = project
                    .plans
                    .drain(..)
                    .filter(|plan| {
                        !current
                            .plans
                            .iter()
                            .any(|existing_plan| existing_plan.name == plan.name)
                    })
                    .collect();
                if new_plans.is_empty() {
                    continue;
                }
                info!(
                    "Adding {} plan(s) to project '{}'",
                    new_plans.len(),
                    project.name
                );
                let mut updated = current.clone();
                for mut plan in new_plans {
                    if plan.uuid.is_empty() {
                        plan.uuid = Uuid::new_v4().to_string();
                    }
                    for step in &mut plan.steps {
                        if step.uuid.is_empty() {
                            step.uuid = Uuid::new_v4().to_string();
                        }
                    }
                    updated.plans.push(plan);
                }
                repository.delete_project(&current.uuid).await.context(Store)?;
                let _ = repository.create_project(updated).await.context(Store)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemRepository;
    use crate::testing;

    #[tokio::test]
    async fn existing_plans_are_preserved() {
        let repo = MemRepository::new();
        let seeded = repo
            .create_project(testing::project(
                "proj",
                vec![testing::plan("existing", vec![testing::step("img:v1", 1)])],
            ))
            .await
            .unwrap();
        let original_uuid = seeded.plans[0].uuid.clone();

        let incoming = vec![testing::project(
            "proj",
            vec![
                testing::plan("existing", vec![]),
                testing::plan("fresh", vec![testing::step("img:v2", 2)]),
            ],
        )];
        reconcile(&repo, incoming).await.unwrap();

        let projects = repo.projects().await.unwrap();
        assert_eq!(projects.len(), 1);
        let plans = &projects[0].plans;
        assert_eq!(plans.len(), 2);
        let existing = plans.iter().find(|plan| plan.name == "existing").unwrap();
        assert_eq!(existing.uuid, original_uuid);
        assert_eq!(existing.steps.len(), 1);
        assert!(plans.iter().any(|plan| plan.name == "fresh"));
    }

    #[tokio::test]
    async fn json_round_trips_modulo_assigned_uuids() {
        let json = serde_json::json!({
            "projects": [{
                "name": "proj",
                "plans": [{
                    "name": "p1",
                    "steps": [{
                        "instance_region": "us-west-2",
                        "instance_type": "t1.micro",
                        "instance_count": 2,
                        "container_name": "img:v1",
                        "run_max_time": 5
                    }]
                }]
            }]
        });
        let state: StateFile = serde_json::from_value(json).unwrap();
        let repo = MemRepository::new();
        reconcile(&repo, state.projects).await.unwrap();
        let stored = repo.projects().await.unwrap();
        let plan = &stored[0].plans[0];
        assert!(!plan.uuid.is_empty());
        assert_eq!(plan.steps[0].instance_count, 2);
        assert_eq!(plan.steps[0].run_delay, 0);
        assert!(plan.enabled);
    }
}
