//! Plans, runs, and the repository they live in.
//!
//! The repository is a capability: the orchestrator only commits
//! whole entities through it, never reaches into storage. The
//! in-memory implementation here is the system of record for a single
//! broker process; the tag store on the IaaS side is what survives a
//! restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use strum_macros::{EnumString, ToString};
use tokio::sync::Mutex;
use uuid::Uuid;

use cloud::Region;

/// Project identifier
pub type ProjectId = String;
/// Plan identifier
pub type PlanId = String;
/// Step identifier; doubles as the `Uuid` instance tag
pub type StepId = String;
/// Run identifier; doubles as the `RunId` instance tag
pub type RunId = String;

/// Repository errors
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum DbError {
    #[snafu(display("A project named '{}' already exists", name))]
    DuplicateProject { name: String },
}

/// Named grouping of plans
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Project {
    /// Server-assigned identifier
    #[serde(default)]
    pub uuid: ProjectId,
    /// Project name, unique per repository
    pub name: String,
    /// The plans this project owns
    #[serde(default)]
    pub plans: Vec<Plan>,
}

/// Immutable, re-runnable test description
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Plan {
    /// Server-assigned identifier
    #[serde(default)]
    pub uuid: PlanId,
    /// Plan name, unique within its project
    pub name: String,
    /// Disabled plans cannot be orchestrated
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ordered steps
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One homogeneous fleet-slice inside a plan
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Step {
    /// Server-assigned identifier
    #[serde(default)]
    pub uuid: StepId,
    /// Region the step's instances are allocated in
    pub instance_region: Region,
    /// Machine type for every instance of the step
    pub instance_type: String,
    /// Fleet size
    pub instance_count: u32,
    /// Container image to run
    pub container_name: String,
    /// Archive URL to import the image from; pull by name when unset
    #[serde(default)]
    pub container_url: Option<String>,
    /// Environment for the step container; values may reference
    /// `$var`s from the run environment
    #[serde(default)]
    pub environment_data: BTreeMap<String, String>,
    /// Extra command arguments, `$var` references allowed
    #[serde(default)]
    pub additional_command_args: Option<String>,
    /// Host port to `container[/proto]` bindings
    #[serde(default)]
    pub port_mapping: BTreeMap<String, String>,
    /// Host path to container path binds
    #[serde(default)]
    pub volume_mapping: BTreeMap<String, String>,
    /// When set, the step's instance addresses are published under
    /// this name to later-starting steps
    #[serde(default)]
    pub dns_name: Option<String>,
    /// Seconds after run start before this step may start
    #[serde(default)]
    pub run_delay: u64,
    /// Cap on step duration once started, seconds
    pub run_max_time: u64,
    /// Stagger between starting successive instances, seconds
    #[serde(default)]
    pub node_delay: u64,
    /// Evict unresponsive instances mid-run
    #[serde(default)]
    pub prune_running: bool,
    /// Label handed to the metrics shipper
    #[serde(default)]
    pub docker_series: Option<String>,
}

impl Step {
    /// The designated monitor step hosts the time-series sink itself:
    /// it gets no sidecars and its address feeds everyone else's
    /// shipper.
    pub fn is_monitor(&self) -> bool {
        self.environment_data
            .get("RUN_MONITOR")
            .map_or(false, |value| value == "true")
    }
}

fn default_true() -> bool {
    true
}

/// Lifecycle of a run. Transitions are monotonic; every legal trace
/// ends in `Completed`.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, EnumString, ToString,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum RunState {
    Initializing,
    Running,
    Terminating,
    Completed,
}

/// One execution of a plan
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Run {
    /// Run identifier, also the `RunId` instance tag
    pub uuid: RunId,
    /// Plan this run executes
    pub plan_uuid: PlanId,
    /// Submitting owner, folded into the fleet `Name` tag
    pub owner: Option<String>,
    /// Current lifecycle state
    pub state: RunState,
    /// When the run was created
    pub created_at: DateTime<Utc>,
    /// When the scheduler loop began
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached `Completed`
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether the run was aborted by a caller
    pub aborted: bool,
    /// Interpolation environment: submitted overrides plus `RUN_ID`
    /// and `BROKER_VERSION`
    pub environment_data: BTreeMap<String, String>,
    /// Exactly one record per step of the plan
    pub step_records: Vec<StepRecord>,
}

impl Run {
    /// New run for `plan`, with one step record per step
    pub fn new(
        plan: &Plan,
        owner: Option<String>,
        environment: BTreeMap<String, String>,
        uuid: Option<RunId>,
    ) -> Run {
        let uuid = uuid.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut environment_data = environment;
        environment_data.insert("RUN_ID".to_string(), uuid.clone());
        environment_data.insert("BROKER_VERSION".to_string(), crate::VERSION.to_string());
        Run {
            uuid,
            plan_uuid: plan.uuid.clone(),
            owner,
            state: RunState::Initializing,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            aborted: false,
            environment_data,
            step_records: plan.steps.iter().map(StepRecord::new).collect(),
        }
    }

    /// The record for `step_uuid`, if the plan has such a step
    pub fn record(&self, step_uuid: &str) -> Option<&StepRecord> {
        self.step_records
            .iter()
            .find(|record| record.step_uuid == step_uuid)
    }

    /// Mutable record lookup
    pub fn record_mut(&mut self, step_uuid: &str) -> Option<&mut StepRecord> {
        self.step_records
            .iter_mut()
            .find(|record| record.step_uuid == step_uuid)
    }

    /// Whether the run still needs a manager driving it
    pub fn is_live(&self) -> bool {
        self.state != RunState::Completed
    }
}

/// Per-(run, step) runtime row, driving the scheduler predicates
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StepRecord {
    /// Step this record tracks
    pub step_uuid: StepId,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// Set when the start procedure returned
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the stop procedure returned
    pub completed_at: Option<DateTime<Utc>>,
    /// The start procedure raised; orthogonal to the timestamps
    pub failed: bool,
}

impl StepRecord {
    fn new(step: &Step) -> StepRecord {
        StepRecord {
            step_uuid: step.uuid.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed: false,
        }
    }

    /// Eligible to start: not yet started, and the run has been going
    /// for at least the step's delay
    pub fn should_start(
        &self,
        run_started_at: DateTime<Utc>,
        run_delay: u64,
        now: DateTime<Utc>,
    ) -> bool {
        self.started_at.is_none()
            && now >= run_started_at + Duration::seconds(run_delay as i64)
    }

    /// Past the step's maximum duration
    pub fn should_stop(&self, run_max_time: u64, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started_at) => now >= started_at + Duration::seconds(run_max_time as i64),
            None => false,
        }
    }
}

/// Storage capability for plans and runs
#[async_trait]
pub trait Repository: Send + Sync {
    /// Store a new project tree, assigning identifiers
    async fn create_project(&self, project: Project) -> Result<Project, DbError>;
    /// All projects
    async fn projects(&self) -> Result<Vec<Project>, DbError>;
    /// One project by id
    async fn project(&self, uuid: &str) -> Result<Option<Project>, DbError>;
    /// Delete a project and its plans; false when unknown
    async fn delete_project(&self, uuid: &str) -> Result<bool, DbError>;

    /// One plan with its steps, searched across projects
    async fn load_plan_with_steps(&self, uuid: &str) -> Result<Option<Plan>, DbError>;
    /// Delete a plan; false when unknown
    async fn delete_plan(&self, uuid: &str) -> Result<bool, DbError>;

    /// Create and store a run for `plan`
    async fn new_run(
        &self,
        plan: &Plan,
        owner: Option<String>,
        environment: BTreeMap<String, String>,
        uuid: Option<RunId>,
    ) -> Result<Run, DbError>;
    /// Commit the current state of a run
    async fn save_run(&self, run: &Run) -> Result<(), DbError>;
    /// Runs, most recent first
    async fn query_runs(&self, limit: usize, offset: usize) -> Result<Vec<Run>, DbError>;
    /// One run by id
    async fn query_run(&self, uuid: &str) -> Result<Option<Run>, DbError>;
    /// Remove a run record entirely; false when unknown
    async fn delete_run(&self, uuid: &str) -> Result<bool, DbError>;
    /// Runs that have not reached `Completed`
    async fn live_runs(&self) -> Result<Vec<Run>, DbError>;
}

/// In-memory repository, the system of record for one broker process
#[derive(Default, Clone)]
pub struct MemRepository {
    inner: Arc<MemInner>,
}

#[derive(Default)]
struct MemInner {
    projects: Mutex<Vec<Project>>,
    runs: Mutex<HashMap<RunId, Run>>,
}

impl MemRepository {
    /// New empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

fn assign_ids(project: &mut Project) {
    if project.uuid.is_empty() {
        project.uuid = Uuid::new_v4().to_string();
    }
    for plan in &mut project.plans {
        if plan.uuid.is_empty() {
            plan.uuid = Uuid::new_v4().to_string();
        }
        for step in &mut plan.steps {
            if step.uuid.is_empty() {
                step.uuid = Uuid::new_v4().to_string();
            }
        }
    }
}

#[async_trait]
impl Repository for MemRepository {
    async fn create_project(&self, mut project: Project) -> Result<Project, DbError> {
        let mut projects = self.inner.projects.lock().await;
        if projects.iter().any(|existing| existing.name == project.name) {
            return DuplicateProject {
                name: project.name,
            }
            .fail();
        }
        assign_ids(&mut project);
        projects.push(project.clone());
        Ok(project)
    }

    async fn projects(&self) -> Result<Vec<Project>, DbError> {
        Ok(self.inner.projects.lock().await.clone())
    }

    async fn project(&self, uuid: &str) -> Result<Option<Project>, DbError> {
        Ok(self
            .inner
            .projects
            .lock()
            .await
            .iter()
            .find(|project| project.uuid == uuid)
            .cloned())
    }

    async fn delete_project(&self, uuid: &str) -> Result<bool, DbError> {
        let mut projects = self.inner.projects.lock().await;
        let before = projects.len();
        projects.retain(|project| project.uuid != uuid);
        Ok(projects.len() != before)
    }

    async fn load_plan_with_steps(&self, uuid: &str) -> Result<Option<Plan>, DbError> {
        Ok(self
            .inner
            .projects
            .lock()
            .await
            .iter()
            .flat_map(|project| project.plans.iter())
            .find(|plan| plan.uuid == uuid)
            .cloned())
    }

    async fn delete_plan(&self, uuid: &str) -> Result<bool, DbError> {
        let mut projects = self.inner.projects.lock().await;
        let mut deleted = false;
        for project in projects.iter_mut() {
            let before = project.plans.len();
            project.plans.retain(|plan| plan.uuid != uuid);
            deleted |= project.plans.len() != before;
        }
        Ok(deleted)
    }

    async fn new_run(
        &self,
        plan: &Plan,
        owner: Option<String>,
        environment: BTreeMap<String, String>,
        uuid: Option<RunId>,
    ) -> Result<Run, DbError> {
        let run = Run::new(plan, owner, environment, uuid);
        self.inner
            .runs
            .lock()
            .await
            .insert(run.uuid.clone(), run.clone());
        Ok(run)
    }

    async fn save_run(&self, run: &Run) -> Result<(), DbError> {
        self.inner
            .runs
            .lock()
            .await
            .insert(run.uuid.clone(), run.clone());
        Ok(())
    }

    async fn query_runs(&self, limit: usize, offset: usize) -> Result<Vec<Run>, DbError> {
        let runs = self.inner.runs.lock().await;
        let mut runs: Vec<Run> = runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs.into_iter().skip(offset).take(limit).collect())
    }

    async fn query_run(&self, uuid: &str) -> Result<Option<Run>, DbError> {
        Ok(self.inner.runs.lock().await.get(uuid).cloned())
    }

    async fn delete_run(&self, uuid: &str) -> Result<bool, DbError> {
        Ok(self.inner.runs.lock().await.remove(uuid).is_some())
    }

    async fn live_runs(&self) -> Result<Vec<Run>, DbError> {
        let runs = self.inner.runs.lock().await;
        Ok(runs.values().filter(|run| run.is_live()).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn plans_are_found_across_projects() {
        let repo = MemRepository::new();
        let project = repo
            .create_project(testing::project("proj", vec![testing::plan("p1", vec![])]))
            .await
            .unwrap();
        let plan_uuid = &project.plans[0].uuid;
        assert!(!plan_uuid.is_empty());
        let found = repo.load_plan_with_steps(plan_uuid).await.unwrap().unwrap();
        assert_eq!(&found.name, "p1");
    }

    #[tokio::test]
    async fn duplicate_project_names_are_rejected() {
        let repo = MemRepository::new();
        repo.create_project(testing::project("proj", vec![]))
            .await
            .unwrap();
        assert!(repo
            .create_project(testing::project("proj", vec![]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn run_environment_carries_run_id_and_version() {
        let plan = testing::plan("p1", vec![testing::step("img:v1", 1)]);
        let run = Run::new(&plan, None, BTreeMap::new(), None);
        assert_eq!(run.environment_data["RUN_ID"], run.uuid);
        assert_eq!(run.environment_data["BROKER_VERSION"], crate::VERSION);
        assert_eq!(run.step_records.len(), 1);
    }

    #[test]
    fn step_record_predicates() {
        let step = testing::step("img:v1", 1);
        let mut record = StepRecord::new(&step);
        let run_started = Utc::now();

        assert!(!record.should_start(run_started, 10, run_started + Duration::seconds(5)));
        assert!(record.should_start(run_started, 10, run_started + Duration::seconds(10)));

        assert!(!record.should_stop(60, run_started));
        record.started_at = Some(run_started);
        assert!(!record.should_stop(60, run_started + Duration::seconds(59)));
        assert!(record.should_stop(60, run_started + Duration::seconds(60)));

        record.started_at = Some(run_started);
        assert!(!record.should_start(run_started, 0, run_started));
    }

    #[tokio::test]
    async fn runs_page_most_recent_first() {
        let repo = MemRepository::new();
        let plan = testing::plan("p1", vec![]);
        for _ in 0 .. 3 {
            repo.new_run(&plan, None, BTreeMap::new(), None).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let page = repo.query_runs(2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].created_at >= page[1].created_at);
        assert_eq!(repo.query_runs(10, 2).await.unwrap().len(), 1);
    }
}
