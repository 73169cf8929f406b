//! Process-wide singleton owning the pool, the repository, the
//! helper capabilities, and the registry of live run managers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cloud::{CloudInstance, CloudProvider, Region};

use crate::config::BrokerConfig;
use crate::db::{Repository, Run, RunId, RunState};
use crate::extensions::Helpers;
use crate::images::ImageRegistry;
use crate::pool::Pool;
use crate::run::RunManager;
use crate::{BrokerError, PlanDisabled, PlanNotFound, RunAlreadyCompleted, RunNotFound};

struct RunHandle {
    abort: Arc<AtomicBool>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// The broker: everything a transport needs to drive the system
pub struct Broker {
    config: BrokerConfig,
    pool: Arc<Pool>,
    repository: Arc<dyn Repository>,
    helpers: Arc<Helpers>,
    active: Mutex<HashMap<RunId, RunHandle>>,
}

impl Broker {
    /// Bring the broker up: populate the image registry and run pool
    /// recovery. Either failing is fatal; nothing may proceed with a
    /// blank registry or an unrecovered pool.
    pub async fn start(
        config: BrokerConfig,
        provider: Arc<dyn CloudProvider>,
        repository: Arc<dyn Repository>,
        helpers: Arc<Helpers>,
    ) -> Result<Arc<Broker>, BrokerError> {
        let registry =
            ImageRegistry::populate(provider.as_ref(), Region::all(), &config.image_owner_id)
                .await?;
        let pool = Arc::new(Pool::new(config.clone(), provider, registry));
        pool.recover().await?;

        Ok(Arc::new(Broker {
            config,
            pool,
            repository,
            helpers,
            active: Mutex::new(HashMap::new()),
        }))
    }

    /// The pool, for transports that inspect instances
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// The repository, for transports that serve plans and projects
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Broker settings
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Create a run for `plan_id` and spawn its manager. The
    /// environment is the submitted interpolation variables; the
    /// broker folds in its own identity.
    pub async fn run_plan(
        self: &Arc<Self>,
        plan_id: &str,
        mut environment: BTreeMap<String, String>,
        owner: Option<String>,
        run_uuid: Option<RunId>,
    ) -> Result<RunId, BrokerError> {
        let plan = match self.repository.load_plan_with_steps(plan_id).await? {
            Some(plan) => plan,
            None => return PlanNotFound { uuid: plan_id }.fail(),
        };
        if !plan.enabled {
            return PlanDisabled { uuid: plan_id }.fail();
        }

        environment.insert("BROKER_ID".to_string(), self.config.broker_id.clone());
        let run = self
            .repository
            .new_run(&plan, owner, environment, run_uuid)
            .await?;
        let uuid = run.uuid.clone();
        info!("Orchestrating plan {} as run {}", plan_id, uuid);
        self.spawn_manager(run, false).await;
        Ok(uuid)
    }

    /// Reconstruct managers for every run that was live when the
    /// broker went down; they reattach to recovered instances instead
    /// of creating new ones. Returns how many were resumed.
    pub async fn recover_runs(self: &Arc<Self>) -> Result<usize, BrokerError> {
        let live = self.repository.live_runs().await?;
        let mut resumed = 0;
        for run in live {
            if self.active.lock().await.contains_key(&run.uuid) {
                continue;
            }
            resumed += 1;
            self.spawn_manager(run, true).await;
        }
        if resumed > 0 {
            info!("Resumed {} in-flight run(s)", resumed);
        }
        Ok(resumed)
    }

    async fn spawn_manager(self: &Arc<Self>, run: Run, resume: bool) {
        let plan = match self.repository.load_plan_with_steps(&run.plan_uuid).await {
            Ok(Some(plan)) => plan,
            _ => {
                warn!("Run {} references a missing plan; not driving it", run.uuid);
                return;
            }
        };

        let abort = Arc::new(AtomicBool::new(false));
        let manager = RunManager::new(
            run.clone(),
            plan,
            self.pool.clone(),
            self.repository.clone(),
            self.helpers.clone(),
            abort.clone(),
            self.config.poll_interval,
        );

        let broker = self.clone();
        let uuid = run.uuid.clone();
        let task_uuid = uuid.clone();

        // the handle must be registered before the task can try to
        // deregister itself
        let mut active = self.active.lock().await;
        let task = tokio::spawn(assert_send(async move {
            let result = if resume {
                manager.resume().await
            } else {
                manager.execute().await
            };
            if let Err(error) = result {
                error!("Run {} surfaced a failure: {}", task_uuid, error);
            }
            broker.active.lock().await.remove(&task_uuid);
        }));
        active.insert(uuid, RunHandle { abort, task });
    }

    /// Mark abort on a live run; the manager notices on its next
    /// tick. False when no manager is driving the run.
    pub async fn abort_run(&self, run_id: &str) -> bool {
        match self.active.lock().await.get(run_id) {
            Some(handle) => {
                handle.abort.store(true, Ordering::SeqCst);
                info!("Abort requested for run {}", run_id);
                true
            }
            None => false,
        }
    }

    /// Abort and optionally purge a run record. Purging a live run
    /// aborts it and waits for its manager to wind down, so the
    /// manager's final commit cannot resurrect the deleted record.
    pub async fn delete_run(&self, run_id: &str, purge: bool) -> Result<(), BrokerError> {
        let run = match self.repository.query_run(run_id).await? {
            Some(run) => run,
            None => return RunNotFound { uuid: run_id }.fail(),
        };
        if run.state == RunState::Completed && !purge {
            return RunAlreadyCompleted { uuid: run_id }.fail();
        }
        if run.is_live() {
            self.abort_run(run_id).await;
            if purge {
                while self.is_active(run_id).await {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
            }
        }
        if purge {
            let _ = self.repository.delete_run(run_id).await?;
        }
        Ok(())
    }

    /// Runs, most recent first
    pub async fn get_runs(&self, limit: usize, offset: usize) -> Result<Vec<Run>, BrokerError> {
        Ok(self.repository.query_runs(limit, offset).await?)
    }

    /// One run by id
    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, BrokerError> {
        Ok(self.repository.query_run(run_id).await?)
    }

    /// Every instance the pool tracks
    pub async fn instances(&self) -> Vec<CloudInstance> {
        self.pool.instances().await
    }

    /// One tracked instance
    pub async fn instance(&self, id: &str) -> Option<CloudInstance> {
        self.pool.find_instance(id).await
    }

    /// Terminate one tracked free instance
    pub async fn terminate_instance(&self, id: &str) -> Result<(), BrokerError> {
        self.pool.terminate_instance(id).await
    }

    /// Terminate every free instance
    pub async fn reap_instances(&self) -> Result<(), BrokerError> {
        self.pool.reap_instances().await
    }

    /// Whether a manager is currently driving `run_id`
    pub async fn is_active(&self, run_id: &str) -> bool {
        self.active.lock().await.contains_key(run_id)
    }

    /// Block until no manager is active; used by tests and shutdown
    pub async fn wait_idle(&self) {
        loop {
            if self.active.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}
