//! Drives one run end to end.
//!
//! ```text
//! Initializing --initialize-->  Running  --poll loop-->  Terminating  --shutdown-->  Completed
//!        \__cleanup on any initialization failure____________________________/
//! ```
//!
//! The poll loop is the scheduling core: each tick it checks the
//! abort flag, settles finished steps, and starts whatever became
//! eligible. Starts are serialized in ascending `run_delay` order so
//! a step that publishes a DNS name is up before any later step
//! builds its local resolver. Stops and completion checks fan out in
//! parallel. All record timestamps are committed on the loop task
//! right after the awaits resolve.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::collection::Collection;
use crate::db::{Plan, Repository, Run, RunId, RunState};
use crate::extensions::{Helpers, MetricsOptions};
use crate::pool::Pool;
use crate::steps::StepLink;
use crate::BrokerError;

/// Port the monitor step's sink listens on
const METRICS_PORT: u16 = 8086;

/// Owns one run's lifecycle
pub struct RunManager {
    run: Run,
    plan: Plan,
    pool: Arc<Pool>,
    repository: Arc<dyn Repository>,
    helpers: Arc<Helpers>,
    abort: Arc<AtomicBool>,
    poll_interval: Duration,
    links: Vec<StepLink>,
    dns_map: BTreeMap<String, Vec<String>>,
    metrics: Option<MetricsOptions>,
}

impl RunManager {
    /// Manager for `run`, which must execute `plan`
    pub fn new(
        run: Run,
        plan: Plan,
        pool: Arc<Pool>,
        repository: Arc<dyn Repository>,
        helpers: Arc<Helpers>,
        abort: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> RunManager {
        RunManager {
            run,
            plan,
            pool,
            repository,
            helpers,
            abort,
            poll_interval,
            links: vec![],
            dns_map: BTreeMap::new(),
            metrics: None,
        }
    }

    /// Drive a fresh run to completion
    pub async fn execute(mut self) -> Result<RunId, BrokerError> {
        let uuid = self.run.uuid.clone();
        match self.initialize().await {
            Ok(()) => {
                self.run_loop().await;
                self.shutdown().await;
                self.cleanup(false).await;
                Ok(uuid)
            }
            Err(error) => {
                error!("Run {} failed to initialize: {}", uuid, error);
                self.cleanup(true).await;
                Err(error)
            }
        }
    }

    /// Reattach to a run that was live when the broker went down:
    /// drain the recovery buckets, skip initialization, resume the
    /// poll loop with whatever came back.
    pub async fn resume(mut self) -> Result<RunId, BrokerError> {
        let uuid = self.run.uuid.clone();
        info!("Resuming run {}", uuid);
        match self.reattach().await {
            Ok(()) => {
                self.run_loop().await;
                self.shutdown().await;
                self.cleanup(false).await;
                Ok(uuid)
            }
            Err(error) => {
                error!("Run {} failed to reattach: {}", uuid, error);
                self.cleanup(true).await;
                Err(error)
            }
        }
    }

    async fn reattach(&mut self) -> Result<(), BrokerError> {
        for step in self.plan.steps.clone() {
            let collection = self
                .pool
                .request_instances(
                    &self.run.uuid,
                    &step.uuid,
                    step.instance_count,
                    &step.instance_type,
                    step.instance_region,
                    self.run.owner.as_deref(),
                    false,
                )
                .await?;
            let record = self
                .run
                .record(&step.uuid)
                .cloned()
                .unwrap_or_else(|| panic_record(&self.run, &step.uuid));
            let mut link = StepLink::new(step, record, collection);
            link.collection.started = link.record.started_at.is_some();
            crate::docker::setup_hosts(&mut link.collection, self.helpers.factory.as_ref());

            // the monitor's sink address is derivable state, not tag
            // state; rebuild it so later shippers still have a target
            if link.step.is_monitor() && link.record.started_at.is_some() {
                if let Some(host) = link
                    .collection
                    .running()
                    .first()
                    .and_then(|member| member.instance.private_ip.clone())
                {
                    self.metrics = Some(MetricsOptions {
                        host,
                        port: METRICS_PORT,
                        database: self.run.uuid.replace('-', ""),
                    });
                }
            }
            self.links.push(link);
        }

        if self.run.started_at.is_none() {
            // went down during initialization; the records are blank
            // and the scheduler can start from scratch
            self.run.started_at = Some(Utc::now());
        }
        self.run.state = RunState::Running;
        self.persist().await;
        Ok(())
    }

    /// Acquire one collection per step, then ready every collection
    /// in parallel
    async fn initialize(&mut self) -> Result<(), BrokerError> {
        self.persist().await;
        let vars = self.run.environment_data.clone();

        let requests = self.plan.steps.iter().map(|step| {
            let pool = self.pool.clone();
            let run_id = self.run.uuid.clone();
            let owner = self.run.owner.clone();
            async move {
                pool.request_instances(
                    &run_id,
                    &step.uuid,
                    step.instance_count,
                    &step.instance_type,
                    step.instance_region,
                    owner.as_deref(),
                    true,
                )
                .await
            }
        });
        let results: Vec<Result<Collection, BrokerError>> = join_all(requests).await;

        let mut collections = vec![];
        let mut first_error = None;
        for result in results {
            match result {
                Ok(collection) => collections.push(collection),
                Err(error) => first_error = first_error.or(Some(error)),
            }
        }
        if let Some(error) = first_error {
            // hand back whatever we did manage to lease
            for collection in collections {
                if let Err(release_error) = self.pool.release_instances(collection).await {
                    warn!("Release during failed initialization: {}", release_error);
                }
            }
            return Err(error);
        }

        self.links = self
            .plan
            .steps
            .iter()
            .zip(collections)
            .map(|(step, collection)| {
                let record = self
                    .run
                    .record(&step.uuid)
                    .cloned()
                    .unwrap_or_else(|| panic_record(&self.run, &step.uuid));
                StepLink::new(step.clone(), record, collection)
            })
            .collect();

        let helpers = self.helpers.clone();
        let setups = self.links.iter_mut().map(|link| {
            let helpers = helpers.clone();
            let vars = vars.clone();
            async move { link.initialize(&helpers, &vars).await }
        });
        join_all(setups).await;

        self.run.state = RunState::Running;
        self.run.started_at = Some(Utc::now());
        self.persist().await;
        info!("Run {} is running", self.run.uuid);
        Ok(())
    }

    /// The scheduling core; returns when every step has been
    /// attempted and finished, or on abort
    async fn run_loop(&mut self) {
        loop {
            if self.abort.load(Ordering::SeqCst) {
                info!("Run {} abort requested", self.run.uuid);
                break;
            }

            let all_attempted = self.links.iter().all(|link| link.attempted());
            let all_finished = self.links.iter().all(|link| link.collection.finished);
            if all_attempted && all_finished {
                break;
            }

            self.settle_finished().await;
            self.start_eligible().await;
            self.persist().await;

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Evaluate completion predicates in parallel and stop every
    /// newly-done step
    async fn settle_finished(&mut self) {
        let vars = self.run.environment_data.clone();
        let now = Utc::now();

        let checks = self
            .links
            .iter_mut()
            .enumerate()
            .filter(|(_, link)| link.attempted() && !link.collection.finished)
            .map(|(index, link)| {
                let vars = &vars;
                async move { (index, link.is_done(vars, now).await) }
            });
        let done: Vec<usize> = join_all(checks)
            .await
            .into_iter()
            .filter(|(_, is_done)| *is_done)
            .map(|(index, _)| index)
            .collect();
        if done.is_empty() {
            return;
        }

        let stops = self
            .links
            .iter_mut()
            .enumerate()
            .filter(|(index, _)| done.contains(index))
            .map(|(_, link)| {
                let vars = &vars;
                async move { link.stop(vars).await }
            });
        join_all(stops).await;

        let now = Utc::now();
        for index in done {
            let link = &mut self.links[index];
            link.record.completed_at = Some(now);
            debug!("Step {} completed", link.step.uuid);
        }
    }

    /// Start every eligible step, earliest `run_delay` first, one at
    /// a time so the DNS map accumulates deterministically
    async fn start_eligible(&mut self) {
        let run_started_at = match self.run.started_at {
            Some(started_at) => started_at,
            None => return,
        };
        let now = Utc::now();

        let mut eligible: Vec<usize> = self
            .links
            .iter()
            .enumerate()
            .filter(|(_, link)| !link.attempted() && link.should_start(run_started_at, now))
            .map(|(index, _)| index)
            .collect();
        eligible.sort_by_key(|index| self.links[*index].step.run_delay);

        for index in eligible {
            let vars = self.run.environment_data.clone();
            let helpers = self.helpers.clone();
            let started = self.links[index]
                .start(&helpers, &vars, &self.dns_map, self.metrics.as_ref())
                .await;
            self.links[index].record.started_at = Some(Utc::now());
            if let Err(error) = started {
                warn!(
                    "Step {} failed to start: {}",
                    self.links[index].step.uuid, error
                );
                self.links[index].record.failed = true;
                continue;
            }

            let link = &self.links[index];
            if link.step.is_monitor() {
                if let Some(host) = link
                    .collection
                    .running()
                    .first()
                    .and_then(|member| member.instance.private_ip.clone())
                {
                    self.metrics = Some(MetricsOptions {
                        host,
                        port: METRICS_PORT,
                        database: self.run.uuid.replace('-', ""),
                    });
                }
            }
            if let Some(name) = link.step.dns_name.clone() {
                let addresses = link.collection.addresses();
                debug!("Publishing {} -> {:?}", name, addresses);
                self.dns_map.entry(name).or_default().extend(addresses);
            }
        }
    }

    /// Stop everything and seal the terminal state
    async fn shutdown(&mut self) {
        self.run.state = RunState::Terminating;
        self.persist().await;

        let vars = self.run.environment_data.clone();
        let stops = self
            .links
            .iter_mut()
            .filter(|link| !link.collection.finished)
            .map(|link| {
                let vars = &vars;
                async move { link.stop(vars).await }
            });
        join_all(stops).await;

        self.run.state = RunState::Completed;
        self.run.completed_at = Some(Utc::now());
        self.run.aborted = self.abort.load(Ordering::SeqCst);
        self.persist().await;
        info!(
            "Run {} completed (aborted: {})",
            self.run.uuid, self.run.aborted
        );
    }

    /// Exception-safe teardown: best-effort stop on the failure path,
    /// then unconditionally release every collection. A release
    /// failure is logged, never allowed to mask the original error.
    async fn cleanup(&mut self, failed: bool) {
        if failed {
            let vars = self.run.environment_data.clone();
            for link in &mut self.links {
                link.stop(&vars).await;
            }
        }

        for link in std::mem::take(&mut self.links) {
            if let Err(error) = self.pool.release_instances(link.collection).await {
                warn!(
                    "Failed to release a collection for run {}: {}",
                    self.run.uuid, error
                );
            }
        }

        if failed {
            self.run.state = RunState::Completed;
            self.run.completed_at = Some(Utc::now());
            self.run.aborted = self.abort.load(Ordering::SeqCst);
            self.persist().await;
        }
    }

    /// Commit the run and its records; the loop task is the only
    /// writer
    async fn persist(&mut self) {
        if !self.links.is_empty() {
            self.run.step_records = self.links.iter().map(|link| link.record.clone()).collect();
        }
        if let Err(error) = self.repository.save_run(&self.run).await {
            warn!("Failed to persist run {}: {}", self.run.uuid, error);
        }
    }
}

fn panic_record(run: &Run, step_uuid: &str) -> crate::db::StepRecord {
    // a run always carries one record per plan step; reaching this
    // means the plan and run went out of sync
    unreachable!("run {} has no record for step {}", run.uuid, step_uuid)
}
