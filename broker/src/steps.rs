//! Binds a plan step to its runtime record and its allocated
//! collection, and owns the step's start/stop procedure.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use dockerhost::env::interpolate;

use crate::collection::Collection;
use crate::db::{Step, StepRecord};
use crate::docker::{self, ContainerLaunch, STOP_TIMEOUT};
use crate::extensions::{
    Helpers, LocalDns, MetricsOptions, MetricsShipper, Watcher, BASE_CONTAINERS,
};
use crate::{BrokerError, StepFailed};

/// One step of a live run: definition, record, and machines
pub struct StepLink {
    /// The step definition from the plan
    pub step: Step,
    /// The per-run record the scheduler predicates read
    pub record: StepRecord,
    /// The machines leased for this step
    pub collection: Collection,
}

impl StepLink {
    /// Bind a step to its record and collection
    pub fn new(step: Step, record: StepRecord, collection: Collection) -> StepLink {
        StepLink {
            step,
            record,
            collection,
        }
    }

    /// The step has been started, or its start failed; either way the
    /// scheduler will not try again
    pub fn attempted(&self) -> bool {
        self.record.started_at.is_some() || self.record.failed
    }

    /// Image reference with run variables resolved
    pub fn container_name(&self, vars: &BTreeMap<String, String>) -> String {
        interpolate(&self.step.container_name, vars)
    }

    /// Prepare the collection: wait for Running, attach daemons, wait
    /// for them to answer, and load the images the step will need.
    /// Instance-scoped faults evict the instance; the step proceeds
    /// with fewer machines.
    pub async fn initialize(&mut self, helpers: &Helpers, vars: &BTreeMap<String, String>) {
        debug!("Initializing collection for step {}", self.step.uuid);
        self.collection
            .wait_for_running(helpers.wait.running_interval, helpers.wait.running_timeout)
            .await;
        docker::setup_hosts(&mut self.collection, helpers.factory.as_ref());
        docker::wait_ready(
            &mut self.collection,
            helpers.wait.daemon_interval,
            helpers.wait.daemon_timeout,
        )
        .await;

        if !self.step.is_monitor() {
            for info in &BASE_CONTAINERS {
                docker::load_image(&mut self.collection, info.name, info.url).await;
            }
        }
        let name = self.container_name(vars);
        let url = self
            .step
            .container_url
            .as_ref()
            .map(|url| interpolate(url, vars));
        docker::load_image(&mut self.collection, &name, url.as_deref()).await;
    }

    /// Ordered start procedure: sysctl reload, sidecars, then the
    /// step's own container with per-instance stagger. Fails only
    /// when a non-empty collection could not start the container
    /// anywhere; instance-scoped faults just shrink the fleet.
    pub async fn start(
        &mut self,
        helpers: &Helpers,
        vars: &BTreeMap<String, String>,
        dns_map: &BTreeMap<String, Vec<String>>,
        metrics: Option<&MetricsOptions>,
    ) -> Result<(), BrokerError> {
        info!("Starting step {}", self.step.uuid);
        self.collection.started = true;

        if !self.step.is_monitor() {
            crate::extensions::reload_sysctl(helpers.shell.as_ref(), &self.collection).await;
            Watcher::start(&mut self.collection).await;
            if let Some(options) = metrics {
                MetricsShipper::start(
                    &mut self.collection,
                    helpers.shell.as_ref(),
                    options,
                    self.step.docker_series.as_deref(),
                )
                .await;
            }
            if !dns_map.is_empty() {
                LocalDns::start(&mut self.collection, dns_map).await;
            }
        }

        let mut env = vars.clone();
        env.append(&mut self.step.environment_data.clone());
        env.insert("CONTAINER_ID".to_string(), self.step.uuid.clone());

        let launch = ContainerLaunch {
            name: self.container_name(vars),
            command_args: self.step.additional_command_args.clone(),
            env,
            vars: vars.clone(),
            ports: self.step.port_mapping.clone(),
            volumes: self.step.volume_mapping.clone(),
            stagger: if self.step.node_delay > 0 {
                Some(Duration::from_secs(self.step.node_delay))
            } else {
                None
            },
            pid_host: false,
            use_local_dns: true,
        };
        let started = docker::run_containers(&mut self.collection, &launch).await;
        if started == 0 && !self.collection.is_empty() {
            return StepFailed {
                step: self.step.uuid.clone(),
            }
            .fail();
        }
        Ok(())
    }

    /// Reverse-order stop procedure, then prune whatever died along
    /// the way
    pub async fn stop(&mut self, vars: &BTreeMap<String, String>) {
        if self.collection.finished {
            return;
        }
        info!("Stopping step {}", self.step.uuid);
        let name = self.container_name(vars);
        docker::stop_containers(&mut self.collection, &name, STOP_TIMEOUT).await;

        if !self.step.is_monitor() {
            MetricsShipper::stop(&mut self.collection).await;
            Watcher::stop(&mut self.collection).await;
        }
        let dns_started = self
            .collection
            .members()
            .iter()
            .any(|member| member.ext.local_dns);
        if dns_started {
            LocalDns::stop(&mut self.collection).await;
        }

        self.collection.remove_dead_instances().await;
        self.collection.finished = true;
    }

    /// Completion predicate for the scheduler loop
    pub async fn is_done(&mut self, vars: &BTreeMap<String, String>, now: DateTime<Utc>) -> bool {
        if self.record.started_at.is_none() {
            return false;
        }
        if self.collection.finished {
            return true;
        }
        if self.collection.is_empty() {
            return true;
        }

        let name = self.container_name(vars);
        let any_running =
            docker::is_running(&mut self.collection, &name, self.step.prune_running).await;
        if !any_running {
            debug!("No instances still run '{}'; step {} done", name, self.step.uuid);
            return true;
        }

        self.record.should_stop(self.step.run_max_time, now)
    }

    /// Start predicate, evaluated against the step record
    pub fn should_start(&self, run_started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.record
            .should_start(run_started_at, self.step.run_delay, now)
    }
}
