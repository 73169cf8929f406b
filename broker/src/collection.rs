//! A step's allocated group of instances.
//!
//! The pool owns instances; a collection is the transient working set
//! a run manager holds while a step needs machines. Fan-outs run with
//! bounded concurrency equal to the live instance count and report
//! `(index, result)` pairs so callers commit state changes after the
//! await, never from inside the fan-out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use cloud::{tags, CloudClient, CloudInstance, InstanceId, InstanceState, Region};
use dockerhost::ContainerHost;

use crate::db::{RunId, StepId};

/// Typed scratchpad the capabilities attach to each instance
#[derive(Default, Clone)]
pub struct ExtensionState {
    /// Container daemon handle, attached during initialization
    pub host: Option<Arc<dyn ContainerHost>>,
    /// Resolver the step container should use, set when local DNS
    /// starts on the instance
    pub resolver_ip: Option<String>,
    /// The instance stopped answering a capability call
    pub nonresponsive: bool,
    /// Local DNS was started on the instance
    pub local_dns: bool,
}

/// One instance plus its extension state
pub struct Member {
    /// Snapshot of the cloud instance
    pub instance: CloudInstance,
    /// Capability scratchpad
    pub ext: ExtensionState,
}

impl Member {
    /// Dead members are skipped by every fan-out: terminal instance
    /// state, or flagged non-responsive by a capability
    pub fn is_dead(&self) -> bool {
        self.ext.nonresponsive
            || !matches!(
                self.instance.state,
                InstanceState::Running | InstanceState::Pending
            )
    }

    /// Address a capability should dial; public preferred
    pub fn address(&self) -> Option<&str> {
        self.instance
            .public_ip
            .as_deref()
            .or_else(|| self.instance.private_ip.as_deref())
    }
}

/// Instances allocated together for one step
pub struct Collection {
    /// Run the collection is leased to
    pub run_id: RunId,
    /// Step the collection is leased to
    pub step_id: StepId,
    /// Region every member lives in
    pub region: Region,
    /// The step's start procedure has run
    pub started: bool,
    /// The step's stop procedure has run
    pub finished: bool,
    members: Vec<Member>,
    client: Arc<dyn CloudClient>,
}

impl Collection {
    /// New collection over `instances`
    pub fn new(
        run_id: RunId,
        step_id: StepId,
        region: Region,
        instances: Vec<CloudInstance>,
        client: Arc<dyn CloudClient>,
    ) -> Collection {
        Collection {
            run_id,
            step_id,
            region,
            started: false,
            finished: false,
            members: instances
                .into_iter()
                .map(|instance| Member {
                    instance,
                    ext: ExtensionState::default(),
                })
                .collect(),
            client,
        }
    }

    /// All members, dead ones included
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Mutable member access, for committing fan-out results
    pub fn members_mut(&mut self) -> &mut [Member] {
        &mut self.members
    }

    /// Number of members still in the collection
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether any members remain
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members awaiting the Running state
    pub fn pending(&self) -> Vec<&Member> {
        self.members
            .iter()
            .filter(|member| member.instance.state == InstanceState::Pending)
            .collect()
    }

    /// Members usable for work: Running and responsive
    pub fn running(&self) -> Vec<&Member> {
        self.members
            .iter()
            .filter(|member| {
                member.instance.state == InstanceState::Running && !member.ext.nonresponsive
            })
            .collect()
    }

    /// Ids of members no fan-out should touch
    pub fn dead_ids(&self) -> Vec<InstanceId> {
        self.members
            .iter()
            .filter(|member| member.is_dead())
            .map(|member| member.instance.id.clone())
            .collect()
    }

    /// Public addresses of usable members, for DNS publication
    pub fn addresses(&self) -> Vec<String> {
        self.running()
            .iter()
            .filter_map(|member| member.address().map(|ip| ip.to_string()))
            .collect()
    }

    /// Surrender the members, for release back to the pool
    pub fn into_instances(self) -> Vec<CloudInstance> {
        self.members.into_iter().map(|member| member.instance).collect()
    }

    /// Run `f` over every live member with bounded concurrency,
    /// optionally staggering launches by `stagger` per member.
    /// Results come back as `(member index, output)`; the caller
    /// commits any state changes.
    pub async fn map_live<'a, T, F, Fut>(&'a self, stagger: Option<Duration>, f: F) -> Vec<(usize, T)>
    where
        F: Fn(usize, &'a Member) -> Fut,
        Fut: Future<Output = T> + 'a,
    {
        let live: Vec<(usize, &Member)> = self
            .members
            .iter()
            .enumerate()
            .filter(|(_, member)| !member.is_dead())
            .collect();
        let width = live.len().max(1);

        let tasks = live.into_iter().enumerate().map(|(slot, (index, member))| {
            let work = f(index, member);
            async move {
                if let Some(delay) = stagger {
                    if slot > 0 {
                        tokio::time::sleep(delay * slot as u32).await;
                    }
                }
                (index, work.await)
            }
        });
        stream::iter(tasks).buffer_unordered(width).collect().await
    }

    /// Poll the IaaS until no member is Pending, up to `timeout`.
    /// Members still not Running afterwards are removed.
    pub async fn wait_for_running(&mut self, interval: Duration, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending().is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            self.refresh().await;
            if self.pending().is_empty() {
                break;
            }
            tokio::time::sleep(interval).await;
        }

        let stragglers: Vec<InstanceId> = self
            .members
            .iter()
            .filter(|member| member.instance.state != InstanceState::Running)
            .map(|member| member.instance.id.clone())
            .collect();
        if !stragglers.is_empty() {
            warn!(
                "Evicting {} instance(s) that never reached Running for step {}",
                stragglers.len(),
                self.step_id
            );
            self.remove_instances(&stragglers).await;
        }
    }

    /// Refresh member state snapshots from the IaaS
    pub async fn refresh(&mut self) {
        let ids: Vec<InstanceId> = self
            .members
            .iter()
            .map(|member| member.instance.id.clone())
            .collect();
        if ids.is_empty() {
            return;
        }
        match self.client.describe_instances(&tags::id_filter(&ids)).await {
            Ok(described) => {
                for member in &mut self.members {
                    if let Some(fresh) =
                        described.iter().find(|inst| inst.id == member.instance.id)
                    {
                        member.instance.state = fresh.state;
                        member.instance.public_ip = fresh.public_ip.clone();
                        member.instance.private_ip = fresh.private_ip.clone();
                        member.instance.launch_time = fresh.launch_time;
                    }
                }
            }
            // transient; the next poll retries
            Err(error) => warn!("Failed to refresh collection state: {}", error),
        }
    }

    /// Drop `ids` from the collection: clear their allocation tags and
    /// terminate them, best-effort, then remove them locally. Local
    /// removal always happens even if the IaaS calls fail.
    pub async fn remove_instances(&mut self, ids: &[InstanceId]) {
        if ids.is_empty() {
            return;
        }
        if let Err(error) = self.client.create_tags(ids, &tags::release()).await {
            warn!("Failed to clear tags while evicting: {}", error);
        }
        if let Err(error) = self.client.terminate_instances(ids).await {
            warn!("Failed to terminate evicted instances: {}", error);
        }
        debug!(
            "Removed {} instance(s) from step {} collection",
            ids.len(),
            self.step_id
        );
        self.members
            .retain(|member| !ids.contains(&member.instance.id));
    }

    /// Remove every dead member; returns how many went
    pub async fn remove_dead_instances(&mut self) -> usize {
        let dead = self.dead_ids();
        let count = dead.len();
        if count > 0 {
            self.remove_instances(&dead).await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;
    use cloud::CloudProvider;

    async fn collection(count: u32) -> (FakeCloud, Collection) {
        let fake = FakeCloud::new();
        let client = fake.connect(Region::UsWest2).await.unwrap();
        let instances = fake.seed_running(Region::UsWest2, count, "t1.micro").await;
        let collection = Collection::new(
            "run-1".to_string(),
            "step-1".to_string(),
            Region::UsWest2,
            instances,
            client,
        );
        (fake, collection)
    }

    #[tokio::test]
    async fn map_live_skips_dead_members() {
        let (_fake, mut collection) = collection(3).await;
        collection.members_mut()[1].ext.nonresponsive = true;

        let results = collection
            .map_live(None, |index, member| {
                let id = member.instance.id.clone();
                async move { (index, id) }
            })
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(index, _)| *index != 1));
    }

    #[tokio::test]
    async fn remove_instances_is_local_even_if_iaas_fails() {
        let (fake, mut collection) = collection(2).await;
        fake.fail_next_terminate().await;
        let doomed = vec![collection.members()[0].instance.id.clone()];
        collection.remove_instances(&doomed).await;
        assert_eq!(collection.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_running_evicts_stalled_pending() {
        let fake = FakeCloud::new();
        let client = fake.connect(Region::UsWest2).await.unwrap();
        let mut instances = fake.seed_running(Region::UsWest2, 2, "t1.micro").await;
        // one instance never leaves Pending
        instances[1].state = InstanceState::Pending;
        fake.pin_state(&instances[1].id, InstanceState::Pending).await;

        let mut collection = Collection::new(
            "run-1".to_string(),
            "step-1".to_string(),
            Region::UsWest2,
            instances,
            client,
        );
        collection
            .wait_for_running(Duration::from_millis(10), Duration::from_millis(50))
            .await;
        assert_eq!(collection.len(), 1);
        assert_eq!(
            collection.members()[0].instance.state,
            InstanceState::Running
        );
    }
}
