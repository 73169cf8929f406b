//! Cross-region instance reservoir.
//!
//! The pool is the sole owner of every instance the broker ever
//! created. At startup it sweeps every region for instances carrying
//! the broker's tags and classifies them: allocated ones land in a
//! recovery bucket keyed by `(run, step)`, usable unallocated ones in
//! a per-region free list, stalled ones in the free list for later
//! reaping. The tag store is the only durable record; everything here
//! can be rebuilt from it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use snafu::ResultExt;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, info, warn};

use cloud::{
    tags, CloudClient, CloudError, CloudInstance, CloudProvider, InstanceId, InstanceState,
    LaunchRequest, Region,
};

use crate::collection::Collection;
use crate::config::BrokerConfig;
use crate::db::{RunId, StepId};
use crate::images::ImageRegistry;
use crate::{BrokerError, InstanceNotFound, TagInstances};

/// Bounded attempts at tagging freshly created instances; tag calls
/// race the IaaS's own visibility of them
pub const TAG_ATTEMPTS: usize = 6;
const TAG_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Default)]
struct PoolState {
    free: HashMap<Region, Vec<CloudInstance>>,
    recovered: HashMap<(RunId, StepId), Vec<CloudInstance>>,
}

/// Cross-region allocator and recovery cache of instances
pub struct Pool {
    config: BrokerConfig,
    provider: Arc<dyn CloudProvider>,
    registry: ImageRegistry,
    state: Mutex<PoolState>,
    clients: Mutex<HashMap<Region, Arc<OnceCell<Arc<dyn CloudClient>>>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Pool {
    /// New pool; call [`Pool::recover`] before requesting instances
    pub fn new(
        config: BrokerConfig,
        provider: Arc<dyn CloudProvider>,
        registry: ImageRegistry,
    ) -> Pool {
        let (ready_tx, ready_rx) = watch::channel(false);
        Pool {
            config,
            provider,
            registry,
            state: Mutex::new(PoolState::default()),
            clients: Mutex::new(HashMap::new()),
            ready_tx,
            ready_rx,
        }
    }

    /// Completes when startup recovery has finished. Allocation
    /// requests block on this so an early caller cannot race the
    /// recovery sweep and double-allocate instances that belong in a
    /// recovery bucket.
    pub async fn ready(&self) {
        let mut ready = self.ready_rx.clone();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                break;
            }
        }
    }

    /// Memoized per-region client. Creation is serialized per region:
    /// the first caller connects, everyone else awaits the same cell.
    async fn client(&self, region: Region) -> Result<Arc<dyn CloudClient>, CloudError> {
        let cell = {
            let mut clients = self.clients.lock().await;
            clients
                .entry(region)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let provider = self.provider.clone();
        let client = cell
            .get_or_try_init(|| async move { provider.connect(region).await })
            .await?;
        Ok(client.clone())
    }

    /// Sweep every region for tagged instances and classify them.
    /// Idempotent: running it again over the same live fleet yields
    /// the same free lists and buckets.
    pub async fn recover(&self) -> Result<(), BrokerError> {
        let filters = tags::fleet_filters(&self.config.broker_id);
        let sweeps = Region::all().iter().map(|region| {
            let filters = filters.clone();
            async move {
                let client = self.client(*region).await?;
                client.describe_instances(&filters).await
            }
        });
        let described: Vec<Result<Vec<CloudInstance>, CloudError>> = stream::iter(sweeps)
            .buffer_unordered(self.config.pool_workers.max(1))
            .collect()
            .await;

        let now = Utc::now();
        let mut free: HashMap<Region, Vec<CloudInstance>> = HashMap::new();
        let mut recovered: HashMap<(RunId, StepId), Vec<CloudInstance>> = HashMap::new();
        let mut total = 0;
        for result in described {
            for instance in result? {
                total += 1;
                if instance.state == InstanceState::Terminated {
                    continue;
                }
                if !instance.available(now) {
                    // stalled or stopping; keep for the reaper
                    free.entry(instance.region).or_default().push(instance);
                    continue;
                }
                if instance.is_allocated() {
                    let key = (
                        instance.tag(tags::RUN_ID).unwrap_or_default().to_string(),
                        instance.tag(tags::STEP_ID).unwrap_or_default().to_string(),
                    );
                    recovered.entry(key).or_default().push(instance);
                } else {
                    free.entry(instance.region).or_default().push(instance);
                }
            }
        }

        let buckets = recovered.len();
        {
            let mut state = self.state.lock().await;
            state.free = free;
            state.recovered = recovered;
        }
        let _ = self.ready_tx.send(true);
        info!(
            "Pool recovery finished: {} instance(s) seen, {} allocation bucket(s)",
            total, buckets
        );
        Ok(())
    }

    /// Lease a collection of `count` instances for `(run_id,
    /// step_id)`.
    ///
    /// Allocation order: the recovery bucket for this exact lease,
    /// then available type-matching instances from the region free
    /// list, then a single batched create for the deficit. With
    /// `allocate_missing` unset only the bucket is drained, which is
    /// how a resumed run reattaches without creating machines.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_instances(
        &self,
        run_id: &str,
        step_id: &str,
        count: u32,
        instance_type: &str,
        region: Region,
        owner: Option<&str>,
        allocate_missing: bool,
    ) -> Result<Collection, BrokerError> {
        self.ready().await;
        let client = self.client(region).await?;
        let now = Utc::now();
        let wanted = count as usize;

        let mut instances = {
            let mut state = self.state.lock().await;
            let mut instances = state
                .recovered
                .remove(&(run_id.to_string(), step_id.to_string()))
                .unwrap_or_default();
            if instances.len() > wanted {
                let extra = instances.split_off(wanted);
                state.free.entry(region).or_default().extend(extra);
            }

            if allocate_missing && instances.len() < wanted {
                let free = state.free.entry(region).or_default();
                let mut kept = Vec::with_capacity(free.len());
                for candidate in free.drain(..) {
                    if instances.len() < wanted
                        && candidate.instance_type == instance_type
                        && candidate.available(now)
                    {
                        instances.push(candidate);
                    } else {
                        kept.push(candidate);
                    }
                }
                *free = kept;
            }
            instances
        };

        if allocate_missing && instances.len() < wanted {
            let deficit = (wanted - instances.len()) as u32;
            let image = self.registry.get(region, instance_type)?;
            debug!(
                "Creating {} instance(s) of {} in {} for run {} step {}",
                deficit, instance_type, region, run_id, step_id
            );
            let created = client
                .run_instances(&LaunchRequest {
                    image,
                    count: deficit,
                    instance_type: instance_type.to_string(),
                    key_pair: self.config.key_pair.clone(),
                    security_group: self.config.security_group.clone(),
                    user_data: self.config.user_data.clone(),
                })
                .await?;
            if created.len() < deficit as usize {
                warn!(
                    "IaaS returned {} of {} requested instances",
                    created.len(),
                    deficit
                );
            }
            instances.extend(created);
        }

        if !instances.is_empty() {
            let tag_set = tags::allocation(&self.config.broker_id, run_id, step_id, owner);
            let ids: Vec<InstanceId> = instances.iter().map(|inst| inst.id.clone()).collect();
            self.tag_with_retry(&client, &ids, &tag_set, run_id, step_id)
                .await?;
            for instance in &mut instances {
                for (key, value) in &tag_set {
                    instance.tags.insert(key.clone(), value.clone());
                }
            }
        }

        debug!(
            "Leased {} instance(s) to run {} step {}",
            instances.len(),
            run_id,
            step_id
        );
        Ok(Collection::new(
            run_id.to_string(),
            step_id.to_string(),
            region,
            instances,
            client,
        ))
    }

    async fn tag_with_retry(
        &self,
        client: &Arc<dyn CloudClient>,
        ids: &[InstanceId],
        tag_set: &[(String, String)],
        run_id: &str,
        step_id: &str,
    ) -> Result<(), BrokerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match client.create_tags(ids, tag_set).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < TAG_ATTEMPTS => {
                    // freshly created instances may not be visible yet
                    warn!(
                        "Tagging attempt {}/{} failed: {}",
                        attempt, TAG_ATTEMPTS, error
                    );
                    tokio::time::sleep(TAG_RETRY_DELAY).await;
                }
                Err(error) => {
                    return Err(error).context(TagInstances {
                        run_id,
                        step_id,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// Return a collection's instances to the free list, clearing
    /// their allocation tags first
    pub async fn release_instances(&self, collection: Collection) -> Result<(), BrokerError> {
        let region = collection.region;
        let mut instances = collection.into_instances();
        if instances.is_empty() {
            return Ok(());
        }
        let client = self.client(region).await?;
        let ids: Vec<InstanceId> = instances.iter().map(|inst| inst.id.clone()).collect();
        client.create_tags(&ids, &tags::release()).await?;
        for instance in &mut instances {
            instance.tags.remove(tags::RUN_ID);
            instance.tags.remove(tags::STEP_ID);
        }

        let count = instances.len();
        let mut state = self.state.lock().await;
        state.free.entry(region).or_default().extend(instances);
        debug!("Released {} instance(s) back to {}", count, region);
        Ok(())
    }

    /// Terminate every free instance across all regions
    pub async fn reap_instances(&self) -> Result<(), BrokerError> {
        let reapable = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.free)
        };
        for (region, instances) in reapable {
            if instances.is_empty() {
                continue;
            }
            let client = self.client(region).await?;
            let ids: Vec<InstanceId> = instances.iter().map(|inst| inst.id.clone()).collect();
            info!("Reaping {} instance(s) in {}", ids.len(), region);
            client.terminate_instances(&ids).await?;
        }
        Ok(())
    }

    /// Every instance the pool currently tracks, free and recovered
    pub async fn instances(&self) -> Vec<CloudInstance> {
        let state = self.state.lock().await;
        state
            .free
            .values()
            .flatten()
            .chain(state.recovered.values().flatten())
            .cloned()
            .collect()
    }

    /// One tracked instance by id
    pub async fn find_instance(&self, id: &str) -> Option<CloudInstance> {
        self.instances()
            .await
            .into_iter()
            .find(|instance| instance.id.0 == id)
    }

    /// Terminate one tracked free instance by id
    pub async fn terminate_instance(&self, id: &str) -> Result<(), BrokerError> {
        let found = {
            let mut state = self.state.lock().await;
            let mut found = None;
            for (_, instances) in state.free.iter_mut() {
                if let Some(position) =
                    instances.iter().position(|instance| instance.id.0 == id)
                {
                    found = Some(instances.remove(position));
                    break;
                }
            }
            found
        };
        let instance = match found {
            Some(instance) => instance,
            None => return InstanceNotFound { id }.fail(),
        };
        let client = self.client(instance.region).await?;
        client
            .terminate_instances(&[instance.id.clone()])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pool_with, FakeCloud};

    #[tokio::test]
    async fn allocation_creates_the_deficit_in_one_batch() {
        let fake = FakeCloud::new();
        let pool = pool_with(&fake).await;
        pool.recover().await.unwrap();

        let collection = pool
            .request_instances("run-1", "step-1", 3, "t1.micro", Region::UsWest2, None, true)
            .await
            .unwrap();
        assert_eq!(collection.len(), 3);
        assert_eq!(fake.launch_calls().await, 1);

        for member in collection.members() {
            assert_eq!(member.instance.tag(tags::RUN_ID), Some("run-1"));
            assert_eq!(member.instance.tag(tags::STEP_ID), Some("step-1"));
            assert_eq!(member.instance.tag(tags::PROJECT), Some("loads"));
        }
    }

    #[tokio::test]
    async fn release_clears_tags_and_feeds_the_free_list() {
        let fake = FakeCloud::new();
        let pool = pool_with(&fake).await;
        pool.recover().await.unwrap();

        let collection = pool
            .request_instances("run-1", "step-1", 2, "t1.micro", Region::UsWest2, None, true)
            .await
            .unwrap();
        pool.release_instances(collection).await.unwrap();

        // nothing on the IaaS side still carries allocation tags
        let described = fake.all_instances().await;
        assert!(described.iter().all(|instance| !instance.is_allocated()));

        // a second lease reuses the freed machines instead of creating
        let collection = pool
            .request_instances("run-2", "step-9", 2, "t1.micro", Region::UsWest2, None, true)
            .await
            .unwrap();
        assert_eq!(collection.len(), 2);
        assert_eq!(fake.launch_calls().await, 1);
    }

    #[tokio::test]
    async fn recovery_buckets_are_drained_before_anything_else() {
        let fake = FakeCloud::new();
        {
            let pool = pool_with(&fake).await;
            pool.recover().await.unwrap();
            let _leased = pool
                .request_instances("run-1", "step-1", 2, "t1.micro", Region::UsWest2, None, true)
                .await
                .unwrap();
            // broker "crashes" here: the lease is never released
        }

        let pool = pool_with(&fake).await;
        pool.recover().await.unwrap();
        let collection = pool
            .request_instances("run-1", "step-1", 2, "t1.micro", Region::UsWest2, None, false)
            .await
            .unwrap();
        assert_eq!(collection.len(), 2);
        // reattach must not create machines
        assert_eq!(fake.launch_calls().await, 1);
    }

    #[tokio::test]
    async fn recovery_is_idempotent() {
        let fake = FakeCloud::new();
        let pool = pool_with(&fake).await;
        pool.recover().await.unwrap();
        let _ = pool
            .request_instances("run-1", "step-1", 2, "t1.micro", Region::UsWest2, None, true)
            .await
            .unwrap();

        let pool_a = pool_with(&fake).await;
        pool_a.recover().await.unwrap();
        let pool_b = pool_with(&fake).await;
        pool_b.recover().await.unwrap();

        let mut a: Vec<String> = pool_a
            .instances()
            .await
            .into_iter()
            .map(|instance| instance.id.0)
            .collect();
        let mut b: Vec<String> = pool_b
            .instances()
            .await
            .into_iter()
            .map(|instance| instance.id.0)
            .collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn free_list_never_crosses_regions() {
        let fake = FakeCloud::new();
        let pool = pool_with(&fake).await;
        pool.recover().await.unwrap();

        let collection = pool
            .request_instances("run-1", "step-1", 2, "t1.micro", Region::UsWest2, None, true)
            .await
            .unwrap();
        pool.release_instances(collection).await.unwrap();

        // an allocation in another region cannot see us-west-2 frees
        let collection = pool
            .request_instances("run-1", "step-2", 1, "t1.micro", Region::UsEast1, None, true)
            .await
            .unwrap();
        assert_eq!(collection.len(), 1);
        assert_eq!(fake.launch_calls().await, 2);
    }

    #[tokio::test]
    async fn reap_terminates_every_free_instance() {
        let fake = FakeCloud::new();
        let pool = pool_with(&fake).await;
        pool.recover().await.unwrap();
        let collection = pool
            .request_instances("run-1", "step-1", 2, "t1.micro", Region::UsWest2, None, true)
            .await
            .unwrap();
        pool.release_instances(collection).await.unwrap();

        pool.reap_instances().await.unwrap();
        assert!(pool.instances().await.is_empty());
        assert!(fake
            .all_instances()
            .await
            .iter()
            .all(|instance| instance.state == InstanceState::Terminated));
    }
}
