//! In-crate test doubles: a scripted IaaS, scripted container hosts,
//! and a no-op shell. The scenario tests drive the real pool, run
//! manager, and broker against these.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use cloud::{
    CloudClient, CloudError, CloudInstance, CloudProvider, Filter, InstanceId, InstanceState,
    LaunchRequest, MachineImage, Region, Virtualization,
};
use dockerhost::{ContainerHost, ContainerRun, ContainerSummary, HostError, HostFactory};
use shell::{ExecOutput, RemoteShell, ShellError};

use crate::config::BrokerConfig;
use crate::db::{Plan, Project, Step};
use crate::extensions::Helpers;
use crate::images::ImageRegistry;
use crate::pool::Pool;

/// Scripted IaaS shared by every region client it hands out
#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<FakeFleet>>,
}

#[derive(Default)]
struct FakeFleet {
    instances: HashMap<InstanceId, CloudInstance>,
    counter: usize,
    launch_calls: usize,
    fail_terminate_once: bool,
}

impl FakeCloud {
    /// New empty fleet
    pub fn new() -> FakeCloud {
        FakeCloud::default()
    }

    /// How many batched create calls the fleet has seen
    pub async fn launch_calls(&self) -> usize {
        self.state.lock().await.launch_calls
    }

    /// Every instance ever created, terminated ones included
    pub async fn all_instances(&self) -> Vec<CloudInstance> {
        self.state.lock().await.instances.values().cloned().collect()
    }

    /// Put an instance into `state`; the fleet never transitions
    /// states on its own, so it stays there
    pub async fn pin_state(&self, id: &InstanceId, state: InstanceState) {
        let mut fleet = self.state.lock().await;
        if let Some(instance) = fleet.instances.get_mut(id) {
            instance.state = state;
        }
    }

    /// Make the next terminate call fail
    pub async fn fail_next_terminate(&self) {
        self.state.lock().await.fail_terminate_once = true;
    }

    /// Create `count` Running instances outside any pool bookkeeping
    pub async fn seed_running(
        &self,
        region: Region,
        count: u32,
        instance_type: &str,
    ) -> Vec<CloudInstance> {
        let mut fleet = self.state.lock().await;
        (0 .. count)
            .map(|_| fleet.spawn(region, instance_type))
            .collect()
    }
}

impl FakeFleet {
    fn spawn(&mut self, region: Region, instance_type: &str) -> CloudInstance {
        self.counter += 1;
        let n = self.counter;
        let instance = CloudInstance {
            id: InstanceId(format!("i-{:017x}", n)),
            region,
            instance_type: instance_type.to_string(),
            public_ip: Some(format!("203.0.113.{}", n)),
            private_ip: Some(format!("10.0.0.{}", n)),
            state: InstanceState::Running,
            launch_time: Some(Utc::now()),
            tags: HashMap::new(),
        };
        self.instances.insert(instance.id.clone(), instance.clone());
        instance
    }

    fn matches(instance: &CloudInstance, filters: &[Filter]) -> bool {
        filters.iter().all(|(name, values)| {
            if name == "instance-id" {
                return values.iter().any(|value| value == &instance.id.0);
            }
            if let Some(key) = name.strip_prefix("tag:") {
                return match instance.tags.get(key) {
                    Some(actual) => values.iter().any(|value| {
                        match value.strip_suffix('*') {
                            Some(prefix) => actual.starts_with(prefix),
                            None => actual == value,
                        }
                    }),
                    None => false,
                };
            }
            false
        })
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn connect(&self, region: Region) -> Result<Arc<dyn CloudClient>, CloudError> {
        Ok(Arc::new(FakeClient {
            region,
            state: self.state.clone(),
        }))
    }
}

struct FakeClient {
    region: Region,
    state: Arc<Mutex<FakeFleet>>,
}

#[async_trait]
impl CloudClient for FakeClient {
    fn region(&self) -> Region {
        self.region
    }

    async fn describe_instances(
        &self,
        filters: &[Filter],
    ) -> Result<Vec<CloudInstance>, CloudError> {
        let fleet = self.state.lock().await;
        Ok(fleet
            .instances
            .values()
            .filter(|instance| instance.region == self.region)
            .filter(|instance| FakeFleet::matches(instance, filters))
            .cloned()
            .collect())
    }

    async fn run_instances(
        &self,
        request: &LaunchRequest,
    ) -> Result<Vec<CloudInstance>, CloudError> {
        let mut fleet = self.state.lock().await;
        fleet.launch_calls += 1;
        Ok((0 .. request.count)
            .map(|_| fleet.spawn(self.region, &request.instance_type))
            .collect())
    }

    async fn create_tags(
        &self,
        ids: &[InstanceId],
        tags: &[(String, String)],
    ) -> Result<(), CloudError> {
        let mut fleet = self.state.lock().await;
        for id in ids {
            if let Some(instance) = fleet.instances.get_mut(id) {
                for (key, value) in tags {
                    if value.is_empty() {
                        instance.tags.remove(key);
                    } else {
                        instance.tags.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), CloudError> {
        let mut fleet = self.state.lock().await;
        if fleet.fail_terminate_once {
            fleet.fail_terminate_once = false;
            return Err(CloudError::Internal {
                message: "simulated terminate outage".to_string(),
            });
        }
        for id in ids {
            if let Some(instance) = fleet.instances.get_mut(id) {
                instance.state = InstanceState::Terminated;
            }
        }
        Ok(())
    }

    async fn describe_images(&self, _owner_id: &str) -> Result<Vec<MachineImage>, CloudError> {
        Ok(vec![
            MachineImage {
                id: format!("ami-{}hvm", self.region.as_str().replace('-', "")),
                name: "base-0002".to_string(),
                virtualization: Virtualization::Hvm,
            },
            MachineImage {
                id: format!("ami-{}pv", self.region.as_str().replace('-', "")),
                name: "base-0001".to_string(),
                virtualization: Virtualization::Paravirtual,
            },
        ])
    }
}

/// Scripted container hosts, one per instance address
#[derive(Clone, Default)]
pub struct FakeHosts {
    state: Arc<StdMutex<HashMap<String, Arc<FakeHostState>>>>,
    launches: Arc<StdMutex<Vec<(String, ContainerRun)>>>,
}

#[derive(Default)]
struct FakeHostState {
    containers: StdMutex<Vec<ContainerSummary>>,
    images: StdMutex<HashSet<String>>,
    fail_inventory: AtomicBool,
    ids: AtomicUsize,
}

impl FakeHosts {
    /// New factory with no hosts yet
    pub fn new() -> FakeHosts {
        FakeHosts::default()
    }

    fn host_state(&self, host_ip: &str) -> Arc<FakeHostState> {
        let mut hosts = self.state.lock().unwrap();
        hosts
            .entry(host_ip.to_string())
            .or_insert_with(|| Arc::new(FakeHostState::default()))
            .clone()
    }

    /// Make the daemon at `host_ip` stop answering inventory calls
    pub fn fail_inventory(&self, host_ip: &str) {
        self.host_state(host_ip)
            .fail_inventory
            .store(true, Ordering::SeqCst);
    }

    /// Simulate every container created from `image` exiting on every
    /// host
    pub fn finish_containers(&self, image: &str) {
        let hosts = self.state.lock().unwrap();
        for state in hosts.values() {
            state
                .containers
                .lock()
                .unwrap()
                .retain(|container| !container.image.contains(image));
        }
    }

    /// Every container start observed, with the full launch spec
    pub fn launches(&self) -> Vec<(String, ContainerRun)> {
        self.launches.lock().unwrap().clone()
    }

    /// Starts of `image`, as `(host, launch)` pairs
    pub fn launches_of(&self, image: &str) -> Vec<(String, ContainerRun)> {
        self.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, run)| run.name.contains(image))
            .cloned()
            .collect()
    }

    /// How many times `image` was started anywhere
    pub fn started_count(&self, image: &str) -> usize {
        self.launches_of(image).len()
    }

    /// Containers currently running on `host_ip`
    pub fn containers_on(&self, host_ip: &str) -> Vec<String> {
        self.host_state(host_ip)
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|container| container.image.clone())
            .collect()
    }
}

impl HostFactory for FakeHosts {
    fn host(&self, host_ip: &str) -> Result<Arc<dyn ContainerHost>, HostError> {
        Ok(Arc::new(FakeHost {
            host: host_ip.to_string(),
            state: self.host_state(host_ip),
            launches: self.launches.clone(),
        }))
    }
}

struct FakeHost {
    host: String,
    state: Arc<FakeHostState>,
    launches: Arc<StdMutex<Vec<(String, ContainerRun)>>>,
}

#[async_trait]
impl ContainerHost for FakeHost {
    fn host(&self) -> &str {
        &self.host
    }

    async fn containers(&self) -> Result<Vec<ContainerSummary>, HostError> {
        if self.state.fail_inventory.load(Ordering::SeqCst) {
            return Err(HostError::ImageMissing {
                host: self.host.clone(),
                name: "inventory refused".to_string(),
            });
        }
        Ok(self.state.containers.lock().unwrap().clone())
    }

    async fn has_image(&self, _name: &str) -> Result<bool, HostError> {
        // fake hosts are pre-provisioned; pulls and imports are
        // recorded but never required
        Ok(true)
    }

    async fn pull_image(&self, name: &str) -> Result<(), HostError> {
        self.state.images.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn import_image(&self, url: &str) -> Result<(), HostError> {
        // the archive name stands in for the image it carries
        self.state.images.lock().unwrap().insert(url.to_string());
        Ok(())
    }

    async fn run_container(&self, run: &ContainerRun) -> Result<(), HostError> {
        if self.state.fail_inventory.load(Ordering::SeqCst) {
            return Err(HostError::ImageMissing {
                host: self.host.clone(),
                name: run.name.clone(),
            });
        }
        let id = self.state.ids.fetch_add(1, Ordering::SeqCst);
        self.state.containers.lock().unwrap().push(ContainerSummary {
            id: format!("c-{}", id),
            image: run.name.clone(),
        });
        self.launches
            .lock()
            .unwrap()
            .push((self.host.clone(), run.clone()));
        Ok(())
    }

    async fn stop_container(&self, name: &str, _timeout: Duration) -> Result<(), HostError> {
        self.state
            .containers
            .lock()
            .unwrap()
            .retain(|container| !container.image.contains(name));
        Ok(())
    }
}

/// A shell that succeeds at everything and touches nothing
#[derive(Default)]
pub struct NullShell;

#[async_trait]
impl RemoteShell for NullShell {
    async fn exec(&self, _host: &str, _command: &str) -> Result<ExecOutput, ShellError> {
        Ok(ExecOutput {
            status: 0,
            stdout: String::new(),
        })
    }

    async fn upload(
        &self,
        _host: &str,
        _bytes: &[u8],
        _remote_path: &str,
    ) -> Result<(), ShellError> {
        Ok(())
    }
}

/// Pool over the fake fleet with default settings
pub async fn pool_with(fake: &FakeCloud) -> Pool {
    let config = BrokerConfig::default();
    let registry = ImageRegistry::populate(fake, Region::all(), &config.image_owner_id)
        .await
        .unwrap();
    Pool::new(config, Arc::new(fake.clone()), registry)
}

/// Helper bundle over fakes, with waits shrunk for tests
pub fn helpers_with(hosts: &FakeHosts) -> Arc<Helpers> {
    Arc::new(Helpers {
        factory: Arc::new(hosts.clone()),
        shell: Arc::new(NullShell::default()),
        wait: crate::extensions::WaitBudgets {
            running_interval: Duration::from_millis(10),
            running_timeout: Duration::from_millis(500),
            daemon_interval: Duration::from_millis(10),
            daemon_timeout: Duration::from_millis(300),
        },
    })
}

/// Broker settings tuned for fast tests
pub fn fast_config() -> BrokerConfig {
    BrokerConfig {
        poll_interval: Duration::from_millis(50),
        ..BrokerConfig::default()
    }
}

/// A project fixture
pub fn project(name: &str, plans: Vec<Plan>) -> Project {
    Project {
        uuid: String::new(),
        name: name.to_string(),
        plans,
    }
}

/// A plan fixture
pub fn plan(name: &str, steps: Vec<Step>) -> Plan {
    Plan {
        uuid: String::new(),
        name: name.to_string(),
        enabled: true,
        steps,
    }
}

/// A step fixture: us-west-2, t1.micro, five second cap
pub fn step(container: &str, count: u32) -> Step {
    Step {
        uuid: Uuid::new_v4().to_string(),
        instance_region: Region::UsWest2,
        instance_type: "t1.micro".to_string(),
        instance_count: count,
        container_name: container.to_string(),
        container_url: None,
        environment_data: BTreeMap::new(),
        additional_command_args: None,
        port_mapping: BTreeMap::new(),
        volume_mapping: BTreeMap::new(),
        dns_name: None,
        run_delay: 0,
        run_max_time: 5,
        node_delay: 0,
        prune_running: false,
        docker_series: None,
    }
}
