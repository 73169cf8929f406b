//! Container operations fanned out over a collection.
//!
//! Per-instance failures here never escape to the scheduler: they mark
//! the instance non-responsive (and prune it where the caller asked
//! for that) and the step carries on with fewer machines.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use dockerhost::env::{interpolate, interpolate_all};
use dockerhost::{ContainerRun, HostFactory};

use crate::collection::{Collection, Member};

/// Graceful stop window handed to the daemon
pub const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything needed to fan a container out over a collection
#[derive(Debug, Clone, Default)]
pub struct ContainerLaunch {
    /// Image reference, already interpolated
    pub name: String,
    /// Raw command arguments; interpolated per instance
    pub command_args: Option<String>,
    /// Raw environment; values interpolated per instance
    pub env: BTreeMap<String, String>,
    /// Interpolation source: the run environment
    pub vars: BTreeMap<String, String>,
    /// Host port to `container[/proto]` bindings
    pub ports: BTreeMap<String, String>,
    /// Host path to container path binds
    pub volumes: BTreeMap<String, String>,
    /// Stagger between successive instance launches
    pub stagger: Option<Duration>,
    /// Run in the host pid namespace
    pub pid_host: bool,
    /// Point the container at the instance's local resolver when one
    /// was started
    pub use_local_dns: bool,
}

/// Synthetic per-instance interpolation keys
fn instance_vars(member: &Member) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    if let Some(ip) = &member.instance.public_ip {
        vars.insert("HOST_IP".to_string(), ip.clone());
    }
    if let Some(ip) = &member.instance.private_ip {
        vars.insert("PRIVATE_IP".to_string(), ip.clone());
        vars.insert("STATSD_HOST".to_string(), ip.clone());
    }
    vars.insert("STATSD_PORT".to_string(), "8125".to_string());
    vars
}

/// Attach a container daemon handle to every member that has none.
/// Members without a reachable address are flagged non-responsive.
pub fn setup_hosts(collection: &mut Collection, factory: &dyn HostFactory) {
    for member in collection.members_mut() {
        if member.ext.host.is_some() || member.is_dead() {
            continue;
        }
        let address = match member.address() {
            Some(address) => address.to_string(),
            None => {
                warn!("Instance {} has no address; flagging", member.instance.id);
                member.ext.nonresponsive = true;
                continue;
            }
        };
        match factory.host(&address) {
            Ok(host) => member.ext.host = Some(host),
            Err(error) => {
                warn!("Failed to build host for {}: {}", address, error);
                member.ext.nonresponsive = true;
            }
        }
    }
}

/// Wait until every member's daemon answers the inventory call, up to
/// `timeout`. Non-responders are pruned from the collection. Returns
/// how many were pruned.
pub async fn wait_ready(
    collection: &mut Collection,
    interval: Duration,
    timeout: Duration,
) -> usize {
    let deadline = Instant::now() + timeout;
    let mut responded: Vec<bool> = vec![false; collection.len()];

    loop {
        let waiting: Vec<usize> = collection
            .members()
            .iter()
            .enumerate()
            .filter(|(index, member)| !responded[*index] && !member.is_dead())
            .map(|(index, _)| index)
            .collect();
        if waiting.is_empty() {
            break;
        }

        let results = collection
            .map_live(None, |index, member| {
                let host = member.ext.host.clone();
                let probe = waiting.contains(&index);
                async move {
                    match host {
                        Some(host) if probe => host.containers().await.is_ok(),
                        _ => false,
                    }
                }
            })
            .await;
        for (index, ok) in results {
            if ok {
                responded[index] = true;
            }
        }

        let still_waiting = collection
            .members()
            .iter()
            .enumerate()
            .any(|(index, member)| !responded[index] && !member.is_dead());
        if !still_waiting {
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    let mut pruned = 0;
    for (index, member) in collection.members_mut().iter_mut().enumerate() {
        if !responded[index] && !member.is_dead() {
            member.ext.nonresponsive = true;
            pruned += 1;
        }
    }
    if pruned > 0 {
        warn!("Pruning {} non-responding instance(s)", pruned);
        collection.remove_dead_instances().await;
    }
    pruned
}

/// Make sure `name` is present on every live member, importing from
/// `url` when one is given, pulling from the registry otherwise.
/// Members that cannot load the image are flagged non-responsive.
pub async fn load_image(collection: &mut Collection, name: &str, url: Option<&str>) {
    let results = collection
        .map_live(None, |_, member| {
            let host = member.ext.host.clone();
            let name = name.to_string();
            let url = url.map(|u| u.to_string());
            async move {
                let host = match host {
                    Some(host) => host,
                    None => return false,
                };
                let load = async {
                    if host.has_image(&name).await? {
                        return Ok(true);
                    }
                    match &url {
                        Some(url) => host.import_image(url).await?,
                        None => host.pull_image(&name).await?,
                    }
                    host.has_image(&name).await
                };
                match load.await {
                    Ok(true) => true,
                    Ok(false) => {
                        warn!("Image '{}' missing on {} after load", name, host.host());
                        false
                    }
                    Err(error) => {
                        warn!("Failed to load '{}' on {}: {}", name, host.host(), error);
                        false
                    }
                }
            }
        })
        .await;

    for (index, loaded) in results {
        if !loaded {
            collection.members_mut()[index].ext.nonresponsive = true;
        }
    }
}

/// Start `launch` on every live member, staggered by `launch.stagger`.
/// Per-instance failures flag the instance and are swallowed; the
/// count of successful starts comes back so callers can notice a
/// whole-step failure.
pub async fn run_containers(collection: &mut Collection, launch: &ContainerLaunch) -> usize {
    let results = collection
        .map_live(launch.stagger, |_, member| {
            let host = member.ext.host.clone();
            let run = container_run(launch, member);
            async move {
                let host = match host {
                    Some(host) => host,
                    None => return false,
                };
                match host.run_container(&run).await {
                    Ok(()) => true,
                    Err(error) => {
                        warn!("Failed to start {} on {}: {}", run.name, host.host(), error);
                        false
                    }
                }
            }
        })
        .await;

    let mut started_count = 0;
    for (index, started) in results {
        if started {
            started_count += 1;
        } else {
            collection.members_mut()[index].ext.nonresponsive = true;
        }
    }
    started_count
}

fn container_run(launch: &ContainerLaunch, member: &Member) -> ContainerRun {
    let mut vars = launch.vars.clone();
    vars.append(&mut instance_vars(member));

    let mut env = interpolate_all(&launch.env, &vars);
    // the synthetic keys are part of the container environment too
    for (name, value) in instance_vars(member) {
        env.entry(name).or_insert(value);
    }

    ContainerRun {
        name: launch.name.clone(),
        command_args: launch
            .command_args
            .as_ref()
            .map(|args| interpolate(args, &vars)),
        env,
        volumes: launch.volumes.clone(),
        ports: launch.ports.clone(),
        dns: if launch.use_local_dns {
            member.ext.resolver_ip.clone()
        } else {
            None
        },
        pid_host: launch.pid_host,
    }
}

/// Whether any live member still runs a container created from
/// `name`. Members whose inventory call fails are flagged, and pruned
/// when `prune` is set.
pub async fn is_running(collection: &mut Collection, name: &str, prune: bool) -> bool {
    let results = collection
        .map_live(None, |_, member| {
            let host = member.ext.host.clone();
            let name = name.to_string();
            async move {
                match host {
                    Some(host) => host.is_running(&name).await.map_err(|error| {
                        warn!("Inventory failed on {}: {}", host.host(), error);
                    }),
                    None => Err(()),
                }
            }
        })
        .await;

    let mut any_running = false;
    let mut failed = vec![];
    for (index, result) in results {
        match result {
            Ok(true) => any_running = true,
            Ok(false) => {}
            Err(()) => failed.push(index),
        }
    }
    if prune && !failed.is_empty() {
        for index in &failed {
            collection.members_mut()[*index].ext.nonresponsive = true;
        }
        collection.remove_dead_instances().await;
    }
    any_running
}

/// Gracefully stop every container created from `name` across the
/// collection
pub async fn stop_containers(collection: &mut Collection, name: &str, timeout: Duration) {
    let results = collection
        .map_live(None, |_, member| {
            let host = member.ext.host.clone();
            let name = name.to_string();
            async move {
                match host {
                    Some(host) => match host.stop_container(&name, timeout).await {
                        Ok(()) => true,
                        Err(error) => {
                            warn!("Failed to stop {} on {}: {}", name, host.host(), error);
                            false
                        }
                    },
                    None => false,
                }
            }
        })
        .await;

    for (index, stopped) in results {
        if !stopped {
            collection.members_mut()[index].ext.nonresponsive = true;
        }
    }
    debug!("Stopped '{}' across collection", name);
}
