//! Base sidecars started around every step, plus the host-level
//! helpers they need. Sidecar failures follow the usual rule: flag
//! the instance, never fail the step.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use dockerhost::HostFactory;
use shell::RemoteShell;

use crate::collection::Collection;
use crate::docker::{self, ContainerLaunch, STOP_TIMEOUT};

/// A sidecar image and the archive it can be imported from when the
/// registry is unreachable
#[derive(Debug, Clone, Copy)]
pub struct ContainerInfo {
    /// Image reference
    pub name: &'static str,
    /// Optional archive URL, fed through `docker load`
    pub url: Option<&'static str>,
}

/// Watches the step container and host health
pub const WATCHER_INFO: ContainerInfo = ContainerInfo {
    name: "loadswatch:latest",
    url: Some("https://s3.amazonaws.com/loads-docker-images/loadswatch.tar.bz2"),
};

/// Ships statsd and log traffic to the run's metrics sink
pub const SHIPPER_INFO: ContainerInfo = ContainerInfo {
    name: "pjenvey/heka:0.10.0",
    url: Some("https://s3.amazonaws.com/loads-docker-images/heka-0.10.0.tar.bz2"),
};

/// Local resolver pre-seeded with the run's DNS map
pub const DNSMASQ_INFO: ContainerInfo = ContainerInfo {
    name: "kitcambridge/dnsmasq:latest",
    url: Some("https://s3.amazonaws.com/loads-docker-images/dnsmasq.tar.bz2"),
};

/// Images pulled onto every non-monitor collection during
/// initialization
pub const BASE_CONTAINERS: [ContainerInfo; 3] = [WATCHER_INFO, SHIPPER_INFO, DNSMASQ_INFO];

/// Where the shipper config lands on each host
const SHIPPER_CONFIG_PATH: &str = "/home/core/shipper/config.toml";

/// Capabilities shared by every run manager
pub struct Helpers {
    /// Builds container daemon handles per instance
    pub factory: Arc<dyn HostFactory>,
    /// Remote shell for host-level chores
    pub shell: Arc<dyn RemoteShell>,
    /// Polling budgets for collection readiness
    pub wait: WaitBudgets,
}

/// How long to wait, and how often to look, while a collection comes
/// up
#[derive(Debug, Clone)]
pub struct WaitBudgets {
    /// Poll interval while instances reach Running
    pub running_interval: std::time::Duration,
    /// Hard cap on waiting for Running
    pub running_timeout: std::time::Duration,
    /// Poll interval while container daemons come up
    pub daemon_interval: std::time::Duration,
    /// Hard cap on waiting for container daemons
    pub daemon_timeout: std::time::Duration,
}

impl Default for WaitBudgets {
    fn default() -> Self {
        Self {
            running_interval: std::time::Duration::from_secs(5),
            running_timeout: std::time::Duration::from_secs(600),
            daemon_interval: std::time::Duration::from_secs(5),
            daemon_timeout: std::time::Duration::from_secs(360),
        }
    }
}

/// Address of the run's metrics sink, published by the monitor step
#[derive(Debug, Clone)]
pub struct MetricsOptions {
    /// Sink host
    pub host: String,
    /// Sink port
    pub port: u16,
    /// Database the run writes into
    pub database: String,
}

/// Reload kernel parameters on every host. The base machine image
/// does not apply sysctl drop-ins on boot.
pub async fn reload_sysctl(shell: &dyn RemoteShell, collection: &Collection) {
    let results = collection
        .map_live(None, |_, member| {
            let address = member.address().map(|a| a.to_string());
            async move {
                let address = match address {
                    Some(address) => address,
                    None => return false,
                };
                match shell.exec(&address, "sudo sysctl --system").await {
                    Ok(output) => output.success(),
                    Err(error) => {
                        warn!("sysctl reload failed on {}: {}", address, error);
                        false
                    }
                }
            }
        })
        .await;
    let failures = results.iter().filter(|(_, ok)| !ok).count();
    if failures > 0 {
        warn!("sysctl reload failed on {} host(s)", failures);
    }
}

/// The watcher sidecar
pub struct Watcher;

impl Watcher {
    /// Start the watcher on every instance
    pub async fn start(collection: &mut Collection) {
        let mut volumes = BTreeMap::new();
        volumes.insert(
            "/var/run/docker.sock".to_string(),
            "/var/run/docker.sock".to_string(),
        );
        let launch = ContainerLaunch {
            name: WATCHER_INFO.name.to_string(),
            volumes,
            pid_host: true,
            ..Default::default()
        };
        docker::run_containers(collection, &launch).await;
    }

    /// Stop the watcher everywhere
    pub async fn stop(collection: &mut Collection) {
        docker::stop_containers(collection, WATCHER_INFO.name, STOP_TIMEOUT).await;
    }
}

/// The metrics shipper sidecar
pub struct MetricsShipper;

impl MetricsShipper {
    /// Upload per-host config and start the shipper on every instance
    pub async fn start(
        collection: &mut Collection,
        shell: &dyn RemoteShell,
        options: &MetricsOptions,
        series: Option<&str>,
    ) {
        let config = Self::render_config(options, series);
        let uploads = collection
            .map_live(None, |_, member| {
                let address = member.address().map(|a| a.to_string());
                let config = config.clone();
                async move {
                    let address = match address {
                        Some(address) => address,
                        None => return false,
                    };
                    match shell
                        .upload(&address, config.as_bytes(), SHIPPER_CONFIG_PATH)
                        .await
                    {
                        Ok(()) => true,
                        Err(error) => {
                            warn!("Shipper config upload failed on {}: {}", address, error);
                            false
                        }
                    }
                }
            })
            .await;
        for (index, uploaded) in uploads {
            if !uploaded {
                collection.members_mut()[index].ext.nonresponsive = true;
            }
        }

        let mut volumes = BTreeMap::new();
        volumes.insert("/home/core/shipper".to_string(), "/shipper".to_string());
        let mut ports = BTreeMap::new();
        ports.insert("8125".to_string(), "8125/udp".to_string());
        let mut env = BTreeMap::new();
        if let Some(series) = series {
            env.insert("SERIES".to_string(), series.to_string());
        }
        let launch = ContainerLaunch {
            name: SHIPPER_INFO.name.to_string(),
            command_args: Some("-config=/shipper/config.toml".to_string()),
            env,
            volumes,
            ports,
            ..Default::default()
        };
        docker::run_containers(collection, &launch).await;
    }

    /// Stop the shipper everywhere
    pub async fn stop(collection: &mut Collection) {
        docker::stop_containers(collection, SHIPPER_INFO.name, STOP_TIMEOUT).await;
    }

    fn render_config(options: &MetricsOptions, series: Option<&str>) -> String {
        format!(
            "[statsd]\naddress = \"0.0.0.0:8125\"\n\n[sink]\naddress = \"{}:{}\"\ndatabase = \"{}\"\nseries = \"{}\"\n",
            options.host,
            options.port,
            options.database,
            series.unwrap_or("loads"),
        )
    }
}

/// The local DNS sidecar
pub struct LocalDns;

impl LocalDns {
    /// Start dnsmasq on every instance, pre-seeded with `dns_map`,
    /// and point each instance's resolver at itself
    pub async fn start(collection: &mut Collection, dns_map: &BTreeMap<String, Vec<String>>) {
        let mut records = vec!["--user=root".to_string()];
        for (name, ips) in dns_map {
            for ip in ips {
                records.push(format!("--host-record={},{}", name, ip));
            }
        }
        let mut ports = BTreeMap::new();
        ports.insert("53".to_string(), "53/udp".to_string());
        let launch = ContainerLaunch {
            name: DNSMASQ_INFO.name.to_string(),
            command_args: Some(records.join(" ")),
            ports,
            pid_host: true,
            ..Default::default()
        };
        docker::run_containers(collection, &launch).await;

        for member in collection.members_mut() {
            if member.is_dead() {
                continue;
            }
            member.ext.resolver_ip = member.instance.private_ip.clone();
            member.ext.local_dns = true;
        }
        debug!("Local DNS started with {} name(s)", dns_map.len());
    }

    /// Stop dnsmasq wherever it was started
    pub async fn stop(collection: &mut Collection) {
        docker::stop_containers(collection, DNSMASQ_INFO.name, STOP_TIMEOUT).await;
        for member in collection.members_mut() {
            member.ext.local_dns = false;
            member.ext.resolver_ip = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipper_config_carries_sink_and_series() {
        let options = MetricsOptions {
            host: "10.0.0.9".to_string(),
            port: 8086,
            database: "run1".to_string(),
        };
        let config = MetricsShipper::render_config(&options, Some("web-tier"));
        assert!(config.contains("10.0.0.9:8086"));
        assert!(config.contains("database = \"run1\""));
        assert!(config.contains("series = \"web-tier\""));
    }
}
