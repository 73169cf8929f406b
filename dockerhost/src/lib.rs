//! Container host capability: per-instance image and container
//! management, spoken to the daemon each instance exposes on its
//! public address.
//!
//! The broker only sees the [`ContainerHost`] trait; the bollard
//! adapter lives in [`docker`]. Environment interpolation is a pure
//! pass in [`env`] and never mixes with I/O.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

mod docker;
pub mod env;

pub use docker::{DockerHost, DockerHostFactory};

/// Default port instances expose their container daemon on
pub const DAEMON_PORT: u16 = 2375;

/// Errors from container host interactions
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum HostError {
    #[snafu(display("Failed to reach the container daemon on {}", host))]
    Daemon {
        host: String,
        source: bollard::errors::Error,
    },
    #[snafu(display("Failed to {} on {}", operation, host))]
    Api {
        host: String,
        operation: String,
        source: bollard::errors::Error,
    },
    #[snafu(display("Image '{}' still missing on {} after load", name, host))]
    ImageMissing { host: String, name: String },
    #[snafu(display("Failed to import image on {}", host))]
    Import {
        host: String,
        source: shell::ShellError,
    },
}

/// One container as reported by the daemon inventory
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Daemon-assigned container id
    pub id: String,
    /// Image reference the container was created from
    pub image: String,
}

/// Everything needed to start one container on one host.
///
/// All values are fully interpolated before this struct is built;
/// see [`env::interpolate`].
#[derive(Debug, Clone, Default)]
pub struct ContainerRun {
    /// Image reference, e.g. `img:v1`
    pub name: String,
    /// Command arguments, whitespace separated
    pub command_args: Option<String>,
    /// Environment, name to resolved value
    pub env: BTreeMap<String, String>,
    /// Volume binds, host path to container path
    pub volumes: BTreeMap<String, String>,
    /// Port bindings, host port to `container[/proto]`
    pub ports: BTreeMap<String, String>,
    /// Resolver address the container should use
    pub dns: Option<String>,
    /// Run in the host pid namespace
    pub pid_host: bool,
}

/// Capability attached to each instance: pull, run, inspect and stop
/// containers on that one host.
#[async_trait]
pub trait ContainerHost: Send + Sync {
    /// The address this host is reached on
    fn host(&self) -> &str;

    /// Inventory of running containers. This is the liveness probe:
    /// a host that cannot answer it is treated as non-responsive.
    async fn containers(&self) -> Result<Vec<ContainerSummary>, HostError>;

    /// Whether the image is already present locally
    async fn has_image(&self, name: &str) -> Result<bool, HostError>;

    /// Pull the image from its registry
    async fn pull_image(&self, name: &str) -> Result<(), HostError>;

    /// Import the image from an archive URL, via the remote shell
    async fn import_image(&self, url: &str) -> Result<(), HostError>;

    /// Create and start one container
    async fn run_container(&self, run: &ContainerRun) -> Result<(), HostError>;

    /// Gracefully stop every container created from `name`
    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<(), HostError>;

    /// Whether any running container was created from `name`
    async fn is_running(&self, name: &str) -> Result<bool, HostError> {
        let containers = self.containers().await?;
        Ok(containers
            .iter()
            .any(|container| container.image.contains(name)))
    }
}

/// Builds a [`ContainerHost`] for an instance address; the pool knows
/// addresses, not daemons.
pub trait HostFactory: Send + Sync {
    /// Host handle for the daemon at `host_ip`
    fn host(&self, host_ip: &str) -> Result<Arc<dyn ContainerHost>, HostError>;
}
