use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::HostConfig;
use bollard::service::{PortBinding, PortMap};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use snafu::ResultExt;
use tracing::debug;

use shell::RemoteShell;

use crate::{
    Api, ContainerHost, ContainerRun, ContainerSummary, Daemon, HostError, HostFactory, Import,
    ImageMissing, DAEMON_PORT,
};

/// Builds [`DockerHost`]s for instance addresses
pub struct DockerHostFactory {
    shell: Arc<dyn RemoteShell>,
    port: u16,
    timeout: u64,
}

impl DockerHostFactory {
    /// Factory talking to daemons on the default port with the given
    /// shell for image imports
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            port: DAEMON_PORT,
            timeout: 120,
        }
    }
}

impl HostFactory for DockerHostFactory {
    fn host(&self, host_ip: &str) -> Result<Arc<dyn ContainerHost>, HostError> {
        let address = format!("tcp://{}:{}", host_ip, self.port);
        let docker = Docker::connect_with_http(&address, self.timeout, API_DEFAULT_VERSION)
            .context(Daemon { host: host_ip })?;
        Ok(Arc::new(DockerHost {
            host: host_ip.to_string(),
            docker,
            shell: self.shell.clone(),
        }))
    }
}

/// Container daemon adapter for one instance
pub struct DockerHost {
    host: String,
    docker: Docker,
    shell: Arc<dyn RemoteShell>,
}

impl DockerHost {
    /// Image references without a tag mean `:latest`
    fn qualified(name: &str) -> String {
        if name.contains(':') {
            name.to_string()
        } else {
            format!("{}:latest", name)
        }
    }

    async fn stop_one(&self, id: &str, timeout: Duration) -> Result<(), HostError> {
        let result = self
            .docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await;
        if let Err(error) = result {
            // already stopped or gone is not a failure
            match error {
                BollardError::DockerResponseServerError {
                    status_code: 304, ..
                }
                | BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => {}
                error => {
                    return Err(error).context(Api {
                        host: self.host.clone(),
                        operation: "stop container",
                    })
                }
            }
        }
        let result = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    link: false,
                }),
            )
            .await;
        if let Err(error) = result {
            match error {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => {}
                error => {
                    return Err(error).context(Api {
                        host: self.host.clone(),
                        operation: "remove container",
                    })
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerHost for DockerHost {
    fn host(&self) -> &str {
        &self.host
    }

    async fn containers(&self) -> Result<Vec<ContainerSummary>, HostError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context(Api {
                host: self.host.clone(),
                operation: "list containers",
            })?;

        Ok(containers
            .into_iter()
            .map(|container| ContainerSummary {
                id: container.id.unwrap_or_default(),
                image: container.image.unwrap_or_default(),
            })
            .collect())
    }

    async fn has_image(&self, name: &str) -> Result<bool, HostError> {
        let name = Self::qualified(name);
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .context(Api {
                host: self.host.clone(),
                operation: "list images",
            })?;
        Ok(images
            .iter()
            .any(|image| image.repo_tags.iter().any(|tag| tag == &name)))
    }

    async fn pull_image(&self, name: &str) -> Result<(), HostError> {
        let name = Self::qualified(name);
        debug!("{}: pulling image {}", self.host, name);
        let mut progress = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: name.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(info) = progress.next().await {
            let _ = info.context(Api {
                host: self.host.clone(),
                operation: "pull image",
            })?;
        }
        Ok(())
    }

    async fn import_image(&self, url: &str) -> Result<(), HostError> {
        debug!("{}: importing image from {}", self.host, url);
        let command = format!("curl -sSL '{}' | docker load", url);
        let output = self
            .shell
            .exec(&self.host, &command)
            .await
            .context(Import {
                host: self.host.clone(),
            })?;
        if !output.success() {
            return ImageMissing {
                host: self.host.clone(),
                name: url,
            }
            .fail();
        }
        Ok(())
    }

    async fn run_container(&self, run: &ContainerRun) -> Result<(), HostError> {
        let mut port_bindings = PortMap::new();
        let mut exposed_ports = HashMap::new();
        for (host_port, container_port) in &run.ports {
            let key = if container_port.contains('/') {
                container_port.clone()
            } else {
                format!("{}/tcp", container_port)
            };
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.clone()),
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let binds: Vec<String> = run
            .volumes
            .iter()
            .map(|(host, container)| format!("{}:{}", host, container))
            .collect();

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            dns: run.dns.as_ref().map(|ip| vec![ip.clone()]),
            pid_mode: if run.pid_host {
                Some("host".to_string())
            } else {
                None
            },
            ..Default::default()
        };

        let config = Config::<String> {
            image: Some(Self::qualified(&run.name)),
            cmd: run
                .command_args
                .as_ref()
                .map(|args| args.split_whitespace().map(|s| s.to_string()).collect()),
            env: Some(
                run.env
                    .iter()
                    .map(|(name, value)| format!("{}={}", name, value))
                    .collect(),
            ),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .context(Api {
                host: self.host.clone(),
                operation: "create container",
            })?;
        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .context(Api {
                host: self.host.clone(),
                operation: "start container",
            })?;
        debug!("{}: started {} as {}", self.host, run.name, created.id);
        Ok(())
    }

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<(), HostError> {
        let containers = self.containers().await?;
        for container in containers {
            if container.image.contains(name) {
                self.stop_one(&container.id, timeout).await?;
            }
        }
        Ok(())
    }
}
