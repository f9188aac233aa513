//! Docker-backed provider
//!
//! Each proxy resource is a container running the configured proxy image with
//! its proxy port published on an ephemeral host port. The network policy is a
//! dedicated bridge network that every container joins.

use crate::config::{ProviderConfig, PullPolicy};
use crate::provider::{
    PolicyId, ProviderError, ReadinessState, ResourceDescription, ResourceId, ResourceProvider,
};
use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HealthStatusEnum, HostConfig};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label put on every container and network this provider creates
const MANAGED_LABEL: &str = "egressgate.managed";

/// Provider that runs proxies as Docker containers
pub struct DockerProvider {
    client: Docker,
    image: String,
    pull_policy: PullPolicy,
    network: String,
    proxy_port: u16,
    /// Host that published ports are reachable on
    advertise_host: String,
    memory: Option<i64>,
    nano_cpus: Option<i64>,
    env: Vec<String>,
    /// Set once the image is known to be present
    image_ready: OnceCell<()>,
}

impl DockerProvider {
    /// Connect to the Docker daemon and validate the provider config
    ///
    /// Connection priority:
    /// 1. Explicit docker_host setting
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let image = config
            .image
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Docker provider requires 'image' field"))?;

        let client = if let Some(ref host) = config.docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                    host, e
                )
            })?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        let memory = config.memory.as_deref().map(parse_memory_limit).transpose()?;
        let nano_cpus = config
            .cpus
            .as_deref()
            .map(|cpus| {
                cpus.parse::<f64>()
                    .map(|count| (count * 1_000_000_000.0) as i64)
                    .map_err(|_| anyhow::anyhow!("Invalid CPU limit: {}", cpus))
            })
            .transpose()?;

        let mut env: Vec<String> = config.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.push(format!("PORT={}", config.proxy_port));

        debug!(image = %image, network = %config.network, "Connected to Docker daemon");

        Ok(Self {
            client,
            image,
            pull_policy: config.pull_policy.clone(),
            network: config.network.clone(),
            proxy_port: config.proxy_port,
            advertise_host: config.advertise_host.clone(),
            memory,
            nano_cpus,
            env,
            image_ready: OnceCell::new(),
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    /// Pull the proxy image if the pull policy asks for it
    async fn ensure_image(&self) -> Result<(), ProviderError> {
        self.image_ready
            .get_or_try_init(|| async {
                let present = self.client.inspect_image(&self.image).await.is_ok();
                let should_pull = match self.pull_policy {
                    PullPolicy::Always => true,
                    PullPolicy::IfNotPresent => !present,
                    PullPolicy::Never if present => false,
                    PullPolicy::Never => {
                        return Err(ProviderError::Configuration(format!(
                            "image '{}' not found locally and pull_policy is 'never'",
                            self.image
                        )));
                    }
                };

                if should_pull {
                    self.pull_image().await?;
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn pull_image(&self) -> Result<(), ProviderError> {
        info!(image = %self.image, "Pulling proxy image");
        let options = CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(error) = progress.error {
                        return Err(ProviderError::Api(format!(
                            "failed to pull '{}': {}",
                            self.image, error
                        )));
                    }
                    if let Some(status) = progress.status {
                        debug!(image = %self.image, status = %status, "Pull progress");
                    }
                }
                Err(e) => return Err(map_docker_error(e)),
            }
        }

        info!(image = %self.image, "Image pulled successfully");
        Ok(())
    }

    fn describe(&self, info: &ContainerInspectResponse) -> ResourceDescription {
        let state = info.state.as_ref();
        let health = state
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status.as_ref());

        let readiness = match state.and_then(|s| s.status.as_ref()) {
            Some(ContainerStateStatusEnum::RUNNING) => match health {
                Some(HealthStatusEnum::STARTING) | Some(HealthStatusEnum::UNHEALTHY) => {
                    ReadinessState::Pending
                }
                _ => ReadinessState::Ready,
            },
            Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
                ReadinessState::Failed
            }
            Some(ContainerStateStatusEnum::REMOVING) => ReadinessState::Terminated,
            _ => ReadinessState::Pending,
        };

        let port_key = format!("{}/tcp", self.proxy_port);
        let endpoint = info
            .network_settings
            .as_ref()
            .and_then(|n| n.ports.as_ref())
            .and_then(|ports| ports.get(&port_key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .filter(|port| !port.is_empty())
            .map(|port| format!("{}:{}", self.advertise_host, port))
            .unwrap_or_default();

        ResourceDescription { endpoint, readiness }
    }
}

#[async_trait]
impl ResourceProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_resource(&self, policy: &PolicyId) -> Result<ResourceId, ProviderError> {
        self.ensure_image().await?;

        let simple = Uuid::new_v4().simple().to_string();
        let container_name = format!("egressgate-{}", &simple[..12]);

        let port_key = format!("{}/tcp", self.proxy_port);
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            network_mode: Some(policy.as_str().to_string()),
            publish_all_ports: Some(true),
            memory: self.memory,
            nano_cpus: self.nano_cpus,
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.image.clone()),
            env: Some(self.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(map_docker_error)?;
        let container_id = response.id;

        if let Err(e) = self
            .client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            warn!(container_id = %container_id, error = %e, "Failed to start proxy container, removing it");
            return Err(discard_unstarted(&container_id, e, self.remove(&container_id)).await);
        }

        info!(container_id = %container_id, container_name = %container_name, image = %self.image, "Started proxy container");
        Ok(ResourceId::new(container_id))
    }

    async fn terminate_resource(&self, id: &ResourceId) -> Result<(), ProviderError> {
        self.remove(id.as_str()).await
    }

    async fn describe_resource(&self, id: &ResourceId) -> Result<ResourceDescription, ProviderError> {
        match self.client.inspect_container(id.as_str(), None).await {
            Ok(info) => Ok(self.describe(&info)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ResourceDescription {
                endpoint: String::new(),
                readiness: ReadinessState::Terminated,
            }),
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn provision_network_policy(&self) -> Result<PolicyId, ProviderError> {
        match self.client.inspect_network::<String>(&self.network, None).await {
            Ok(_) => {
                debug!(network = %self.network, "Network already exists");
                return Ok(PolicyId::new(self.network.clone()));
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(map_docker_error(e)),
        }

        info!(network = %self.network, "Creating Docker network");
        self.client
            .create_network(CreateNetworkOptions {
                name: self.network.as_str(),
                driver: "bridge",
                labels: HashMap::from([(MANAGED_LABEL, "true")]),
                ..Default::default()
            })
            .await
            .map_err(map_docker_error)?;

        Ok(PolicyId::new(self.network.clone()))
    }

    async fn delete_network_policy(&self, policy: &PolicyId) -> Result<(), ProviderError> {
        self.client
            .remove_network(policy.as_str())
            .await
            .map_err(map_docker_error)?;
        info!(network = %policy, "Removed Docker network");
        Ok(())
    }
}

impl DockerProvider {
    /// Force-remove a container; a missing container counts as removed
    async fn remove(&self, container_id: &str) -> Result<(), ProviderError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(container_id, Some(options)).await {
            Ok(_) => {
                debug!(container_id, "Removed proxy container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(e) => Err(map_docker_error(e)),
        }
    }
}

fn map_docker_error(err: bollard::errors::Error) -> ProviderError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => ProviderError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => ProviderError::Api(format!("{} ({})", message, status_code)),
        other => ProviderError::Unavailable(other.to_string()),
    }
}

/// Parse memory limit string (e.g., "512m", "1g") to bytes
fn parse_memory_limit(limit: &str) -> anyhow::Result<i64> {
    let limit = limit.trim().to_lowercase();
    let (num_str, multiplier) = if limit.ends_with('g') || limit.ends_with("gb") {
        (limit.trim_end_matches("gb").trim_end_matches('g'), 1024 * 1024 * 1024i64)
    } else if limit.ends_with('m') || limit.ends_with("mb") {
        (limit.trim_end_matches("mb").trim_end_matches('m'), 1024 * 1024i64)
    } else if limit.ends_with('k') || limit.ends_with("kb") {
        (limit.trim_end_matches("kb").trim_end_matches('k'), 1024i64)
    } else {
        (limit.as_str(), 1i64)
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit: {}", limit))?;

    Ok((num * multiplier as f64) as i64)
}

/// Remove a container that never started and hand back the start error
///
/// A failed removal is only logged; the caller sees why the start failed.
async fn discard_unstarted<F>(container_id: &str, start_error: bollard::errors::Error, removal: F) -> ProviderError
where
    F: std::future::Future<Output = Result<(), ProviderError>>,
{
    if let Err(cleanup) = removal.await {
        warn!(container_id = %container_id, error = %cleanup, "Failed to remove unstarted proxy container, it may be leaked");
    }
    map_docker_error(start_error)
}
