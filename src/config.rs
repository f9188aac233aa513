use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Pool lifecycle settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Which provider backs the pool
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

/// Timing and capacity of the resource pool
#[derive(Debug, Deserialize, Clone)]
pub struct PoolSettings {
    /// Standby resources kept next to the active one
    #[serde(default = "default_target_pool_size")]
    pub target_pool_size: usize,

    /// Lifetime of an active resource before it is rotated
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// How often the TTL watcher checks whether it was superseded
    #[serde(default = "default_ttl_check_interval")]
    pub ttl_check_interval_ms: u64,

    /// Wait after the provider reports ready, before handing the endpoint out
    #[serde(default = "default_readiness_settle")]
    pub readiness_settle_secs: u64,

    /// Wait after terminating resources, before deleting the network policy
    #[serde(default = "default_termination_settle")]
    pub termination_settle_secs: u64,

    /// Interval between readiness polls
    #[serde(default = "default_readiness_poll_interval")]
    pub readiness_poll_interval_ms: u64,

    /// Readiness polls before giving up on a candidate
    #[serde(default = "default_readiness_max_attempts")]
    pub readiness_max_attempts: u32,

    /// Attempts for create/policy calls before reporting a provisioning error
    #[serde(default = "default_provider_retries")]
    pub provider_retries: u32,

    /// Base backoff between provider retries (multiplied by the attempt number)
    #[serde(default = "default_provider_retry_backoff")]
    pub provider_retry_backoff_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            target_pool_size: default_target_pool_size(),
            ttl_secs: default_ttl(),
            ttl_check_interval_ms: default_ttl_check_interval(),
            readiness_settle_secs: default_readiness_settle(),
            termination_settle_secs: default_termination_settle(),
            readiness_poll_interval_ms: default_readiness_poll_interval(),
            readiness_max_attempts: default_readiness_max_attempts(),
            provider_retries: default_provider_retries(),
            provider_retry_backoff_ms: default_provider_retry_backoff(),
        }
    }
}

impl PoolSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn ttl_check_interval(&self) -> Duration {
        Duration::from_millis(self.ttl_check_interval_ms)
    }

    pub fn readiness_settle(&self) -> Duration {
        Duration::from_secs(self.readiness_settle_secs)
    }

    pub fn termination_settle(&self) -> Duration {
        Duration::from_secs(self.termination_settle_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    pub fn provider_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.provider_retry_backoff_ms)
    }

    /// Validate pool settings, returning every problem found
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.target_pool_size == 0 {
            errors.push("pool.target_pool_size must be at least 1".to_string());
        }
        if self.ttl_secs == 0 {
            errors.push("pool.ttl_secs must be greater than 0".to_string());
        }
        if self.ttl_check_interval_ms == 0 {
            errors.push("pool.ttl_check_interval_ms must be greater than 0".to_string());
        }
        if self.readiness_poll_interval_ms == 0 {
            errors.push("pool.readiness_poll_interval_ms must be greater than 0".to_string());
        }
        if self.readiness_max_attempts == 0 {
            errors.push("pool.readiness_max_attempts must be at least 1".to_string());
        }
        if self.provider_retries == 0 {
            errors.push("pool.provider_retries must be at least 1".to_string());
        }

        errors
    }
}

/// Provider type
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// In-memory provider, no real resources (default)
    #[default]
    Simulated,
    /// Each resource is a container running a proxy image
    Docker,
}

/// Image pull policy for the Docker provider
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Pull if image doesn't exist locally (default)
    #[default]
    #[serde(alias = "if-not-present")]
    IfNotPresent,
    /// Always pull before starting
    Always,
    /// Never pull, fail if image doesn't exist
    Never,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Provider type: "simulated" (default) or "docker"
    #[serde(default, rename = "type")]
    pub provider_type: ProviderType,

    /// Port the proxy listens on inside each resource
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    // === Docker-specific fields ===
    /// Proxy image to run (required for Docker)
    pub image: Option<String>,

    /// Name of the bridge network acting as the network policy
    #[serde(default = "default_network")]
    pub network: String,

    /// Docker host URL (default: DOCKER_HOST or common socket paths)
    pub docker_host: Option<String>,

    /// Host clients use to reach published proxy ports
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,

    /// Image pull policy: "always", "never", or "if-not-present" (default)
    #[serde(default)]
    pub pull_policy: PullPolicy,

    /// Memory limit (e.g., "128m")
    pub memory: Option<String>,

    /// CPU limit (e.g., "0.5")
    pub cpus: Option<String>,

    /// Environment variables passed to every resource
    #[serde(default)]
    pub env: HashMap<String, String>,

    // === Simulated-specific fields ===
    /// Describe calls answered with "pending" before a resource is ready
    #[serde(default)]
    pub ready_after_polls: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::default(),
            proxy_port: default_proxy_port(),
            image: None,
            network: default_network(),
            docker_host: None,
            advertise_host: default_advertise_host(),
            pull_policy: PullPolicy::default(),
            memory: None,
            cpus: None,
            env: HashMap::new(),
            ready_after_polls: 0,
        }
    }
}

impl ProviderConfig {
    /// Create a Docker provider config with defaults
    pub fn docker(image: &str) -> Self {
        Self {
            provider_type: ProviderType::Docker,
            image: Some(image.to_string()),
            ..Default::default()
        }
    }

    /// Validate the provider configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.proxy_port == 0 {
            errors.push("provider.proxy_port must be greater than 0".to_string());
        }

        if self.provider_type == ProviderType::Docker {
            if self.image.is_none() {
                errors.push("provider: docker provider requires 'image' field".to_string());
            }
            if self.network.trim().is_empty() {
                errors.push("provider.network must not be empty".to_string());
            }
        }

        errors
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_target_pool_size() -> usize {
    2
}

fn default_ttl() -> u64 {
    300 // 5 minutes per proxy
}

fn default_ttl_check_interval() -> u64 {
    1000
}

fn default_readiness_settle() -> u64 {
    60 // provider-side propagation lag after "ready"
}

fn default_termination_settle() -> u64 {
    120 // resources must be gone before the policy can be deleted
}

fn default_readiness_poll_interval() -> u64 {
    1000
}

fn default_readiness_max_attempts() -> u32 {
    300
}

fn default_provider_retries() -> u32 {
    3
}

fn default_provider_retry_backoff() -> u64 {
    500
}

fn default_proxy_port() -> u16 {
    8080
}

fn default_network() -> String {
    "egressgate".to_string()
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = self.pool.validate();
        errors.extend(self.provider.validate());

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
