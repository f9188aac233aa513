//! Provider interface for proxy resources
//!
//! The controller never talks to a cloud or container API directly. Everything
//! it needs from the outside world goes through [`ResourceProvider`]: creating
//! and terminating resources, describing their readiness, and managing the
//! network policy that resources are attached to.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

/// Provider-assigned identifier of a proxy resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider-assigned identifier of a network policy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PolicyId(String);

impl PolicyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Readiness of a resource as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessState {
    /// Resource exists but cannot carry traffic yet
    Pending,
    /// Resource reports it is usable
    Ready,
    /// Resource failed to come up and never will
    Failed,
    /// Resource is gone or shutting down
    Terminated,
}

impl ReadinessState {
    /// True when waiting longer cannot make the resource ready
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReadinessState::Failed | ReadinessState::Terminated)
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::Pending => write!(f, "pending"),
            ReadinessState::Ready => write!(f, "ready"),
            ReadinessState::Failed => write!(f, "failed"),
            ReadinessState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Result of a describe call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescription {
    /// `host:port` the proxy listens on. Empty until the provider knows it.
    pub endpoint: String,
    pub readiness: ReadinessState,
}

/// Errors reported by a provider
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider API rejected or failed the call
    #[error("provider API error: {0}")]
    Api(String),

    /// The referenced resource or policy does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider could not be reached
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider is misconfigured (bad image, missing field, ...)
    #[error("provider configuration error: {0}")]
    Configuration(String),
}

/// Creates, describes and destroys proxy resources and their network policy.
///
/// `provision_network_policy` must be idempotent: calling it for a policy
/// that already exists returns the existing handle.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Short provider name used in logs
    fn name(&self) -> &'static str;

    /// Request a new resource attached to `policy`
    async fn create_resource(&self, policy: &PolicyId) -> Result<ResourceId, ProviderError>;

    /// Terminate a resource
    async fn terminate_resource(&self, id: &ResourceId) -> Result<(), ProviderError>;

    /// Report the endpoint and readiness of a resource
    async fn describe_resource(&self, id: &ResourceId) -> Result<ResourceDescription, ProviderError>;

    /// Establish the ingress/egress policy shared by all resources
    async fn provision_network_policy(&self) -> Result<PolicyId, ProviderError>;

    /// Remove the network policy
    async fn delete_network_policy(&self, policy: &PolicyId) -> Result<(), ProviderError>;
}
