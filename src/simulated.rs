//! In-memory provider
//!
//! Hands out fake resources with deterministic endpoints and keeps a count of
//! every call it receives. Used by the test suite and by `type = "simulated"`
//! for dry runs of the controller without any infrastructure.

use crate::provider::{
    PolicyId, ProviderError, ReadinessState, ResourceDescription, ResourceId, ResourceProvider,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

/// Per-operation call counters
#[derive(Debug, Default)]
pub struct ProviderCalls {
    pub creates: AtomicU64,
    pub terminates: AtomicU64,
    pub describes: AtomicU64,
    pub policy_provisions: AtomicU64,
    pub policy_deletes: AtomicU64,
}

impl ProviderCalls {
    pub fn creates(&self) -> u64 {
        self.creates.load(Ordering::Relaxed)
    }

    pub fn terminates(&self) -> u64 {
        self.terminates.load(Ordering::Relaxed)
    }

    pub fn describes(&self) -> u64 {
        self.describes.load(Ordering::Relaxed)
    }

    pub fn policy_provisions(&self) -> u64 {
        self.policy_provisions.load(Ordering::Relaxed)
    }

    pub fn policy_deletes(&self) -> u64 {
        self.policy_deletes.load(Ordering::Relaxed)
    }

    /// Sum of all calls
    pub fn total(&self) -> u64 {
        self.creates()
            + self.terminates()
            + self.describes()
            + self.policy_provisions()
            + self.policy_deletes()
    }
}

struct SimResource {
    endpoint: String,
    polls: u32,
    terminated: bool,
}

#[derive(Default)]
struct SimState {
    resources: HashMap<ResourceId, SimResource>,
    /// Creation order, used by tests to inspect what was provisioned
    created: Vec<ResourceId>,
    policy: Option<PolicyId>,
    next_host: u32,
}

/// Provider backed by a hash map
pub struct SimulatedProvider {
    state: Mutex<SimState>,
    calls: ProviderCalls,
    proxy_port: u16,
    /// Describe calls a resource answers with `Pending` before `Ready`
    ready_after_polls: u32,
    /// Remaining create calls that fail
    failing_creates: AtomicU32,
    /// Remaining terminate calls that fail
    failing_terminates: AtomicU32,
    /// Remaining describe calls that fail
    failing_describes: AtomicU32,
    /// Remaining policy provision calls that fail
    failing_policy_provisions: AtomicU32,
    /// Remaining policy delete calls that fail
    failing_policy_deletes: AtomicU32,
    /// Fixed readiness reported for every live resource, if set
    readiness_override: Mutex<Option<ReadinessState>>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(8080, 0)
    }
}

impl SimulatedProvider {
    pub fn new(proxy_port: u16, ready_after_polls: u32) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            calls: ProviderCalls::default(),
            proxy_port,
            ready_after_polls,
            failing_creates: AtomicU32::new(0),
            failing_terminates: AtomicU32::new(0),
            failing_describes: AtomicU32::new(0),
            failing_policy_provisions: AtomicU32::new(0),
            failing_policy_deletes: AtomicU32::new(0),
            readiness_override: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> &ProviderCalls {
        &self.calls
    }

    /// Make the next `count` create calls fail
    pub fn fail_next_creates(&self, count: u32) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` terminate calls fail
    pub fn fail_next_terminates(&self, count: u32) {
        self.failing_terminates.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` describe calls fail
    pub fn fail_next_describes(&self, count: u32) {
        self.failing_describes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` policy provision calls fail
    pub fn fail_next_policy_provisions(&self, count: u32) {
        self.failing_policy_provisions.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` policy delete calls fail
    pub fn fail_next_policy_deletes(&self, count: u32) {
        self.failing_policy_deletes.store(count, Ordering::SeqCst);
    }

    /// Drop the policy as if it had been deleted out of band
    pub fn revoke_policy(&self) {
        self.state.lock().policy = None;
    }

    /// Force every live resource to report `state` (`None` restores normal behaviour)
    pub fn override_readiness(&self, state: Option<ReadinessState>) {
        *self.readiness_override.lock() = state;
    }

    /// Whether a resource exists and has not been terminated
    pub fn is_live(&self, id: &ResourceId) -> bool {
        self.state
            .lock()
            .resources
            .get(id)
            .map(|r| !r.terminated)
            .unwrap_or(false)
    }

    /// Whether a resource was terminated
    pub fn is_terminated(&self, id: &ResourceId) -> bool {
        self.state
            .lock()
            .resources
            .get(id)
            .map(|r| r.terminated)
            .unwrap_or(false)
    }

    /// Number of resources not yet terminated
    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .resources
            .values()
            .filter(|r| !r.terminated)
            .count()
    }

    /// Every id ever created, oldest first
    pub fn created(&self) -> Vec<ResourceId> {
        self.state.lock().created.clone()
    }

    /// The currently provisioned policy
    pub fn policy(&self) -> Option<PolicyId> {
        self.state.lock().policy.clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ResourceProvider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create_resource(&self, policy: &PolicyId) -> Result<ResourceId, ProviderError> {
        self.calls.creates.fetch_add(1, Ordering::Relaxed);

        if Self::take_failure(&self.failing_creates) {
            return Err(ProviderError::Unavailable("injected create failure".to_string()));
        }

        let mut state = self.state.lock();
        if state.policy.as_ref() != Some(policy) {
            return Err(ProviderError::NotFound(format!("network policy {}", policy)));
        }

        let simple = Uuid::new_v4().simple().to_string();
        let id = ResourceId::new(format!("sim-{}", &simple[..12]));
        state.next_host += 1;
        let endpoint = format!("10.0.{}.{}:{}", state.next_host / 250, state.next_host % 250 + 1, self.proxy_port);

        debug!(id = %id, endpoint = %endpoint, "Simulated resource created");

        state.resources.insert(
            id.clone(),
            SimResource {
                endpoint,
                polls: 0,
                terminated: false,
            },
        );
        state.created.push(id.clone());
        Ok(id)
    }

    async fn terminate_resource(&self, id: &ResourceId) -> Result<(), ProviderError> {
        self.calls.terminates.fetch_add(1, Ordering::Relaxed);

        if Self::take_failure(&self.failing_terminates) {
            return Err(ProviderError::Api("injected terminate failure".to_string()));
        }

        let mut state = self.state.lock();
        match state.resources.get_mut(id) {
            Some(resource) => {
                resource.terminated = true;
                debug!(id = %id, "Simulated resource terminated");
                Ok(())
            }
            None => Err(ProviderError::NotFound(format!("resource {}", id))),
        }
    }

    async fn describe_resource(&self, id: &ResourceId) -> Result<ResourceDescription, ProviderError> {
        self.calls.describes.fetch_add(1, Ordering::Relaxed);

        if Self::take_failure(&self.failing_describes) {
            return Err(ProviderError::Unavailable("injected describe failure".to_string()));
        }

        let forced = *self.readiness_override.lock();
        let mut state = self.state.lock();
        let resource = state
            .resources
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(format!("resource {}", id)))?;

        let readiness = if resource.terminated {
            ReadinessState::Terminated
        } else if let Some(forced) = forced {
            forced
        } else if resource.polls >= self.ready_after_polls {
            ReadinessState::Ready
        } else {
            resource.polls += 1;
            ReadinessState::Pending
        };

        Ok(ResourceDescription {
            endpoint: resource.endpoint.clone(),
            readiness,
        })
    }

    async fn provision_network_policy(&self) -> Result<PolicyId, ProviderError> {
        self.calls.policy_provisions.fetch_add(1, Ordering::Relaxed);

        if Self::take_failure(&self.failing_policy_provisions) {
            return Err(ProviderError::Unavailable("injected policy provision failure".to_string()));
        }

        let mut state = self.state.lock();
        let policy = state
            .policy
            .get_or_insert_with(|| PolicyId::new(format!("sim-policy-{}", Uuid::new_v4().simple())))
            .clone();
        Ok(policy)
    }

    async fn delete_network_policy(&self, policy: &PolicyId) -> Result<(), ProviderError> {
        self.calls.policy_deletes.fetch_add(1, Ordering::Relaxed);

        if Self::take_failure(&self.failing_policy_deletes) {
            return Err(ProviderError::Api("injected policy delete failure".to_string()));
        }

        let mut state = self.state.lock();
        if state.policy.as_ref() == Some(policy) {
            state.policy = None;
            Ok(())
        } else {
            Err(ProviderError::NotFound(format!("network policy {}", policy)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_requires_policy() {
        let provider = SimulatedProvider::default();
        let result = provider.create_resource(&PolicyId::new("missing")).await;
        assert!(matches!(result, Err(ProviderError::NotFound(_))));

        let policy = provider.provision_network_policy().await.unwrap();
        let id = provider.create_resource(&policy).await.unwrap();
        assert!(provider.is_live(&id));
        assert_eq!(provider.calls().creates(), 2);
    }

    #[tokio::test]
    async fn test_policy_is_idempotent() {
        let provider = SimulatedProvider::default();
        let first = provider.provision_network_policy().await.unwrap();
        let second = provider.provision_network_policy().await.unwrap();
        assert_eq!(first, second);

        provider.fail_next_policy_deletes(1);
        assert!(matches!(
            provider.delete_network_policy(&first).await,
            Err(ProviderError::Api(_))
        ));
        assert_eq!(provider.policy(), Some(first.clone()));

        provider.delete_network_policy(&first).await.unwrap();
        assert!(provider.policy().is_none());
        assert!(provider.delete_network_policy(&first).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_policy_provision_failure() {
        let provider = SimulatedProvider::default();
        provider.fail_next_policy_provisions(1);

        assert!(provider.provision_network_policy().await.is_err());
        assert!(provider.policy().is_none());
        assert!(provider.provision_network_policy().await.is_ok());
        assert_eq!(provider.calls().policy_provisions(), 2);

        provider.revoke_policy();
        assert!(provider.policy().is_none());
    }

    #[tokio::test]
    async fn test_ready_after_polls() {
        let provider = SimulatedProvider::new(3128, 2);
        let policy = provider.provision_network_policy().await.unwrap();
        let id = provider.create_resource(&policy).await.unwrap();

        let first = provider.describe_resource(&id).await.unwrap();
        assert_eq!(first.readiness, ReadinessState::Pending);
        assert!(first.endpoint.ends_with(":3128"));
        assert_eq!(
            provider.describe_resource(&id).await.unwrap().readiness,
            ReadinessState::Pending
        );
        assert_eq!(
            provider.describe_resource(&id).await.unwrap().readiness,
            ReadinessState::Ready
        );
    }

    #[tokio::test]
    async fn test_terminated_resource_reports_terminated() {
        let provider = SimulatedProvider::default();
        let policy = provider.provision_network_policy().await.unwrap();
        let id = provider.create_resource(&policy).await.unwrap();

        provider.terminate_resource(&id).await.unwrap();
        assert!(provider.is_terminated(&id));
        assert_eq!(provider.live_count(), 0);
        assert_eq!(
            provider.describe_resource(&id).await.unwrap().readiness,
            ReadinessState::Terminated
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let provider = SimulatedProvider::default();
        let policy = provider.provision_network_policy().await.unwrap();

        provider.fail_next_creates(1);
        assert!(provider.create_resource(&policy).await.is_err());
        assert!(provider.create_resource(&policy).await.is_ok());

        provider.fail_next_describes(1);
        let id = provider.create_resource(&policy).await.unwrap();
        assert!(matches!(
            provider.describe_resource(&id).await,
            Err(ProviderError::Unavailable(_))
        ));
        assert!(provider.describe_resource(&id).await.is_ok());

        provider.override_readiness(Some(ReadinessState::Failed));
        let id = provider.create_resource(&policy).await.unwrap();
        assert_eq!(
            provider.describe_resource(&id).await.unwrap().readiness,
            ReadinessState::Failed
        );
    }
}
