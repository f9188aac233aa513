//! Pool lifecycle controller
//!
//! Hands out one proxy endpoint at a time from a pool of provisioned
//! resources and rotates it after a TTL or on request.
//!
//! # Locking
//!
//! Two locks with different jobs:
//!
//! - `gate` (async) serializes the foreground operations `get_endpoint`,
//!   `rotate` and `teardown_all`, and is held across provider calls and waits.
//! - `state` (sync) guards pool membership, the active handle, the policy and
//!   the watcher handle. It is only taken for short critical sections and never
//!   across an `.await`, so the TTL watcher can always get it.
//!
//! # Interrupts
//!
//! Waits inside an operation (readiness polls, settle delays, retry backoff)
//! can be cut short two ways:
//!
//! - `interrupt()` bumps a generation counter. Every wait in progress at that
//!   moment ends with `Interrupted`; waits started later are unaffected.
//! - A queued `teardown_all` keeps a waiting count raised until it holds the
//!   gate. Activation waits end while it is raised. The termination settle
//!   inside teardown ignores it and only yields to `interrupt()`.
//!
//! # Activation
//!
//! ```text
//! Idle -> PolicyPending -> PoolPending -> AwaitingReadiness -> Active
//! ```
//!
//! The candidate is the first pool member. Once it reports ready and the settle
//! delay has passed, it leaves the pool and becomes the active handle, so the
//! active id is never a pool member.

use crate::config::PoolSettings;
use crate::error::Error;
use crate::pool::ResourcePool;
use crate::provider::{
    PolicyId, ProviderError, ReadinessState, ResourceDescription, ResourceId, ResourceProvider,
};
use crate::watcher::TtlWatcher;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Scheme of every endpoint handed out
pub const ENDPOINT_SCHEME: &str = "http";

/// Proxy endpoint returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub scheme: String,
    /// `host:port` of the proxy
    pub endpoint: String,
}

impl Endpoint {
    pub fn http(endpoint: impl Into<String>) -> Self {
        Self {
            scheme: ENDPOINT_SCHEME.to_string(),
            endpoint: endpoint.into(),
        }
    }

    /// Proxy URL, e.g. `http://10.0.0.7:8080`
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.endpoint)
    }
}

/// Where the controller is in bringing up an active resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPhase {
    /// Nothing active
    Idle,
    /// Provisioning the network policy
    PolicyPending,
    /// Filling the pool
    PoolPending,
    /// Polling the candidate until it is ready
    AwaitingReadiness,
    /// An active handle is installed
    Active,
}

/// The resource currently exposed to callers
#[derive(Debug, Clone, Serialize)]
pub struct ActiveHandle {
    pub id: ResourceId,
    pub endpoint: String,
    pub readiness: ReadinessState,
    /// Cleared by the TTL watcher once the TTL elapses. Never set back.
    pub alive: bool,
    pub activated_at: DateTime<Utc>,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub phase: ActivationPhase,
    pub active: Option<ActiveHandle>,
    pub pool: Vec<ResourceId>,
    pub target_pool_size: usize,
    pub policy: Option<PolicyId>,
    /// Resources whose termination failed, retried at teardown
    pub retired: Vec<ResourceId>,
}

/// State shared between the foreground operations and the TTL watcher
pub(crate) struct ControllerState {
    pool: ResourcePool,
    active: Option<ActiveHandle>,
    policy: Option<PolicyId>,
    phase: ActivationPhase,
    watcher: Option<TtlWatcher>,
    retired: Vec<ResourceId>,
}

pub(crate) type SharedState = Arc<Mutex<ControllerState>>;

impl ControllerState {
    fn new(target_pool_size: usize) -> Self {
        Self {
            pool: ResourcePool::new(target_pool_size),
            active: None,
            policy: None,
            phase: ActivationPhase::Idle,
            watcher: None,
            retired: Vec::new(),
        }
    }

    /// Whether `id` is still the active generation
    pub(crate) fn is_current(&self, id: &ResourceId) -> bool {
        self.active.as_ref().map(|a| &a.id == id).unwrap_or(false)
    }

    /// Mark the active handle expired if it is still generation `id`
    pub(crate) fn expire_if_current(&mut self, id: &ResourceId) -> bool {
        match self.active.as_mut() {
            Some(active) if &active.id == id => {
                active.alive = false;
                true
            }
            _ => false,
        }
    }

    /// Phase to fall back to after a failed attempt
    fn settled_phase(&self) -> ActivationPhase {
        if self.active.is_some() {
            ActivationPhase::Active
        } else {
            ActivationPhase::Idle
        }
    }
}

/// Manages the resource pool and the active endpoint.
///
/// Created once by the caller and shared behind an `Arc`; the constructor
/// returns `Arc<Self>` directly. Several controllers can coexist, each with
/// its own pool and policy.
pub struct PoolController {
    provider: Arc<dyn ResourceProvider>,
    settings: PoolSettings,
    state: SharedState,
    /// Serializes foreground operations
    gate: tokio::sync::Mutex<()>,
    /// Bumped by `interrupt()`
    interrupt_tx: watch::Sender<u64>,
    /// Teardowns queued on the gate
    teardown_waiting: watch::Sender<usize>,
}

/// Which waits a pause yields to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    /// Activation and rotation waits, also cut short by a queued teardown
    Activation,
    /// The termination settle, cut short only by `interrupt()`
    Termination,
}

/// Counts a teardown as queued until dropped
struct QueuedTeardown<'a>(&'a watch::Sender<usize>);

impl<'a> QueuedTeardown<'a> {
    fn enter(waiting: &'a watch::Sender<usize>) -> Self {
        waiting.send_modify(|count| *count += 1);
        Self(waiting)
    }
}

impl Drop for QueuedTeardown<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl PoolController {
    pub fn new(provider: Arc<dyn ResourceProvider>, settings: PoolSettings) -> Arc<Self> {
        let (interrupt_tx, _) = watch::channel(0);
        let (teardown_waiting, _) = watch::channel(0);
        let state = ControllerState::new(settings.target_pool_size);

        Arc::new(Self {
            provider,
            settings,
            state: Arc::new(Mutex::new(state)),
            gate: tokio::sync::Mutex::new(()),
            interrupt_tx,
            teardown_waiting,
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Snapshot of the current state
    pub fn status(&self) -> ControllerStatus {
        let state = self.state.lock();
        ControllerStatus {
            phase: state.phase,
            active: state.active.clone(),
            pool: state.pool.members(),
            target_pool_size: state.pool.target_size(),
            policy: state.policy.clone(),
            retired: state.retired.clone(),
        }
    }

    /// The active handle, if any
    pub fn active(&self) -> Option<ActiveHandle> {
        self.state.lock().active.clone()
    }

    /// Standby pool members in activation order
    pub fn pool_members(&self) -> Vec<ResourceId> {
        self.state.lock().pool.members()
    }

    pub fn phase(&self) -> ActivationPhase {
        self.state.lock().phase
    }

    /// Cut every wait currently in progress short.
    ///
    /// The interrupted operation fails with [`Error::Interrupted`], or for the
    /// termination settle, moves straight on to deleting the policy. Later
    /// operations are not affected.
    pub fn interrupt(&self) {
        info!("Interrupting in-progress waits");
        self.interrupt_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Return the active endpoint, provisioning or rotating first if needed
    pub async fn get_endpoint(&self) -> Result<Endpoint, Error> {
        let _gate = self.gate.lock().await;

        let alive = self.state.lock().active.as_ref().map(|a| a.alive);
        match alive {
            None => self.activate_from_idle().await?,
            Some(false) => {
                info!("Active resource expired, rotating before handing out endpoint");
                self.rotate_locked().await?;
            }
            Some(true) => self.top_up().await,
        }

        let state = self.state.lock();
        let active = state.active.as_ref().ok_or(Error::NoActiveResource)?;
        Ok(Endpoint::http(active.endpoint.clone()))
    }

    /// Replace the active resource with the next pool member
    pub async fn rotate(&self) -> Result<(), Error> {
        let _gate = self.gate.lock().await;
        self.rotate_locked().await
    }

    /// Terminate everything and delete the network policy.
    ///
    /// Best-effort: provider errors are logged and cleanup carries on.
    /// Resources that could not be terminated stay on the retired list and a
    /// policy that could not be deleted stays recorded, so calling this again
    /// retries exactly those.
    pub async fn teardown_all(&self) {
        // Activation waits of whatever holds the gate end while we are queued
        let queued = QueuedTeardown::enter(&self.teardown_waiting);
        let _gate = self.gate.lock().await;
        drop(queued);

        let (targets, watcher, policy) = {
            let mut state = self.state.lock();
            state.phase = ActivationPhase::Idle;

            let mut targets = state.pool.drain();
            if let Some(active) = state.active.take() {
                targets.push(active.id);
            }
            targets.append(&mut state.retired);
            (targets, state.watcher.take(), state.policy.clone())
        };

        if let Some(watcher) = watcher {
            watcher.cancel();
        }

        if targets.is_empty() && policy.is_none() {
            debug!("Nothing to tear down");
            return;
        }

        info!(count = targets.len(), "Tearing down resources");

        let attempted = targets.len();
        let results = join_all(targets.iter().map(|id| self.provider.terminate_resource(id))).await;
        let mut failed = Vec::new();
        for (id, result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => debug!(id = %id, "Resource terminated"),
                Err(ProviderError::NotFound(_)) => debug!(id = %id, "Resource already gone"),
                Err(e) => {
                    error!(id = %id, error = %e, "Failed to terminate resource during teardown");
                    failed.push(id);
                }
            }
        }

        let terminated_any = failed.len() < attempted;
        if !failed.is_empty() {
            self.state.lock().retired.extend(failed);
        }

        if terminated_any {
            let settle = self.settings.termination_settle();
            info!(settle_secs = settle.as_secs(), "Waiting for terminations to settle");
            if self.pause(settle, WaitKind::Termination).await.is_err() {
                warn!("Termination settle interrupted, deleting network policy early");
            }
        }

        if let Some(policy) = policy {
            match self.provider.delete_network_policy(&policy).await {
                Ok(()) | Err(ProviderError::NotFound(_)) => {
                    self.state.lock().policy = None;
                    info!(policy = %policy, "Network policy deleted");
                }
                Err(e) => {
                    error!(policy = %policy, error = %e, "Failed to delete network policy");
                }
            }
        }

        info!("Teardown complete");
    }

    async fn activate_from_idle(&self) -> Result<(), Error> {
        self.set_phase(ActivationPhase::PolicyPending);

        let policy = match self.ensure_policy().await {
            Ok(policy) => policy,
            Err(e) => {
                self.reset_phase();
                return Err(e);
            }
        };

        self.install_next(&policy).await
    }

    async fn rotate_locked(&self) -> Result<(), Error> {
        let (old, watcher) = {
            let mut state = self.state.lock();
            let id = state
                .active
                .as_ref()
                .map(|a| a.id.clone())
                .ok_or(Error::NoActiveResource)?;
            (id, state.watcher.take())
        };

        if let Some(watcher) = watcher {
            watcher.cancel();
        }

        info!(id = %old, "Rotating active resource");

        if let Err(e) = self.provider.terminate_resource(&old).await {
            warn!(id = %old, error = %e, "Failed to terminate rotated resource, retrying at teardown");
            self.state.lock().retired.push(old.clone());
        }

        {
            let mut state = self.state.lock();
            state.pool.remove(&old);
            state.active = None;
            state.phase = ActivationPhase::Idle;
        }

        let policy = self.ensure_policy().await?;
        self.install_next(&policy).await?;

        info!(old = %old, "Switched proxy");
        Ok(())
    }

    /// PoolPending -> AwaitingReadiness -> Active, then refill the pool
    async fn install_next(&self, policy: &PolicyId) -> Result<(), Error> {
        self.set_phase(ActivationPhase::PoolPending);

        if let Err(e) = self.replenish(policy).await {
            if self.state.lock().pool.is_empty() {
                self.reset_phase();
                return Err(e);
            }
            warn!(error = %e, "Pool only partially filled, activating from what is there");
        }

        if let Err(e) = self.activate().await {
            self.reset_phase();
            return Err(e);
        }

        if let Err(e) = self.replenish(policy).await {
            warn!(error = %e, "Failed to refill pool after activation");
        }

        Ok(())
    }

    /// Promote the pool candidate to active once it is ready
    async fn activate(&self) -> Result<(), Error> {
        let candidate = self.state.lock().pool.candidate()?;
        self.set_phase(ActivationPhase::AwaitingReadiness);

        info!(id = %candidate, "Waiting for candidate to become ready");

        let description = match self.await_readiness(&candidate).await {
            Ok(description) => description,
            Err(Error::Interrupted) => return Err(Error::Interrupted),
            Err(e) => {
                self.discard_candidate(&candidate).await;
                return Err(e);
            }
        };

        let settle = self.settings.readiness_settle();
        if !settle.is_zero() {
            info!(id = %candidate, settle_secs = settle.as_secs(), "Candidate ready, waiting for propagation");
            self.pause(settle, WaitKind::Activation).await?;
        }

        let ttl = self.settings.ttl();
        {
            let mut state = self.state.lock();
            state.pool.remove(&candidate);
            state.active = Some(ActiveHandle {
                id: candidate.clone(),
                endpoint: description.endpoint.clone(),
                readiness: description.readiness,
                alive: true,
                activated_at: Utc::now(),
            });
            state.phase = ActivationPhase::Active;

            let watcher = TtlWatcher::spawn(
                Arc::clone(&self.state),
                candidate.clone(),
                ttl,
                self.settings.ttl_check_interval(),
            );
            if let Some(previous) = state.watcher.replace(watcher) {
                previous.cancel();
            }
        }

        info!(
            id = %candidate,
            endpoint = %description.endpoint,
            ttl_secs = ttl.as_secs(),
            "Resource activated"
        );
        Ok(())
    }

    /// Poll the provider until `id` is ready, bounded by `readiness_max_attempts`
    async fn await_readiness(&self, id: &ResourceId) -> Result<ResourceDescription, Error> {
        let max_attempts = self.settings.readiness_max_attempts.max(1);
        let interval = self.settings.readiness_poll_interval();

        let mut last_error = None;
        for attempt in 1..=max_attempts {
            match self.provider.describe_resource(id).await {
                Ok(description)
                    if description.readiness == ReadinessState::Ready
                        && !description.endpoint.is_empty() =>
                {
                    debug!(id = %id, attempt, "Candidate reported ready");
                    return Ok(description);
                }
                Ok(description) if description.readiness.is_terminal() => {
                    error!(id = %id, state = %description.readiness, "Candidate will never become ready");
                    return Err(Error::ReadinessFailed {
                        id: id.clone(),
                        state: description.readiness,
                    });
                }
                Ok(description) => {
                    debug!(id = %id, attempt, state = %description.readiness, "Candidate not ready yet");
                    last_error = None;
                }
                Err(e) => {
                    warn!(id = %id, attempt, error = %e, "Readiness poll failed");
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                self.pause(interval, WaitKind::Activation).await?;
            }
        }

        // The provider was unreachable on the last poll, not just slow
        if let Some(e) = last_error {
            error!(id = %id, attempts = max_attempts, error = %e, "Readiness polling ended on a provider error");
            return Err(Error::Provider(e));
        }

        error!(id = %id, attempts = max_attempts, "Candidate readiness timeout exceeded");
        Err(Error::ProvisioningTimeout {
            id: id.clone(),
            attempts: max_attempts,
        })
    }

    /// Drop a candidate that failed to come up so the next attempt starts fresh
    async fn discard_candidate(&self, id: &ResourceId) {
        self.state.lock().pool.remove(id);

        if let Err(e) = self.provider.terminate_resource(id).await {
            warn!(id = %id, error = %e, "Failed to terminate discarded candidate");
            self.state.lock().retired.push(id.clone());
        } else {
            info!(id = %id, "Discarded candidate terminated");
        }
    }

    /// Fill the pool up to its target size.
    ///
    /// All missing resources are requested concurrently. Successful creations
    /// are kept even when others fail.
    async fn replenish(&self, policy: &PolicyId) -> Result<usize, Error> {
        let deficit = self.state.lock().pool.deficit();
        if deficit == 0 {
            return Ok(0);
        }

        debug!(deficit, "Replenishing pool");

        let requests = (0..deficit).map(|_| {
            self.with_retries("create_resource", || self.provider.create_resource(policy))
        });
        let results = join_all(requests).await;

        let mut created = 0;
        let mut first_error = None;
        let pool_size = {
            let mut state = self.state.lock();
            for result in results {
                match result {
                    Ok(id) => {
                        info!(id = %id, "Resource created");
                        state.pool.push(id);
                        created += 1;
                    }
                    Err(e) => {
                        first_error.get_or_insert(e);
                    }
                }
            }
            state.pool.len()
        };

        debug!(created, pool_size, "Pool replenish finished");

        match first_error {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    /// Refill a short pool while an endpoint is already active
    async fn top_up(&self) {
        let (short, policy) = {
            let state = self.state.lock();
            (state.pool.deficit() > 0, state.policy.clone())
        };

        if let (true, Some(policy)) = (short, policy) {
            if let Err(e) = self.replenish(&policy).await {
                warn!(error = %e, "Failed to top up pool");
            }
        }
    }

    /// Provision the network policy once per pool lifetime
    async fn ensure_policy(&self) -> Result<PolicyId, Error> {
        let existing = self.state.lock().policy.clone();
        if let Some(policy) = existing {
            return Ok(policy);
        }

        let policy = self
            .with_retries("provision_network_policy", || {
                self.provider.provision_network_policy()
            })
            .await?;

        info!(policy = %policy, provider = self.provider.name(), "Network policy provisioned");
        self.state.lock().policy = Some(policy.clone());
        Ok(policy)
    }

    /// Run a provisioning call with linear backoff between attempts
    async fn with_retries<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let attempts = self.settings.provider_retries.max(1);
        let backoff = self.settings.provider_retry_backoff();
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    error!(operation, attempts, error = %e, "Provider call failed, giving up");
                    return Err(Error::Provisioning { attempts, source: e });
                }
                Err(e) => {
                    warn!(operation, attempt, error = %e, "Provider call failed, retrying");
                    self.pause(backoff * attempt, WaitKind::Activation).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Sleep unless interrupted
    async fn pause(&self, duration: Duration, kind: WaitKind) -> Result<(), Error> {
        if duration.is_zero() {
            return Ok(());
        }

        // Subscribing marks the current generation as seen
        let mut interrupts = self.interrupt_tx.subscribe();
        let mut teardowns = self.teardown_waiting.subscribe();

        let teardown_queued = async {
            if kind == WaitKind::Activation {
                let _ = teardowns.wait_for(|queued| *queued > 0).await;
            } else {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = interrupts.changed() => Err(Error::Interrupted),
            _ = teardown_queued => Err(Error::Interrupted),
        }
    }

    fn set_phase(&self, phase: ActivationPhase) {
        let mut state = self.state.lock();
        if state.phase != phase {
            debug!(from = ?state.phase, to = ?phase, "Activation phase changed");
            state.phase = phase;
        }
    }

    fn reset_phase(&self) {
        let mut state = self.state.lock();
        state.phase = state.settled_phase();
    }
}

#[cfg(test)]
impl ControllerState {
    /// State with an alive active handle for `id`
    pub(crate) fn shared_with_active(id: &str) -> SharedState {
        let mut state = ControllerState::new(2);
        state.install_for_test(id);
        Arc::new(Mutex::new(state))
    }

    pub(crate) fn install_for_test(&mut self, id: &str) {
        self.active = Some(ActiveHandle {
            id: ResourceId::new(id),
            endpoint: "10.0.0.1:8080".to_string(),
            readiness: ReadinessState::Ready,
            alive: true,
            activated_at: Utc::now(),
        });
        self.phase = ActivationPhase::Active;
    }

    pub(crate) fn active_alive(&self) -> Option<bool> {
        self.active.as_ref().map(|a| a.alive)
    }

    pub(crate) fn clear_active(&mut self) {
        self.active = None;
        self.phase = ActivationPhase::Idle;
    }
}
