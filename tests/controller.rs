//! Lifecycle tests for the pool controller against the simulated provider.
//!
//! All tests run on a paused clock so TTLs and settle delays elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use egressgate::config::PoolSettings;
use egressgate::controller::{ActivationPhase, PoolController};
use egressgate::error::{Error, ErrorCode};
use egressgate::provider::{ReadinessState, ResourceId};
use egressgate::simulated::SimulatedProvider;

/// Small, fast settings: TTL in seconds, everything else near zero
fn test_settings(ttl_secs: u64) -> PoolSettings {
    PoolSettings {
        target_pool_size: 2,
        ttl_secs,
        ttl_check_interval_ms: 100,
        readiness_settle_secs: 0,
        termination_settle_secs: 0,
        readiness_poll_interval_ms: 10,
        readiness_max_attempts: 5,
        provider_retries: 3,
        provider_retry_backoff_ms: 10,
    }
}

fn setup(settings: PoolSettings) -> (Arc<SimulatedProvider>, Arc<PoolController>) {
    setup_with_provider(SimulatedProvider::default(), settings)
}

fn setup_with_provider(
    provider: SimulatedProvider,
    settings: PoolSettings,
) -> (Arc<SimulatedProvider>, Arc<PoolController>) {
    let provider = Arc::new(provider);
    let controller = PoolController::new(provider.clone(), settings);
    (provider, controller)
}

fn active_id(controller: &PoolController) -> ResourceId {
    controller.active().expect("an active resource").id
}

/// The active resource is never a pool member
fn assert_singleton(controller: &PoolController) {
    let status = controller.status();
    if let Some(active) = status.active {
        assert!(
            !status.pool.contains(&active.id),
            "active resource {} is also in the pool",
            active.id
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_endpoint_fills_pool() {
    let (provider, controller) = setup(test_settings(5));

    let endpoint = controller.get_endpoint().await.unwrap();
    let active = controller.active().unwrap();

    assert_eq!(endpoint.endpoint, active.endpoint);
    assert_eq!(endpoint.url(), format!("http://{}", active.endpoint));
    assert!(active.alive);
    assert_eq!(active.readiness, ReadinessState::Ready);

    let pool = controller.pool_members();
    assert_eq!(pool.len(), 2);
    assert!(!pool.contains(&active.id));
    assert_eq!(controller.phase(), ActivationPhase::Active);

    assert_eq!(provider.calls().policy_provisions(), 1);
    assert_eq!(provider.calls().creates(), 3);
    assert_eq!(provider.live_count(), 3);
    assert!(provider.policy().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_expired_endpoint_rotates_on_next_call() {
    let (provider, controller) = setup(test_settings(5));

    let first = controller.get_endpoint().await.unwrap();
    let old_id = active_id(&controller);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!controller.active().unwrap().alive);

    let second = controller.get_endpoint().await.unwrap();

    assert_ne!(first, second);
    assert_ne!(active_id(&controller), old_id);
    assert!(provider.is_terminated(&old_id));
    assert!(!controller.pool_members().contains(&old_id));
    assert_eq!(controller.pool_members().len(), 2);
    assert_singleton(&controller);
}

#[tokio::test(start_paused = true)]
async fn test_expiry_triggers_exactly_one_rotation() {
    let (provider, controller) = setup(test_settings(5));

    controller.get_endpoint().await.unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    let terminates_before = provider.calls().terminates();
    let rotated = controller.get_endpoint().await.unwrap();
    assert_eq!(provider.calls().terminates(), terminates_before + 1);

    // The new generation starts alive and is not rotated again
    assert!(controller.active().unwrap().alive);
    let again = controller.get_endpoint().await.unwrap();
    assert_eq!(rotated, again);
    assert_eq!(provider.calls().terminates(), terminates_before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_rotate_replaces_active() {
    let (provider, controller) = setup(test_settings(5));

    controller.get_endpoint().await.unwrap();
    let old_id = active_id(&controller);
    let next_candidate = controller.pool_members()[0].clone();

    controller.rotate().await.unwrap();

    let new_id = active_id(&controller);
    assert_ne!(new_id, old_id);
    assert_eq!(new_id, next_candidate);
    assert!(provider.is_terminated(&old_id));
    assert!(!controller.pool_members().contains(&old_id));
    assert_eq!(controller.pool_members().len(), 2);
    assert_singleton(&controller);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_calls_return_same_endpoint() {
    let (provider, controller) = setup(test_settings(3600));

    let first = controller.get_endpoint().await.unwrap();
    let second = controller.get_endpoint().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(provider.calls().creates(), 3);
    assert_eq!(provider.calls().terminates(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pool_stays_at_target_across_operations() {
    let (_provider, controller) = setup(test_settings(5));

    controller.get_endpoint().await.unwrap();
    assert_eq!(controller.pool_members().len(), 2);

    for _ in 0..3 {
        controller.rotate().await.unwrap();
        assert_eq!(controller.pool_members().len(), 2);
        assert_singleton(&controller);
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    controller.get_endpoint().await.unwrap();
    assert_eq!(controller.pool_members().len(), 2);
    assert_singleton(&controller);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_watcher_has_no_effect() {
    let (provider, controller) = setup(test_settings(5));

    controller.get_endpoint().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    controller.rotate().await.unwrap();
    let new_id = active_id(&controller);
    let terminates = provider.calls().terminates();

    // Past the first generation's deadline, before the second one's
    tokio::time::sleep(Duration::from_secs(4)).await;

    let active = controller.active().unwrap();
    assert_eq!(active.id, new_id);
    assert!(active.alive);
    assert_eq!(provider.calls().terminates(), terminates);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_twice_is_noop() {
    let (provider, controller) = setup(test_settings(5));

    controller.get_endpoint().await.unwrap();
    controller.teardown_all().await;

    assert_eq!(provider.live_count(), 0);
    assert!(provider.policy().is_none());
    assert_eq!(provider.calls().policy_deletes(), 1);
    assert!(controller.active().is_none());
    assert!(controller.pool_members().is_empty());
    assert_eq!(controller.phase(), ActivationPhase::Idle);

    let calls = provider.calls().total();
    controller.teardown_all().await;
    assert_eq!(provider.calls().total(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_before_activation_makes_no_calls() {
    let (provider, controller) = setup(test_settings(5));

    controller.teardown_all().await;
    assert_eq!(provider.calls().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rotate_without_active_resource() {
    let (provider, controller) = setup(test_settings(5));

    let err = controller.rotate().await.unwrap_err();
    assert!(matches!(err, Error::NoActiveResource));
    assert_eq!(err.code(), ErrorCode::NoActiveResource);
    assert_eq!(provider.calls().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_discards_candidate() {
    let (provider, controller) = setup(test_settings(5));
    provider.override_readiness(Some(ReadinessState::Pending));

    let err = controller.get_endpoint().await.unwrap_err();
    match &err {
        Error::ProvisioningTimeout { attempts, .. } => assert_eq!(*attempts, 5),
        other => panic!("expected ProvisioningTimeout, got {:?}", other),
    }
    assert_eq!(err.code(), ErrorCode::ProvisioningTimeout);

    assert!(controller.active().is_none());
    assert_eq!(controller.phase(), ActivationPhase::Idle);
    assert_eq!(controller.pool_members().len(), 1);
    assert_eq!(provider.calls().terminates(), 1);

    // A later call recovers once resources become ready
    provider.override_readiness(None);
    controller.get_endpoint().await.unwrap();
    assert_eq!(controller.pool_members().len(), 2);
    assert_singleton(&controller);
}

#[tokio::test(start_paused = true)]
async fn test_failed_candidate_is_reported() {
    let (provider, controller) = setup(test_settings(5));
    provider.override_readiness(Some(ReadinessState::Failed));

    let err = controller.get_endpoint().await.unwrap_err();
    assert!(matches!(
        err,
        Error::ReadinessFailed {
            state: ReadinessState::Failed,
            ..
        }
    ));
    assert_eq!(err.code(), ErrorCode::ProvisioningFailed);

    // Only one describe: a failed resource is not polled again
    assert_eq!(provider.calls().describes(), 1);
    assert!(controller.active().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_slow_readiness_is_polled() {
    let provider = SimulatedProvider::new(8080, 3);
    let (provider, controller) = setup_with_provider(provider, test_settings(5));

    controller.get_endpoint().await.unwrap();
    assert_eq!(provider.calls().describes(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_create_failures_exhaust_retries() {
    let (provider, controller) = setup(test_settings(5));
    provider.fail_next_creates(100);

    let err = controller.get_endpoint().await.unwrap_err();
    match &err {
        Error::Provisioning { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("expected Provisioning, got {:?}", other),
    }
    assert_eq!(err.code(), ErrorCode::ProvisioningFailed);

    // Both pool slots retried three times each
    assert_eq!(provider.calls().creates(), 6);
    assert!(controller.active().is_none());
    assert_eq!(controller.phase(), ActivationPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_create_retry_recovers() {
    let (provider, controller) = setup(test_settings(5));
    provider.fail_next_creates(1);

    controller.get_endpoint().await.unwrap();
    assert_eq!(provider.calls().creates(), 4);
    assert_eq!(controller.pool_members().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_partial_pool_still_activates() {
    let settings = PoolSettings {
        provider_retries: 1,
        ..test_settings(5)
    };
    let (provider, controller) = setup(settings);
    provider.fail_next_creates(1);

    // One of two creates fails, the other candidate is activated
    controller.get_endpoint().await.unwrap();
    assert!(controller.active().is_some());
    assert_eq!(controller.pool_members().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_rotation_terminate_is_retried_at_teardown() {
    let (provider, controller) = setup(test_settings(5));

    controller.get_endpoint().await.unwrap();
    let old_id = active_id(&controller);

    provider.fail_next_terminates(1);
    controller.rotate().await.unwrap();

    let status = controller.status();
    assert_eq!(status.retired, vec![old_id.clone()]);
    assert!(provider.is_live(&old_id));
    assert_ne!(active_id(&controller), old_id);

    controller.teardown_all().await;
    assert!(provider.is_terminated(&old_id));
    assert_eq!(provider.live_count(), 0);
    assert!(controller.status().retired.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_teardown_terminate_is_retried() {
    let (provider, controller) = setup(test_settings(5));

    controller.get_endpoint().await.unwrap();
    provider.fail_next_terminates(1);
    controller.teardown_all().await;

    assert_eq!(controller.status().retired.len(), 1);
    assert_eq!(provider.live_count(), 1);

    controller.teardown_all().await;
    assert!(controller.status().retired.is_empty());
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_interrupts_readiness_settle() {
    let settings = PoolSettings {
        readiness_settle_secs: 60,
        ..test_settings(5)
    };
    let (provider, controller) = setup(settings);

    let started = tokio::time::Instant::now();
    let pending = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.get_endpoint().await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(controller.phase(), ActivationPhase::AwaitingReadiness);

    controller.teardown_all().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(started.elapsed() < Duration::from_secs(60));

    assert!(controller.active().is_none());
    assert_eq!(provider.live_count(), 0);
    assert!(provider.policy().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_cuts_termination_settle() {
    let settings = PoolSettings {
        termination_settle_secs: 120,
        ..test_settings(5)
    };
    let (provider, controller) = setup(settings);
    controller.get_endpoint().await.unwrap();

    let started = tokio::time::Instant::now();
    let teardown = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.teardown_all().await })
    };

    tokio::time::sleep(Duration::from_secs(5)).await;
    controller.interrupt();
    teardown.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(120));
    assert!(provider.policy().is_none());
    assert_eq!(provider.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_activate_once() {
    let provider = SimulatedProvider::new(8080, 2);
    let (provider, controller) = setup_with_provider(provider, test_settings(3600));

    let a = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.get_endpoint().await })
    };
    let b = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.get_endpoint().await })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_eq!(a, b);
    assert_eq!(provider.calls().policy_provisions(), 1);
    assert_eq!(provider.calls().creates(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_controller_reusable_after_teardown() {
    let (provider, controller) = setup(test_settings(5));

    let first = controller.get_endpoint().await.unwrap();
    controller.teardown_all().await;

    let second = controller.get_endpoint().await.unwrap();
    assert_ne!(first, second);
    assert_eq!(provider.calls().policy_provisions(), 2);
    assert_eq!(controller.pool_members().len(), 2);
    assert_eq!(provider.live_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_cancels_watcher() {
    let (_provider, controller) = setup(test_settings(5));

    controller.get_endpoint().await.unwrap();
    controller.teardown_all().await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(controller.active().is_none());
    assert_eq!(controller.phase(), ActivationPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_second_teardown_waits_for_termination_settle() {
    let settings = PoolSettings {
        termination_settle_secs: 120,
        ..test_settings(5)
    };
    let (provider, controller) = setup(settings);
    controller.get_endpoint().await.unwrap();

    let started = tokio::time::Instant::now();
    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.teardown_all().await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;

    let second = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.teardown_all().await })
    };
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Still settling: the queued teardown does not cut it short
    assert!(provider.policy().is_some());
    assert_eq!(provider.calls().policy_deletes(), 0);

    first.await.unwrap();
    second.await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(120));
    assert!(provider.policy().is_none());
    assert_eq!(provider.calls().policy_deletes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_does_not_affect_later_calls() {
    let (provider, controller) = setup(test_settings(5));

    controller.interrupt();

    controller.get_endpoint().await.unwrap();
    assert!(controller.active().is_some());
    assert_eq!(provider.calls().creates(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_activation_recovers_after_interrupt() {
    let settings = PoolSettings {
        readiness_settle_secs: 60,
        ..test_settings(5)
    };
    let (provider, controller) = setup(settings);

    let pending = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.get_endpoint().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    controller.interrupt();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::Interrupted)));
    assert!(controller.active().is_none());
    assert_eq!(controller.phase(), ActivationPhase::Idle);

    // The interrupted candidate is still pooled and gets activated now
    controller.get_endpoint().await.unwrap();
    assert!(controller.active().is_some());
    assert_eq!(provider.calls().creates(), 3);
    assert_singleton(&controller);
}

#[tokio::test(start_paused = true)]
async fn test_policy_provision_failures_exhaust_retries() {
    let (provider, controller) = setup(test_settings(5));
    provider.fail_next_policy_provisions(3);

    let err = controller.get_endpoint().await.unwrap_err();
    match &err {
        Error::Provisioning { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("expected Provisioning, got {:?}", other),
    }
    assert_eq!(err.code(), ErrorCode::ProvisioningFailed);

    assert_eq!(provider.calls().policy_provisions(), 3);
    assert_eq!(provider.calls().creates(), 0);
    assert_eq!(controller.phase(), ActivationPhase::Idle);
    assert!(controller.status().policy.is_none());

    controller.get_endpoint().await.unwrap();
    assert_eq!(provider.calls().policy_provisions(), 4);
    assert!(controller.status().policy.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failed_policy_delete_is_retried() {
    let (provider, controller) = setup(test_settings(5));
    controller.get_endpoint().await.unwrap();
    let policy = controller.status().policy.unwrap();

    provider.fail_next_policy_deletes(1);
    controller.teardown_all().await;

    // Resources are gone but the policy is still recorded
    assert_eq!(provider.live_count(), 0);
    assert_eq!(controller.status().policy, Some(policy.clone()));
    assert_eq!(provider.policy(), Some(policy));
    assert_eq!(provider.calls().policy_deletes(), 1);

    let terminates = provider.calls().terminates();
    controller.teardown_all().await;

    assert!(controller.status().policy.is_none());
    assert!(provider.policy().is_none());
    assert_eq!(provider.calls().policy_deletes(), 2);
    assert_eq!(provider.calls().terminates(), terminates);
}

#[tokio::test(start_paused = true)]
async fn test_missing_policy_counts_as_deleted() {
    let (provider, controller) = setup(test_settings(5));
    controller.get_endpoint().await.unwrap();

    provider.revoke_policy();
    controller.teardown_all().await;

    assert!(controller.status().policy.is_none());
    assert_eq!(provider.calls().policy_deletes(), 1);

    let calls = provider.calls().total();
    controller.teardown_all().await;
    assert_eq!(provider.calls().total(), calls);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_provider_on_last_poll_is_reported() {
    let (provider, controller) = setup(test_settings(5));
    provider.fail_next_describes(5);

    let err = controller.get_endpoint().await.unwrap_err();
    assert!(matches!(err, Error::Provider(_)), "got {:?}", err);
    assert_eq!(err.code(), ErrorCode::ProviderError);

    assert_eq!(provider.calls().describes(), 5);
    assert_eq!(provider.calls().terminates(), 1);
    assert!(controller.active().is_none());
    assert_eq!(controller.pool_members().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_describe_failures_are_polled_through() {
    let (provider, controller) = setup(test_settings(5));
    provider.fail_next_describes(2);

    controller.get_endpoint().await.unwrap();
    assert!(controller.active().is_some());
    assert_eq!(provider.calls().terminates(), 0);
}
