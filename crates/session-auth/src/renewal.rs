//! Single-flight token renewal.
//!
//! At most one refresh exchange runs per process. The coordinator is a small
//! state machine:
//!
//! - `Idle`: nothing running. The first caller with a refresh token moves it
//!   to `Renewing` and starts the exchange.
//! - `Renewing`: one exchange outstanding. Further callers either share its
//!   outcome ([`ContentionPolicy::Join`]) or fail fast with
//!   [`RenewalError::InProgress`] ([`ContentionPolicy::Reject`]).
//!
//! The exchange runs on its own task, so a caller that gives up waiting does
//! not cancel it. A drop guard returns the state to `Idle` and resolves every
//! waiter on all exit paths.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, OnceCell};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::api::AuthApi;
use crate::config::ContentionPolicy;
use crate::error::RenewalError;
use crate::session::SignOutReason;
use crate::store::CredentialStore;

/// New access token, or why there is none.
pub type RenewalOutcome = Result<String, RenewalError>;

/// Outcome slot shared by every caller of one renewal.
struct InFlight {
    result: OnceCell<RenewalOutcome>,
    notify: Notify,
}

impl InFlight {
    fn new() -> Self {
        Self {
            result: OnceCell::new(),
            notify: Notify::new(),
        }
    }

    fn resolve(&self, outcome: RenewalOutcome) {
        // First outcome wins
        let _ = self.result.set(outcome);
        self.notify.notify_waiters();
    }

    async fn wait(&self) -> RenewalOutcome {
        loop {
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            let notified = self.notify.notified();
            if let Some(result) = self.result.get() {
                return result.clone();
            }

            notified.await;
        }
    }
}

enum RenewalState {
    Idle,
    Renewing(Arc<InFlight>),
}

struct Inner {
    store: Arc<CredentialStore>,
    api: Arc<dyn AuthApi>,
    policy: ContentionPolicy,
    timeout: Option<Duration>,
    state: Mutex<RenewalState>,
}

/// Returns the coordinator to `Idle` and resolves the in-flight slot when
/// the exchange task ends, however it ends.
struct ReleaseGuard {
    inner: Arc<Inner>,
    flight: Arc<InFlight>,
    outcome: Option<RenewalOutcome>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            if matches!(&*state, RenewalState::Renewing(current) if Arc::ptr_eq(current, &self.flight))
            {
                *state = RenewalState::Idle;
            }
        }

        let outcome = self.outcome.take().unwrap_or(Err(RenewalError::Aborted));
        self.flight.resolve(outcome);
    }
}

#[derive(Clone)]
pub struct RenewalCoordinator {
    inner: Arc<Inner>,
}

impl RenewalCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        api: Arc<dyn AuthApi>,
        policy: ContentionPolicy,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                api,
                policy,
                timeout,
                state: Mutex::new(RenewalState::Idle),
            }),
        }
    }

    pub fn policy(&self) -> ContentionPolicy {
        self.inner.policy
    }

    /// Whether an exchange is currently outstanding.
    pub fn is_renewing(&self) -> bool {
        matches!(&*self.inner.state.lock(), RenewalState::Renewing(_))
    }

    /// Exchange the session's refresh token for a new access token.
    ///
    /// # Returns
    /// * `Ok(access)` - the store now holds `access` and the unchanged refresh token
    /// * `Err(NoRefreshToken | InProgress)` - failed fast, session untouched
    /// * `Err(Superseded)` - a logout or new login replaced the session
    ///   meanwhile; the renewed token was discarded
    /// * `Err(..)` - renewal failed and the session was cleared
    pub async fn renew(&self) -> RenewalOutcome {
        let refresh = self
            .inner
            .store
            .refresh_token()
            .ok_or(RenewalError::NoRefreshToken)?;

        let flight = {
            let mut state = self.inner.state.lock();
            let running = match &*state {
                RenewalState::Renewing(flight) => Some(Arc::clone(flight)),
                RenewalState::Idle => None,
            };

            match running {
                Some(flight) => match self.inner.policy {
                    ContentionPolicy::Reject => {
                        debug!("Renewal requested while another is in flight; rejecting");
                        return Err(RenewalError::InProgress);
                    }
                    ContentionPolicy::Join => {
                        debug!("Joining in-flight renewal");
                        flight
                    }
                },
                None => {
                    let flight = Arc::new(InFlight::new());
                    *state = RenewalState::Renewing(Arc::clone(&flight));
                    self.spawn_exchange(refresh, Arc::clone(&flight));
                    flight
                }
            }
        };

        flight.wait().await
    }

    fn spawn_exchange(&self, refresh: String, flight: Arc<InFlight>) {
        let inner = Arc::clone(&self.inner);
        let span = info_span!("token_renewal");

        tokio::spawn(
            async move {
                let mut guard = ReleaseGuard {
                    inner: Arc::clone(&inner),
                    flight,
                    outcome: None,
                };
                guard.outcome = Some(run_exchange(&inner, &refresh).await);
            }
            .instrument(span),
        );
    }
}

async fn run_exchange(inner: &Inner, refresh: &str) -> RenewalOutcome {
    info!("Starting token renewal");

    let exchange = inner.api.refresh(refresh);
    let result = match inner.timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .unwrap_or(Err(RenewalError::TimedOut(limit))),
        None => exchange.await,
    };

    let failure = match result {
        Ok(access) => match inner.store.apply_renewal(refresh, access.clone()).await {
            Ok(true) => {
                info!("Token renewal successful");
                return Ok(access);
            }
            Ok(false) => {
                warn!("Session changed while renewing; discarding renewed token");
                return Err(RenewalError::Superseded);
            }
            Err(e) => RenewalError::Malformed(e.to_string()),
        },
        Err(e) => e,
    };

    error!(error = %failure, "Token renewal failed; signing out");
    inner
        .store
        .clear_if_current(refresh, SignOutReason::RenewalFailed)
        .await;
    Err(failure)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::api::{LoginRequest, LoginResponse, RegisterRequest};
    use crate::error::AuthError;
    use crate::persistence::{MemorySecretStore, SecretStore};
    use crate::session::SessionEvent;

    const KEY: &str = "refreshToken";

    /// Refresh endpoint stand-in. Each exchange waits for a gate permit when
    /// gated, then pops the next scripted outcome.
    struct ScriptedApi {
        calls: AtomicUsize,
        gate: Option<Semaphore>,
        outcomes: Mutex<VecDeque<RenewalOutcome>>,
    }

    impl ScriptedApi {
        fn new(outcomes: impl IntoIterator<Item = RenewalOutcome>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: None,
                outcomes: Mutex::new(outcomes.into_iter().collect()),
            }
        }

        fn gated(outcomes: impl IntoIterator<Item = RenewalOutcome>) -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::new(outcomes)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.add_permits(1);
            }
        }
    }

    #[async_trait]
    impl AuthApi for ScriptedApi {
        async fn login(&self, _: &LoginRequest) -> Result<LoginResponse, AuthError> {
            unimplemented!("not used by renewal")
        }

        async fn register(&self, _: &RegisterRequest) -> Result<(), AuthError> {
            unimplemented!("not used by renewal")
        }

        async fn refresh(&self, refresh_token: &str) -> RenewalOutcome {
            assert_eq!(refresh_token, "r1");
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or(Err(RenewalError::Transport("no scripted outcome".into())))
        }
    }

    async fn setup(
        api: Arc<ScriptedApi>,
        policy: ContentionPolicy,
        timeout: Option<Duration>,
    ) -> (RenewalCoordinator, Arc<CredentialStore>, Arc<MemorySecretStore>) {
        let secrets = Arc::new(MemorySecretStore::new());
        let store = Arc::new(CredentialStore::new(secrets.clone(), KEY));
        store
            .set_tokens("a0".into(), "r1".into(), None)
            .await
            .unwrap();
        let coordinator = RenewalCoordinator::new(store.clone(), api, policy, timeout);
        (coordinator, store, secrets)
    }

    async fn wait_for_calls(api: &ScriptedApi, expected: usize) {
        while api.calls() < expected {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_success_updates_access_and_keeps_refresh() {
        let api = Arc::new(ScriptedApi::new([Ok("a2".to_owned())]));
        let (coordinator, store, secrets) = setup(api.clone(), ContentionPolicy::Join, None).await;

        assert_eq!(coordinator.renew().await.unwrap(), "a2");

        let session = store.read();
        assert_eq!(session.access_token.as_deref(), Some("a2"));
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));
        assert!(secrets.contains(KEY));
        assert_eq!(api.calls(), 1);
        assert!(!coordinator.is_renewing());
    }

    #[tokio::test]
    async fn test_without_refresh_token_fails_fast() {
        let api = Arc::new(ScriptedApi::new([]));
        let store = Arc::new(CredentialStore::new(Arc::new(MemorySecretStore::new()), KEY));
        let coordinator =
            RenewalCoordinator::new(store.clone(), api.clone(), ContentionPolicy::Join, None);

        assert_eq!(coordinator.renew().await, Err(RenewalError::NoRefreshToken));
        assert_eq!(api.calls(), 0);
        assert!(!coordinator.is_renewing());
        assert!(store.read().is_empty());
    }

    #[tokio::test]
    async fn test_reject_policy_fails_second_caller_with_one_exchange() {
        let api = Arc::new(ScriptedApi::gated([Ok("a2".to_owned())]));
        let (coordinator, store, _) = setup(api.clone(), ContentionPolicy::Reject, None).await;

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.renew().await }
        });
        wait_for_calls(&api, 1).await;
        assert!(coordinator.is_renewing());

        assert_eq!(coordinator.renew().await, Err(RenewalError::InProgress));
        // Contention alone never clears the session
        assert_eq!(store.access_token().as_deref(), Some("a0"));

        api.release();
        assert_eq!(first.await.unwrap().unwrap(), "a2");
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_join_policy_shares_single_outcome() {
        let api = Arc::new(ScriptedApi::gated([Ok("a2".to_owned())]));
        let (coordinator, _, _) = setup(api.clone(), ContentionPolicy::Join, None).await;

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.renew().await })
            })
            .collect();

        wait_for_calls(&api, 1).await;
        api.release();

        for caller in callers {
            assert_eq!(caller.await.unwrap().unwrap(), "a2");
        }
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejection_clears_session_totally() {
        let api = Arc::new(ScriptedApi::new([Err(RenewalError::Rejected {
            status: StatusCode::UNAUTHORIZED,
        })]));
        let (coordinator, store, secrets) = setup(api, ContentionPolicy::Join, None).await;
        let mut events = store.subscribe();

        let err = coordinator.renew().await.unwrap_err();
        assert_eq!(
            err,
            RenewalError::Rejected {
                status: StatusCode::UNAUTHORIZED
            }
        );

        assert!(store.read().is_empty());
        assert!(!secrets.contains(KEY));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SignedOut {
                reason: SignOutReason::RenewalFailed
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_token_counts_as_failure() {
        let api = Arc::new(ScriptedApi::new([Ok(String::new())]));
        let (coordinator, store, _) = setup(api, ContentionPolicy::Join, None).await;

        assert!(matches!(
            coordinator.renew().await,
            Err(RenewalError::Malformed(_))
        ));
        assert!(store.read().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_a_renewal_failure() {
        let api = Arc::new(ScriptedApi::gated([Ok("never".to_owned())]));
        let limit = Duration::from_millis(20);
        let (coordinator, store, secrets) =
            setup(api.clone(), ContentionPolicy::Join, Some(limit)).await;

        assert_eq!(coordinator.renew().await, Err(RenewalError::TimedOut(limit)));
        assert!(store.read().is_empty());
        assert!(!secrets.contains(KEY));
        assert!(!coordinator.is_renewing());
    }

    #[tokio::test]
    async fn test_returns_to_idle_between_renewals() {
        let api = Arc::new(ScriptedApi::new([Ok("a2".to_owned()), Ok("a3".to_owned())]));
        let (coordinator, store, _) = setup(api.clone(), ContentionPolicy::Reject, None).await;

        assert_eq!(coordinator.renew().await.unwrap(), "a2");
        assert_eq!(coordinator.renew().await.unwrap(), "a3");
        assert_eq!(store.access_token().as_deref(), Some("a3"));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_renewal() {
        let api = Arc::new(ScriptedApi::gated([Ok("a2".to_owned())]));
        let (coordinator, store, _) = setup(api.clone(), ContentionPolicy::Join, None).await;

        let caller = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.renew().await }
        });
        wait_for_calls(&api, 1).await;
        caller.abort();

        api.release();
        while coordinator.is_renewing() {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.access_token().as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn test_logout_during_renewal_is_not_undone() {
        let api = Arc::new(ScriptedApi::gated([Ok("a2".to_owned())]));
        let (coordinator, store, _) = setup(api.clone(), ContentionPolicy::Join, None).await;

        let caller = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.renew().await }
        });
        wait_for_calls(&api, 1).await;

        store.clear(SignOutReason::Explicit).await;
        api.release();

        assert_eq!(caller.await.unwrap(), Err(RenewalError::Superseded));
        assert!(store.read().is_empty());
    }

    #[tokio::test]
    async fn test_newer_login_during_renewal_is_kept() {
        let api = Arc::new(ScriptedApi::gated([Ok("a2".to_owned())]));
        let (coordinator, store, secrets) = setup(api.clone(), ContentionPolicy::Join, None).await;

        let caller = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.renew().await }
        });
        wait_for_calls(&api, 1).await;

        store
            .set_tokens("a9".into(), "r9".into(), None)
            .await
            .unwrap();
        api.release();

        let err = caller.await.unwrap().unwrap_err();
        assert_eq!(err, RenewalError::Superseded);
        assert!(!err.is_terminal());
        assert_eq!(store.access_token().as_deref(), Some("a9"));
        assert_eq!(secrets.get(KEY).await.unwrap().as_deref(), Some("r9"));
    }
}
