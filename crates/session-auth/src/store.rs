//! In-memory credential store.
//!
//! Holds the process-wide [`Session`]. Only the refresh token is persisted;
//! the access token and profile live in memory and are empty after every
//! restart until bootstrap or a login repopulates them.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::persistence::SecretStore;
use crate::session::{Profile, Session, SessionEvent, SignOutReason};

/// Default channel capacity for session events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct CredentialStore {
    session: RwLock<Session>,
    secrets: Arc<dyn SecretStore>,
    key: String,
    /// Serializes writes so the persisted secret follows the same order as
    /// the in-memory updates. Never held by readers.
    write_lock: Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl CredentialStore {
    pub fn new(secrets: Arc<dyn SecretStore>, key: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session: RwLock::new(Session::default()),
            secrets,
            key: key.into(),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Current session snapshot. Never waits on I/O.
    pub fn read(&self) -> Session {
        self.session.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.session.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.session.read().refresh_token.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: SessionEvent) {
        debug!("Session event: {}", event.description());
        // send() fails only when nobody is listening
        let _ = self.events.send(event);
    }

    /// Load the persisted refresh token into memory.
    ///
    /// A backend failure is logged and treated as nothing stored.
    pub(crate) async fn restore(&self) -> Option<String> {
        let _guard = self.write_lock.lock().await;

        let stored = match self.secrets.get(&self.key).await {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read persisted refresh token (non-fatal)");
                None
            }
        };

        if let Some(refresh) = &stored {
            self.session.write().refresh_token = Some(refresh.clone());
        }

        self.publish(SessionEvent::Restored {
            has_refresh_token: stored.is_some(),
        });
        stored
    }

    /// Replace the session with a freshly signed-in one and persist the
    /// refresh token.
    ///
    /// Tokens and profile land in a single write, so readers never see the
    /// new tokens next to the previous user's profile. Persistence failure is
    /// logged, not surfaced: the in-memory session stays authoritative for
    /// this process.
    pub(crate) async fn set_tokens(
        &self,
        access: String,
        refresh: String,
        profile: Option<Profile>,
    ) -> Result<(), AuthError> {
        validate_token(&access)?;
        validate_token(&refresh)?;

        let _guard = self.write_lock.lock().await;
        let has_profile = profile.is_some();
        *self.session.write() = Session {
            access_token: Some(access),
            refresh_token: Some(refresh.clone()),
            profile,
        };
        self.publish(SessionEvent::SignedIn);
        if has_profile {
            self.publish(SessionEvent::ProfileUpdated);
        }
        self.persist(&refresh).await;
        Ok(())
    }

    /// Install a renewed access token, keeping the refresh token.
    ///
    /// Applies only while `refresh_used` is still the session's refresh token;
    /// returns `false` if the session moved on (logout or a new login) while
    /// the renewal was running. The refresh token is unchanged, so nothing is
    /// written to the secret store.
    pub(crate) async fn apply_renewal(
        &self,
        refresh_used: &str,
        access: String,
    ) -> Result<bool, AuthError> {
        validate_token(&access)?;

        let _guard = self.write_lock.lock().await;
        {
            let mut session = self.session.write();
            if session.refresh_token.as_deref() != Some(refresh_used) {
                return Ok(false);
            }
            session.access_token = Some(access);
        }
        self.publish(SessionEvent::Renewed);
        Ok(true)
    }

    /// Cache the signed-in user's profile.
    ///
    /// Applies only while `refresh_used` is still the session's refresh token,
    /// so an identity fetch that finishes after a logout or a new login
    /// cannot resurrect a profile in an empty or foreign session.
    pub(crate) async fn set_profile(&self, refresh_used: &str, profile: Profile) -> bool {
        let _guard = self.write_lock.lock().await;
        {
            let mut session = self.session.write();
            if session.refresh_token.as_deref() != Some(refresh_used) {
                debug!("Session changed during profile fetch; discarding profile");
                return false;
            }
            session.profile = Some(profile);
        }
        self.publish(SessionEvent::ProfileUpdated);
        true
    }

    /// Drop every field and delete the persisted secret.
    pub(crate) async fn clear(&self, reason: SignOutReason) {
        let _guard = self.write_lock.lock().await;
        self.clear_locked(reason).await;
    }

    /// Clear only while `refresh_used` is still the session's refresh token.
    ///
    /// A failed renewal must not tear down a session that a newer login
    /// already replaced.
    pub(crate) async fn clear_if_current(&self, refresh_used: &str, reason: SignOutReason) -> bool {
        let _guard = self.write_lock.lock().await;
        let current = self.session.read().refresh_token.clone();
        match current.as_deref() {
            Some(current) if current != refresh_used => false,
            _ => {
                self.clear_locked(reason).await;
                true
            }
        }
    }

    async fn clear_locked(&self, reason: SignOutReason) {
        *self.session.write() = Session::default();
        self.publish(SessionEvent::SignedOut { reason });

        if let Err(e) = self.secrets.delete(&self.key).await {
            warn!(error = %e, "Failed to delete persisted refresh token (non-fatal)");
        }
    }

    async fn persist(&self, refresh: &str) {
        if let Err(e) = self.secrets.set(&self.key, refresh).await {
            warn!(error = %e, "Failed to persist refresh token (non-fatal)");
        }
    }
}

/// Reject tokens that cannot be carried as a bearer credential.
pub(crate) fn validate_token(token: &str) -> Result<(), AuthError> {
    if token.is_empty() {
        return Err(AuthError::InvalidToken("token is empty"));
    }
    if token.trim() != token {
        return Err(AuthError::InvalidToken("token has surrounding whitespace"));
    }
    if !token.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(AuthError::InvalidToken(
            "token contains non-printable or non-ASCII characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemorySecretStore, MockSecretStore, PersistenceError};

    const KEY: &str = "refreshToken";

    fn profile() -> Profile {
        Profile {
            id: 7,
            username: "runner123".to_owned(),
            display_name: "Runner".to_owned(),
            total_points: 40,
        }
    }

    #[tokio::test]
    async fn test_set_tokens_persists_refresh_only() {
        let secrets = Arc::new(MemorySecretStore::new());
        let store = CredentialStore::new(secrets.clone(), KEY);

        store.set_tokens("a1".into(), "r1".into(), None).await.unwrap();

        let session = store.read();
        assert_eq!(session.access_token.as_deref(), Some("a1"));
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));
        assert_eq!(secrets.get(KEY).await.unwrap().as_deref(), Some("r1"));
        assert_eq!(secrets.len(), 1);
    }

    #[tokio::test]
    async fn test_set_tokens_rejects_invalid_access_token() {
        let store = CredentialStore::new(Arc::new(MemorySecretStore::new()), KEY);

        for bad in ["", " a1", "a\n1", "tok\u{e9}n"] {
            let err = store.set_tokens(bad.into(), "r1".into(), None).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidToken(_)), "{bad:?}");
        }
        assert!(store.read().is_empty());
    }

    #[tokio::test]
    async fn test_clear_is_total() {
        let secrets = Arc::new(MemorySecretStore::new());
        let store = CredentialStore::new(secrets.clone(), KEY);
        store
            .set_tokens("a1".into(), "r1".into(), Some(profile()))
            .await
            .unwrap();

        let mut events = store.subscribe();
        store.clear(SignOutReason::Explicit).await;

        assert!(store.read().is_empty());
        assert!(!secrets.contains(KEY));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SignedOut {
                reason: SignOutReason::Explicit
            }
        );
    }

    #[tokio::test]
    async fn test_restore_loads_refresh_token_only() {
        let secrets = Arc::new(MemorySecretStore::with_secret(KEY, "r1"));
        let store = CredentialStore::new(secrets, KEY);

        assert_eq!(store.restore().await.as_deref(), Some("r1"));
        let session = store.read();
        assert_eq!(session.refresh_token.as_deref(), Some("r1"));
        assert!(session.access_token.is_none());
        assert!(session.profile.is_none());
    }

    #[tokio::test]
    async fn test_persistence_failures_are_not_surfaced() {
        let mut secrets = MockSecretStore::new();
        secrets
            .expect_set()
            .returning(|_, _| Err(PersistenceError::Backend("keystore locked".into())));
        secrets
            .expect_delete()
            .returning(|_| Err(PersistenceError::Backend("keystore locked".into())));
        secrets
            .expect_get()
            .returning(|_| Err(PersistenceError::Backend("keystore locked".into())));

        let store = CredentialStore::new(Arc::new(secrets), KEY);

        assert!(store.restore().await.is_none());
        store.set_tokens("a1".into(), "r1".into(), None).await.unwrap();
        assert_eq!(store.access_token().as_deref(), Some("a1"));

        store.clear(SignOutReason::Explicit).await;
        assert!(store.read().is_empty());
    }

    #[tokio::test]
    async fn test_apply_renewal_requires_matching_refresh_token() {
        let store = CredentialStore::new(Arc::new(MemorySecretStore::new()), KEY);
        store.set_tokens("a1".into(), "r1".into(), None).await.unwrap();

        assert!(store.apply_renewal("r1", "a2".into()).await.unwrap());
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));

        store.clear(SignOutReason::Explicit).await;
        assert!(!store.apply_renewal("r1", "a3".into()).await.unwrap());
        assert!(store.read().is_empty());
    }

    #[tokio::test]
    async fn test_clear_if_current_spares_newer_login() {
        let secrets = Arc::new(MemorySecretStore::new());
        let store = CredentialStore::new(secrets.clone(), KEY);
        store.set_tokens("a9".into(), "r9".into(), None).await.unwrap();

        assert!(!store.clear_if_current("r1", SignOutReason::RenewalFailed).await);
        assert_eq!(store.refresh_token().as_deref(), Some("r9"));
        assert!(secrets.contains(KEY));

        assert!(store.clear_if_current("r9", SignOutReason::RenewalFailed).await);
        assert!(store.read().is_empty());
        assert!(!secrets.contains(KEY));
    }

    #[tokio::test]
    async fn test_renewal_does_not_rewrite_persisted_secret() {
        let mut secrets = MockSecretStore::new();
        secrets.expect_set().times(1).returning(|_, _| Ok(()));

        let store = CredentialStore::new(Arc::new(secrets), KEY);
        store.set_tokens("a1".into(), "r1".into(), None).await.unwrap();

        assert!(store.apply_renewal("r1", "a2".into()).await.unwrap());
        assert!(store.apply_renewal("r1", "a3".into()).await.unwrap());
        assert_eq!(store.access_token().as_deref(), Some("a3"));
    }

    #[tokio::test]
    async fn test_profile_is_not_written_into_a_cleared_session() {
        let store = CredentialStore::new(Arc::new(MemorySecretStore::new()), KEY);
        store.set_tokens("a1".into(), "r1".into(), None).await.unwrap();
        store.clear(SignOutReason::Explicit).await;

        assert!(!store.set_profile("r1", profile()).await);
        assert!(store.read().is_empty());
    }

    #[tokio::test]
    async fn test_profile_is_not_written_into_a_newer_login() {
        let store = CredentialStore::new(Arc::new(MemorySecretStore::new()), KEY);
        store.set_tokens("a9".into(), "r9".into(), None).await.unwrap();

        assert!(!store.set_profile("r1", profile()).await);
        assert!(store.read().profile.is_none());

        assert!(store.set_profile("r9", profile()).await);
        assert_eq!(store.read().profile, Some(profile()));
    }

    #[tokio::test]
    async fn test_sign_in_replaces_previous_profile_atomically() {
        let store = CredentialStore::new(Arc::new(MemorySecretStore::new()), KEY);
        store
            .set_tokens("a1".into(), "r1".into(), Some(profile()))
            .await
            .unwrap();

        store.set_tokens("a2".into(), "r2".into(), None).await.unwrap();

        let session = store.read();
        assert_eq!(session.access_token.as_deref(), Some("a2"));
        assert!(session.profile.is_none());
    }
}
