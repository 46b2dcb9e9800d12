//! Session data model and change events.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Cached user identity. Never used for authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub total_points: i64,
}

/// Snapshot of the current session.
///
/// `access_token` absent means unauthenticated for request signing.
/// `refresh_token` present with `access_token` absent means renewable but not
/// yet active.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub profile: Option<Profile>,
}

impl Session {
    #[inline]
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    #[inline]
    pub fn is_renewable(&self) -> bool {
        self.refresh_token.is_some()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.profile.is_none()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(token: &Option<String>) -> &'static str {
            if token.is_some() { "<redacted>" } else { "None" }
        }

        f.debug_struct("Session")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("profile", &self.profile)
            .finish()
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    /// `logout()` was called.
    Explicit,
    /// Token renewal failed and the session was torn down.
    RenewalFailed,
}

/// Session transitions broadcast to subscribers (the presentation layer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Persisted state was loaded at process start.
    Restored { has_refresh_token: bool },
    /// New tokens were installed by a login.
    SignedIn,
    /// Access token was replaced by a renewal.
    Renewed,
    ProfileUpdated,
    SignedOut { reason: SignOutReason },
}

impl SessionEvent {
    /// Get a description of the event for logging.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Restored { .. } => "Session restored from storage",
            Self::SignedIn => "Signed in",
            Self::Renewed => "Access token renewed",
            Self::ProfileUpdated => "Profile updated",
            Self::SignedOut {
                reason: SignOutReason::Explicit,
            } => "Signed out",
            Self::SignedOut {
                reason: SignOutReason::RenewalFailed,
            } => "Signed out after renewal failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_tokens() {
        let session = Session {
            access_token: Some("secret-access".to_owned()),
            refresh_token: Some("secret-refresh".to_owned()),
            profile: None,
        };
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_state_predicates() {
        let mut session = Session::default();
        assert!(session.is_empty());
        assert!(!session.is_authenticated());

        session.refresh_token = Some("r1".to_owned());
        assert!(session.is_renewable());
        assert!(!session.is_authenticated());
        assert!(!session.is_empty());
    }
}
