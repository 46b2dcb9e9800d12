//! Startup sequence: restore the persisted refresh token and, when one is
//! found, activate it before anyone can observe the session.

use tracing::{info, instrument, warn};

use crate::client::SessionClient;

/// What bootstrap left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// No stored refresh token. No network calls were made.
    Unauthenticated,
    /// Stored refresh token was exchanged for an access token.
    Renewed {
        /// `false` when the identity fetch failed; the tokens are still valid.
        profile_loaded: bool,
    },
    /// Stored refresh token could not be used; the session was cleared.
    RenewalFailed,
}

impl BootstrapOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Renewed { .. })
    }
}

/// Run the startup sequence. Never fails: every error ends in a well-defined
/// session state.
#[instrument(skip_all)]
pub(crate) async fn run(client: &SessionClient) -> BootstrapOutcome {
    let store = client.store();

    if store.restore().await.is_none() {
        info!("No stored session");
        return BootstrapOutcome::Unauthenticated;
    }

    if store.access_token().is_some() {
        return BootstrapOutcome::Renewed {
            profile_loaded: store.read().profile.is_some(),
        };
    }

    if let Err(e) = client.coordinator().renew().await {
        warn!(error = %e, "Failed to restore session on startup");
        return BootstrapOutcome::RenewalFailed;
    }

    let profile_loaded = match client.refresh_profile().await {
        Ok(profile) => {
            info!(user_id = profile.id, username = %profile.username, "Session restored");
            true
        }
        Err(e) => {
            warn!(error = %e, "Session restored but profile fetch failed");
            // A rejected identity fetch may have torn the session down again
            if !store.read().is_authenticated() {
                return BootstrapOutcome::RenewalFailed;
            }
            false
        }
    };

    BootstrapOutcome::Renewed { profile_loaded }
}
