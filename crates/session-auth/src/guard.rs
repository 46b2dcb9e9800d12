//! Response guard: renew on `401 Unauthorized` and replay the request once.

use std::sync::Arc;

use reqwest::{Client, Request, Response, StatusCode};
use tracing::{debug, instrument, warn};

use crate::decorator::decorate;
use crate::error::{AuthError, RenewalError};
use crate::renewal::RenewalCoordinator;
use crate::store::CredentialStore;

/// Whether a response status means the access token was refused.
#[inline]
pub fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED
}

/// An outbound request plus whether it has already been replayed after a
/// renewal.
#[derive(Debug)]
pub struct GuardedRequest {
    request: Request,
    already_retried: bool,
}

impl GuardedRequest {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            already_retried: false,
        }
    }

    pub fn already_retried(&self) -> bool {
        self.already_retried
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    fn into_replay(replay: Request) -> Self {
        Self {
            request: replay,
            already_retried: true,
        }
    }
}

impl From<Request> for GuardedRequest {
    fn from(request: Request) -> Self {
        Self::new(request)
    }
}

/// Sends decorated requests and repairs expired access tokens.
#[derive(Clone)]
pub struct ResponseGuard {
    client: Client,
    store: Arc<CredentialStore>,
    coordinator: RenewalCoordinator,
}

impl ResponseGuard {
    pub fn new(client: Client, store: Arc<CredentialStore>, coordinator: RenewalCoordinator) -> Self {
        Self {
            client,
            store,
            coordinator,
        }
    }

    /// Send a request through decoration and the retry-once policy.
    ///
    /// Responses other than 401 are returned untouched, whatever their
    /// status. A 401 on a fresh request renews the access token and replays
    /// the request exactly once; the replay's response is returned as-is,
    /// even if it is another 401. A login that replaces the session during
    /// the renewal counts as a renewal: the replay carries the new token.
    ///
    /// # Errors
    /// * `AuthError::Renewal` - renewal failed; the session has been cleared
    ///   unless the failure was fail-fast
    /// * `AuthError::Transport` - network failure; session untouched
    #[instrument(
        skip_all,
        fields(method = %guarded.request().method(), url = %guarded.request().url())
    )]
    pub async fn dispatch(&self, guarded: GuardedRequest) -> Result<Response, AuthError> {
        let mut guarded = guarded;

        loop {
            let replay = if guarded.already_retried {
                None
            } else {
                guarded.request.try_clone()
            };

            let session = self.store.read();
            let sent_token = session.access_token.clone();
            let request = decorate(guarded.request, &session);

            let response = self.client.execute(request).await?;
            let status = response.status();

            if !is_auth_failure(status) {
                return Ok(response);
            }

            if guarded.already_retried {
                warn!(%status, "Request still unauthorized after token renewal; giving up");
                return Ok(response);
            }

            let Some(replay) = replay else {
                warn!(%status, "Unauthorized response for a request that cannot be replayed");
                return Ok(response);
            };

            guarded = GuardedRequest::into_replay(replay);

            let current = self.store.access_token();
            if current.is_some() && current != sent_token {
                debug!("Access token was renewed while this request was in flight; replaying");
                continue;
            }

            debug!("Access token rejected; renewing");
            match self.coordinator.renew().await {
                Ok(_) => {}
                Err(RenewalError::Superseded) if self.store.access_token().is_some() => {
                    debug!("Session replaced during renewal; replaying with the current token");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Shorthand for dispatching a fresh request.
    pub async fn execute(&self, request: Request) -> Result<Response, AuthError> {
        self.dispatch(GuardedRequest::new(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusCode::UNAUTHORIZED, true)]
    #[case(StatusCode::FORBIDDEN, false)]
    #[case(StatusCode::OK, false)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, false)]
    fn test_is_auth_failure(#[case] status: StatusCode, #[case] expected: bool) {
        assert_eq!(is_auth_failure(status), expected);
    }

    #[test]
    fn test_new_envelope_is_not_retried() {
        let request = Request::new(
            reqwest::Method::GET,
            reqwest::Url::parse("http://localhost/api/runs/").unwrap(),
        );
        let guarded = GuardedRequest::from(request);
        assert!(!guarded.already_retried());

        let replay = guarded.request().try_clone().unwrap();
        assert!(GuardedRequest::into_replay(replay).already_retried());
    }
}
