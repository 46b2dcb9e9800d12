//! Session client: the single handle the application uses for sessions and
//! for every API call.
//!
//! All feature code goes through [`SessionClient::send`] (or the JSON
//! helpers) so that decoration and the retry-once guard are never bypassed.

use std::sync::Arc;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::api::{AuthApi, HttpAuthApi, LoginRequest, MeResponse, RegisterRequest};
use crate::bootstrap::{self, BootstrapOutcome};
use crate::config::{AuthConfig, ME_PATH};
use crate::error::{AuthError, RenewalError};
use crate::guard::ResponseGuard;
use crate::http::build_client;
use crate::persistence::{MemorySecretStore, SecretStore};
use crate::renewal::RenewalCoordinator;
use crate::session::{Profile, Session, SessionEvent, SignOutReason};
use crate::store::CredentialStore;

/// Builder for [`SessionClient`].
///
/// The client only comes into existence through [`bootstrap`](Self::bootstrap),
/// so nothing can read session state before startup restoration finished.
pub struct SessionClientBuilder {
    config: AuthConfig,
    secrets: Option<Arc<dyn SecretStore>>,
    api: Option<Arc<dyn AuthApi>>,
    http: Option<Client>,
}

impl SessionClientBuilder {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            secrets: None,
            api: None,
            http: None,
        }
    }

    /// Durable storage for the refresh token. Defaults to an in-memory store.
    pub fn secret_store(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Replace the HTTP-backed auth endpoints.
    pub fn auth_api(mut self, api: Arc<dyn AuthApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Use a preconfigured `reqwest::Client` instead of building one from the config.
    pub fn http_client(mut self, client: Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Assemble the client and run the startup sequence.
    ///
    /// Bootstrap failures never surface here; they leave the session
    /// unauthenticated and are reported by [`SessionClient::bootstrap_outcome`].
    /// Only configuration problems are returned as errors.
    pub async fn bootstrap(self) -> Result<SessionClient, AuthError> {
        let config = Arc::new(self.config);

        let http = match self.http {
            Some(client) => client,
            None => build_client(&config)?,
        };

        let api: Arc<dyn AuthApi> = match self.api {
            Some(api) => api,
            None => Arc::new(HttpAuthApi::new(http.clone(), &config)?),
        };

        let secrets = self
            .secrets
            .unwrap_or_else(|| Arc::new(MemorySecretStore::new()) as Arc<dyn SecretStore>);

        let store = Arc::new(CredentialStore::new(
            secrets,
            config.refresh_token_key.clone(),
        ));
        let coordinator = RenewalCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&api),
            config.contention,
            config.renewal_timeout,
        );
        let guard = ResponseGuard::new(http.clone(), Arc::clone(&store), coordinator.clone());

        let mut client = SessionClient {
            config,
            http,
            store,
            api,
            coordinator,
            guard,
            bootstrap: BootstrapOutcome::Unauthenticated,
        };
        client.bootstrap = bootstrap::run(&client).await;

        Ok(client)
    }
}

#[derive(Clone)]
pub struct SessionClient {
    config: Arc<AuthConfig>,
    http: Client,
    store: Arc<CredentialStore>,
    api: Arc<dyn AuthApi>,
    coordinator: RenewalCoordinator,
    guard: ResponseGuard,
    bootstrap: BootstrapOutcome,
}

impl SessionClient {
    pub fn builder(config: AuthConfig) -> SessionClientBuilder {
        SessionClientBuilder::new(config)
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Current session snapshot.
    pub fn session(&self) -> Session {
        self.store.read()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.read().is_authenticated()
    }

    /// Subscribe to session transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.store.subscribe()
    }

    pub fn bootstrap_outcome(&self) -> BootstrapOutcome {
        self.bootstrap
    }

    pub(crate) fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub(crate) fn coordinator(&self) -> &RenewalCoordinator {
        &self.coordinator
    }

    /// Install tokens obtained by a login or registration flow.
    pub async fn login(
        &self,
        access: impl Into<String>,
        refresh: impl Into<String>,
        profile: Profile,
    ) -> Result<(), AuthError> {
        self.store
            .set_tokens(access.into(), refresh.into(), Some(profile))
            .await
    }

    /// End the session: clear every field and delete the stored refresh token.
    pub async fn logout(&self) {
        self.store.clear(SignOutReason::Explicit).await;
        info!("Logged out");
    }

    /// Authenticate with username and password.
    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<Profile, AuthError> {
        let response = self
            .api
            .login(&LoginRequest {
                username: username.to_owned(),
                password: password.to_owned(),
            })
            .await?;

        let (access, refresh, profile) = response.into_parts(username);
        self.login(access, refresh, profile.clone()).await?;

        info!(user_id = profile.id, "Signed in");
        Ok(profile)
    }

    /// Create an account. Does not sign in.
    #[instrument(skip(self, password))]
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        self.api
            .register(&RegisterRequest {
                username: username.to_owned(),
                email: email.to_owned(),
                password: password.to_owned(),
            })
            .await
    }

    /// Create an account and sign straight in.
    pub async fn sign_up(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Profile, AuthError> {
        self.register(username, email, password).await?;
        self.sign_in(username, password).await
    }

    /// Fetch the signed-in user's identity and cache it in the session.
    ///
    /// # Errors
    /// * `AuthError::SessionChanged` - a logout or another login happened while
    ///   the fetch was in flight; the fetched profile was discarded
    pub async fn refresh_profile(&self) -> Result<Profile, AuthError> {
        let refresh = self
            .store
            .refresh_token()
            .ok_or(RenewalError::NoRefreshToken)?;

        let me: MeResponse = self.get_json(ME_PATH).await?;
        let profile = Profile::from(me);

        if !self.store.set_profile(&refresh, profile.clone()).await {
            return Err(AuthError::SessionChanged);
        }
        Ok(profile)
    }

    /// Start a request against an API path.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, AuthError> {
        Ok(self.http.request(method, self.config.endpoint(path)?))
    }

    /// Send a request with the session's credentials, renewing and replaying
    /// once if the access token is refused.
    ///
    /// Non-401 responses are returned whatever their status.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, AuthError> {
        let request = request.build()?;
        self.guard.execute(request).await
    }

    /// `GET` an API path and decode a JSON body. Non-2xx is an error.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AuthError> {
        let response = self.send(self.request(Method::GET, path)?).await?;
        read_json(response, path).await
    }

    /// `POST` a JSON body to an API path and decode a JSON reply. Non-2xx is an error.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, AuthError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send(self.request(Method::POST, path)?.json(body))
            .await?;
        read_json(response, path).await
    }
}

async fn read_json<T: DeserializeOwned>(response: Response, path: &str) -> Result<T, AuthError> {
    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::Status {
            status,
            url: response.url().to_string(),
        });
    }

    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|source| AuthError::Decode {
        endpoint: path.to_owned(),
        source,
    })
}
