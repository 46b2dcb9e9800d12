//! Unauthenticated auth endpoints: login, registration and token refresh.
//!
//! These calls go straight to the server, never through the response guard,
//! so a 401 from the refresh endpoint cannot trigger another renewal.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AuthConfig, LOGIN_PATH, REGISTER_PATH, TOKEN_REFRESH_PATH};
use crate::error::{AuthError, RenewalError};
use crate::session::Profile;
use crate::store::validate_token;

/// Credentials for `POST auth/login/`. Not `Debug`: carries the password.
#[derive(Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
}

/// Body of a successful login.
///
/// The server only includes profile fields when the user has a profile, and
/// does not echo the username.
#[derive(Clone, Deserialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    pub user_id: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub total_points: Option<i64>,
}

impl LoginResponse {
    /// Split into tokens and profile, using `fallback_username` when the
    /// server omitted it.
    pub fn into_parts(self, fallback_username: &str) -> (String, String, Profile) {
        let profile = Profile {
            id: self.user_id,
            username: self
                .username
                .unwrap_or_else(|| fallback_username.to_owned()),
            display_name: self.display_name.unwrap_or_default(),
            total_points: self.total_points.unwrap_or_default(),
        };
        (self.access, self.refresh, profile)
    }
}

impl std::fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginResponse")
            .field("user_id", &self.user_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Body of `GET auth/me/`.
#[derive(Debug, Clone, Deserialize)]
pub struct MeResponse {
    pub user_id: u64,
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub total_points: i64,
}

impl From<MeResponse> for Profile {
    fn from(me: MeResponse) -> Self {
        Profile {
            id: me.user_id,
            username: me.username,
            display_name: me.display_name,
            total_points: me.total_points,
        }
    }
}

/// Auth endpoints the session layer depends on.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, AuthError>;

    async fn register(&self, request: &RegisterRequest) -> Result<(), AuthError>;

    /// Exchange a refresh token for a new access token. Single attempt.
    async fn refresh(&self, refresh_token: &str) -> Result<String, RenewalError>;
}

/// `AuthApi` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAuthApi {
    client: Client,
    login_url: Url,
    register_url: Url,
    refresh_url: Url,
}

impl HttpAuthApi {
    pub fn new(client: Client, config: &AuthConfig) -> Result<Self, AuthError> {
        Ok(Self {
            client,
            login_url: config.endpoint(LOGIN_PATH)?,
            register_url: config.endpoint(REGISTER_PATH)?,
            refresh_url: config.endpoint(TOKEN_REFRESH_PATH)?,
        })
    }
}

#[async_trait]
impl AuthApi for HttpAuthApi {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, AuthError> {
        let response = self
            .client
            .post(self.login_url.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST {
            return Err(AuthError::InvalidCredentials);
        }
        if !status.is_success() {
            return Err(AuthError::Status {
                status,
                url: self.login_url.to_string(),
            });
        }

        let body = response.bytes().await?;
        let login: LoginResponse =
            serde_json::from_slice(&body).map_err(|source| AuthError::Decode {
                endpoint: LOGIN_PATH.to_owned(),
                source,
            })?;

        validate_token(&login.access)?;
        validate_token(&login.refresh)?;

        debug!(user_id = login.user_id, "Login accepted");
        Ok(login)
    }

    async fn register(&self, request: &RegisterRequest) -> Result<(), AuthError> {
        let response = self
            .client
            .post(self.register_url.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::Status {
                status,
                url: self.register_url.to_string(),
            });
        }

        debug!(username = %request.username, "Registration accepted");
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, RenewalError> {
        let response = self
            .client
            .post(self.refresh_url.clone())
            .json(&RefreshRequest {
                refresh: refresh_token,
            })
            .send()
            .await
            .map_err(|e| RenewalError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RenewalError::Rejected { status });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RenewalError::Transport(e.to_string()))?;

        let parsed: RefreshResponse =
            serde_json::from_slice(&body).map_err(|e| RenewalError::Malformed(e.to_string()))?;

        validate_token(&parsed.access).map_err(|e| RenewalError::Malformed(e.to_string()))?;

        Ok(parsed.access)
    }
}
