//! Session authentication layer for the SquadRun client.
//!
//! # Architecture
//!
//! - [`CredentialStore`]: process-wide session; persists only the refresh token
//! - [`SecretStore`]: durable get/set/delete of one named secret
//! - [`decorate`]: attaches the bearer credential to outbound requests
//! - [`RenewalCoordinator`]: single-flight refresh-token exchange
//! - [`ResponseGuard`]: renews on `401` and replays the request once
//! - [`SessionClient`]: the handle the application uses; created by running
//!   the bootstrap sequence
//!
//! ```no_run
//! use std::sync::Arc;
//! use session_auth::{AuthConfig, MemorySecretStore, SessionClient};
//!
//! # async fn run() -> Result<(), session_auth::AuthError> {
//! let client = SessionClient::builder(AuthConfig::new("http://localhost:8000/api")?)
//!     .secret_store(Arc::new(MemorySecretStore::new()))
//!     .bootstrap()
//!     .await?;
//!
//! if !client.is_authenticated() {
//!     client.sign_in("runner123", "hunter2").await?;
//! }
//! let squads: serde_json::Value = client.get_json("squads/").await?;
//! # let _ = squads;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod decorator;
pub mod error;
pub mod guard;
pub mod http;
pub mod persistence;
pub mod renewal;
pub mod session;
pub mod store;

pub use api::{AuthApi, HttpAuthApi, LoginRequest, LoginResponse, MeResponse, RegisterRequest};
pub use bootstrap::BootstrapOutcome;
pub use client::{SessionClient, SessionClientBuilder};
pub use config::{AuthConfig, ContentionPolicy, ProxyConfig};
pub use decorator::decorate;
pub use error::{AuthError, RenewalError};
pub use guard::{GuardedRequest, ResponseGuard, is_auth_failure};
pub use persistence::{MemorySecretStore, PersistenceError, SecretStore};
pub use renewal::{RenewalCoordinator, RenewalOutcome};
pub use session::{Profile, Session, SessionEvent, SignOutReason};
pub use store::CredentialStore;
