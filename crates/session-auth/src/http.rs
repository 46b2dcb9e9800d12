//! HTTP client construction.

use std::sync::Once;

use reqwest::{ClientBuilder, Proxy};
use tracing::{debug, warn};

use crate::config::{AuthConfig, ProxyConfig};
use crate::error::AuthError;

/// Install aws-lc-rs as the process-wide rustls provider.
///
/// reqwest is built without a bundled provider, so this must run before the
/// first client is built. Safe to call repeatedly.
pub fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls provider was already installed by another component");
        }
    });
}

/// Where the client routes its traffic.
#[derive(Debug)]
enum Route {
    /// Connect directly, ignoring proxy environment variables.
    Direct,
    /// Let reqwest pick up `HTTP(S)_PROXY` and friends.
    System,
    Explicit(Proxy),
}

fn route(proxy: &ProxyConfig) -> Route {
    if !proxy.enabled {
        return Route::Direct;
    }

    let Some(url) = proxy.url.as_deref().filter(|u| !u.trim().is_empty()) else {
        return if proxy.use_system_proxy {
            Route::System
        } else {
            Route::Direct
        };
    };

    let explicit = match Proxy::all(url) {
        Ok(explicit) => explicit,
        Err(e) => {
            warn!(proxy_url = %url, error = %e, "Ignoring unparsable proxy URL; connecting directly");
            return Route::Direct;
        }
    };

    match (proxy.username.as_deref(), proxy.password.as_deref()) {
        (Some(user), Some(pass)) => Route::Explicit(explicit.basic_auth(user, pass)),
        (Some(_), None) | (None, Some(_)) => {
            warn!(proxy_url = %url, "Proxy credentials need both username and password; ignoring them");
            Route::Explicit(explicit)
        }
        (None, None) => Route::Explicit(explicit),
    }
}

fn with_route(builder: ClientBuilder, proxy: &ProxyConfig) -> ClientBuilder {
    match route(proxy) {
        Route::Direct => builder.no_proxy(),
        Route::System => builder,
        Route::Explicit(explicit) => builder.proxy(explicit),
    }
}

/// Build the `reqwest::Client` shared by the auth endpoints and the guarded
/// request path.
pub fn build_client(config: &AuthConfig) -> Result<reqwest::Client, AuthError> {
    ensure_crypto_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .connect_timeout(config.connect_timeout);

    if !config.request_timeout.is_zero() {
        builder = builder.timeout(config.request_timeout);
    }

    with_route(builder, &config.proxy)
        .build()
        .map_err(|e| AuthError::config(format!("failed to build HTTP client: {e}")))
}
