//! Outbound request decoration.

use reqwest::Request;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use tracing::warn;

use crate::session::Session;

/// Attach the session's access token as a bearer credential.
///
/// Any existing `Authorization` header is replaced, so a replayed request
/// carries the renewed token. Without an access token the request is returned
/// unmodified; the server will reject it and the response guard takes over.
pub fn decorate(mut request: Request, session: &Session) -> Request {
    let Some(token) = session.access_token.as_deref() else {
        return request;
    };

    match bearer_header(token) {
        Some(value) => {
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        None => {
            warn!(url = %request.url(), "Access token is not a valid header value; sending unauthenticated");
        }
    }

    request
}

fn bearer_header(token: &str) -> Option<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}")).ok()?;
    value.set_sensitive(true);
    Some(value)
}
