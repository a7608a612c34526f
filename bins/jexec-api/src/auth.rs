// Request Authenticator
//
// Every protected call carries `Authorization: Bearer <secret>`. Calls that
// may change state also carry `x-signature`, the hex HMAC-SHA256 of the exact
// body bytes keyed with the same secret. The middleware buffers the body so
// the signature is checked against precisely what arrived on the wire.

use crate::error::ApiError;
use crate::AppState;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{AsHeaderName, AUTHORIZATION};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::Response;
use jexec_common::signing::{credential_matches, verify_body, BEARER_PREFIX, SIGNATURE_HEADER};
use jexec_common::types::ValidationError;
use std::sync::Arc;

/// Largest request body accepted on any protected route
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidCredential,
    #[error("missing request signature")]
    MissingSignature,
    #[error("invalid request signature")]
    InvalidSignature,
}

/// Read-only methods need no body signature
fn is_read_only(method: &Method) -> bool {
    [Method::GET, Method::HEAD, Method::OPTIONS].contains(method)
}

/// Check the bearer credential alone
pub fn check_credential(authorization: Option<&str>, secret: &str) -> Result<(), AuthError> {
    let credential = authorization
        .ok_or(AuthError::MissingCredential)?
        .strip_prefix(BEARER_PREFIX)
        .ok_or(AuthError::InvalidCredential)?;

    if credential_matches(credential, secret) {
        Ok(())
    } else {
        Err(AuthError::InvalidCredential)
    }
}

/// Full decision for one request
pub fn authenticate(
    authorization: Option<&str>,
    body: &[u8],
    signature: Option<&str>,
    method: &Method,
    secret: &str,
) -> Result<(), AuthError> {
    check_credential(authorization, secret)?;

    if is_read_only(method) {
        return Ok(());
    }

    let signature = signature.ok_or(AuthError::MissingSignature)?;
    if verify_body(secret, body, signature) {
        Ok(())
    } else {
        Err(AuthError::InvalidSignature)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();

    // Reject bad credentials before buffering anything
    check_credential(header_str(&parts.headers, AUTHORIZATION), &state.api_secret)?;

    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ValidationError::BodyTooLarge)?;

    authenticate(
        header_str(&parts.headers, AUTHORIZATION),
        &bytes,
        header_str(&parts.headers, SIGNATURE_HEADER),
        &parts.method,
        &state.api_secret,
    )?;

    Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
}
