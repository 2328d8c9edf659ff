use std::net::SocketAddr;

use axum::{extract::ConnectInfo, Json};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use http::HeaderMap;
use serde::Serialize;
use sha1::Sha1;
use tracing::debug;

use crate::{
    api::guard,
    service::{
        rate_limiter::Restriction,
        tokens::{TokenError, TokenKind},
    },
    services, utils, Error, Result,
};

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Serialize)]
pub struct TurnCredentialsResponse {
    pub uris: Vec<String>,
    pub username: String,
    pub password: String,
    pub ttl: u64,
}

/// # `POST /api/turn-credentials`
///
/// Exchanges a relay token (minted on join, or a diagnostic token) for
/// short-lived TURN credentials in the coturn REST style: the expiry is baked
/// into the username, the password is an HMAC-SHA1 over it.
pub async fn turn_credentials_route(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<TurnCredentialsResponse>> {
    let ip = guard(Restriction::CredentialMint, &headers, peer)?;

    let token = headers
        .get("x-turn-token")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Unauthorized("missing X-Turn-Token header"))?;

    let record = services().tokens.consume(token).map_err(|error| match error {
        TokenError::Unknown => Error::Unauthorized("unknown relay token"),
        TokenError::Expired => Error::Unauthorized("expired relay token"),
    })?;
    if record.ip != ip {
        // Tokens are bound to the minting address; a mismatch is worth a log
        // line but mobile clients legitimately change networks mid-call.
        debug!(minted_for = %record.ip, used_from = %ip, "relay token used from a different address");
    }

    let Some(turn) = services().globals.turn() else {
        return Err(Error::bad_config("TURN relay is not configured"));
    };

    let expiry = utils::secs_since_unix_epoch() + turn.ttl;
    let username = format!("{expiry}:parley");

    let mut mac =
        HmacSha1::new_from_slice(turn.secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(username.as_bytes());
    let password = general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(Json(TurnCredentialsResponse {
        uris: turn.uris(),
        username,
        password,
        ttl: turn.ttl,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticTokenResponse {
    pub token: String,
    pub expires_at: u64,
}

/// # `POST /api/diagnostic-token`
///
/// A five-second token for the device-check page, so the relay reachability
/// probe works without joining a room.
pub async fn diagnostic_token_route(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<DiagnosticTokenResponse>> {
    let ip = guard(Restriction::DiagnosticToken, &headers, peer)?;

    let (token, expires_at) = services().tokens.issue(ip, TokenKind::Diagnostic);

    Ok(Json(DiagnosticTokenResponse { token, expires_at }))
}
