use std::{
    collections::HashMap,
    net::IpAddr,
    sync::Mutex,
    time::Duration,
};

use tracing::debug;

use crate::utils;

/// Expired entries are removed on this cadence; expiry itself is checked on
/// every consume, so the sweeper only bounds memory.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const TOKEN_LENGTH: usize = 32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenKind {
    /// Minted on a successful join; unlocks TURN credentials for the call.
    Call,
    /// Minted for the device-check page; barely lives long enough to be used.
    Diagnostic,
}

impl TokenKind {
    pub fn ttl(self) -> Duration {
        match self {
            TokenKind::Call => Duration::from_secs(5 * 60),
            TokenKind::Diagnostic => Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TokenRecord {
    pub ip: IpAddr,
    pub issued_at: u64,
    pub expires_at: u64,
    pub kind: TokenKind,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenError {
    Unknown,
    Expired,
}

/// Time-bounded map from opaque token to its issuance facts. Tokens may be
/// consumed repeatedly while they live; expiry is authoritative.
pub struct Service {
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl Service {
    pub fn build() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self, ip: IpAddr, kind: TokenKind) -> (String, u64) {
        let token = utils::random_string(TOKEN_LENGTH);
        let issued_at = utils::millis_since_unix_epoch();
        let expires_at = issued_at + kind.ttl().as_millis() as u64;

        self.tokens.lock().unwrap().insert(
            token.clone(),
            TokenRecord {
                ip,
                issued_at,
                expires_at,
                kind,
            },
        );

        (token, expires_at)
    }

    pub fn consume(&self, token: &str) -> Result<TokenRecord, TokenError> {
        let tokens = self.tokens.lock().unwrap();
        let record = tokens.get(token).ok_or(TokenError::Unknown)?;

        if utils::millis_since_unix_epoch() >= record.expires_at {
            return Err(TokenError::Expired);
        }

        Ok(record.clone())
    }

    pub fn sweep(&self) {
        let now = utils::millis_since_unix_epoch();
        let mut tokens = self.tokens.lock().unwrap();
        let before = tokens.len();
        tokens.retain(|_, record| record.expires_at > now);
        let removed = before - tokens.len();
        if removed > 0 {
            debug!(removed, remaining = tokens.len(), "swept expired relay tokens");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: &str = "203.0.113.7";

    #[test]
    fn issued_tokens_consume_repeatedly_within_ttl() {
        let store = Service::build();
        let ip: IpAddr = IP.parse().unwrap();

        let (token, expires_at) = store.issue(ip, TokenKind::Call);
        assert!(expires_at > utils::millis_since_unix_epoch());

        let record = store.consume(&token).unwrap();
        assert_eq!(record.ip, ip);
        assert_eq!(record.kind, TokenKind::Call);

        // Re-use within the TTL is allowed.
        assert!(store.consume(&token).is_ok());
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        let store = Service::build();
        assert_eq!(store.consume("nope"), Err(TokenError::Unknown));
    }

    #[test]
    fn expired_tokens_are_rejected_and_swept() {
        let store = Service::build();
        let ip: IpAddr = IP.parse().unwrap();

        let (token, _) = store.issue(ip, TokenKind::Diagnostic);
        store
            .tokens
            .lock()
            .unwrap()
            .get_mut(&token)
            .unwrap()
            .expires_at = utils::millis_since_unix_epoch() - 1;

        assert_eq!(store.consume(&token), Err(TokenError::Expired));

        store.sweep();
        assert_eq!(store.consume(&token), Err(TokenError::Unknown));
    }

    #[test]
    fn diagnostic_tokens_are_short_lived() {
        assert!(TokenKind::Diagnostic.ttl() < TokenKind::Call.ttl());
        assert_eq!(TokenKind::Diagnostic.ttl(), Duration::from_secs(5));
    }
}
