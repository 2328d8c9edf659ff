use base64::{engine::general_purpose, Engine as _};
use ring::{constant_time, hmac};

use crate::{utils, Config};

/// Room ids are exactly this many URL-safe base64 characters: a 12-byte
/// random nonce followed by an 8-byte truncated HMAC-SHA-256 tag.
pub const ROOM_ID_LENGTH: usize = 27;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 8;

/// 64 bits of randomness behind every session and client id.
const ID_BYTES: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoomIdError {
    /// No MAC secret is configured, so ids can neither be minted nor checked.
    NotConfigured,
    /// Wrong shape or failed MAC.
    Invalid,
}

pub struct Service {
    mac_key: Option<hmac::Key>,
    context: String,
}

impl Service {
    pub fn load(config: &Config) -> Self {
        let mac_key = config
            .room_id_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .map(|secret| hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()));

        Self {
            mac_key,
            // Binds the MAC to this deployment so ids never verify across
            // environments sharing a secret.
            context: format!("id:v1|{}|room", config.room_id_env),
        }
    }

    pub fn mint_session_id(&self) -> String {
        format!("S-{}", utils::hex_encode(&utils::random_bytes::<ID_BYTES>()))
    }

    pub fn mint_client_id(&self) -> String {
        format!("C-{}", utils::hex_encode(&utils::random_bytes::<ID_BYTES>()))
    }

    /// A fresh self-authenticating room handle. The server keeps no record of
    /// it; possession of a verifying id is the whole capability.
    pub fn mint_room_id(&self) -> Result<String, RoomIdError> {
        let key = self.mac_key.as_ref().ok_or(RoomIdError::NotConfigured)?;

        let nonce = utils::random_bytes::<NONCE_LENGTH>();
        let tag = hmac::sign(key, &self.mac_input(&nonce));

        let mut raw = Vec::with_capacity(NONCE_LENGTH + TAG_LENGTH);
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&tag.as_ref()[..TAG_LENGTH]);

        Ok(general_purpose::URL_SAFE_NO_PAD.encode(raw))
    }

    /// Constant-time MAC check. Anything that is not 27 chars of URL-safe
    /// base64 over 20 bytes with a verifying tag is rejected.
    pub fn validate_room_id(&self, room_id: &str) -> Result<(), RoomIdError> {
        let key = self.mac_key.as_ref().ok_or(RoomIdError::NotConfigured)?;

        if room_id.len() != ROOM_ID_LENGTH {
            return Err(RoomIdError::Invalid);
        }

        let raw = general_purpose::URL_SAFE_NO_PAD
            .decode(room_id)
            .map_err(|_| RoomIdError::Invalid)?;
        if raw.len() != NONCE_LENGTH + TAG_LENGTH {
            return Err(RoomIdError::Invalid);
        }

        let (nonce, tag) = raw.split_at(NONCE_LENGTH);
        let expected = hmac::sign(key, &self.mac_input(nonce));

        constant_time::verify_slices_are_equal(&expected.as_ref()[..TAG_LENGTH], tag)
            .map_err(|_| RoomIdError::Invalid)
    }

    fn mac_input(&self, nonce: &[u8]) -> Vec<u8> {
        let mut input = Vec::with_capacity(self.context.len() + 1 + nonce.len());
        input.extend_from_slice(self.context.as_bytes());
        input.push(0);
        input.extend_from_slice(nonce);
        input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config(secret: Option<&str>, env: &str) -> Config {
        Config {
            address: "127.0.0.1".parse().unwrap(),
            port: 0,
            room_id_secret: secret.map(str::to_owned),
            room_id_env: env.to_owned(),
            turn_host: None,
            turn_secret: None,
            turn_ttl: 86400,
            allowed_origins: Vec::new(),
            log: "warn".to_owned(),
            catchall: BTreeMap::new(),
        }
    }

    #[test]
    fn minted_room_ids_validate() {
        let ids = Service::load(&config(Some("secret"), "test"));
        let room_id = ids.mint_room_id().unwrap();

        assert_eq!(room_id.len(), ROOM_ID_LENGTH);
        assert_eq!(ids.validate_room_id(&room_id), Ok(()));
    }

    #[test]
    fn mutated_room_ids_fail() {
        let ids = Service::load(&config(Some("secret"), "test"));
        let room_id = ids.mint_room_id().unwrap();

        // Flip every position in turn; no single-character change may survive.
        for pos in 0..room_id.len() {
            let mut tampered: Vec<char> = room_id.chars().collect();
            tampered[pos] = if tampered[pos] == 'A' { 'B' } else { 'A' };
            let tampered: String = tampered.into_iter().collect();
            if tampered == room_id {
                continue;
            }
            assert_eq!(
                ids.validate_room_id(&tampered),
                Err(RoomIdError::Invalid),
                "tampering position {pos} was accepted"
            );
        }
    }

    #[test]
    fn malformed_room_ids_fail() {
        let ids = Service::load(&config(Some("secret"), "test"));

        assert_eq!(ids.validate_room_id(""), Err(RoomIdError::Invalid));
        assert_eq!(ids.validate_room_id("too-short"), Err(RoomIdError::Invalid));
        assert_eq!(
            ids.validate_room_id(&"x".repeat(ROOM_ID_LENGTH + 1)),
            Err(RoomIdError::Invalid)
        );
        // Right length, invalid alphabet.
        assert_eq!(
            ids.validate_room_id(&"!".repeat(ROOM_ID_LENGTH)),
            Err(RoomIdError::Invalid)
        );
    }

    #[test]
    fn unconfigured_secret_refuses_everything() {
        let ids = Service::load(&config(None, "test"));
        assert_eq!(ids.mint_room_id(), Err(RoomIdError::NotConfigured));
        assert_eq!(
            ids.validate_room_id(&"A".repeat(ROOM_ID_LENGTH)),
            Err(RoomIdError::NotConfigured)
        );

        // An empty secret counts as unset.
        let ids = Service::load(&config(Some(""), "test"));
        assert_eq!(ids.mint_room_id(), Err(RoomIdError::NotConfigured));
    }

    #[test]
    fn room_ids_are_bound_to_the_environment() {
        let staging = Service::load(&config(Some("secret"), "staging"));
        let prod = Service::load(&config(Some("secret"), "prod"));

        let room_id = staging.mint_room_id().unwrap();
        assert_eq!(staging.validate_room_id(&room_id), Ok(()));
        assert_eq!(prod.validate_room_id(&room_id), Err(RoomIdError::Invalid));
    }

    #[test]
    fn session_and_client_ids_are_prefixed() {
        let ids = Service::load(&config(Some("secret"), "test"));

        let sid = ids.mint_session_id();
        assert!(sid.starts_with("S-"));
        assert_eq!(sid.len(), 2 + ID_BYTES * 2);

        let cid = ids.mint_client_id();
        assert!(cid.starts_with("C-"));
        assert_eq!(cid.len(), 2 + ID_BYTES * 2);

        assert_ne!(ids.mint_session_id(), ids.mint_session_id());
    }

}
