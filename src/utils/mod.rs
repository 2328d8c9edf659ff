pub mod error;

use std::{
    net::{IpAddr, SocketAddr},
    time::{SystemTime, UNIX_EPOCH},
};

use http::HeaderMap;
use rand::prelude::*;

pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

pub fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_secs()
}

pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The client address used for rate limiting and token binding: the first
/// `X-Forwarded-For` hop when the reverse proxy sets one, the peer address
/// otherwise.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded) = forwarded.to_str() {
            if let Some(first_hop) = forwarded.split(',').next() {
                if let Ok(ip) = first_hop.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }

    peer.ip()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encoding() {
        assert_eq!(hex_encode(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
        assert_eq!(hex_encode(&[]), "");
    }

    #[test]
    fn random_strings_are_distinct() {
        let a = random_string(32);
        let b = random_string(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let peer: SocketAddr = "10.0.0.1:443".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.2".parse().unwrap());
        assert_eq!(
            client_ip(&headers, peer),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );

        let empty = HeaderMap::new();
        assert_eq!(client_ip(&empty, peer), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn client_ip_ignores_malformed_forwarded_header() {
        let peer: SocketAddr = "10.0.0.1:443".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not an address".parse().unwrap());
        assert_eq!(client_ip(&headers, peer), "10.0.0.1".parse::<IpAddr>().unwrap());
    }
}
