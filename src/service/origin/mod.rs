use url::Url;

use crate::Config;

/// Cross-origin gate for the socket upgrade and every endpoint that hands out
/// credentials. Cheap string checks only; it runs before any protocol work.
pub struct Service {
    allowed: Vec<String>,
}

impl Service {
    pub fn load(config: &Config) -> Self {
        Self {
            allowed: config.allowed_origins.clone(),
        }
    }

    /// A request passes when its `Origin` is absent or empty, is on the
    /// allow-list, matches the request `Host` under either scheme, or is a
    /// localhost variant.
    pub fn permitted(&self, origin: Option<&str>, host: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        if origin.is_empty() {
            return true;
        }

        if self.allowed.iter().any(|allowed| allowed == origin) {
            return true;
        }

        if let Some(host) = host {
            if origin == format!("https://{host}") || origin == format!("http://{host}") {
                return true;
            }
        }

        is_localhost(origin)
    }
}

fn is_localhost(origin: &str) -> bool {
    let Ok(url) = Url::parse(origin) else {
        return false;
    };

    matches!(
        url.host_str(),
        Some("localhost" | "127.0.0.1" | "::1" | "[::1]")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn service(allowed: &[&str]) -> Service {
        Service::load(&Config {
            address: "127.0.0.1".parse().unwrap(),
            port: 0,
            room_id_secret: Some("secret".to_owned()),
            room_id_env: "test".to_owned(),
            turn_host: None,
            turn_secret: None,
            turn_ttl: 86400,
            allowed_origins: allowed.iter().map(|s| (*s).to_owned()).collect(),
            log: "warn".to_owned(),
            catchall: BTreeMap::new(),
        })
    }

    #[test]
    fn origin_matrix() {
        let gate = service(&["https://call.example.org"]);

        // Absent or empty origins pass (non-browser clients).
        assert!(gate.permitted(None, Some("example.org")));
        assert!(gate.permitted(Some(""), Some("example.org")));

        // Allow-list.
        assert!(gate.permitted(Some("https://call.example.org"), None));
        assert!(!gate.permitted(Some("https://evil.example.org"), None));

        // Host match, either scheme.
        assert!(gate.permitted(Some("https://example.org"), Some("example.org")));
        assert!(gate.permitted(Some("http://example.org"), Some("example.org")));
        assert!(!gate.permitted(Some("https://example.org"), Some("other.org")));

        // Localhost variants for development.
        assert!(gate.permitted(Some("http://localhost:3000"), None));
        assert!(gate.permitted(Some("http://127.0.0.1:3000"), None));
        assert!(gate.permitted(Some("http://[::1]:3000"), None));

        // Garbage is not localhost.
        assert!(!gate.permitted(Some("not a url"), None));
    }
}
