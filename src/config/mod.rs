use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use serde::{de::IgnoredAny, Deserialize, Deserializer};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,

    /// Secret behind every room id MAC. Without it the server cannot mint or
    /// validate room handles, so startup refuses to proceed.
    #[serde(default)]
    pub room_id_secret: Option<String>,
    /// Deployment name mixed into the MAC context so room ids cannot be
    /// replayed across environments.
    #[serde(default = "default_room_id_env")]
    pub room_id_env: String,

    #[serde(default)]
    pub turn_host: Option<String>,
    #[serde(default)]
    pub turn_secret: Option<String>,
    #[serde(default = "default_turn_ttl")]
    pub turn_ttl: u64,

    #[serde(default, deserialize_with = "comma_separated")]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_log")]
    pub log: String,

    #[serde(flatten)]
    pub catchall: BTreeMap<String, IgnoredAny>,
}

#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub host: String,
    pub secret: String,
    pub ttl: u64,
}

impl TurnConfig {
    pub fn uris(&self) -> Vec<String> {
        vec![
            format!("turn:{}?transport=udp", self.host),
            format!("turn:{}?transport=tcp", self.host),
        ]
    }
}

impl Config {
    /// TURN relay support needs both the host and the shared secret; anything
    /// less and credential minting stays disabled.
    pub fn turn(&self) -> Option<TurnConfig> {
        match (&self.turn_host, &self.turn_secret) {
            (Some(host), Some(secret)) if !host.is_empty() && !secret.is_empty() => {
                Some(TurnConfig {
                    host: host.clone(),
                    secret: secret.clone(),
                    ttl: self.turn_ttl,
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Prepare a list of config values to show
        let lines = [
            ("Address", self.address.to_string()),
            ("Port", self.port.to_string()),
            (
                "Room id secret",
                match self.room_id_secret {
                    Some(_) => "set".to_owned(),
                    None => "not set".to_owned(),
                },
            ),
            ("Room id environment", self.room_id_env.clone()),
            (
                "TURN relay",
                match self.turn() {
                    Some(turn) => turn.host,
                    None => "disabled".to_owned(),
                },
            ),
            ("TURN credential TTL", self.turn_ttl.to_string()),
            ("Allowed origins", self.allowed_origins.join(", ")),
        ];

        let mut msg: String = "Active config values:\n\n".to_owned();

        for line in lines.into_iter().enumerate() {
            msg += &format!("{}: {}\n", line.1 .0, line.1 .1);
        }

        write!(f, "{msg}")
    }
}

/// `ALLOWED_ORIGINS` arrives as one comma-separated environment variable, but
/// a config file may use a proper list; both are accepted.
fn comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        List(Vec<String>),
        Csv(String),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::List(list) => list,
        OneOrMany::Csv(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_owned)
            .collect(),
    })
}

fn default_address() -> IpAddr {
    Ipv4Addr::LOCALHOST.into()
}

fn default_port() -> u16 {
    8080
}

fn default_room_id_env() -> String {
    "prod".to_owned()
}

fn default_turn_ttl() -> u64 {
    60 * 60 * 24
}

fn default_log() -> String {
    "warn,parley=info".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_accept_both_shapes() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "comma_separated")]
            origins: Vec<String>,
        }

        let from_csv: Probe = serde_json::from_value(serde_json::json!({
            "origins": "https://call.example.org, https://example.org ,"
        }))
        .unwrap();
        assert_eq!(
            from_csv.origins,
            vec!["https://call.example.org", "https://example.org"]
        );

        let from_list: Probe = serde_json::from_value(serde_json::json!({
            "origins": ["https://call.example.org"]
        }))
        .unwrap();
        assert_eq!(from_list.origins, vec!["https://call.example.org"]);
    }

    #[test]
    fn turn_requires_host_and_secret() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "room_id_secret": "s",
            "turn_host": "turn.example.org:3478"
        }))
        .unwrap();
        assert!(config.turn().is_none());

        let config: Config = serde_json::from_value(serde_json::json!({
            "room_id_secret": "s",
            "turn_host": "turn.example.org:3478",
            "turn_secret": "north remembers"
        }))
        .unwrap();
        let turn = config.turn().unwrap();
        assert_eq!(
            turn.uris(),
            vec![
                "turn:turn.example.org:3478?transport=udp",
                "turn:turn.example.org:3478?transport=tcp"
            ]
        );
    }
}
