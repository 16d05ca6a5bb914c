use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::network::{socket_address, NetworkError};
use crate::raft::{NodeState, RaftConfig, VoteRule};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "sled")]
    Sled { data_dir: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid node address: {0}")]
    Address(#[from] NetworkError),
}

/// A daemon's JSON configuration file, as read by `raftctl start`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DaemonConfig {
    /// `tcp://host:port` or `host:port`.
    pub address: String,
    pub command_port: u16,
    #[serde(rename = "election min", default, deserialize_with = "millis")]
    pub election_min: Option<u64>,
    #[serde(rename = "election max", default, deserialize_with = "millis")]
    pub election_max: Option<u64>,
    #[serde(default, deserialize_with = "millis")]
    pub heartbeat: Option<u64>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(rename = "clusterNodes", default)]
    pub cluster_nodes: Vec<String>,
    #[serde(rename = "logFile", default)]
    pub log_file: Option<String>,
    /// Event name (`leader`, `candidate`, `follower` or `state`) to a script.
    #[serde(default)]
    pub events: BTreeMap<String, String>,
    #[serde(rename = "voteRule", default)]
    pub vote_rule: VoteRule,
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Normalises `address` into the core configuration. The node always
    /// listens on loopback; only the port is taken from the address.
    pub fn to_raft_config(&self) -> Result<RaftConfig, ConfigError> {
        let (_, port) = split_address(&self.address)?;
        let mut config = RaftConfig::new("127.0.0.1", port);
        if let Some(min) = self.election_min {
            config.election_timeout_min = min;
        }
        if let Some(max) = self.election_max {
            config.election_timeout_max = max;
        }
        if let Some(heartbeat) = self.heartbeat {
            config.heartbeat_interval = heartbeat;
        }
        if let Some(path) = &self.path {
            config = config.with_data_dir(path);
        }
        config.vote_rule = self.vote_rule;
        Ok(config)
    }

    /// Event scripts to run when the node enters `state`.
    pub fn scripts_for(&self, state: NodeState) -> impl Iterator<Item = (&str, &str)> {
        let specific = match state {
            NodeState::Leader => Some("leader"),
            NodeState::Candidate => Some("candidate"),
            NodeState::Follower => Some("follower"),
            NodeState::Uninitialized => None,
        };
        self.events
            .iter()
            .filter(move |(event, _)| event.as_str() == "state" || Some(event.as_str()) == specific)
            .map(|(event, script)| (event.as_str(), script.as_str()))
    }
}

/// Splits `tcp://host:port` or `host:port` into its parts.
pub fn split_address(address: &str) -> Result<(String, u16), NetworkError> {
    let target = socket_address(address)?;
    match target.rsplit_once(':') {
        Some((host, port)) => port
            .parse::<u16>()
            .map(|port| (host.to_string(), port))
            .map_err(|_| NetworkError::InvalidAddress(address.to_string())),
        None => Err(NetworkError::InvalidAddress(address.to_string())),
    }
}

/// Accepts a millisecond count or a duration string such as `"150 ms"` or
/// `"2s"`.
fn millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct MillisVisitor;

    impl<'de> Visitor<'de> for MillisVisitor {
        type Value = Option<u64>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("milliseconds as an integer or a string like \"150 ms\"")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
            d.deserialize_any(self)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v)
                .map(Some)
                .map_err(|_| E::custom(format!("negative duration {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_duration(v)
                .map(Some)
                .ok_or_else(|| E::custom(format!("invalid duration {v:?}")))
        }
    }

    deserializer.deserialize_option(MillisVisitor)
}

fn parse_duration(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: u64 = value.parse().ok()?;
    let factor = match unit.trim() {
        "" | "ms" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" => 1000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        _ => return None,
    };
    value.checked_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_config_reads_renamed_fields() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{
                "address": "tcp://127.0.0.1:8089",
                "command_port": 9089,
                "election min": "200 ms",
                "election max": 400,
                "clusterNodes": ["tcp://127.0.0.1:8089", "tcp://127.0.0.1:8090"],
                "logFile": "/tmp/node.log",
                "events": { "leader": "./on-leader.js" }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.command_port, 9089);
        assert_eq!(cfg.election_min, Some(200));
        assert_eq!(cfg.election_max, Some(400));
        assert_eq!(cfg.heartbeat, None);
        assert_eq!(cfg.cluster_nodes.len(), 2);
        assert_eq!(cfg.log_file.as_deref(), Some("/tmp/node.log"));
        assert_eq!(cfg.vote_rule, VoteRule::Literal);
    }

    #[test]
    fn raft_config_takes_port_from_address() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{ "address": "tcp://10.0.0.5:8090", "command_port": 9090, "heartbeat": "1s", "path": "/var/lib/raft" }"#,
        )
        .unwrap();

        let raft = cfg.to_raft_config().unwrap();
        assert_eq!(raft.host, "127.0.0.1");
        assert_eq!(raft.port, 8090);
        assert_eq!(raft.heartbeat_interval, 1000);
        assert_eq!(raft.election_timeout_min, 150);
        assert_eq!(
            raft.storage,
            StorageConfig::Sled {
                data_dir: "/var/lib/raft".to_string()
            }
        );
    }

    #[test]
    fn bad_address_is_rejected() {
        let cfg: DaemonConfig =
            serde_json::from_str(r#"{ "address": "nowhere", "command_port": 1 }"#).unwrap();
        assert!(matches!(cfg.to_raft_config(), Err(ConfigError::Address(_))));
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let err = serde_json::from_str::<DaemonConfig>(
            r#"{ "address": "127.0.0.1:1", "command_port": 1, "heartbeat": "soon" }"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn scripts_match_state_and_catch_all() {
        let cfg: DaemonConfig = serde_json::from_str(
            r#"{
                "address": "127.0.0.1:1",
                "command_port": 1,
                "events": { "leader": "a.sh", "state": "b.sh", "follower": "c.sh" }
            }"#,
        )
        .unwrap();

        let leader: Vec<_> = cfg.scripts_for(NodeState::Leader).map(|(_, s)| s).collect();
        assert_eq!(leader, vec!["a.sh", "b.sh"]);
        let candidate: Vec<_> = cfg.scripts_for(NodeState::Candidate).collect();
        assert_eq!(candidate, vec![("state", "b.sh")]);
    }

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_duration("150 ms"), Some(150));
        assert_eq!(parse_duration("2s"), Some(2000));
        assert_eq!(parse_duration("75"), Some(75));
        assert_eq!(parse_duration("ms"), None);
    }
}
