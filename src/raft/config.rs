use std::time::Duration;

use crate::config::StorageConfig;

use super::protocol::VoteRule;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub host: String,
    pub port: u16,                 // 0 picks a free port
    pub election_timeout_min: u64, // in milliseconds
    pub election_timeout_max: u64, // in milliseconds
    pub heartbeat_interval: u64,   // in milliseconds
    pub storage: StorageConfig,
    pub vote_rule: VoteRule,
    pub poll_timeout: u64, // in milliseconds, per one-shot peer request
    pub max_frame_size: usize,
}

impl RaftConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            storage: StorageConfig::Sled {
                data_dir: format!("./db/{port}"),
            },
            vote_rule: VoteRule::default(),
            poll_timeout: 1000,
            max_frame_size: 1024 * 1024,
        }
    }

    pub fn with_data_dir(mut self, data_dir: &str) -> Self {
        self.storage = StorageConfig::Sled {
            data_dir: data_dir.to_string(),
        };
        self
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout)
    }
}
