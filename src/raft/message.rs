use serde::{Deserialize, Serialize};

// Peer wire messages. Every variant carries the sender's `term` and
// `address`, filled in by `stamp` right before the packet is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum Packet {
    DiscoverLeader {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        term: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    LeaderIs {
        #[serde(default)]
        leader: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        term: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    GetState {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        term: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    /// Heartbeat when `success` is absent, heartbeat reply otherwise.
    Append {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        leader: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        term: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    /// Vote request when `success` is absent, vote reply otherwise.
    Vote {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        term: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
}

impl Packet {
    pub fn discover_leader() -> Self {
        Packet::DiscoverLeader {
            term: None,
            address: None,
        }
    }

    pub fn leader_is(leader: Option<String>) -> Self {
        Packet::LeaderIs {
            leader,
            term: None,
            address: None,
        }
    }

    pub fn get_state() -> Self {
        Packet::GetState {
            term: None,
            address: None,
        }
    }

    pub fn append(leader: &str) -> Self {
        Packet::Append {
            leader: Some(leader.to_string()),
            success: None,
            term: None,
            address: None,
        }
    }

    pub fn append_reply(success: bool) -> Self {
        Packet::Append {
            leader: None,
            success: Some(success),
            term: None,
            address: None,
        }
    }

    pub fn vote_request(candidate: &str) -> Self {
        Packet::Vote {
            candidate: Some(candidate.to_string()),
            success: None,
            term: None,
            address: None,
        }
    }

    pub fn vote_reply(success: bool) -> Self {
        Packet::Vote {
            candidate: None,
            success: Some(success),
            term: None,
            address: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::DiscoverLeader { .. } => "discover-leader",
            Packet::LeaderIs { .. } => "leader-is",
            Packet::GetState { .. } => "get-state",
            Packet::Append { .. } => "append",
            Packet::Vote { .. } => "vote",
        }
    }

    pub fn term(&self) -> Option<u64> {
        match self {
            Packet::DiscoverLeader { term, .. }
            | Packet::LeaderIs { term, .. }
            | Packet::GetState { term, .. }
            | Packet::Append { term, .. }
            | Packet::Vote { term, .. } => *term,
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            Packet::DiscoverLeader { address, .. }
            | Packet::LeaderIs { address, .. }
            | Packet::GetState { address, .. }
            | Packet::Append { address, .. }
            | Packet::Vote { address, .. } => address.as_deref(),
        }
    }

    /// Sets the sender's term and address.
    pub fn stamp(&mut self, current_term: u64, own_address: &str) {
        match self {
            Packet::DiscoverLeader { term, address }
            | Packet::LeaderIs { term, address, .. }
            | Packet::GetState { term, address }
            | Packet::Append { term, address, .. }
            | Packet::Vote { term, address, .. } => {
                *term = Some(current_term);
                *address = Some(own_address.to_string());
            }
        }
    }

    pub fn stamped(mut self, current_term: u64, own_address: &str) -> Self {
        self.stamp(current_term, own_address);
        self
    }
}
