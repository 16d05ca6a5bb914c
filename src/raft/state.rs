use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Uninitialized,
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Uninitialized => "UNINITIALIZED",
            NodeState::Follower => "FOLLOWER",
            NodeState::Candidate => "CANDIDATE",
            NodeState::Leader => "LEADER",
        };
        f.write_str(name)
    }
}

/// The vote this node last cast. `term` never exceeds the node's term.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub term: u64,
    pub candidate: Option<String>,
}

/// Self-reported status, as answered to `get-state` and used by cluster
/// state aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub address: String,
    pub state: NodeState,
    pub leader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

/// Point-in-time copy of the consensus state owned by the node task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub address: String,
    pub state: NodeState,
    pub term: u64,
    pub voted: Vote,
    pub leader: Option<String>,
    pub votes: u32,
    pub connections: usize,
}

/// Votes needed to win with `connections` live peers, counting self.
pub fn majority(connections: usize) -> usize {
    connections / 2 + 1
}
