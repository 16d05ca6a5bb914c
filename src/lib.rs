// Consensus core
pub mod raft;
pub mod storage;
pub mod network;

// Daemon surface
pub mod config;
pub mod control;

pub use raft::{NodeState, Raft, RaftConfig, RaftError};
