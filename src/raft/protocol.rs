//! Interprets inbound packets against the node's current state.
//!
//! `handle` is pure: it reads a [`View`] of the node and returns the effects
//! to apply plus an optional reply. The node task applies them in order.

use serde::{Deserialize, Serialize};

use super::message::Packet;
use super::state::{majority, NodeState, NodeStatus, Vote};

/// Rule a follower uses to decide whether to grant a vote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteRule {
    /// Grant when the recorded vote's term is older than the request's term,
    /// or when no candidate has been recorded at all. The recorded term is
    /// the node's own term, not the request's.
    #[default]
    Literal,
    /// Grant when the request's term is at least the node's term and the node
    /// has not already voted for someone else in its current term. Vote
    /// replies from older terms are not counted.
    Standard,
}

pub struct View<'a> {
    pub address: &'a str,
    pub state: NodeState,
    pub term: u64,
    pub leader: Option<&'a str>,
    pub voted: &'a Vote,
    pub votes: u32,
    pub connections: usize,
    pub rule: VoteRule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    SetLeader(Option<String>),
    ResetElectionTimer,
    RecordVote(Vote),
    CountVote,
    Transition(NodeState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Packet(Packet),
    Status(NodeStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub body: ReplyBody,
    /// Close the connection once the reply is written.
    pub close: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub effects: Vec<Effect>,
    pub reply: Option<Reply>,
}

impl Outcome {
    fn reply(packet: Packet) -> Self {
        Self {
            effects: Vec::new(),
            reply: Some(Reply {
                body: ReplyBody::Packet(packet),
                close: false,
            }),
        }
    }
}

pub fn handle(view: &View<'_>, packet: &Packet) -> Outcome {
    match packet {
        Packet::DiscoverLeader { .. } => {
            let leader = if view.state == NodeState::Leader {
                Some(view.address.to_string())
            } else {
                view.leader.map(str::to_string)
            };
            Outcome {
                effects: Vec::new(),
                reply: Some(Reply {
                    body: ReplyBody::Packet(Packet::leader_is(leader)),
                    close: true,
                }),
            }
        }
        Packet::GetState { .. } => Outcome {
            effects: Vec::new(),
            reply: Some(Reply {
                body: ReplyBody::Status(NodeStatus {
                    address: view.address.to_string(),
                    state: view.state,
                    leader: view.leader.map(str::to_string),
                    notice: None,
                }),
                close: true,
            }),
        },
        _ => match view.state {
            NodeState::Follower => follower(view, packet),
            NodeState::Candidate => candidate(view, packet),
            NodeState::Leader => leader(packet),
            NodeState::Uninitialized => Outcome::default(),
        },
    }
}

fn follower(view: &View<'_>, packet: &Packet) -> Outcome {
    match packet {
        Packet::Append {
            leader,
            success: None,
            ..
        } => Outcome {
            effects: vec![
                Effect::SetLeader(leader.clone()),
                Effect::ResetElectionTimer,
            ],
            ..Outcome::reply(Packet::append_reply(true))
        },
        Packet::Vote {
            candidate,
            success: None,
            term,
            ..
        } => {
            if grants_vote(view, candidate.as_deref(), *term) {
                Outcome {
                    effects: vec![
                        Effect::RecordVote(Vote {
                            term: view.term,
                            candidate: candidate.clone(),
                        }),
                        Effect::ResetElectionTimer,
                    ],
                    ..Outcome::reply(Packet::vote_reply(true))
                }
            } else {
                Outcome::reply(Packet::vote_reply(false))
            }
        }
        _ => Outcome::default(),
    }
}

fn grants_vote(view: &View<'_>, candidate: Option<&str>, request_term: Option<u64>) -> bool {
    match view.rule {
        VoteRule::Literal => {
            // A request without a term never beats a recorded vote term.
            let newer = request_term.is_some_and(|t| view.voted.term < t);
            newer || view.voted.candidate.is_none()
        }
        VoteRule::Standard => {
            let Some(request_term) = request_term else {
                return false;
            };
            if request_term < view.term {
                return false;
            }
            match view.voted.candidate.as_deref() {
                Some(voted_for) if view.voted.term == view.term => {
                    candidate == Some(voted_for)
                }
                _ => true,
            }
        }
    }
}

fn candidate(view: &View<'_>, packet: &Packet) -> Outcome {
    match packet {
        Packet::Vote {
            success: Some(true),
            term,
            ..
        } => {
            if view.rule == VoteRule::Standard && term.is_some_and(|t| t < view.term) {
                return Outcome::default();
            }
            let mut effects = vec![Effect::CountVote];
            if view.votes as usize + 1 >= majority(view.connections) {
                effects.push(Effect::Transition(NodeState::Leader));
            }
            Outcome {
                effects,
                reply: None,
            }
        }
        _ => Outcome::default(),
    }
}

fn leader(packet: &Packet) -> Outcome {
    match packet {
        Packet::Vote { success: None, .. } => Outcome::reply(Packet::vote_reply(false)),
        _ => Outcome::default(),
    }
}
