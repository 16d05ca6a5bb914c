use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::network::codec::encode;
use crate::network::{
    connect, spawn_io, Accepted, ConnectionId, ConnectionRegistry, Direction, Inbound, PeerEvent,
    PeerEventKind,
};
use crate::storage::{ErrorSink, TermPersister, TermStore};

use super::cluster::{ClusterPlan, SINGLE_NODE_NOTICE};
use super::events::{NodeFailure, Subscribers, Transition};
use super::message::Packet;
use super::protocol::{self, Effect, ReplyBody, View};
use super::state::{majority, NodeSnapshot, NodeState, NodeStatus, Vote};
use super::timer::{random_election_timeout, TimerName, TimerTick, Timers};
use super::{RaftConfig, RaftError};

/// Routes persist failures back into the node task, which publishes them on
/// the failure channel. The in-memory term is left as it is.
pub(crate) fn persist_failure_sink(events: UnboundedSender<NodeEvent>) -> ErrorSink {
    Box::new(move |term, e| {
        let _ = events.send(NodeEvent::PersistFailed {
            term,
            reason: e.to_string(),
        });
    })
}

/// Everything the node task reacts to. Events are processed one at a time,
/// so all consensus state has a single writer.
pub(crate) enum NodeEvent {
    Accepted(Accepted),
    Peer(PeerEvent),
    Timer(TimerTick),
    Join {
        address: String,
        ack: oneshot::Sender<Result<ConnectionId, RaftError>>,
    },
    Connected {
        stream: TcpStream,
        remote: SocketAddr,
        ack: oneshot::Sender<Result<ConnectionId, RaftError>>,
    },
    PersistFailed {
        term: u64,
        reason: String,
    },
    Snapshot(oneshot::Sender<NodeSnapshot>),
    ClusterPlan(oneshot::Sender<ClusterPlan>),
    Subscribe {
        target: Option<NodeState>,
        reply: oneshot::Sender<UnboundedReceiver<Transition>>,
    },
    SubscribeFailures(oneshot::Sender<UnboundedReceiver<NodeFailure>>),
    Shutdown(oneshot::Sender<()>),
}

impl From<Accepted> for NodeEvent {
    fn from(accepted: Accepted) -> Self {
        NodeEvent::Accepted(accepted)
    }
}

impl From<PeerEvent> for NodeEvent {
    fn from(event: PeerEvent) -> Self {
        NodeEvent::Peer(event)
    }
}

pub(crate) struct RaftNode {
    // Node identity
    address: String,
    config: RaftConfig,

    // Consensus state
    state: NodeState,
    term: u64,
    voted: Vote,
    leader: Option<String>,
    votes: u32,

    // Membership is whatever is connected right now
    connections: ConnectionRegistry,

    timers: Timers<NodeEvent>,
    persister: TermPersister,
    subscribers: Subscribers,
    events: UnboundedSender<NodeEvent>,
}

impl RaftNode {
    pub(crate) fn new(
        config: RaftConfig,
        address: String,
        term: u64,
        store: Arc<TermStore>,
        subscribers: Subscribers,
        events: UnboundedSender<NodeEvent>,
    ) -> Self {
        let persister = TermPersister::spawn(store, term, persist_failure_sink(events.clone()));

        Self {
            address,
            config,
            state: NodeState::Uninitialized,
            term,
            voted: Vote::default(),
            leader: None,
            votes: 0,
            connections: ConnectionRegistry::new(),
            timers: Timers::new(events.clone(), NodeEvent::Timer),
            persister,
            subscribers,
            events,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events: UnboundedReceiver<NodeEvent>,
        acceptor: JoinHandle<()>,
    ) {
        info!("Node {} starting at term {}", self.address, self.term);
        self.transition(NodeState::Follower);

        let mut ack = None;
        while let Some(event) = events.recv().await {
            if let NodeEvent::Shutdown(reply) = event {
                ack = Some(reply);
                break;
            }
            self.handle_event(event);
        }

        info!("Node {} shutting down", self.address);
        acceptor.abort();
        self.timers.clear();
        self.connections.clear();
        self.persister.close().await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Accepted(Accepted { stream, remote }) => {
                self.register(stream, remote, Direction::Inbound);
            }
            NodeEvent::Peer(PeerEvent { id, kind }) => self.handle_peer_event(id, kind),
            NodeEvent::Timer(tick) => self.handle_timer(tick),
            NodeEvent::Join { address, ack } => self.join(address, ack),
            NodeEvent::Connected { stream, remote, ack } => {
                self.transition(NodeState::Follower);
                let id = self.register(stream, remote, Direction::Outbound);
                let _ = ack.send(Ok(id));
            }
            NodeEvent::PersistFailed { term, reason } => {
                error!("Term {term} was not persisted: {reason}");
                self.subscribers.fail(NodeFailure::Persist { term, reason });
            }
            NodeEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            NodeEvent::ClusterPlan(reply) => {
                let _ = reply.send(self.cluster_plan());
            }
            NodeEvent::Subscribe { target, reply } => {
                let _ = reply.send(self.subscribers.on_transition(target));
            }
            NodeEvent::SubscribeFailures(reply) => {
                let _ = reply.send(self.subscribers.on_failure());
            }
            // consumed by the run loop
            NodeEvent::Shutdown(_) => {}
        }
    }

    fn register(
        &mut self,
        stream: TcpStream,
        remote: SocketAddr,
        direction: Direction,
    ) -> ConnectionId {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let id = self.connections.register(remote, direction, writer_tx);
        let reader = spawn_io(
            stream,
            id,
            self.config.max_frame_size,
            writer_rx,
            self.events.clone(),
        );
        self.connections.attach_reader(id, reader);
        id
    }

    fn handle_peer_event(&mut self, id: ConnectionId, kind: PeerEventKind) {
        match kind {
            PeerEventKind::Received(inbound) => self.receive(id, inbound),
            PeerEventKind::Malformed(e) => {
                warn!("Destroying connection {id}: {e}");
                self.connections.remove(id);
            }
            PeerEventKind::Closed => {
                self.connections.remove(id);
            }
        }
    }

    fn receive(&mut self, id: ConnectionId, inbound: Inbound) {
        if self.connections.get(id).is_none() {
            return;
        }
        debug!("Received {inbound:?} on connection {id}");

        if let Inbound::Packet(packet) = &inbound {
            if let Some(address) = packet.address() {
                self.connections.note_advertised(id, address);
            }
        }

        if let Some(term) = inbound.term() {
            if term > self.term {
                info!("Adopting term {term} (was {})", self.term);
                self.set_term(term);
                self.transition(NodeState::Follower);
            }
        }

        match inbound {
            Inbound::Packet(packet) => self.dispatch(id, &packet),
            Inbound::Unrecognized { .. } => {}
        }
    }

    fn dispatch(&mut self, id: ConnectionId, packet: &Packet) {
        let outcome = {
            let view = View {
                address: &self.address,
                state: self.state,
                term: self.term,
                leader: self.leader.as_deref(),
                voted: &self.voted,
                votes: self.votes,
                connections: self.connections.membership(),
                rule: self.config.vote_rule,
            };
            protocol::handle(&view, packet)
        };

        for effect in outcome.effects {
            match effect {
                Effect::SetLeader(leader) => self.leader = leader,
                Effect::ResetElectionTimer => self.reset_election_timer(),
                Effect::RecordVote(vote) => {
                    debug!("Voting for {:?} in term {}", vote.candidate, vote.term);
                    self.voted = vote;
                }
                Effect::CountVote => {
                    self.votes += 1;
                    debug!("Received vote, {} total", self.votes);
                }
                Effect::Transition(state) => self.transition(state),
            }
        }

        let Some(reply) = outcome.reply else {
            return;
        };
        let bytes = match reply.body {
            ReplyBody::Packet(packet) => encode(&packet.stamped(self.term, &self.address)),
            ReplyBody::Status(status) => encode(&status),
        };
        match (bytes, self.connections.get(id)) {
            (Ok(bytes), Some(conn)) => {
                conn.send(bytes);
                if reply.close {
                    conn.close_after_flush();
                }
            }
            (Err(e), _) => error!("Failed to encode reply: {e}"),
            (Ok(_), None) => {}
        }
    }

    fn handle_timer(&mut self, tick: TimerTick) {
        if !self.timers.accept(tick) {
            debug!("Ignoring stale {:?} tick", tick.name);
            return;
        }
        match (tick.name, self.state) {
            (TimerName::Election, NodeState::Follower | NodeState::Candidate) => self.election(),
            (TimerName::Heartbeat, NodeState::Leader) => self.heartbeat(),
            _ => {}
        }
    }

    fn election(&mut self) {
        self.set_term(self.term + 1);
        info!("Starting a new election for term {}", self.term);

        self.votes = 0;
        let rerun = self.state == NodeState::Candidate;
        self.transition(NodeState::Candidate);
        if rerun {
            self.reset_election_timer();
        }

        self.votes += 1;
        self.voted = Vote {
            term: self.term,
            candidate: Some(self.address.clone()),
        };

        if self.votes as usize >= majority(self.connections.membership()) {
            info!("Election won by own vote for term {}", self.term);
            self.transition(NodeState::Leader);
            return;
        }

        self.broadcast(Packet::vote_request(&self.address));
    }

    fn heartbeat(&mut self) {
        debug!("Sending heartbeats to {} connections", self.connections.membership());
        self.broadcast(Packet::append(&self.address));
    }

    fn broadcast(&self, packet: Packet) {
        let packet = packet.stamped(self.term, &self.address);
        match encode(&packet) {
            Ok(bytes) => {
                self.connections.broadcast(&bytes);
            }
            Err(e) => error!("Failed to encode {}: {e}", packet.name()),
        }
    }

    fn join(&mut self, address: String, ack: oneshot::Sender<Result<ConnectionId, RaftError>>) {
        info!("Establishing persistent connection to {address}");
        self.transition(NodeState::Follower);

        let events = self.events.clone();
        tokio::spawn(async move {
            let connected = async {
                let stream = connect(&address).await?;
                let remote = stream.peer_addr()?;
                Ok::<_, RaftError>((stream, remote))
            };
            match connected.await {
                Ok((stream, remote)) => {
                    let _ = events.send(NodeEvent::Connected { stream, remote, ack });
                }
                Err(e) => {
                    warn!("Failed to join {address}: {e}");
                    let _ = ack.send(Err(e));
                }
            }
        });
    }

    fn transition(&mut self, target: NodeState) {
        if self.state == target {
            return;
        }
        let from = self.state;
        self.state = target;
        info!("Transitioning from {from} to {target} (term {})", self.term);

        self.timers.clear();
        self.subscribers.notify(Transition {
            from,
            to: target,
            term: self.term,
        });

        match target {
            NodeState::Follower | NodeState::Candidate => self.reset_election_timer(),
            NodeState::Leader => self
                .timers
                .schedule_every(TimerName::Heartbeat, self.config.heartbeat()),
            NodeState::Uninitialized => {}
        }
    }

    fn reset_election_timer(&mut self) {
        let delay = random_election_timeout(
            self.config.election_timeout_min,
            self.config.election_timeout_max,
        );
        self.timers.schedule(TimerName::Election, delay);
    }

    fn set_term(&mut self, term: u64) {
        debug_assert!(term >= self.term);
        self.term = term;
        self.persister.save(term);
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            address: self.address.clone(),
            state: self.state,
            term: self.term,
            voted: self.voted.clone(),
            leader: self.leader.clone(),
            votes: self.votes,
            connections: self.connections.membership(),
        }
    }

    fn cluster_plan(&self) -> ClusterPlan {
        if self.state != NodeState::Leader {
            return ClusterPlan::Single(NodeStatus {
                address: self.address.clone(),
                state: self.state,
                leader: self.leader.clone(),
                notice: Some(SINGLE_NODE_NOTICE.to_string()),
            });
        }
        ClusterPlan::Poll {
            own: NodeStatus {
                address: self.address.clone(),
                state: self.state,
                leader: None,
                notice: None,
            },
            targets: self.connections.iter().map(|c| c.poll_target()).collect(),
            term: self.term,
        }
    }
}
