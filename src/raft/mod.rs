mod cluster;
mod config;
mod error;
mod events;
mod message;
mod node;
mod protocol;
mod state;
mod timer;

pub use self::cluster::{ClusterPlan, SINGLE_NODE_NOTICE};
pub use self::config::RaftConfig;
pub use self::error::RaftError;
pub use self::events::{NodeFailure, Subscribers, Transition};
pub use self::message::Packet;
pub use self::protocol::{handle, Effect, Outcome, Reply, ReplyBody, View, VoteRule};
pub use self::state::{majority, NodeSnapshot, NodeState, NodeStatus, Vote};
pub use self::timer::{random_election_timeout, TimerName, TimerTick, Timers};

use std::sync::Arc;

use ::log::{info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::config::StorageConfig;
use crate::network::{accept_loop, format_address, ConnectionId, PeerClient};
use crate::storage::TermStore;

use self::node::{NodeEvent, RaftNode};

/// Handle to a running node. Cheap to clone; every call is a message to the
/// node task, so the handle never touches consensus state directly.
///
/// Dropping the last clone stops the node as `shutdown` would, without
/// waiting for it.
#[derive(Clone)]
pub struct Raft {
    address: String,
    events: UnboundedSender<NodeEvent>,
    client: Arc<PeerClient>,
    _owner: Arc<Owner>,
}

/// Shared by every clone of a handle. The node task holds its own sender
/// for timers and sockets, so the channel alone never signals that the
/// handles are gone.
struct Owner {
    events: UnboundedSender<NodeEvent>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        let (ack, _) = oneshot::channel();
        let _ = self.events.send(NodeEvent::Shutdown(ack));
    }
}

impl Raft {
    pub async fn start(config: RaftConfig) -> Result<Self, RaftError> {
        Self::start_with(config, Subscribers::new()).await
    }

    /// Starts a node with subscribers registered before the first transition,
    /// so `UNINITIALIZED -> FOLLOWER` is observable.
    pub async fn start_with(
        config: RaftConfig,
        subscribers: Subscribers,
    ) -> Result<Self, RaftError> {
        let StorageConfig::Sled { data_dir } = &config.storage;
        let store = TermStore::open(data_dir)?;
        let term = store.load_term()?;

        let bind = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|source| RaftError::Bind {
                address: bind.clone(),
                source,
            })?;
        let address = format_address(listener.local_addr()?);
        info!("Node listening at {address} (term {term})");

        let (events, rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(accept_loop(listener, events.clone()));
        let client = Arc::new(PeerClient::new(config.poll_timeout(), config.max_frame_size));

        let node = RaftNode::new(
            config,
            address.clone(),
            term,
            Arc::new(store),
            subscribers,
            events.clone(),
        );
        tokio::spawn(node.run(rx, acceptor));

        Ok(Self {
            address,
            _owner: Arc::new(Owner {
                events: events.clone(),
            }),
            events,
            client,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn snapshot(&self) -> Result<NodeSnapshot, RaftError> {
        self.request(NodeEvent::Snapshot).await
    }

    /// This node's self-reported record, as a peer would see it on `get-state`.
    pub async fn status(&self) -> Result<NodeStatus, RaftError> {
        let snapshot = self.snapshot().await?;
        Ok(NodeStatus {
            address: snapshot.address,
            state: snapshot.state,
            leader: snapshot.leader,
            notice: None,
        })
    }

    /// Forces FOLLOWER and opens a persistent connection to `address`.
    pub async fn join(&self, address: &str) -> Result<ConnectionId, RaftError> {
        let (ack, rx) = oneshot::channel();
        self.send(NodeEvent::Join {
            address: address.to_string(),
            ack,
        })?;
        rx.await.map_err(|_| RaftError::NotRunning)?
    }

    /// Asks `address` for the current leader and joins it. Returns the leader
    /// that was joined, or `None` when the peer knew of no leader or pointed
    /// back at this node.
    pub async fn discover_and_join(&self, address: &str) -> Result<Option<String>, RaftError> {
        info!("Discovering leader by contacting {address}");
        let term = self.snapshot().await?.term;
        let leader = self
            .client
            .discover_leader(address, term, &self.address)
            .await
            .inspect_err(|e| warn!("Discovery via {address} failed: {e}"))?;

        match leader {
            Some(leader) if leader != self.address => {
                info!("Discovered leader is {leader}");
                self.join(&leader).await?;
                Ok(Some(leader))
            }
            Some(_) => Ok(None),
            None => {
                info!("{address} does not know of a leader");
                Ok(None)
            }
        }
    }

    /// On the leader, its own record followed by every connected peer's;
    /// elsewhere, this node's record with a notice.
    pub async fn cluster_state(&self) -> Result<Vec<NodeStatus>, RaftError> {
        let plan = self.request(NodeEvent::ClusterPlan).await?;
        Ok(cluster::resolve(plan, Arc::clone(&self.client)).await)
    }

    /// Transitions into `target`, or all transitions when `None`.
    pub async fn subscribe(
        &self,
        target: Option<NodeState>,
    ) -> Result<UnboundedReceiver<Transition>, RaftError> {
        self.request(|reply| NodeEvent::Subscribe { target, reply })
            .await
    }

    pub async fn failures(&self) -> Result<UnboundedReceiver<NodeFailure>, RaftError> {
        self.request(NodeEvent::SubscribeFailures).await
    }

    /// Stops the node: listener, connections and timers are torn down and the
    /// outstanding term write is flushed before this returns.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        self.request(NodeEvent::Shutdown).await
    }

    fn send(&self, event: NodeEvent) -> Result<(), RaftError> {
        self.events.send(event).map_err(|_| RaftError::NotRunning)
    }

    async fn request<T>(
        &self,
        event: impl FnOnce(oneshot::Sender<T>) -> NodeEvent,
    ) -> Result<T, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(event(tx))?;
        rx.await.map_err(|_| RaftError::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout, Instant};

    use crate::storage::StorageError;

    fn quiet_config(dir: &TempDir) -> RaftConfig {
        let mut config =
            RaftConfig::new("127.0.0.1", 0).with_data_dir(dir.path().to_str().unwrap());
        config.election_timeout_min = 60_000;
        config.election_timeout_max = 60_000;
        config
    }

    #[tokio::test]
    async fn persist_failure_is_published_and_term_is_kept() {
        let dir = TempDir::new().unwrap();
        TermStore::open(dir.path()).unwrap().save_term(5).await.unwrap();

        let raft = Raft::start(quiet_config(&dir)).await.unwrap();
        let mut failures = raft.failures().await.unwrap();

        let sink = node::persist_failure_sink(raft.events.clone());
        sink(5, StorageError::SledError("disk full".to_string()));

        let failure = timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            failure,
            NodeFailure::Persist {
                term: 5,
                reason: "Sled error: disk full".to_string(),
            }
        );

        let snapshot = raft.snapshot().await.unwrap();
        assert_eq!(snapshot.term, 5);
        assert_eq!(snapshot.state, NodeState::Follower);

        raft.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_node() {
        let dir = TempDir::new().unwrap();
        let raft = Raft::start(quiet_config(&dir)).await.unwrap();
        let target = raft.address().trim_start_matches("tcp://").to_string();

        let clone = raft.clone();
        drop(raft);
        assert_eq!(clone.snapshot().await.unwrap().state, NodeState::Follower);
        drop(clone);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let listening = TcpStream::connect(&target).await.is_ok();
            if !listening {
                if let Ok(store) = TermStore::open(dir.path()) {
                    assert_eq!(store.load_term().unwrap(), 0);
                    break;
                }
            }
            assert!(
                Instant::now() < deadline,
                "node kept running after its handles were dropped"
            );
            sleep(Duration::from_millis(20)).await;
        }
    }
}
