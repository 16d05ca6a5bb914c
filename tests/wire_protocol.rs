use std::time::Duration;

use raftctl::network::JsonDecoder;
use raftctl::raft::{NodeState, Raft, RaftConfig};
use raftctl::storage::TermStore;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

const FAKE_ADDRESS: &str = "tcp://127.0.0.1:4242";

/// A raw socket speaking the JSON wire format.
struct FakePeer {
    stream: TcpStream,
    decoder: JsonDecoder,
    pending: Vec<Value>,
}

impl FakePeer {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: JsonDecoder::new(1024 * 1024),
            pending: Vec::new(),
        }
    }

    async fn connect(address: &str) -> Self {
        let target = address.trim_start_matches("tcp://");
        Self::new(TcpStream::connect(target).await.unwrap())
    }

    async fn send(&mut self, packet: Value) {
        self.stream
            .write_all(&serde_json::to_vec(&packet).unwrap())
            .await
            .unwrap();
    }

    /// Next document, or `None` once the node closes the socket.
    async fn recv(&mut self) -> Option<Value> {
        let mut chunk = vec![0u8; 4096];
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }
            let n = timeout(Duration::from_secs(2), self.stream.read(&mut chunk))
                .await
                .expect("timed out waiting for the node")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.pending.extend(self.decoder.decode(&chunk[..n]).unwrap());
        }
    }

    async fn recv_named(&mut self, name: &str) -> Value {
        loop {
            let packet = self.recv().await.expect("connection closed");
            if packet["name"] == name {
                return packet;
            }
        }
    }

    /// Next reply named `name`, skipping requests such as heartbeats.
    async fn recv_reply(&mut self, name: &str) -> Value {
        loop {
            let packet = self.recv_named(name).await;
            if packet.get("success").is_some() {
                return packet;
            }
        }
    }
}

/// Listens for the node's outbound connection made by `join`.
async fn joined_peer(raft: &Raft) -> FakePeer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("tcp://{}", listener.local_addr().unwrap());
    let (joined, accepted) = tokio::join!(raft.join(&address), listener.accept());
    joined.unwrap();
    FakePeer::new(accepted.unwrap().0)
}

fn config(dir: &TempDir, min: u64, max: u64) -> RaftConfig {
    let mut config =
        RaftConfig::new("127.0.0.1", 0).with_data_dir(dir.path().to_str().unwrap());
    config.election_timeout_min = min;
    config.election_timeout_max = max;
    config
}

async fn wait_until<F>(raft: &Raft, what: &str, check: F)
where
    F: Fn(&raftctl::raft::NodeSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = raft.snapshot().await.unwrap();
        if check(&snapshot) {
            return;
        }
        assert!(Instant::now() < deadline, "never reached: {what} ({snapshot:?})");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn vote_requests_carry_the_incremented_persisted_term() {
    let dir = TempDir::new().unwrap();
    {
        let store = TermStore::open(dir.path()).unwrap();
        store.save_term(5).await.unwrap();
    }

    let raft = Raft::start(config(&dir, 300, 400)).await.unwrap();
    assert_eq!(raft.snapshot().await.unwrap().term, 5);

    let mut first = joined_peer(&raft).await;
    let mut second = joined_peer(&raft).await;

    let request = first.recv_named("vote").await;
    assert_eq!(request["term"], 6);
    assert_eq!(request["candidate"], raft.address());
    assert_eq!(request["address"], raft.address());
    assert!(request.get("success").is_none());
    assert_eq!(second.recv_named("vote").await["term"], 6);

    assert_eq!(raft.snapshot().await.unwrap().state, NodeState::Candidate);

    // Two connections need two votes: our own plus this one.
    first
        .send(json!({"name": "vote", "success": true, "term": 6, "address": FAKE_ADDRESS}))
        .await;
    wait_until(&raft, "leader", |s| s.state == NodeState::Leader).await;

    let heartbeat = second.recv_named("append").await;
    assert_eq!(heartbeat["leader"], raft.address());
    assert_eq!(heartbeat["term"], 6);

    raft.shutdown().await.unwrap();
}

#[tokio::test]
async fn higher_term_forces_follower() {
    let dir = TempDir::new().unwrap();
    let raft = Raft::start(config(&dir, 100, 150)).await.unwrap();
    wait_until(&raft, "leader", |s| s.state == NodeState::Leader).await;
    let term = raft.snapshot().await.unwrap().term;

    let mut peer = FakePeer::connect(raft.address()).await;
    peer.send(json!({
        "name": "append",
        "leader": FAKE_ADDRESS,
        "term": term + 10,
        "address": FAKE_ADDRESS,
    }))
    .await;

    let reply = peer.recv_reply("append").await;
    assert_eq!(reply["success"], true);
    assert_eq!(reply["term"], term + 10);

    let snapshot = raft.snapshot().await.unwrap();
    assert_eq!(snapshot.term, term + 10);
    assert_eq!(snapshot.state, NodeState::Follower);
    assert_eq!(snapshot.leader.as_deref(), Some(FAKE_ADDRESS));

    raft.shutdown().await.unwrap();
}

#[tokio::test]
async fn follower_grants_vote_once_per_term() {
    let dir = TempDir::new().unwrap();
    let raft = Raft::start(config(&dir, 60_000, 60_000)).await.unwrap();
    let mut peer = FakePeer::connect(raft.address()).await;

    peer.send(json!({
        "name": "vote",
        "candidate": FAKE_ADDRESS,
        "term": 1,
        "address": FAKE_ADDRESS,
    }))
    .await;
    let granted = peer.recv_reply("vote").await;
    assert_eq!(granted["success"], true);
    assert_eq!(granted["term"], 1);

    let snapshot = raft.snapshot().await.unwrap();
    assert_eq!(snapshot.voted.candidate.as_deref(), Some(FAKE_ADDRESS));
    assert_eq!(snapshot.state, NodeState::Follower);

    peer.send(json!({
        "name": "vote",
        "candidate": "tcp://127.0.0.1:4343",
        "term": 1,
        "address": "tcp://127.0.0.1:4343",
    }))
    .await;
    assert_eq!(peer.recv_reply("vote").await["success"], false);

    raft.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_json_closes_only_that_connection() {
    let dir = TempDir::new().unwrap();
    let raft = Raft::start(config(&dir, 60_000, 60_000)).await.unwrap();

    let mut bad = FakePeer::connect(raft.address()).await;
    let mut good = FakePeer::connect(raft.address()).await;
    wait_until(&raft, "two connections", |s| s.connections == 2).await;
    let before = raft.snapshot().await.unwrap();

    bad.stream.write_all(b"this is not json").await.unwrap();
    assert!(bad.recv().await.is_none());
    wait_until(&raft, "one connection", |s| s.connections == 1).await;

    let after = raft.snapshot().await.unwrap();
    assert_eq!(after.state, before.state);
    assert_eq!(after.term, before.term);
    assert_eq!(after.leader, before.leader);

    good.send(json!({"name": "get-state"})).await;
    let status = good.recv().await.unwrap();
    assert_eq!(status["address"], raft.address());
    assert_eq!(status["state"], "FOLLOWER");

    raft.shutdown().await.unwrap();
}

#[tokio::test]
async fn split_and_coalesced_writes_are_decoded() {
    let dir = TempDir::new().unwrap();
    let raft = Raft::start(config(&dir, 60_000, 60_000)).await.unwrap();
    let mut peer = FakePeer::connect(raft.address()).await;

    let append = serde_json::to_vec(&json!({
        "name": "append", "leader": FAKE_ADDRESS, "term": 2, "address": FAKE_ADDRESS,
    }))
    .unwrap();
    let (head, tail) = append.split_at(10);
    peer.stream.write_all(head).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    let mut rest = tail.to_vec();
    rest.extend_from_slice(&append);
    peer.stream.write_all(&rest).await.unwrap();

    assert_eq!(peer.recv_reply("append").await["success"], true);
    assert_eq!(peer.recv_reply("append").await["success"], true);
    assert_eq!(raft.snapshot().await.unwrap().term, 2);

    raft.shutdown().await.unwrap();
}

#[tokio::test]
async fn discover_reports_no_leader_then_the_known_one() {
    let dir = TempDir::new().unwrap();
    let raft = Raft::start(config(&dir, 60_000, 60_000)).await.unwrap();

    let mut asker = FakePeer::connect(raft.address()).await;
    asker.send(json!({"name": "discover-leader"})).await;
    let reply = asker.recv().await.unwrap();
    assert_eq!(reply["name"], "leader-is");
    assert!(reply["leader"].is_null());
    assert!(asker.recv().await.is_none(), "discovery is one-shot");

    let mut leader = joined_peer(&raft).await;
    leader
        .send(json!({"name": "append", "leader": FAKE_ADDRESS, "term": 1, "address": FAKE_ADDRESS}))
        .await;
    assert_eq!(leader.recv_reply("append").await["success"], true);

    let mut asker = FakePeer::connect(raft.address()).await;
    asker.send(json!({"name": "discover-leader"})).await;
    let reply = asker.recv().await.unwrap();
    assert_eq!(reply["leader"], FAKE_ADDRESS);

    raft.shutdown().await.unwrap();
}

#[tokio::test]
async fn unnamed_packets_only_move_the_term() {
    let dir = TempDir::new().unwrap();
    let raft = Raft::start(config(&dir, 60_000, 60_000)).await.unwrap();
    let mut peer = FakePeer::connect(raft.address()).await;

    peer.send(json!({"success": true, "term": 3})).await;
    wait_until(&raft, "term 3", |s| s.term == 3).await;

    let snapshot = raft.snapshot().await.unwrap();
    assert_eq!(snapshot.state, NodeState::Follower);
    assert_eq!(snapshot.connections, 1);

    raft.shutdown().await.unwrap();
}
