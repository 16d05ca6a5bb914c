use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::raft::{NodeStatus, Packet};

use super::codec::{classify, encode, Inbound, JsonDecoder};
use super::NetworkError;

const ADDRESS_SCHEME: &str = "tcp://";

/// `tcp://host:port` for a bound socket.
pub fn format_address(addr: SocketAddr) -> String {
    format!("{ADDRESS_SCHEME}{addr}")
}

/// Accepts `tcp://host:port` or `host:port` and returns `host:port`.
pub fn socket_address(address: &str) -> Result<String, NetworkError> {
    let rest = address.strip_prefix(ADDRESS_SCHEME).unwrap_or(address);
    let rest = rest.trim_end_matches('/');
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(rest.to_string())
        }
        _ => Err(NetworkError::InvalidAddress(address.to_string())),
    }
}

pub async fn connect(address: &str) -> Result<TcpStream, NetworkError> {
    let target = socket_address(address)?;
    TcpStream::connect(&target)
        .await
        .map_err(|e| NetworkError::ConnectionError(format!("{target}: {e}")))
}

/// One-shot requests to a peer: open a socket, send one packet, read one
/// reply, close.
pub struct PeerClient {
    timeout: Duration,
    max_frame: usize,
}

impl PeerClient {
    pub fn new(timeout: Duration, max_frame: usize) -> Self {
        Self { timeout, max_frame }
    }

    /// Asks `address` who the leader is.
    pub async fn discover_leader(
        &self,
        address: &str,
        term: u64,
        own_address: &str,
    ) -> Result<Option<String>, NetworkError> {
        let request = Packet::discover_leader().stamped(term, own_address);
        let reply = self.request(address, &request, is_leader_is).await?;
        match classify(reply) {
            Inbound::Packet(Packet::LeaderIs { leader, .. }) => Ok(leader),
            other => Err(NetworkError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Fetches the self-reported status of the peer at `address`.
    pub async fn fetch_state(
        &self,
        address: &str,
        term: u64,
        own_address: &str,
    ) -> Result<NodeStatus, NetworkError> {
        let request = Packet::get_state().stamped(term, own_address);
        let reply = self.request(address, &request, is_status).await?;
        decode_reply(reply)
    }

    async fn request(
        &self,
        address: &str,
        packet: &Packet,
        is_reply: fn(&Value) -> bool,
    ) -> Result<Value, NetworkError> {
        timeout(self.timeout, self.exchange(address, packet, is_reply))
            .await
            .map_err(|_| NetworkError::TimeoutError)?
    }

    /// Sends `packet` and returns the first document `is_reply` accepts.
    /// A leader broadcasts heartbeats on every socket it has accepted, so
    /// other packets can arrive ahead of the reply.
    async fn exchange(
        &self,
        address: &str,
        packet: &Packet,
        is_reply: fn(&Value) -> bool,
    ) -> Result<Value, NetworkError> {
        let mut stream = connect(address).await?;
        stream.write_all(&encode(packet)?).await?;
        debug!("Sent {} to {address}", packet.name());

        let mut decoder = JsonDecoder::new(self.max_frame);
        let mut chunk = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(NetworkError::ConnectionClosed);
            }
            for doc in decoder.decode(&chunk[..n])? {
                if is_reply(&doc) {
                    return Ok(doc);
                }
                debug!("Skipping {doc} from {address} while waiting for a reply");
            }
        }
    }
}

fn is_leader_is(doc: &Value) -> bool {
    doc.get("name").and_then(Value::as_str) == Some("leader-is")
}

// Status replies are the only unnamed documents a node writes.
fn is_status(doc: &Value) -> bool {
    doc.get("name").is_none() && doc.get("state").is_some()
}

fn decode_reply<T: DeserializeOwned>(reply: Value) -> Result<T, NetworkError> {
    serde_json::from_value(reply).map_err(|e| NetworkError::UnexpectedReply(e.to_string()))
}
