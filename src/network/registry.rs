use std::net::SocketAddr;

use log::debug;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use super::client::socket_address;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Opened by us through `join`.
    Outbound,
}

#[derive(Debug)]
pub enum Outbound {
    Frame(Vec<u8>),
    /// Flush what is queued, then half-close the socket.
    Close,
}

/// A live link to a peer. Dropping it tears the socket down.
pub struct Connection {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub direction: Direction,
    advertised: Option<String>,
    writer: UnboundedSender<Outbound>,
    reader: Option<AbortHandle>,
}

impl Connection {
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.writer.send(Outbound::Frame(frame)).is_ok()
    }

    pub fn close_after_flush(&self) {
        let _ = self.writer.send(Outbound::Close);
    }

    /// The peer's own `tcp://host:port`, once it has stamped a packet.
    pub fn advertised(&self) -> Option<&str> {
        self.advertised.as_deref()
    }

    /// Endpoint for a fresh one-shot request to this peer.
    ///
    /// For links we opened this is the remote endpoint itself. For accepted
    /// links the remote port is the peer's ephemeral client port, so the
    /// advertised address is preferred when the peer has sent one.
    pub fn poll_target(&self) -> String {
        match (self.direction, self.advertised.as_deref()) {
            (Direction::Inbound, Some(advertised)) => match socket_address(advertised) {
                Ok(addr) => addr,
                Err(_) => self.remote.to_string(),
            },
            _ => self.remote.to_string(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Open peer links in registration order. Cluster membership is exactly
/// this set.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: ConnectionId,
    connections: Vec<Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        remote: SocketAddr,
        direction: Direction,
        writer: UnboundedSender<Outbound>,
    ) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.connections.push(Connection {
            id,
            remote,
            direction,
            advertised: None,
            writer,
            reader: None,
        });
        debug!("Registered {direction:?} connection {id} with {remote}");
        id
    }

    pub fn attach_reader(&mut self, id: ConnectionId, reader: AbortHandle) {
        match self.connections.iter_mut().find(|c| c.id == id) {
            Some(conn) => conn.reader = Some(reader),
            None => reader.abort(),
        }
    }

    /// Removes and tears down a connection. Returns false if it was already
    /// gone.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        match self.connections.iter().position(|c| c.id == id) {
            Some(pos) => {
                let conn = self.connections.remove(pos);
                debug!("Removed connection {id} with {}", conn.remote);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn note_advertised(&mut self, id: ConnectionId, address: &str) {
        if let Some(conn) = self.connections.iter_mut().find(|c| c.id == id) {
            if conn.advertised.as_deref() != Some(address) {
                conn.advertised = Some(address.to_string());
            }
        }
    }

    /// Live member count used for majority thresholds.
    pub fn membership(&self) -> usize {
        self.connections.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Sends a frame on every connection; returns how many accepted it.
    pub fn broadcast(&self, frame: &[u8]) -> usize {
        self.connections
            .iter()
            .filter(|c| c.send(frame.to_vec()))
            .count()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
