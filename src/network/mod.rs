mod error;

pub mod client;
pub mod codec;
pub mod connection;
pub mod registry;
pub mod server;

pub use self::error::NetworkError;
pub use client::{connect, format_address, socket_address, PeerClient};
pub use codec::{Inbound, JsonDecoder};
pub use connection::{spawn_io, PeerEvent, PeerEventKind};
pub use registry::{Connection, ConnectionId, ConnectionRegistry, Direction, Outbound};
pub use server::{accept_loop, Accepted};
