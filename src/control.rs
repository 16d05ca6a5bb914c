//! Local command socket for a running daemon.
//!
//! Accepts one JSON command per connection on loopback and writes one JSON
//! reply. `state` reports the node's state (and leader when known); `join`
//! starts discovery in the background and acknowledges immediately.

use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::network::codec::encode;
use crate::network::{JsonDecoder, NetworkError};
use crate::raft::{NodeState, Raft};

const MAX_COMMAND_SIZE: usize = 64 * 1024;
pub const DISCOVERY_INITIATED: &str = "ok, discovery initiated";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    State,
    Join { address: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    State {
        state: NodeState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        leader: Option<String>,
    },
    Status {
        status: String,
    },
    Error {
        error: String,
    },
}

pub async fn bind(port: u16) -> Result<TcpListener, NetworkError> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("Command server listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serves commands for `raft` until the listener fails or the task is aborted.
pub async fn serve(listener: TcpListener, raft: Raft) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!("Command connection from {remote}");
                let raft = raft.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &raft).await {
                        warn!("Command connection from {remote} failed: {e}");
                    }
                });
            }
            Err(e) => warn!("Command accept failed: {e}"),
        }
    }
}

async fn handle_connection(mut stream: TcpStream, raft: &Raft) -> Result<(), NetworkError> {
    let Some(doc) = read_document(&mut stream).await? else {
        return Ok(());
    };

    let response = match serde_json::from_value::<Command>(doc) {
        Ok(command) => execute(command, raft).await,
        Err(e) => Response::Error {
            error: format!("unknown command: {e}"),
        },
    };

    stream.write_all(&encode(&response)?).await?;
    stream.shutdown().await?;
    Ok(())
}

pub async fn execute(command: Command, raft: &Raft) -> Response {
    match command {
        Command::State => match raft.snapshot().await {
            Ok(snapshot) => Response::State {
                state: snapshot.state,
                leader: snapshot.leader,
            },
            Err(e) => Response::Error {
                error: e.to_string(),
            },
        },
        Command::Join { address } => {
            info!("Received join command for address: {address}");
            let raft = raft.clone();
            tokio::spawn(async move {
                if let Err(e) = raft.discover_and_join(&address).await {
                    warn!("Join via {address} failed: {e}");
                }
            });
            Response::Status {
                status: DISCOVERY_INITIATED.to_string(),
            }
        }
    }
}

/// Sends `command` to the daemon listening on `port` and returns its reply.
pub async fn send_command(
    port: u16,
    command: &Command,
    wait: Duration,
) -> Result<Value, NetworkError> {
    let exchange = async {
        let mut stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| NetworkError::ConnectionError(format!("127.0.0.1:{port}: {e}")))?;
        stream.write_all(&encode(command)?).await?;
        read_document(&mut stream)
            .await?
            .ok_or(NetworkError::ConnectionClosed)
    };
    timeout(wait, exchange)
        .await
        .map_err(|_| NetworkError::TimeoutError)?
}

async fn read_document(stream: &mut TcpStream) -> Result<Option<Value>, NetworkError> {
    let mut decoder = JsonDecoder::new(MAX_COMMAND_SIZE);
    let mut chunk = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(doc) = decoder.decode(&chunk[..n])?.into_iter().next() {
            return Ok(Some(doc));
        }
    }
}
