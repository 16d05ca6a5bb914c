use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;

use super::codec::{classify, Inbound, JsonDecoder};
use super::registry::{ConnectionId, Outbound};
use super::NetworkError;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug)]
pub struct PeerEvent {
    pub id: ConnectionId,
    pub kind: PeerEventKind,
}

#[derive(Debug)]
pub enum PeerEventKind {
    Received(Inbound),
    /// Undecodable input; the connection must be destroyed.
    Malformed(NetworkError),
    Closed,
}

/// Splits `stream` into a writer task draining `writer_rx` and a reader task
/// feeding `events`. Packets from one connection are delivered in the order
/// they were read. The returned handle stops the reader.
pub fn spawn_io<E>(
    stream: TcpStream,
    id: ConnectionId,
    max_frame: usize,
    mut writer_rx: UnboundedReceiver<Outbound>,
    events: UnboundedSender<E>,
) -> AbortHandle
where
    E: From<PeerEvent> + Send + 'static,
{
    let (mut read_half, mut write_half) = stream.into_split();

    tokio::spawn(async move {
        while let Some(out) = writer_rx.recv().await {
            match out {
                Outbound::Frame(bytes) => {
                    if let Err(e) = write_half.write_all(&bytes).await {
                        debug!("Write on connection {id} failed: {e}");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    });

    let reader = tokio::spawn(async move {
        let mut decoder = JsonDecoder::new(max_frame);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let kind = match read_half.read(&mut chunk).await {
                Ok(0) => PeerEventKind::Closed,
                Ok(n) => match decoder.decode(&chunk[..n]) {
                    Ok(docs) => {
                        for doc in docs {
                            let event = PeerEvent {
                                id,
                                kind: PeerEventKind::Received(classify(doc)),
                            };
                            if events.send(event.into()).is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                    Err(e) => PeerEventKind::Malformed(e),
                },
                Err(e) => {
                    debug!("Read on connection {id} failed: {e}");
                    PeerEventKind::Closed
                }
            };
            let _ = events.send(PeerEvent { id, kind }.into());
            return;
        }
    });

    reader.abort_handle()
}
