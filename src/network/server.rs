use std::net::SocketAddr;

use log::{debug, error};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;

/// A peer socket accepted by the listener.
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub remote: SocketAddr,
}

/// Accepts peer connections and hands them to the node task until the node
/// goes away.
pub async fn accept_loop<E>(listener: TcpListener, events: UnboundedSender<E>)
where
    E: From<Accepted> + Send + 'static,
{
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!("Accepted connection from {remote}");
                if events.send(Accepted { stream, remote }.into()).is_err() {
                    break;
                }
            }
            Err(e) => {
                error!("Accept failed: {e}");
            }
        }
    }
}
