//! Connection plumbing over the message codec.
//!
//! Each connection splits a framed stream into a background reader and
//! writer task joined to the user by mpsc channels, so invocation code
//! never touches the socket directly.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::dispatch::ObjectAdapter;
use crate::error::OrbError;
use crate::frame::Message;
use crate::invocation::RequestRegistry;

const CHANNEL_CAPACITY: usize = 100;
const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// Client side of one connection. Cheap to clone; all clones share
/// the writer channel and the pending-request registry.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::Sender<Message>,
    registry: Arc<RequestRegistry>,
}

impl Connection {
    /// Wrap an established stream: spawn the writer, reader, and
    /// timeout-sweep tasks.
    pub fn new(stream: TcpStream) -> Self {
        let (mut net_writer, mut net_reader) = Framed::new(stream, MessageCodec::new()).split();
        let (user_tx, mut network_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        let registry = Arc::new(RequestRegistry::new());

        // Writer task: user -> network.
        tokio::spawn(async move {
            while let Some(message) = network_rx.recv().await {
                if let Err(e) = net_writer.send(message).await {
                    warn!(error = %e, "network write failed");
                    break;
                }
            }
        });

        // Reader task: network -> pending-request registry.
        let reader_registry = registry.clone();
        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(Message::Reply(reply)) => {
                        if !reader_registry.complete(reply.request_id, reply) {
                            debug!("reply for unknown or expired request");
                        }
                    }
                    Ok(Message::ValidateConnection) => {
                        debug!("connection validated by peer");
                    }
                    Ok(Message::CloseConnection) => {
                        debug!("peer closed connection gracefully");
                        break;
                    }
                    Ok(_) => {
                        warn!("server-bound message on client connection");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "network read failed");
                        break;
                    }
                }
            }
            reader_registry.fail_all();
        });

        // Deadline sweep, stopped once the connection handle is gone.
        let sweep_registry = registry.clone();
        let sweep_tx = user_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = sweep_tx.closed() => break,
                    _ = interval.tick() => {
                        sweep_registry.drain_expired();
                    }
                }
            }
        });

        Connection {
            tx: user_tx,
            registry,
        }
    }

    pub async fn connect(host: &str, port: u16) -> Result<Self, OrbError> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::new(stream))
    }

    pub async fn send(&self, message: Message) -> Result<(), OrbError> {
        self.tx.send(message).await.map_err(OrbError::from)
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    /// Announce a graceful shutdown to the peer.
    pub async fn close(&self) -> Result<(), OrbError> {
        self.send(Message::CloseConnection).await
    }
}

// ── Server side ──────────────────────────────────────────────────

/// Accept loop: one spawned task per inbound connection, all
/// dispatching into the same adapter.
pub async fn serve(listener: TcpListener, adapter: Arc<ObjectAdapter>) -> Result<(), OrbError> {
    info!(adapter = adapter.name(), addr = %listener.local_addr()?, "serving");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "accepted connection");
        let adapter = adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, adapter).await {
                warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

/// Drive one server-side connection: validate, then dispatch until
/// the peer closes or the stream errors.
pub async fn serve_connection(
    stream: TcpStream,
    adapter: Arc<ObjectAdapter>,
) -> Result<(), OrbError> {
    let mut framed = Framed::new(stream, MessageCodec::new());
    framed.send(Message::ValidateConnection).await?;

    while let Some(result) = framed.next().await {
        let message = result?;
        if matches!(message, Message::CloseConnection) {
            debug!("close requested by peer");
            break;
        }
        if let Some(reply) = adapter.handle(message).await? {
            framed.send(reply).await?;
        }
    }
    Ok(())
}
