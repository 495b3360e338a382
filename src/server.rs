//! WebSocket server for relay clients.
//!
//! Accepts TCP connections, performs the WebSocket handshake, registers each
//! connection with the `ConnectionManager` and runs one reader loop plus one
//! writer task per connection.
//!
//! A client gets `handshake_timeout` to finish the WebSocket upgrade. After
//! that there is no liveness check: each peer's outbound queue is unbounded,
//! and a peer that stops reading is only dropped once its socket errors or
//! closes. Delivery is best-effort.

use crate::config::Config;
use crate::error::RelayError;
use crate::registry::{ConnectionManager, Outbound, PeerHandle};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

/// How often the registry is checked while draining on shutdown
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server instance
pub struct Server {
    listener: TcpListener,
    manager: Arc<ConnectionManager>,
    shutdown_grace: Duration,
    handshake_timeout: Duration,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(config: &Config, manager: Arc<ConnectionManager>) -> Result<Self, RelayError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| RelayError::Bind {
                addr: format!("{}:{}", config.host, config.port),
                source,
            })?;

        info!(address = %listener.local_addr()?, "Relay listening");

        Ok(Server {
            listener,
            manager,
            shutdown_grace: config.shutdown_grace,
            handshake_timeout: config.handshake_timeout,
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// connection and wait up to the grace period for them to drain.
    pub async fn run<F>(self, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");

                        let manager = Arc::clone(&self.manager);
                        let handshake_timeout = self.handshake_timeout;
                        tokio::spawn(async move {
                            handle_connection(stream, peer, manager, handshake_timeout).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }

        let Server {
            listener,
            manager,
            shutdown_grace,
            ..
        } = self;
        drop(listener);

        info!("Shutting down");
        manager.shutdown();

        let drained = tokio::time::timeout(shutdown_grace, async {
            while !manager.is_empty() {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        match drained {
            Ok(()) => info!("All connections closed"),
            Err(_) => warn!(
                remaining = ?manager.ids(),
                grace_ms = shutdown_grace.as_millis() as u64,
                "Shutdown grace period elapsed with open connections"
            ),
        }

        Ok(())
    }
}

/// Resolve once the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<ConnectionManager>,
    handshake_timeout: Duration,
) {
    let ws = match tokio::time::timeout(handshake_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            debug!(peer = %peer, "WebSocket handshake timed out");
            return;
        }
    };

    let (sink, mut source) = ws.split();
    let (handle, outbound) = PeerHandle::channel();
    let conn_id = manager.accept(handle);
    let writer = tokio::spawn(write_loop(conn_id, sink, outbound));

    let mut failed = false;
    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                manager.on_message(conn_id, text.as_str());
            }
            Ok(Message::Binary(data)) => {
                manager.on_binary_message(conn_id, &data);
            }
            // The close reply is queued by tungstenite; the stream ends after it
            Ok(Message::Close(frame)) => {
                trace!(conn_id, ?frame, "Close frame received");
            }
            Ok(_) => {}
            Err(e) => {
                manager.on_error(conn_id, &e);
                failed = true;
                break;
            }
        }
    }

    if !failed {
        manager.on_closed(conn_id);
    }

    // Deregistration dropped the last sender, so the writer finishes on its own
    if let Err(e) = writer.await {
        debug!(conn_id, error = %e, "Writer task failed");
    }
}

/// Drain queued frames into the socket until the channel closes, a close is
/// requested, or a write fails.
async fn write_loop(conn_id: u64, mut sink: WsSink, mut outbound: UnboundedReceiver<Outbound>) {
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::text(text)).await {
                    debug!(conn_id, error = %e, "Write failed");
                    break;
                }
            }
            Outbound::Close => {
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!(conn_id, error = %e, "Close failed");
                }
                break;
            }
        }
    }
    trace!(conn_id, "Writer finished");
}
