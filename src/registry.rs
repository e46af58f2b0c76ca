//! Registry of active connections.
//!
//! Holds the write half of every accepted connection and fans each
//! broadcast line out to all of them. The set is mutex-guarded: the accept
//! loop appends, connection handlers remove themselves, and broadcasts
//! iterate, all concurrently. Holding the lock across a broadcast also
//! keeps each connection's outgoing stream strictly ordered.

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The set of currently connected clients, in accept order.
pub struct Registry {
    connections: Mutex<Vec<Peer>>,
}

/// Write side of one registered connection.
struct Peer {
    id: Uuid,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Peer {
    async fn send(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Add a connection's write half to the set.
    pub async fn register(&self, id: Uuid, writer: OwnedWriteHalf) {
        let mut connections = self.connections.lock().await;
        connections.push(Peer {
            id,
            writer: BufWriter::new(writer),
        });
        debug!(%id, total = connections.len(), "Connection registered");
    }

    /// Send one line to every registered connection.
    ///
    /// A write failure to one peer is logged and skipped; delivery to the
    /// remaining peers continues. The line is also echoed to the operator
    /// log.
    pub async fn broadcast(&self, line: &str) {
        info!(message = %line, "Broadcast");

        let mut connections = self.connections.lock().await;
        for peer in connections.iter_mut() {
            if let Err(e) = peer.send(line).await {
                warn!(id = %peer.id, error = %e, "Failed to deliver broadcast");
            }
        }
    }

    /// Remove a connection by identifier and shut its writer down.
    ///
    /// Unknown identifiers are silently ignored, so this is safe to call
    /// from any exit path of a connection handler.
    pub async fn remove(&self, id: Uuid) {
        let mut connections = self.connections.lock().await;
        if let Some(pos) = connections.iter().position(|peer| peer.id == id) {
            let mut peer = connections.remove(pos);
            if let Err(e) = peer.writer.shutdown().await {
                debug!(%id, error = %e, "Writer shutdown failed");
            }
            debug!(%id, total = connections.len(), "Connection removed");
        }
    }

    /// Shut down every registered writer. Used on fatal accept-loop
    /// failure; the set is not cleared since the server is going away.
    /// Read halves and their spawned tasks are not touched here; they
    /// are torn down by process exit.
    pub async fn shutdown_all(&self) {
        let mut connections = self.connections.lock().await;
        for peer in connections.iter_mut() {
            if let Err(e) = peer.writer.shutdown().await {
                debug!(id = %peer.id, error = %e, "Writer shutdown failed");
            }
        }
    }

    #[cfg(test)]
    pub async fn contains(&self, id: Uuid) -> bool {
        self.connections
            .lock()
            .await
            .iter()
            .any(|peer| peer.id == id)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }
}
