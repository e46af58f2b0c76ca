//! Per-client connection handling.
//!
//! Each accepted stream gets a `Connection` that reads newline-delimited
//! text and relays it through the registry. The first line is the client's
//! display name; subsequent lines are broadcast verbatim to everyone,
//! including the sender.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tracing::debug;
use uuid::Uuid;

use crate::registry::Registry;

/// Display name used when a peer disconnects before sending one.
const UNNAMED: &str = "unknown";

/// Read side of one client connection.
pub struct Connection {
    id: Uuid,
    reader: BufReader<OwnedReadHalf>,
    registry: Arc<Registry>,
}

impl Connection {
    pub fn new(id: Uuid, read_half: OwnedReadHalf, registry: Arc<Registry>) -> Self {
        Self {
            id,
            reader: BufReader::new(read_half),
            registry,
        }
    }

    /// Drive the connection until the peer disconnects.
    ///
    /// Announces the join, relays every line, announces the departure on
    /// end of stream or read error, and deregisters from the registry on
    /// every exit path. A clean end of stream counts as a departure, so
    /// politely closed connections do not linger.
    pub async fn process(mut self) {
        let name = match self.read_line().await {
            Ok(Some(name)) => name,
            Ok(None) | Err(_) => UNNAMED.to_string(),
        };

        self.registry
            .broadcast(&format!("{name} joined the chat"))
            .await;

        loop {
            match self.read_line().await {
                Ok(Some(line)) => {
                    self.registry.broadcast(&line).await;
                }
                Ok(None) => {
                    debug!(id = %self.id, "End of stream");
                    self.registry
                        .broadcast(&format!("{name} left the chat"))
                        .await;
                    break;
                }
                Err(e) => {
                    debug!(id = %self.id, error = %e, "Read failed");
                    self.registry
                        .broadcast(&format!("{name} left the chat"))
                        .await;
                    break;
                }
            }
        }

        self.registry.remove(self.id).await;
    }

    /// Read one line, without its terminator. `Ok(None)` means end of
    /// stream. A trailing `\r` is tolerated so plain telnet clients work.
    async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }
}
