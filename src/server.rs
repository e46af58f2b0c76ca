//! TCP accept loop for the relay.
//!
//! Accepts connections, registers each one's write half with the registry,
//! and spawns its read loop as an independent task. An accept failure is
//! fatal: every connection is shut down and the error is returned.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::Connection;
use crate::registry::Registry;

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Server {
            config,
            registry: Arc::new(Registry::new()),
        }
    }

    /// Bind the configured address and begin accepting connections
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %listener.local_addr()?, "Relay listening");
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener.
    ///
    /// Each accepted stream is split: the write half goes into the
    /// registry so broadcasts reach it, the read half drives a spawned
    /// `Connection` task. Only a listener-level error ends the loop.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let id = Uuid::new_v4();
                    debug!(%id, peer = %addr, "New connection");

                    let (read_half, write_half) = stream.into_split();
                    self.registry.register(id, write_half).await;

                    let connection = Connection::new(id, read_half, Arc::clone(&self.registry));
                    tokio::spawn(connection.process());
                }
                Err(e) => {
                    error!(error = %e, "Accept failed, shutting down");
                    self.registry.shutdown_all().await;
                    return Err(e);
                }
            }
        }
    }

    /// Get a reference to the registry for testing
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tokio::task::JoinSet;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr, name: &str) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut client = TestClient {
                reader: BufReader::new(read_half),
                writer: write_half,
            };
            client.send(name).await;
            client
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn expect(&mut self, expected: &str) {
            let mut line = String::new();
            timeout(TEST_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for line")
                .expect("read failed");
            assert_eq!(line, format!("{expected}\n"));
        }
    }

    async fn start_server() -> (SocketAddr, Arc<Registry>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(Config {
            listen: addr.to_string(),
            log_level: "info".to_string(),
        });
        let registry = Arc::clone(server.registry());
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        (addr, registry)
    }

    async fn wait_for_registry_len(registry: &Arc<Registry>, expected: usize) {
        timeout(TEST_TIMEOUT, async {
            while registry.len().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry did not reach expected size");
    }

    #[tokio::test]
    async fn end_to_end_chat_session() {
        let (addr, registry) = start_server().await;

        let mut alice = TestClient::connect(addr, "alice").await;
        alice.expect("alice joined the chat").await;

        let mut bob = TestClient::connect(addr, "bob").await;
        bob.expect("bob joined the chat").await;
        alice.expect("bob joined the chat").await;

        // Relayed verbatim to everyone, sender included.
        alice.send("hello").await;
        alice.expect("hello").await;
        bob.expect("hello").await;

        drop(alice);
        bob.expect("alice left the chat").await;
        wait_for_registry_len(&registry, 1).await;
    }

    #[tokio::test]
    async fn messages_have_no_sender_prefix() {
        let (addr, _registry) = start_server().await;

        let mut alice = TestClient::connect(addr, "alice").await;
        alice.expect("alice joined the chat").await;

        let mut bob = TestClient::connect(addr, "bob").await;
        bob.expect("bob joined the chat").await;
        alice.expect("bob joined the chat").await;

        bob.send("exactly this text").await;
        alice.expect("exactly this text").await;
        bob.expect("exactly this text").await;
    }

    #[tokio::test]
    async fn concurrent_connects_and_disconnects_drain_cleanly() {
        let (addr, registry) = start_server().await;

        let mut tasks = JoinSet::new();
        for i in 0..32 {
            tasks.spawn(async move {
                let mut client = TestClient::connect(addr, &format!("user-{i}")).await;
                client.send("ping").await;
                // Dropping the client disconnects it.
            });
        }
        while tasks.join_next().await.is_some() {}

        // Every handler observes its disconnect and deregisters.
        wait_for_registry_len(&registry, 0).await;

        // The relay still serves new clients afterwards.
        let mut dave = TestClient::connect(addr, "dave").await;
        dave.expect("dave joined the chat").await;
    }
}
