//! Encrypted control channel between the control plane and instance agents
//!
//! Every message travels on its own TCP connection: the sender writes one
//! encrypted token and closes. The server side authenticates by source
//! address and by the shared key, then dispatches the token into the state
//! machine.

use crate::context::Context;
use crate::crypto::ControlCipher;
use crate::error::ControlError;
use crate::lifecycle::{Operation, Orchestrator};
use crate::server::ManagedServer;
use crate::state::ServerState;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Largest accepted encrypted message
pub const MAX_MESSAGE_LEN: usize = 4096;

const SEND_ATTEMPTS: u32 = 3;

/// Tokens exchanged with the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Agent: the game server is running
    Started,
    /// Agent: the game server exited
    Stopped,
    /// Control plane: stop the game server
    Stop,
    /// Control plane: power off the instance
    Shutdown,
    /// Agent: the instance is flagged for teardown
    Destroy,
}

impl ControlMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
            Self::Destroy => "destroy",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "started" => Some(Self::Started),
            "stopped" => Some(Self::Stopped),
            "stop" => Some(Self::Stop),
            "shutdown" => Some(Self::Shutdown),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sends commands to agents
#[derive(Debug, Clone)]
pub struct ControlClient {
    cipher: ControlCipher,
    port: u16,
    attempts: u32,
    backoff: Duration,
    connect_timeout: Duration,
}

impl ControlClient {
    pub fn new(cipher: ControlCipher, port: u16, connect_timeout: Duration, backoff: Duration) -> Self {
        Self {
            cipher,
            port,
            attempts: SEND_ATTEMPTS,
            backoff,
            connect_timeout,
        }
    }

    /// Deliver `message` to the agent at `ip`.
    ///
    /// Connection failures are retried with a fixed backoff. A completed
    /// write is not confirmed by the agent.
    pub async fn tell_remote(&self, ip: &str, message: ControlMessage) -> Result<(), ControlError> {
        let addr = format!("{}:{}", ip, self.port);
        let payload = self.cipher.encrypt(message.as_str().as_bytes());
        let mut last = String::new();

        for attempt in 1..=self.attempts {
            match self.send_once(&addr, &payload).await {
                Ok(()) => {
                    debug!(addr = %addr, message = %message, "Sent control message");
                    return Ok(());
                }
                Err(e) => {
                    warn!(addr = %addr, attempt, error = %e, "Failed to reach agent");
                    last = e.to_string();
                    if attempt < self.attempts {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        Err(ControlError::Unreachable {
            addr,
            attempts: self.attempts,
            last,
        })
    }

    async fn send_once(&self, addr: &str, payload: &[u8]) -> io::Result<()> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.write_all(payload).await?;
        stream.shutdown().await
    }
}

/// Ask the agent to stop the game server and wait for it to report back.
///
/// Returns true if the agent confirmed in time. A missing address, an
/// unreachable agent or a timeout all return false; the caller carries on.
pub async fn stop_game_server(ctx: &Context, server: &ManagedServer) -> bool {
    let Some(ip) = server.ip() else {
        warn!(server = %server.name(), "No instance address, cannot stop game server");
        return false;
    };

    let stopped = server.arm_stop();
    if let Err(e) = ctx.control.tell_remote(&ip, ControlMessage::Stop).await {
        warn!(server = %server.name(), error = %e, "Could not ask agent to stop");
        server.disarm_stop();
        return false;
    }

    match timeout(ctx.timings.stop_timeout, stopped).await {
        Ok(Ok(())) => {
            info!(server = %server.name(), "Game server stopped");
            true
        }
        Ok(Err(_)) => false,
        Err(_) => {
            warn!(server = %server.name(), "Timed out waiting for game server to stop");
            server.disarm_stop();
            false
        }
    }
}

/// Accepts agent reports
pub struct ControlServer {
    orchestrator: Arc<Orchestrator>,
    cipher: ControlCipher,
}

impl ControlServer {
    pub fn new(orchestrator: Arc<Orchestrator>, cipher: ControlCipher) -> Arc<Self> {
        Arc::new(Self { orchestrator, cipher })
    }

    fn ctx(&self) -> &Context {
        self.orchestrator.context()
    }

    /// Accept agent connections until shutdown is signalled
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Control channel listening");
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    debug!(peer = %peer, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control channel shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// The server a connection from `ip` speaks for
    fn resolve(&self, ip: &str) -> Option<Arc<ManagedServer>> {
        let fleet = &self.ctx().fleet;
        fleet
            .by_ip(ip)
            .or_else(|| fleet.sole_unaddressed())
            .cloned()
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ControlError> {
        let ip = peer.ip().to_string();
        let Some(server) = self.resolve(&ip) else {
            warn!(peer = %peer, "Rejected control connection from unknown address");
            return Ok(());
        };

        if matches!(server.state(), ServerState::Snapshot | ServerState::Destroy) {
            debug!(server = %server.name(), peer = %peer, "Ignoring agent while instance is being torn down");
            return Ok(());
        }

        let mut data = Vec::new();
        let mut limited = stream.take(MAX_MESSAGE_LEN as u64 + 1);
        timeout(self.ctx().timings.socket_deadline, limited.read_to_end(&mut data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "control read timed out"))??;

        if data.len() > MAX_MESSAGE_LEN {
            warn!(server = %server.name(), peer = %peer, "Dropped oversized control message");
            return Ok(());
        }

        let plaintext = match self.cipher.decrypt(&data) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(server = %server.name(), peer = %peer, error = %e, "Dropped undecryptable control message");
                return Ok(());
            }
        };

        let token = String::from_utf8_lossy(&plaintext);
        match ControlMessage::parse(&token) {
            Some(message) => self.dispatch(&server, &ip, message),
            None => warn!(server = %server.name(), token = %token, "Unknown control message"),
        }
        Ok(())
    }

    fn dispatch(&self, server: &Arc<ManagedServer>, ip: &str, message: ControlMessage) {
        info!(server = %server.name(), ip, message = %message, "Agent report");

        match message {
            ControlMessage::Started => {
                server.record_ip(ip);
                self.ctx().set_state(server, ServerState::Started);
            }
            ControlMessage::Stopped => {
                if !server.complete_stop() {
                    warn!(server = %server.name(), "Game server stopped unexpectedly");
                    self.ctx().set_state(server, ServerState::Unavailable);
                }
            }
            ControlMessage::Destroy => {
                self.orchestrator.submit(server, Operation::Shutdown);
            }
            ControlMessage::Stop | ControlMessage::Shutdown => {
                warn!(server = %server.name(), message = %message, "Agent sent a control-plane command");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_tokens() {
        for message in [
            ControlMessage::Started,
            ControlMessage::Stopped,
            ControlMessage::Stop,
            ControlMessage::Shutdown,
            ControlMessage::Destroy,
        ] {
            assert_eq!(ControlMessage::parse(message.as_str()), Some(message));
        }
        assert_eq!(ControlMessage::parse("started\n"), Some(ControlMessage::Started));
        assert_eq!(ControlMessage::parse("reboot"), None);
    }

    #[tokio::test]
    async fn test_tell_remote_writes_one_encrypted_message() {
        let cipher = ControlCipher::from_bytes(&[3u8; 32]).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let receiver = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut data = Vec::new();
            stream.read_to_end(&mut data).await.unwrap();
            data
        });

        let client = ControlClient::new(cipher.clone(), port, Duration::from_secs(1), Duration::from_millis(10));
        client.tell_remote("127.0.0.1", ControlMessage::Stop).await.unwrap();

        let data = receiver.await.unwrap();
        assert_eq!(cipher.decrypt(&data).unwrap(), b"stop");
    }

    #[tokio::test]
    async fn test_tell_remote_gives_up() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let cipher = ControlCipher::from_bytes(&[3u8; 32]).unwrap();
        let client = ControlClient::new(cipher, port, Duration::from_secs(1), Duration::from_millis(5));
        let err = client
            .tell_remote("127.0.0.1", ControlMessage::Stop)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Unreachable { attempts: 3, .. }));
    }
}
