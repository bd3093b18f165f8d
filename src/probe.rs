//! Application-level health probe
//!
//! Confirms the game server itself is accepting connections, not just that
//! the instance is up: sends a status handshake followed by an empty status
//! request and checks that a non-trivial response frame comes back.

use crate::codec::{self, Handshake, Packet, NEXT_STATE_STATUS};
use crate::error::CodecError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Protocol version sent in the probe handshake
pub const PROBE_PROTOCOL_VERSION: i32 = 5;

/// Responses at or below this many bytes count as empty
pub const RESPONSE_THRESHOLD: usize = 5;

/// Something that can tell whether the game server at an address is answering
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_responding(&self, ip: &str) -> bool;
}

/// Probe configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Game port on the instance
    pub port: u16,
    /// Deadline for connecting, and again for the request/response exchange
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            port: 25565,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Health probe speaking the game's status protocol over TCP
#[derive(Debug, Clone, Default)]
pub struct StatusProbe {
    config: ProbeConfig,
}

impl StatusProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Run the exchange and return the declared length of the response frame
    async fn exchange(&self, ip: &str) -> Result<usize, CodecError> {
        let addr = format!("{}:{}", ip, self.config.port);
        let mut stream = timeout(self.config.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;

        let handshake = Handshake {
            protocol_version: PROBE_PROTOCOL_VERSION,
            server_address: ip.to_string(),
            server_port: self.config.port,
            next_state: NEXT_STATE_STATUS,
        };

        let mut request = handshake.to_packet().frame();
        request.extend_from_slice(&Packet::new(0x00).frame());

        let exchange = async {
            stream.write_all(&request).await?;
            let length = codec::read_frame_length(&mut stream).await?;
            Ok::<usize, CodecError>(length)
        };

        timeout(self.config.timeout, exchange)
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
    }
}

#[async_trait]
impl HealthProbe for StatusProbe {
    async fn is_responding(&self, ip: &str) -> bool {
        if ip.is_empty() {
            return false;
        }

        match self.exchange(ip).await {
            Ok(length) => {
                debug!(ip, length, "Probe response");
                length > RESPONSE_THRESHOLD
            }
            Err(e) => {
                debug!(ip, error = %e, "Probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_frame;
    use tokio::net::TcpListener;

    async fn spawn_server<F>(respond: F) -> u16
    where
        F: FnOnce(Handshake) -> Option<Vec<u8>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream).await.unwrap();
            let handshake = Handshake::parse(frame.payload()).unwrap();
            let request = read_frame(&mut stream).await.unwrap();
            assert_eq!(request.payload(), &[0x00]);

            match respond(handshake) {
                Some(bytes) => {
                    stream.write_all(&bytes).await.unwrap();
                }
                None => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        });

        port
    }

    fn probe_for(port: u16) -> StatusProbe {
        StatusProbe::new(ProbeConfig {
            port,
            timeout: Duration::from_millis(300),
        })
    }

    #[tokio::test]
    async fn test_responding_server() {
        let port = spawn_server(|handshake| {
            assert_eq!(handshake.protocol_version, PROBE_PROTOCOL_VERSION);
            assert_eq!(handshake.server_address, "127.0.0.1");
            assert_eq!(handshake.next_state, NEXT_STATE_STATUS);

            let mut response = Packet::new(0x00);
            response.write_string(r#"{"description":{"text":"hello"}}"#);
            Some(response.frame())
        })
        .await;

        assert!(probe_for(port).is_responding("127.0.0.1").await);
    }

    #[tokio::test]
    async fn test_tiny_response_is_not_responding() {
        let port = spawn_server(|_| {
            let mut response = Packet::new(0x00);
            response.write_string("ok");
            Some(response.frame())
        })
        .await;

        assert!(!probe_for(port).is_responding("127.0.0.1").await);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let port = spawn_server(|_| None).await;
        assert!(!probe_for(port).is_responding("127.0.0.1").await);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!probe_for(port).is_responding("127.0.0.1").await);
    }

    #[tokio::test]
    async fn test_empty_address() {
        assert!(!StatusProbe::default().is_responding("").await);
    }
}
