//! Raw TCP relay from a client to the active instance

use crate::gateway::ForwardObserver;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Host part of a `host:port` address
pub fn host_of(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    }
}

/// Reports the disconnect even if the relay future is dropped midway
struct SessionGuard<'a> {
    observer: &'a dyn ForwardObserver,
    ip: &'a str,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.observer.on_forward_disconnect(self.ip);
    }
}

/// Relay `client` to `addr` until either side closes.
///
/// `preamble` holds bytes already read from the client (the handshake) and
/// is replayed to the instance first. Connect and disconnect are reported
/// to `observer` by the instance's IP. Returns the bytes copied in each
/// direction.
pub async fn relay(
    mut client: TcpStream,
    preamble: &[u8],
    addr: &str,
    observer: &dyn ForwardObserver,
    connect_timeout: Duration,
) -> io::Result<(u64, u64)> {
    let mut upstream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect to instance timed out"))??;
    upstream.set_nodelay(true)?;

    let ip = host_of(addr);
    observer.on_forward_connect(ip);
    let _session = SessionGuard { observer, ip };

    upstream.write_all(preamble).await?;

    let (to_instance, to_client) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(addr, to_instance, to_client, "Forwarded session closed");
    Ok((to_instance + preamble.len() as u64, to_client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl ForwardObserver for Events {
        fn on_forward_connect(&self, ip: &str) {
            self.0.lock().push(format!("+{}", ip));
        }

        fn on_forward_disconnect(&self, ip: &str) {
            self.0.lock().push(format!("-{}", ip));
        }
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.1:25565"), "10.0.0.1");
        assert_eq!(host_of("10.0.0.1"), "10.0.0.1");
        assert_eq!(host_of("[::1]:25565"), "[::1]");
    }

    #[tokio::test]
    async fn test_relay_replays_preamble_and_echoes() {
        // Instance side: echo everything back
        let instance = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let instance_addr = instance.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = instance.accept().await.unwrap();
            let (mut reader, mut writer) = stream.split();
            tokio::io::copy(&mut reader, &mut writer).await.unwrap();
        });

        // Gateway side: accept one client and relay it
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let events = std::sync::Arc::new(Events::default());
        let relay_events = events.clone();
        let relay_task = tokio::spawn(async move {
            let (client, _) = front.accept().await.unwrap();
            relay(
                client,
                b"hello ",
                &instance_addr,
                relay_events.as_ref(),
                Duration::from_secs(1),
            )
            .await
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(b"world").await.unwrap();

        let mut buf = [0u8; 11];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");

        drop(client);
        let (to_instance, to_client) = relay_task.await.unwrap().unwrap();
        assert_eq!(to_instance, 11);
        assert_eq!(to_client, 11);

        assert_eq!(*events.0.lock(), vec!["+127.0.0.1", "-127.0.0.1"]);
    }

    #[tokio::test]
    async fn test_unreachable_instance_reports_nothing() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap().to_string();
        drop(closed);

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(front_addr).await });
        let (client, _) = front.accept().await.unwrap();

        let events = Events::default();
        let result = relay(client, b"", &closed_addr, &events, Duration::from_secs(1)).await;
        assert!(result.is_err());
        assert!(events.0.lock().is_empty());
        drop(connect);
    }
}
