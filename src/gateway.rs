//! Client-facing game listener
//!
//! Accepts game clients on the public port and routes each connection by
//! the hostname in its handshake. A hostname is either in handler mode,
//! where status pings get the server's status line and logins get a
//! message from the [`ConnectHandler`], or in forward mode, where the
//! connection is relayed raw to the running instance.

use crate::codec::{
    self, normalize_hostname, Handshake, Packet, NEXT_STATE_LOGIN, NEXT_STATE_STATUS,
};
use crate::error::CodecError;
use crate::forwarder;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const STATUS_REQUEST_ID: i32 = 0x00;
const PING_ID: i32 = 0x01;
const LOGIN_START_ID: i32 = 0x00;
const LOGIN_DISCONNECT_ID: i32 = 0x00;

/// What the server list shows for a hostname
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusLine {
    pub text: String,
    pub max_players: u32,
    /// Show the player count; otherwise the entry is marked incompatible
    pub show_connection: bool,
}

/// A player attempting to log in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub username: String,
    pub ip: String,
}

/// Routing surface the state machine drives
pub trait Listener: Send + Sync {
    /// Route `hostnames` to the connect handler for `server`
    fn handle(&self, hostnames: &[String], server: &str);
    /// Relay connections for `hostnames` to `addr`
    fn forward(&self, hostnames: &[String], addr: &str);
    /// Return forwarded hostnames to handler mode
    fn stop_forwarding(&self, hostnames: &[String]);
    /// Publish the server-list entry for `hostnames`
    fn set_status(&self, hostnames: &[String], status: StatusLine);
    /// Remove `hostnames` entirely
    fn forget(&self, hostnames: &[String]);
}

/// Decides what a connecting player is told
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    async fn on_connect(&self, server: &str, player: &Player) -> String;
}

/// Told about every forwarded session, by instance IP
pub trait ForwardObserver: Send + Sync {
    fn on_forward_connect(&self, ip: &str);
    fn on_forward_disconnect(&self, ip: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Handler,
    Forward(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub server: Option<String>,
    pub mode: Mode,
    pub status: StatusLine,
}

/// Hostname routing table
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<String, RouteEntry>,
}

impl RouteTable {
    pub fn lookup(&self, hostname: &str) -> Option<RouteEntry> {
        self.routes
            .get(&normalize_hostname(hostname))
            .map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn upsert(&self, hostname: &str, update: impl FnOnce(&mut RouteEntry)) {
        let mut entry = self
            .routes
            .entry(normalize_hostname(hostname))
            .or_insert_with(|| RouteEntry {
                server: None,
                mode: Mode::Handler,
                status: StatusLine::default(),
            });
        update(entry.value_mut());
    }
}

impl Listener for RouteTable {
    fn handle(&self, hostnames: &[String], server: &str) {
        for hostname in hostnames {
            self.upsert(hostname, |entry| {
                entry.server = Some(server.to_string());
                entry.mode = Mode::Handler;
            });
        }
    }

    fn forward(&self, hostnames: &[String], addr: &str) {
        for hostname in hostnames {
            self.upsert(hostname, |entry| entry.mode = Mode::Forward(addr.to_string()));
        }
    }

    fn stop_forwarding(&self, hostnames: &[String]) {
        for hostname in hostnames {
            if let Some(mut entry) = self.routes.get_mut(&normalize_hostname(hostname)) {
                entry.mode = Mode::Handler;
            }
        }
    }

    fn set_status(&self, hostnames: &[String], status: StatusLine) {
        for hostname in hostnames {
            self.upsert(hostname, |entry| entry.status = status.clone());
        }
    }

    fn forget(&self, hostnames: &[String]) {
        for hostname in hostnames {
            self.routes.remove(&normalize_hostname(hostname));
        }
    }
}

/// Gateway timeouts
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Deadline for each packet read from a client
    pub read_timeout: Duration,
    /// Deadline for dialing an instance
    pub connect_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// The public game listener
pub struct Gateway {
    routes: RouteTable,
    handler: OnceLock<Arc<dyn ConnectHandler>>,
    observer: Arc<dyn ForwardObserver>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(observer: Arc<dyn ForwardObserver>, config: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            routes: RouteTable::default(),
            handler: OnceLock::new(),
            observer,
            config,
        })
    }

    /// Set the connect handler. Only the first call has any effect.
    pub fn install_handler(&self, handler: Arc<dyn ConnectHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("Connect handler already installed");
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Accept clients until shutdown is signalled
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown_rx: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Gateway listening");
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let gateway = Arc::clone(&self);
                            tokio::spawn(async move {
                                match gateway.handle_connection(stream, peer).await {
                                    Ok(()) => {}
                                    Err(e) if e.is_io() => {
                                        debug!(peer = %peer, error = %e, "Client connection closed");
                                    }
                                    Err(e) => {
                                        warn!(peer = %peer, error = %e, "Protocol error from client");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept client connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn read_frame(&self, stream: &mut TcpStream) -> Result<codec::Frame, CodecError> {
        timeout(self.config.read_timeout, codec::read_frame(stream))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), CodecError> {
        let frame = self.read_frame(&mut stream).await?;
        let handshake = Handshake::parse(frame.payload())?;
        let hostname = handshake.hostname();
        let route = self.routes.lookup(&hostname);

        debug!(peer = %peer, hostname = %hostname, next_state = handshake.next_state, "Client handshake");

        if let Some(RouteEntry { mode: Mode::Forward(addr), .. }) = &route {
            forwarder::relay(
                stream,
                frame.raw(),
                addr,
                self.observer.as_ref(),
                self.config.connect_timeout,
            )
            .await?;
            return Ok(());
        }

        match handshake.next_state {
            NEXT_STATE_STATUS => self.answer_status(stream, &handshake, route.as_ref()).await,
            NEXT_STATE_LOGIN => self.answer_login(stream, peer, route.as_ref()).await,
            other => Err(CodecError::UnsupportedState(other)),
        }
    }

    async fn answer_status(
        &self,
        mut stream: TcpStream,
        handshake: &Handshake,
        route: Option<&RouteEntry>,
    ) -> Result<(), CodecError> {
        let request = self.read_frame(&mut stream).await?;
        let mut reader = request.reader();
        let id = reader.read_varint()?;
        if id != STATUS_REQUEST_ID {
            return Err(CodecError::UnexpectedPacket(id));
        }
        reader.finish();

        let body = match route {
            Some(entry) => status_json(&entry.status, handshake.protocol_version),
            None => status_json(
                &StatusLine {
                    text: "Unknown host".to_string(),
                    ..Default::default()
                },
                handshake.protocol_version,
            ),
        };

        let mut response = Packet::new(STATUS_REQUEST_ID);
        response.write_string(&body);
        codec::write_packet(&mut stream, &response).await?;

        // Clients may close without pinging
        let ping = match self.read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return Ok(()),
        };
        let mut reader = ping.reader();
        let id = reader.read_varint()?;
        if id != PING_ID {
            return Err(CodecError::UnexpectedPacket(id));
        }
        let payload = reader.read_i64()?;
        reader.finish();

        let mut pong = Packet::new(PING_ID);
        pong.write_i64(payload);
        codec::write_packet(&mut stream, &pong).await?;
        stream.shutdown().await?;
        Ok(())
    }

    async fn answer_login(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        route: Option<&RouteEntry>,
    ) -> Result<(), CodecError> {
        let start = self.read_frame(&mut stream).await?;
        let mut reader = start.reader();
        let id = reader.read_varint()?;
        if id != LOGIN_START_ID {
            return Err(CodecError::UnexpectedPacket(id));
        }
        let username = reader.read_string()?;
        reader.finish();

        let player = Player {
            username,
            ip: peer.ip().to_string(),
        };

        let message = match (route.and_then(|entry| entry.server.as_deref()), self.handler.get()) {
            (Some(server), Some(handler)) => handler.on_connect(server, &player).await,
            (Some(_), None) => "The gateway is still starting. Try again shortly.".to_string(),
            (None, _) => {
                debug!(player = %player.username, "Login for unknown hostname");
                "Unknown hostname.".to_string()
            }
        };

        let mut disconnect = Packet::new(LOGIN_DISCONNECT_ID);
        disconnect.write_string(&serde_json::json!({ "text": message }).to_string());
        codec::write_packet(&mut stream, &disconnect).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

impl Listener for Gateway {
    fn handle(&self, hostnames: &[String], server: &str) {
        self.routes.handle(hostnames, server);
    }

    fn forward(&self, hostnames: &[String], addr: &str) {
        self.routes.forward(hostnames, addr);
    }

    fn stop_forwarding(&self, hostnames: &[String]) {
        self.routes.stop_forwarding(hostnames);
    }

    fn set_status(&self, hostnames: &[String], status: StatusLine) {
        self.routes.set_status(hostnames, status);
    }

    fn forget(&self, hostnames: &[String]) {
        self.routes.forget(hostnames);
    }
}

/// Status response document for the server list
pub fn status_json(status: &StatusLine, client_protocol: i32) -> String {
    let protocol = if status.show_connection { client_protocol } else { -1 };
    serde_json::json!({
        "version": { "name": "dropgate", "protocol": protocol },
        "players": { "max": status.max_players, "online": 0, "sample": [] },
        "description": { "text": status.text },
    })
    .to_string()
}
