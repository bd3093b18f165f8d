//! A managed game server
//!
//! Holds everything the control plane knows about one configured server.
//! State changes go through [`ManagedServer::set_state`], which applies the
//! transition's side effects while holding the state lock. Lifecycle
//! operations are serialised by a separate async operation lock.

use crate::config::{DropletConfig, MessagesConfig, ServerConfig};
use crate::gateway::{Listener, StatusLine};
use crate::phase::{Immunity, InstancePhase};
use crate::state::{self, ServerState, SideEffect, Transition};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Normalise a player name for whitelist comparison
pub fn normalize_name(name: &str) -> String {
    name.replace(' ', "").to_lowercase()
}

/// Settings that can change on configuration reload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub hostnames: Vec<String>,
    pub available: bool,
    pub max_players: u32,
    pub idle_threshold: Duration,
    pub droplet: DropletConfig,
    pub messages: MessagesConfig,
    /// Normalised names allowed to start the server; empty allows everyone
    pub whitelist: HashSet<String>,
}

impl From<&ServerConfig> for ServerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            hostnames: config
                .hostnames
                .iter()
                .map(|h| crate::codec::normalize_hostname(h))
                .collect(),
            available: config.available,
            max_players: config.max_players,
            idle_threshold: config.idle_threshold(),
            droplet: config.droplet.clone(),
            messages: config.messages.clone(),
            whitelist: config.whitelist.iter().map(|n| normalize_name(n)).collect(),
        }
    }
}

impl ServerSettings {
    /// Whether `player` may cold-start the server
    pub fn may_start(&self, player: &str) -> bool {
        self.whitelist.is_empty() || self.whitelist.contains(&normalize_name(player))
    }
}

struct Slot {
    state: ServerState,
    ip: Option<String>,
    instance_id: Option<u64>,
    immunity: Option<Immunity>,
    pending_stop: Option<oneshot::Sender<()>>,
    shutdown_requested_at: Option<Instant>,
}

/// Held for the duration of a lifecycle operation; records when it finished
pub struct OperationGuard<'a> {
    finished_at: tokio::sync::MutexGuard<'a, Option<Instant>>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        *self.finished_at = Some(Instant::now());
    }
}

/// One logical game server
pub struct ManagedServer {
    name: String,
    settings: RwLock<ServerSettings>,
    slot: Mutex<Slot>,
    operation: tokio::sync::Mutex<Option<Instant>>,
    in_flight: AtomicBool,
    connections: AtomicI64,
    last_active: Mutex<Instant>,
}

impl std::fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedServer")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("ip", &self.ip())
            .field("connections", &self.connections())
            .finish()
    }
}

impl ManagedServer {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            settings: RwLock::new(ServerSettings::from(config)),
            slot: Mutex::new(Slot {
                state: ServerState::Initializing,
                ip: None,
                instance_id: None,
                immunity: None,
                pending_stop: None,
                shutdown_requested_at: None,
            }),
            operation: tokio::sync::Mutex::new(None),
            in_flight: AtomicBool::new(false),
            connections: AtomicI64::new(0),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> ServerSettings {
        self.settings.read().clone()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.settings.read().hostnames.clone()
    }

    pub fn is_available(&self) -> bool {
        self.settings.read().available
    }

    /// Replace the reloadable settings, returning the previous ones
    pub fn update_settings(&self, settings: ServerSettings) -> ServerSettings {
        std::mem::replace(&mut *self.settings.write(), settings)
    }

    pub fn state(&self) -> ServerState {
        self.slot.lock().state
    }

    pub fn ip(&self) -> Option<String> {
        self.slot.lock().ip.clone()
    }

    pub fn instance_id(&self) -> Option<u64> {
        self.slot.lock().instance_id
    }

    /// When the current shutdown was requested, if the server is shutting down
    pub fn shutdown_requested_at(&self) -> Option<Instant> {
        self.slot.lock().shutdown_requested_at
    }

    /// Record the instance currently hosting this server
    pub fn record_instance(&self, instance_id: u64, ip: Option<String>) {
        let mut slot = self.slot.lock();
        slot.instance_id = Some(instance_id);
        if ip.is_some() {
            slot.ip = ip;
        }
    }

    /// Record the address an agent reported from
    pub fn record_ip(&self, ip: &str) {
        self.slot.lock().ip = Some(ip.to_string());
    }

    /// Trust `phase` over the provider until `window` has passed
    pub fn set_immunity(&self, phase: InstancePhase, window: Duration) {
        self.slot.lock().immunity = Some(Immunity {
            phase,
            until: Instant::now() + window,
        });
    }

    /// The locally recorded phase, if its window is still open
    pub fn immune_phase(&self) -> Option<InstancePhase> {
        let slot = self.slot.lock();
        slot.immunity
            .and_then(|immunity| immunity.active_at(Instant::now()))
    }

    /// Change state, applying the transition's side effects under the state lock.
    ///
    /// Returns the applied transition, or `None` if `next` repeated the
    /// current state.
    pub fn set_state(
        &self,
        next: ServerState,
        listener: &dyn Listener,
        game_port: u16,
    ) -> Option<Transition> {
        let mut slot = self.slot.lock();
        let transition = state::plan(slot.state, next)?;

        if transition.nominal {
            info!(server = %self.name, from = %transition.from, to = %transition.to, "State changed");
        } else {
            info!(
                server = %self.name,
                from = %transition.from,
                to = %transition.to,
                "Reconciled state change"
            );
        }

        slot.state = next;
        match next {
            ServerState::Off => {
                slot.ip = None;
                slot.instance_id = None;
                slot.immunity = None;
            }
            ServerState::Shutdown => {
                slot.shutdown_requested_at = Some(Instant::now());
            }
            _ => {}
        }
        if !next.is_tearing_down() {
            slot.shutdown_requested_at = None;
        }

        self.apply_effects(&slot, &transition.effects, listener, game_port);
        Some(transition)
    }

    /// Re-publish routes and status for the current state
    pub fn refresh(&self, listener: &dyn Listener, game_port: u16) {
        let slot = self.slot.lock();
        let effects = if slot.state == ServerState::Started {
            vec![SideEffect::RegisterForward]
        } else {
            vec![SideEffect::RegisterHandler, SideEffect::SetStatus]
        };
        self.apply_effects(&slot, &effects, listener, game_port);
    }

    fn apply_effects(
        &self,
        slot: &Slot,
        effects: &[SideEffect],
        listener: &dyn Listener,
        game_port: u16,
    ) {
        let settings = self.settings.read();
        let hostnames = &settings.hostnames;

        for effect in effects {
            match effect {
                SideEffect::StopForwarding => listener.stop_forwarding(hostnames),
                SideEffect::RegisterHandler => listener.handle(hostnames, &self.name),
                SideEffect::SetStatus => {
                    listener.set_status(hostnames, status_line(slot.state, &settings))
                }
                SideEffect::RegisterForward => match &slot.ip {
                    Some(ip) => {
                        let addr = format!("{}:{}", ip, game_port);
                        debug!(server = %self.name, addr = %addr, "Forwarding to instance");
                        listener.forward(hostnames, &addr);
                    }
                    None => {
                        warn!(server = %self.name, "Started without a known address, not forwarding");
                        listener.handle(hostnames, &self.name);
                        listener.set_status(hostnames, status_line(slot.state, &settings));
                    }
                },
                SideEffect::ResetIdleBaseline => self.reset_idle_baseline(),
            }
        }
    }

    /// Arm the stop signal and return the receiving side
    pub fn arm_stop(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.slot.lock().pending_stop = Some(tx);
        rx
    }

    /// Fire the pending stop signal. Returns false if no stop was pending.
    pub fn complete_stop(&self) -> bool {
        match self.slot.lock().pending_stop.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Drop a pending stop signal that will no longer be awaited
    pub fn disarm_stop(&self) {
        self.slot.lock().pending_stop = None;
    }

    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Count a new forwarded connection
    pub fn connection_opened(&self) -> i64 {
        self.connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count a closed forwarded connection. The count never drops below zero.
    pub fn connection_closed(&self) -> i64 {
        let previous = self
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n - 1)
            });

        match previous {
            Ok(1) => {
                info!(server = %self.name, "All players have left");
                self.reset_idle_baseline();
                0
            }
            Ok(n) => n - 1,
            Err(_) => {
                warn!(server = %self.name, "Disconnect without a matching connect");
                0
            }
        }
    }

    pub fn reset_idle_baseline(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Whether the server is Started, empty and idle past its threshold at `now`
    pub fn is_idle(&self, now: Instant) -> bool {
        let threshold = self.settings.read().idle_threshold;
        self.state() == ServerState::Started
            && self.connections() == 0
            && now.saturating_duration_since(self.last_active()) >= threshold
    }

    /// Claim the single in-flight operation slot
    pub fn begin_flight(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_flight(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Take the operation lock, waiting out `spacing` after the previous operation
    pub async fn lock_operation(&self, spacing: Duration) -> OperationGuard<'_> {
        let finished_at = self.operation.lock().await;
        if let Some(last) = *finished_at {
            tokio::time::sleep_until(last + spacing).await;
        }
        OperationGuard { finished_at }
    }

    /// Whether the server is free for the monitor to reconcile: no operation
    /// running and none finished within `spacing`
    pub fn is_settled(&self, spacing: Duration) -> bool {
        if self.in_flight() {
            return false;
        }
        match self.operation.try_lock() {
            Ok(finished_at) => match *finished_at {
                Some(last) => last.elapsed() >= spacing,
                None => true,
            },
            Err(_) => false,
        }
    }
}

/// Server-list entry for a state
pub fn status_line(state: ServerState, settings: &ServerSettings) -> StatusLine {
    StatusLine {
        text: state.status_text(&settings.messages),
        max_players: settings.max_players,
        show_connection: state.shows_connection(),
    }
}
