//! Per-process context shared by every component

use crate::config::{Config, TimingsConfig};
use crate::control::ControlClient;
use crate::fleet::Fleet;
use crate::gateway::Listener;
use crate::probe::HealthProbe;
use crate::provider::{CloudProvider, DigitalOcean, MemoryProvider};
use crate::server::ManagedServer;
use crate::state::{ServerState, Transition};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Instance that is never destroyed, whatever the provider claims
pub const PROTECTED_INSTANCE_ID: u64 = 3608740;

/// Resolved timing configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub monitor_interval: Duration,
    pub transient_interval: Duration,
    pub list_retry: Duration,
    pub tracker_interval: Duration,
    pub retry_backoff: Duration,
    pub operation_spacing: Duration,
    pub immunity: Duration,
    pub stop_timeout: Duration,
    pub socket_deadline: Duration,
    pub restore_wait: Duration,
}

impl From<&TimingsConfig> for Timings {
    fn from(config: &TimingsConfig) -> Self {
        Self {
            monitor_interval: Duration::from_secs(config.monitor_interval_secs),
            transient_interval: Duration::from_secs(config.transient_interval_secs),
            list_retry: Duration::from_secs(config.list_retry_secs),
            tracker_interval: Duration::from_secs(config.tracker_interval_secs),
            retry_backoff: Duration::from_secs(config.retry_backoff_secs),
            operation_spacing: Duration::from_secs(config.operation_spacing_secs),
            immunity: Duration::from_secs(config.immunity_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            socket_deadline: Duration::from_secs(config.socket_deadline_secs),
            restore_wait: Duration::from_secs(config.restore_wait_secs),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self::from(&TimingsConfig::default())
    }
}

/// Everything a component needs, passed explicitly at construction
pub struct Context {
    pub fleet: Arc<Fleet>,
    pub provider: Arc<dyn CloudProvider>,
    pub control: ControlClient,
    pub listener: Arc<dyn Listener>,
    pub probe: Arc<dyn HealthProbe>,
    pub timings: Timings,
    pub game_port: u16,
    protected: HashSet<u64>,
}

impl Context {
    pub fn new(
        fleet: Arc<Fleet>,
        provider: Arc<dyn CloudProvider>,
        control: ControlClient,
        listener: Arc<dyn Listener>,
        probe: Arc<dyn HealthProbe>,
        timings: Timings,
        game_port: u16,
    ) -> Self {
        Self {
            fleet,
            provider,
            control,
            listener,
            probe,
            timings,
            game_port,
            protected: HashSet::from([PROTECTED_INSTANCE_ID]),
        }
    }

    /// Add instance ids that must never be destroyed
    pub fn with_protected(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.protected.extend(ids);
        self
    }

    pub fn is_protected(&self, instance_id: u64) -> bool {
        self.protected.contains(&instance_id)
    }

    /// Change a server's state, publishing side effects through the listener
    pub fn set_state(&self, server: &ManagedServer, next: ServerState) -> Option<Transition> {
        server.set_state(next, self.listener.as_ref(), self.game_port)
    }
}

/// The provider described by the configuration
pub fn provider_from_config(config: &Config) -> anyhow::Result<Arc<dyn CloudProvider>> {
    if config.dry_run {
        warn!("Dry run: using the in-memory provider, no cloud resources will be touched");
        return Ok(Arc::new(MemoryProvider::new()));
    }
    Ok(Arc::new(DigitalOcean::new(&config.api_token, &config.api_url)?))
}
