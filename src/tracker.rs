//! Connection tracker and idle-shutdown scanner

use crate::error::LifecycleError;
use crate::fleet::Fleet;
use crate::gateway::ForwardObserver;
use crate::lifecycle::{Operation, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Counts forwarded sessions per server, matched by instance IP
#[derive(Debug)]
pub struct ConnectionTracker {
    fleet: Arc<Fleet>,
}

impl ConnectionTracker {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        Self { fleet }
    }

    /// Submit a shutdown for every server idle past its threshold
    pub fn scan_idle(&self, orchestrator: &Arc<Orchestrator>) -> Vec<JoinHandle<Result<(), LifecycleError>>> {
        let now = Instant::now();
        let mut submitted = Vec::new();

        for server in self.fleet.iter() {
            if !server.is_idle(now) {
                continue;
            }
            let idle_secs = now.saturating_duration_since(server.last_active()).as_secs();
            info!(server = %server.name(), idle_secs, "Server idle, shutting down");
            if let Some(handle) = orchestrator.submit(server, Operation::Shutdown) {
                submitted.push(handle);
            }
        }

        submitted
    }

    /// Scan every `interval` until shutdown is signalled
    pub async fn run(
        &self,
        orchestrator: Arc<Orchestrator>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.scan_idle(&orchestrator);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Connection tracker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl ForwardObserver for ConnectionTracker {
    fn on_forward_connect(&self, ip: &str) {
        match self.fleet.by_ip(ip) {
            Some(server) => {
                let connections = server.connection_opened();
                info!(server = %server.name(), ip, connections, "Player connected");
            }
            None => debug!(ip, "Forwarded connection to an unknown instance"),
        }
    }

    fn on_forward_disconnect(&self, ip: &str) {
        match self.fleet.by_ip(ip) {
            Some(server) => {
                let connections = server.connection_closed();
                info!(server = %server.name(), ip, connections, "Player disconnected");
            }
            None => debug!(ip, "Forwarded disconnect from an unknown instance"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn test_events_follow_instance_ip() {
        let fleet = Arc::new(Fleet::new(&[
            ServerConfig::new("alpha", &["alpha.example.com"]),
            ServerConfig::new("beta", &["beta.example.com"]),
        ]));
        let tracker = ConnectionTracker::new(Arc::clone(&fleet));
        let alpha = fleet.get("alpha").unwrap();
        let beta = fleet.get("beta").unwrap();
        alpha.record_instance(1, Some("10.0.0.1".to_string()));
        beta.record_instance(2, Some("10.0.0.2".to_string()));

        tracker.on_forward_connect("10.0.0.1");
        tracker.on_forward_connect("10.0.0.1");
        tracker.on_forward_connect("10.0.0.2");
        tracker.on_forward_disconnect("10.0.0.1");
        tracker.on_forward_connect("10.0.0.9");

        assert_eq!(alpha.connections(), 1);
        assert_eq!(beta.connections(), 1);

        tracker.on_forward_disconnect("10.0.0.2");
        tracker.on_forward_disconnect("10.0.0.2");
        assert_eq!(beta.connections(), 0);
    }
}
