//! Reconciliation loop
//!
//! Polls the provider and the health probe and folds what it sees back into
//! each server's state. Servers are reconciled concurrently; a slow probe on
//! one does not hold up the others.

use crate::context::Context;
use crate::error::ProviderError;
use crate::lifecycle::{Operation, Orchestrator};
use crate::phase::{self, Verdict};
use crate::provider::{self, Instance, InstanceStatus};
use crate::server::ManagedServer;
use crate::state::ServerState;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Monitor {
    orchestrator: Arc<Orchestrator>,
}

impl Monitor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    fn ctx(&self) -> &Context {
        self.orchestrator.context()
    }

    /// Poll until shutdown is signalled
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let timings = &self.ctx().timings;
        loop {
            let wait = match self.poll().await {
                Ok(true) => timings.transient_interval,
                Ok(false) => timings.monitor_interval,
                Err(e) => {
                    warn!(error = %e, "Failed to list instances");
                    timings.list_retry
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Reconcile every available server once.
    ///
    /// Returns whether any server is mid-transition, which shortens the
    /// next interval.
    pub async fn poll(&self) -> Result<bool, ProviderError> {
        let instances = self.ctx().provider.list_instances().await?;
        let servers: Vec<&Arc<ManagedServer>> = self
            .ctx()
            .fleet
            .iter()
            .filter(|server| server.is_available())
            .collect();

        let transient = join_all(
            servers
                .into_iter()
                .map(|server| self.reconcile(server, &instances)),
        )
        .await;
        Ok(transient.into_iter().any(|t| t))
    }

    async fn reconcile(&self, server: &Arc<ManagedServer>, instances: &[Instance]) -> bool {
        let ctx = self.ctx();
        if !server.is_settled(ctx.timings.operation_spacing) {
            debug!(server = %server.name(), "Operation in progress, skipping");
            return true;
        }

        let Some(instance) = provider::find_instance(instances, server.name()) else {
            ctx.set_state(server, ServerState::Off);
            return false;
        };
        server.record_instance(instance.id, instance.ip.clone());

        let current = server.state();

        // Powered off after our shutdown: snapshot regardless of action history
        if current == ServerState::Shutdown && instance.status == InstanceStatus::Off {
            info!(server = %server.name(), instance_id = instance.id, "Instance powered off, taking snapshot");
            self.orchestrator.submit(server, Operation::Snapshot);
            return true;
        }

        if !current.is_tearing_down() {
            if let Some(ip) = &instance.ip {
                if ctx.probe.is_responding(ip).await {
                    ctx.set_state(server, ServerState::Started);
                    return false;
                }
            }
        }

        let phase = match server.immune_phase() {
            Some(phase) => phase,
            None => match ctx.provider.latest_action(instance.id).await {
                Ok(action) => phase::derive(
                    action.as_ref(),
                    instance.status,
                    current == ServerState::Shutdown,
                ),
                Err(e) => {
                    warn!(server = %server.name(), instance_id = instance.id, error = %e, "Failed to fetch instance actions");
                    ctx.set_state(server, ServerState::Unavailable);
                    return false;
                }
            },
        };

        let verdict = phase::settle(current, phase);
        debug!(server = %server.name(), state = %current, phase = ?phase, verdict = ?verdict, "Reconciled");
        match verdict {
            Verdict::Set(next) => {
                ctx.set_state(server, next);
            }
            Verdict::Keep => {}
            Verdict::Snapshot => {
                self.orchestrator.submit(server, Operation::Snapshot);
            }
            Verdict::Destroy => {
                self.orchestrator.submit(server, Operation::Destroy);
            }
        }

        phase.is_transient() || matches!(verdict, Verdict::Snapshot | Verdict::Destroy)
    }
}
