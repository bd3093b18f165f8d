//! Cloud lifecycle orchestrator
//!
//! Drives an instance through shutdown, snapshot, destroy and restore.
//! Each operation holds the server's operation lock for its whole duration
//! and retries provider calls with a fixed backoff. Work is submitted
//! through [`Orchestrator::submit`], which keeps at most one operation per
//! server in flight.

use crate::context::Context;
use crate::control;
use crate::error::LifecycleError;
use crate::phase::{self, InstancePhase};
use crate::provider::{self, CreateRequest, Image, Instance};
use crate::server::ManagedServer;
use crate::state::ServerState;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SHUTDOWN_ATTEMPTS: u32 = 3;
const SNAPSHOT_ATTEMPTS: u32 = 5;
const DESTROY_ATTEMPTS: u32 = 3;
const RESTORE_ATTEMPTS: u32 = 3;

/// Snapshots kept per server
pub const SNAPSHOTS_KEPT: usize = 2;
const PRUNE_ATTEMPTS: u32 = 5;

/// A lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Shutdown,
    Snapshot,
    Destroy,
    Restore,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Shutdown => "shutdown",
            Self::Snapshot => "snapshot",
            Self::Destroy => "destroy",
            Self::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Releases the in-flight slot when the operation ends, even on panic
struct Flight<'a>(&'a ManagedServer);

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.0.end_flight();
    }
}

pub struct Orchestrator {
    ctx: Arc<Context>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Run `operation` in the background unless one is already in flight
    /// for this server.
    pub fn submit(
        self: &Arc<Self>,
        server: &Arc<ManagedServer>,
        operation: Operation,
    ) -> Option<JoinHandle<Result<(), LifecycleError>>> {
        if !server.begin_flight() {
            debug!(server = %server.name(), operation = %operation, "Operation already in flight, dropping");
            return None;
        }

        let orchestrator = Arc::clone(self);
        let server = Arc::clone(server);
        Some(tokio::spawn(async move {
            let _flight = Flight(server.as_ref());
            orchestrator.run(&server, operation).await
        }))
    }

    /// Run `operation` now, escalating exhausted retries to Unavailable
    pub async fn run(&self, server: &ManagedServer, operation: Operation) -> Result<(), LifecycleError> {
        let result = match operation {
            Operation::Shutdown => self.shutdown(server).await,
            Operation::Snapshot => self.snapshot(server).await,
            Operation::Destroy => self.destroy(server).await,
            Operation::Restore => self.restore(server).await,
        };

        match &result {
            Ok(()) => {}
            Err(e @ LifecycleError::Exhausted { .. }) => {
                error!(server = %server.name(), operation = %operation, error = %e, "Lifecycle operation failed");
                self.ctx.set_state(server, ServerState::Unavailable);
            }
            // Already reported where they were raised
            Err(LifecycleError::SafetyCheck { .. } | LifecycleError::NoSnapshot(_)) => {}
            Err(e) => {
                warn!(server = %server.name(), operation = %operation, error = %e, "Lifecycle operation aborted");
            }
        }
        result
    }

    async fn retry<T, F, Fut>(
        &self,
        server: &ManagedServer,
        operation: &'static str,
        attempts: u32,
        mut attempt_once: F,
    ) -> Result<T, LifecycleError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LifecycleError>>,
    {
        let mut last = String::new();
        for attempt in 1..=attempts {
            match attempt_once().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(server = %server.name(), operation, attempt, error = %e, "Provider call failed");
                    last = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.ctx.timings.retry_backoff).await;
                    }
                }
            }
        }
        Err(LifecycleError::Exhausted {
            operation,
            attempts,
            last,
        })
    }

    /// The server's instance, recording its id and address
    async fn locate(&self, server: &ManagedServer) -> Result<Instance, LifecycleError> {
        let instances = self.ctx.provider.list_instances().await?;
        let instance = provider::find_instance(&instances, server.name())
            .cloned()
            .ok_or_else(|| LifecycleError::NotRunning(server.name().to_string()))?;
        server.record_instance(instance.id, instance.ip.clone());
        Ok(instance)
    }

    /// Stop the game server and power off its instance
    pub async fn shutdown(&self, server: &ManagedServer) -> Result<(), LifecycleError> {
        let _guard = server.lock_operation(self.ctx.timings.operation_spacing).await;
        self.ctx.set_state(server, ServerState::Shutdown);

        control::stop_game_server(&self.ctx, server).await;

        self.retry(server, "shutdown", SHUTDOWN_ATTEMPTS, || self.power_off(server))
            .await
    }

    async fn power_off(&self, server: &ManagedServer) -> Result<(), LifecycleError> {
        let instance = self.locate(server).await?;

        // State is already Shutdown here, so a completed action on an active
        // instance must not be read as a pending power-off.
        let phase = match server.immune_phase() {
            Some(phase) => phase,
            None => {
                let action = self.ctx.provider.latest_action(instance.id).await?;
                phase::derive(action.as_ref(), instance.status, false)
            }
        };
        if matches!(phase, InstancePhase::ShuttingDown | InstancePhase::PoweredOff) {
            info!(server = %server.name(), instance_id = instance.id, "Instance already powering off");
            return Ok(());
        }

        self.ctx.provider.shutdown(instance.id).await?;
        server.set_immunity(InstancePhase::ShuttingDown, self.ctx.timings.immunity);
        self.ctx.set_state(server, ServerState::Shutdown);
        info!(server = %server.name(), instance_id = instance.id, "Instance powering off");
        Ok(())
    }

    /// Snapshot the powered-off instance, then prune old snapshots
    pub async fn snapshot(&self, server: &ManagedServer) -> Result<(), LifecycleError> {
        let _guard = server.lock_operation(self.ctx.timings.operation_spacing).await;

        let name = self
            .retry(server, "snapshot", SNAPSHOT_ATTEMPTS, || self.take_snapshot(server))
            .await?;
        server.set_immunity(InstancePhase::Snapshotting, self.ctx.timings.immunity);
        self.ctx.set_state(server, ServerState::Snapshot);
        info!(server = %server.name(), snapshot = %name, "Snapshot started");

        self.prune_snapshots(server).await;
        Ok(())
    }

    async fn take_snapshot(&self, server: &ManagedServer) -> Result<String, LifecycleError> {
        let instance = self.locate(server).await?;
        let name = provider::snapshot_name(server.name(), chrono::Utc::now().timestamp());
        self.ctx.provider.snapshot(instance.id, &name).await?;
        Ok(name)
    }

    /// Delete the oldest snapshots until at most [`SNAPSHOTS_KEPT`] remain
    pub async fn prune_snapshots(&self, server: &ManagedServer) {
        let mut attempts = 0;
        while attempts < PRUNE_ATTEMPTS {
            attempts += 1;

            let images = match self.ctx.provider.list_images().await {
                Ok(images) => images,
                Err(e) => {
                    warn!(server = %server.name(), error = %e, "Failed to list snapshots");
                    tokio::time::sleep(self.ctx.timings.retry_backoff).await;
                    continue;
                }
            };

            let owned = owned_snapshots(server.name(), &images);
            if owned.len() <= SNAPSHOTS_KEPT {
                return;
            }
            let Some((timestamp, oldest)) = owned.first() else {
                return;
            };

            match self.ctx.provider.delete_image(oldest.id).await {
                Ok(()) => {
                    info!(server = %server.name(), snapshot = %oldest.name, timestamp, "Deleted old snapshot")
                }
                Err(e) => {
                    warn!(server = %server.name(), snapshot = %oldest.name, error = %e, "Failed to delete old snapshot");
                    tokio::time::sleep(self.ctx.timings.retry_backoff).await;
                }
            }
        }
        warn!(server = %server.name(), "Gave up pruning snapshots");
    }

    /// Destroy the server's instance
    pub async fn destroy(&self, server: &ManagedServer) -> Result<(), LifecycleError> {
        let _guard = server.lock_operation(self.ctx.timings.operation_spacing).await;
        let instance = self
            .retry(server, "destroy", DESTROY_ATTEMPTS, || self.locate(server))
            .await?;
        self.delete_instance(server, instance.id).await
    }

    /// Destroy a specific instance on behalf of `server`
    pub async fn destroy_instance(
        &self,
        server: &ManagedServer,
        instance_id: u64,
    ) -> Result<(), LifecycleError> {
        let _guard = server.lock_operation(self.ctx.timings.operation_spacing).await;
        self.delete_instance(server, instance_id).await
    }

    async fn delete_instance(&self, server: &ManagedServer, instance_id: u64) -> Result<(), LifecycleError> {
        if self.ctx.is_protected(instance_id) {
            error!(
                server = %server.name(),
                instance_id,
                "Safety check failed: refusing to destroy protected instance"
            );
            return Err(LifecycleError::SafetyCheck { instance_id });
        }

        self.retry(server, "destroy", DESTROY_ATTEMPTS, || async move {
            self.ctx.provider.delete_instance(instance_id).await?;
            Ok::<_, LifecycleError>(())
        })
        .await?;

        server.set_immunity(InstancePhase::Destroying, self.ctx.timings.immunity);
        self.ctx.set_state(server, ServerState::Destroy);
        info!(server = %server.name(), instance_id, "Instance destroyed");
        Ok(())
    }

    /// Create a fresh instance from the newest snapshot
    pub async fn restore(&self, server: &ManagedServer) -> Result<(), LifecycleError> {
        let _guard = server.lock_operation(self.ctx.timings.operation_spacing).await;

        let image = match self
            .retry(server, "restore", RESTORE_ATTEMPTS, || self.latest_snapshot(server))
            .await
        {
            Ok(image) => image,
            Err(e @ LifecycleError::NoSnapshot(_)) => {
                error!(server = %server.name(), "No snapshot to restore from");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.wait_for_vacancy(server).await?;

        let settings = server.settings();
        let request = CreateRequest {
            name: provider::instance_name(server.name()),
            region: settings.droplet.region.clone(),
            size: settings.droplet.memory.clone(),
            image_id: image.id,
            ssh_fingerprint: settings.droplet.ssh_fingerprint.clone(),
        };

        let request = &request;
        let instance = self
            .retry(server, "restore", RESTORE_ATTEMPTS, || async move {
                Ok::<_, LifecycleError>(self.ctx.provider.create_instance(request).await?)
            })
            .await?;

        server.record_instance(instance.id, instance.ip.clone());
        server.set_immunity(InstancePhase::Creating, self.ctx.timings.immunity);
        self.ctx.set_state(server, ServerState::Starting);
        info!(
            server = %server.name(),
            instance_id = instance.id,
            snapshot = %image.name,
            "Restoring from snapshot"
        );
        Ok(())
    }

    async fn latest_snapshot(&self, server: &ManagedServer) -> Result<Image, LifecycleError> {
        let images = self.ctx.provider.list_images().await?;
        owned_snapshots(server.name(), &images)
            .pop()
            .map(|(_, image)| image.clone())
            .ok_or_else(|| LifecycleError::NoSnapshot(server.name().to_string()))
    }

    /// Wait until no instance of this server exists
    async fn wait_for_vacancy(&self, server: &ManagedServer) -> Result<(), LifecycleError> {
        for attempt in 1..=RESTORE_ATTEMPTS {
            let instances = self
                .retry(server, "restore", RESTORE_ATTEMPTS, || async move {
                    Ok::<_, LifecycleError>(self.ctx.provider.list_instances().await?)
                })
                .await?;
            let Some(existing) = provider::find_instance(&instances, server.name()) else {
                return Ok(());
            };

            warn!(
                server = %server.name(),
                instance_id = existing.id,
                attempt,
                "Instance already exists, waiting before restore"
            );
            if attempt < RESTORE_ATTEMPTS {
                tokio::time::sleep(self.ctx.timings.restore_wait).await;
            }
        }

        Err(LifecycleError::Exhausted {
            operation: "restore",
            attempts: RESTORE_ATTEMPTS,
            last: "instance still exists".to_string(),
        })
    }
}

/// Snapshots belonging to `server`, oldest first
fn owned_snapshots<'a>(server: &str, images: &'a [Image]) -> Vec<(i64, &'a Image)> {
    let mut owned: Vec<(i64, &Image)> = images
        .iter()
        .filter_map(|image| provider::snapshot_timestamp(server, &image.name).map(|ts| (ts, image)))
        .collect();
    owned.sort_by_key(|(timestamp, _)| *timestamp);
    owned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: u64, name: &str) -> Image {
        Image {
            id,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_owned_snapshots_sorted_and_filtered() {
        let images = vec![
            image(1, "srv-300"),
            image(2, "srv-100"),
            image(3, "other-50"),
            image(4, "srv-eu-200"),
            image(5, "srv-backup"),
        ];
        let owned = owned_snapshots("srv", &images);
        let ids: Vec<u64> = owned.iter().map(|(_, image)| image.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Restore.to_string(), "restore");
        assert_eq!(Operation::Destroy.to_string(), "destroy");
    }
}
