//! In-process provider
//!
//! Keeps instances, images and action history in memory and records every
//! call made against it. Actions complete immediately. Used by the test
//! suite and by `dry_run` deployments.

use super::{
    ActionKind, ActionStatus, CloudProvider, CreateRequest, Image, Instance, InstanceStatus,
    ProviderAction,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// A call made against the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    ListInstances,
    LatestAction(u64),
    Shutdown(u64),
    Snapshot(u64, String),
    DeleteInstance(u64),
    ListImages,
    DeleteImage(u64),
    CreateInstance(CreateRequest),
}

/// Operation selector for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListInstances,
    LatestAction,
    Shutdown,
    Snapshot,
    DeleteInstance,
    ListImages,
    DeleteImage,
    CreateInstance,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    instances: Vec<Instance>,
    images: Vec<Image>,
    actions: HashMap<u64, ProviderAction>,
    calls: Vec<ProviderCall>,
    failures: HashMap<Operation, u32>,
}

impl Inner {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record_action(&mut self, instance_id: u64, kind: ActionKind, status: ActionStatus) {
        let id = self.allocate_id();
        self.actions
            .insert(instance_id, ProviderAction { id, kind, status });
    }

    /// Record the call, then consume one injected failure if any are pending
    fn enter(&mut self, call: ProviderCall, operation: Operation) -> Result<(), ProviderError> {
        debug!(?call, "Memory provider call");
        self.calls.push(call);

        if let Some(remaining) = self.failures.get_mut(&operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::Transport(format!(
                    "injected failure for {:?}",
                    operation
                )));
            }
        }
        Ok(())
    }

    fn instance_mut(&mut self, instance_id: u64) -> Result<&mut Instance, ProviderError> {
        self.instances
            .iter_mut()
            .find(|instance| instance.id == instance_id)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {}", instance_id)))
    }
}

/// Provider backed by in-memory state
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    instance_ip: String,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::with_instance_ip("127.0.0.1")
    }

    /// Created instances are given `ip` as their public address
    pub fn with_instance_ip(ip: &str) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1000,
                ..Default::default()
            }),
            instance_ip: ip.to_string(),
        }
    }

    /// Add an instance directly, returning its id
    pub fn insert_instance(&self, name: &str, ip: Option<&str>, status: InstanceStatus) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.allocate_id();
        inner.instances.push(Instance {
            id,
            name: name.to_string(),
            ip: ip.map(str::to_string),
            status,
        });
        id
    }

    /// Add an instance with a fixed id
    pub fn insert_instance_with_id(&self, id: u64, name: &str, ip: &str, status: InstanceStatus) {
        self.inner.lock().instances.push(Instance {
            id,
            name: name.to_string(),
            ip: Some(ip.to_string()),
            status,
        });
    }

    /// Add an image directly, returning its id
    pub fn insert_image(&self, name: &str) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.allocate_id();
        inner.images.push(Image {
            id,
            name: name.to_string(),
        });
        id
    }

    /// Overwrite an instance's power status
    pub fn set_status(&self, instance_id: u64, status: InstanceStatus) {
        let mut inner = self.inner.lock();
        if let Ok(instance) = inner.instance_mut(instance_id) {
            instance.status = status;
        }
    }

    /// Overwrite the latest action of an instance
    pub fn set_latest_action(&self, instance_id: u64, kind: ActionKind, status: ActionStatus) {
        self.inner.lock().record_action(instance_id, kind, status);
    }

    /// Make the next `times` calls of `operation` fail
    pub fn fail(&self, operation: Operation, times: u32) {
        self.inner.lock().failures.insert(operation, times);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn instances(&self) -> Vec<Instance> {
        self.inner.lock().instances.clone()
    }

    pub fn images(&self) -> Vec<Image> {
        self.inner.lock().images.clone()
    }

    /// Number of recorded calls matching a predicate
    pub fn count_calls(&self, predicate: impl Fn(&ProviderCall) -> bool) -> usize {
        self.inner.lock().calls.iter().filter(|c| predicate(c)).count()
    }
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let mut inner = self.inner.lock();
        inner.enter(ProviderCall::ListInstances, Operation::ListInstances)?;
        Ok(inner.instances.clone())
    }

    async fn latest_action(
        &self,
        instance_id: u64,
    ) -> Result<Option<ProviderAction>, ProviderError> {
        let mut inner = self.inner.lock();
        inner.enter(ProviderCall::LatestAction(instance_id), Operation::LatestAction)?;
        Ok(inner.actions.get(&instance_id).copied())
    }

    async fn shutdown(&self, instance_id: u64) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        inner.enter(ProviderCall::Shutdown(instance_id), Operation::Shutdown)?;
        inner.instance_mut(instance_id)?.status = InstanceStatus::Off;
        inner.record_action(instance_id, ActionKind::Shutdown, ActionStatus::Completed);
        Ok(())
    }

    async fn snapshot(&self, instance_id: u64, name: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        inner.enter(
            ProviderCall::Snapshot(instance_id, name.to_string()),
            Operation::Snapshot,
        )?;
        inner.instance_mut(instance_id)?;

        let id = inner.allocate_id();
        inner.images.push(Image {
            id,
            name: name.to_string(),
        });
        inner.record_action(instance_id, ActionKind::Snapshot, ActionStatus::Completed);
        Ok(())
    }

    async fn delete_instance(&self, instance_id: u64) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        inner.enter(ProviderCall::DeleteInstance(instance_id), Operation::DeleteInstance)?;
        inner.instance_mut(instance_id)?;
        inner.instances.retain(|instance| instance.id != instance_id);
        inner.actions.remove(&instance_id);
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<Image>, ProviderError> {
        let mut inner = self.inner.lock();
        inner.enter(ProviderCall::ListImages, Operation::ListImages)?;
        Ok(inner.images.clone())
    }

    async fn delete_image(&self, image_id: u64) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        inner.enter(ProviderCall::DeleteImage(image_id), Operation::DeleteImage)?;
        let before = inner.images.len();
        inner.images.retain(|image| image.id != image_id);
        if inner.images.len() == before {
            return Err(ProviderError::NotFound(format!("image {}", image_id)));
        }
        Ok(())
    }

    async fn create_instance(&self, request: &CreateRequest) -> Result<Instance, ProviderError> {
        let mut inner = self.inner.lock();
        inner.enter(
            ProviderCall::CreateInstance(request.clone()),
            Operation::CreateInstance,
        )?;

        if !inner.images.iter().any(|image| image.id == request.image_id) {
            return Err(ProviderError::NotFound(format!("image {}", request.image_id)));
        }

        let id = inner.allocate_id();
        let instance = Instance {
            id,
            name: request.name.clone(),
            ip: Some(self.instance_ip.clone()),
            status: InstanceStatus::Active,
        };
        inner.instances.push(instance.clone());
        inner.record_action(id, ActionKind::Create, ActionStatus::Completed);
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_round() {
        let provider = MemoryProvider::new();
        let image = provider.insert_image("srv-100");

        let created = provider
            .create_instance(&CreateRequest {
                name: "srv-automated".to_string(),
                region: "sgp1".to_string(),
                size: "1gb".to_string(),
                image_id: image,
                ssh_fingerprint: "aa".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(created.status, InstanceStatus::Active);
        assert_eq!(created.ip.as_deref(), Some("127.0.0.1"));

        provider.shutdown(created.id).await.unwrap();
        let action = provider.latest_action(created.id).await.unwrap().unwrap();
        assert_eq!(action.kind, ActionKind::Shutdown);
        assert_eq!(provider.instances()[0].status, InstanceStatus::Off);

        provider.snapshot(created.id, "srv-200").await.unwrap();
        assert_eq!(provider.images().len(), 2);

        provider.delete_instance(created.id).await.unwrap();
        assert!(provider.list_instances().await.unwrap().is_empty());
        assert!(provider.latest_action(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let provider = MemoryProvider::new();
        provider.fail(Operation::ListImages, 2);

        assert!(provider.list_images().await.is_err());
        assert!(provider.list_images().await.is_err());
        assert!(provider.list_images().await.is_ok());
        assert_eq!(provider.count_calls(|c| *c == ProviderCall::ListImages), 3);
    }

    #[tokio::test]
    async fn test_missing_resources() {
        let provider = MemoryProvider::new();
        assert!(matches!(
            provider.delete_instance(5).await,
            Err(ProviderError::NotFound(_))
        ));
        assert!(matches!(
            provider.delete_image(5).await,
            Err(ProviderError::NotFound(_))
        ));
        assert_eq!(provider.calls().len(), 2);
    }
}
