//! Cloud provider abstraction
//!
//! The orchestrator and monitor only see this trait. [`digitalocean`] talks
//! to the real API; [`memory`] keeps everything in process for tests and
//! dry runs.

pub mod digitalocean;
pub mod memory;

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use digitalocean::DigitalOcean;
pub use memory::MemoryProvider;

/// Raw power status reported for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    New,
    Active,
    Off,
    Archive,
    #[serde(other)]
    Unknown,
}

/// A compute instance as listed by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: u64,
    pub name: String,
    /// Public IPv4 address, once assigned
    pub ip: Option<String>,
    pub status: InstanceStatus,
}

/// Kind of a provider action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Snapshot,
    Shutdown,
    Destroy,
    #[serde(other)]
    Other,
}

/// Progress of a provider action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    InProgress,
    Completed,
    Errored,
}

/// One entry of an instance's action history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderAction {
    pub id: u64,
    pub kind: ActionKind,
    pub status: ActionStatus,
}

/// A private disk image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: u64,
    pub name: String,
}

/// Parameters for creating an instance from an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image_id: u64,
    pub ssh_fingerprint: String,
}

/// Operations the control plane needs from a cloud provider
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// List every instance on the account
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError>;

    /// The most recent action issued against an instance
    async fn latest_action(&self, instance_id: u64)
        -> Result<Option<ProviderAction>, ProviderError>;

    /// Ask the instance to power off gracefully
    async fn shutdown(&self, instance_id: u64) -> Result<(), ProviderError>;

    /// Start a snapshot of a powered-off instance
    async fn snapshot(&self, instance_id: u64, name: &str) -> Result<(), ProviderError>;

    /// Delete an instance
    async fn delete_instance(&self, instance_id: u64) -> Result<(), ProviderError>;

    /// List the account's private images
    async fn list_images(&self) -> Result<Vec<Image>, ProviderError>;

    /// Delete a private image
    async fn delete_image(&self, image_id: u64) -> Result<(), ProviderError>;

    /// Create an instance
    async fn create_instance(&self, request: &CreateRequest) -> Result<Instance, ProviderError>;
}

/// Name of the instance that hosts a server
pub fn instance_name(server: &str) -> String {
    format!("{}-automated", server)
}

/// Name of a snapshot of a server taken at `timestamp` (unix seconds)
pub fn snapshot_name(server: &str, timestamp: i64) -> String {
    format!("{}-{}", server, timestamp)
}

/// Parse the timestamp out of a snapshot name belonging to `server`.
///
/// Returns `None` for images of other servers and for names whose suffix is
/// not a number.
pub fn snapshot_timestamp(server: &str, image_name: &str) -> Option<i64> {
    let suffix = image_name.strip_prefix(server)?.strip_prefix('-')?;
    suffix.parse().ok()
}

/// Find the instance hosting `server` in a listing
pub fn find_instance<'a>(instances: &'a [Instance], server: &str) -> Option<&'a Instance> {
    let name = instance_name(server);
    instances.iter().find(|instance| instance.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming() {
        assert_eq!(instance_name("survival"), "survival-automated");
        assert_eq!(snapshot_name("survival", 1700000000), "survival-1700000000");
    }

    #[test]
    fn test_snapshot_timestamp() {
        assert_eq!(snapshot_timestamp("srv", "srv-200"), Some(200));
        assert_eq!(snapshot_timestamp("srv", "srv-"), None);
        assert_eq!(snapshot_timestamp("srv", "srv-abc"), None);
        assert_eq!(snapshot_timestamp("srv", "srv2-100"), None);
        assert_eq!(snapshot_timestamp("srv", "other-100"), None);
        // A server whose name extends another's must not claim its snapshots
        assert_eq!(snapshot_timestamp("srv", "srv-extra-100"), None);
    }

    #[test]
    fn test_find_instance() {
        let instances = vec![
            Instance {
                id: 1,
                name: "primary".to_string(),
                ip: Some("10.0.0.1".to_string()),
                status: InstanceStatus::Active,
            },
            Instance {
                id: 2,
                name: "srv-automated".to_string(),
                ip: None,
                status: InstanceStatus::New,
            },
        ];

        assert_eq!(find_instance(&instances, "srv").map(|i| i.id), Some(2));
        assert!(find_instance(&instances, "primary").is_none());
    }

    #[test]
    fn test_status_decoding() {
        let status: InstanceStatus = serde_json::from_str("\"off\"").unwrap();
        assert_eq!(status, InstanceStatus::Off);
        let status: InstanceStatus = serde_json::from_str("\"rebooting\"").unwrap();
        assert_eq!(status, InstanceStatus::Unknown);

        let status: ActionStatus = serde_json::from_str("\"in-progress\"").unwrap();
        assert_eq!(status, ActionStatus::InProgress);
        let kind: ActionKind = serde_json::from_str("\"power_on\"").unwrap();
        assert_eq!(kind, ActionKind::Other);
    }
}
