//! DigitalOcean REST API backend

use super::{
    ActionKind, ActionStatus, CloudProvider, CreateRequest, Image, Instance, InstanceStatus,
    ProviderAction,
};
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default API endpoint
pub const DEFAULT_API_URL: &str = "https://api.digitalocean.com/v2";

const PAGE: &str = "page=1&per_page=100";

/// DigitalOcean API client
pub struct DigitalOcean {
    http_client: reqwest::Client,
    base_url: String,
    token: String,
}

impl DigitalOcean {
    pub fn new(token: &str, base_url: &str) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(text));
        }

        Err(ProviderError::Api {
            status: status.as_u16(),
            message: text,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProviderError> {
        debug!(path, "GET");
        let response = self
            .http_client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;

        Ok(Self::check(response).await?.json().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        debug!(path, "POST");
        let response = self
            .http_client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        Ok(Self::check(response).await?.json().await?)
    }

    async fn delete(&self, path: &str) -> Result<(), ProviderError> {
        debug!(path, "DELETE");
        let response = self
            .http_client
            .delete(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for DigitalOcean {
    async fn list_instances(&self) -> Result<Vec<Instance>, ProviderError> {
        let body: DropletList = self.get(&format!("/droplets?{}", PAGE)).await?;
        Ok(body.droplets.into_iter().map(Instance::from).collect())
    }

    async fn latest_action(
        &self,
        instance_id: u64,
    ) -> Result<Option<ProviderAction>, ProviderError> {
        let body: ActionList = self
            .get(&format!("/droplets/{}/actions?{}", instance_id, PAGE))
            .await?;
        Ok(latest(body.actions))
    }

    async fn shutdown(&self, instance_id: u64) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .post(
                &format!("/droplets/{}/actions", instance_id),
                &ActionRequest {
                    kind: "shutdown",
                    name: None,
                },
            )
            .await?;
        Ok(())
    }

    async fn snapshot(&self, instance_id: u64, name: &str) -> Result<(), ProviderError> {
        let _: serde_json::Value = self
            .post(
                &format!("/droplets/{}/actions", instance_id),
                &ActionRequest {
                    kind: "snapshot",
                    name: Some(name),
                },
            )
            .await?;
        Ok(())
    }

    async fn delete_instance(&self, instance_id: u64) -> Result<(), ProviderError> {
        self.delete(&format!("/droplets/{}", instance_id)).await
    }

    async fn list_images(&self) -> Result<Vec<Image>, ProviderError> {
        let body: ImageList = self
            .get(&format!("/images?private=true&{}", PAGE))
            .await?;
        Ok(body
            .images
            .into_iter()
            .map(|image| Image {
                id: image.id,
                name: image.name,
            })
            .collect())
    }

    async fn delete_image(&self, image_id: u64) -> Result<(), ProviderError> {
        self.delete(&format!("/images/{}", image_id)).await
    }

    async fn create_instance(&self, request: &CreateRequest) -> Result<Instance, ProviderError> {
        let body = DropletCreate {
            name: &request.name,
            region: &request.region,
            size: &request.size,
            image: request.image_id,
            ssh_keys: vec![&request.ssh_fingerprint],
        };
        let created: DropletEnvelope = self.post("/droplets", &body).await?;
        Ok(created.droplet.into())
    }
}

fn latest(actions: Vec<Action>) -> Option<ProviderAction> {
    actions
        .into_iter()
        .max_by_key(|action| action.id)
        .map(|action| ProviderAction {
            id: action.id,
            kind: action.kind,
            status: action.status,
        })
}

#[derive(Debug, Deserialize)]
struct DropletList {
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    status: InstanceStatus,
    #[serde(default)]
    networks: Networks,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type", default)]
    kind: String,
}

impl From<Droplet> for Instance {
    fn from(droplet: Droplet) -> Self {
        let ip = droplet
            .networks
            .v4
            .iter()
            .find(|network| network.kind == "public")
            .or_else(|| droplet.networks.v4.first())
            .map(|network| network.ip_address.clone());

        Instance {
            id: droplet.id,
            name: droplet.name,
            ip,
            status: droplet.status,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ActionList {
    actions: Vec<Action>,
}

#[derive(Debug, Deserialize)]
struct Action {
    id: u64,
    #[serde(rename = "type")]
    kind: ActionKind,
    status: ActionStatus,
}

#[derive(Debug, Serialize)]
struct ActionRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ImageList {
    images: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    id: u64,
    name: String,
}

#[derive(Debug, Serialize)]
struct DropletCreate<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: u64,
    ssh_keys: Vec<&'a str>,
}
