//! HTTP client for change-data-capture replicas

use super::{CaptureControl, DrainStatus};
use crate::common::labels::{peer_member_name, pod_name};
use crate::common::{ControllerConfig, Error, Result};
use crate::model::{ClusterSpec, ComponentKind};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
struct CaptureEntry {
    id: String,
    #[serde(default)]
    is_owner: bool,
    address: String,
}

#[derive(Debug, Serialize)]
struct DrainRequest<'a> {
    capture_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct DrainResponse {
    #[serde(default)]
    current_table_count: u32,
}

/// [`CaptureControl`] over the capture HTTP API of each replica
pub struct HttpCaptureControl {
    client: Client,
    port: u16,
}

impl HttpCaptureControl {
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        Self::with_timeout(config.capture_port, config.rpc_timeout)
    }

    pub fn with_timeout(port: u16, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, port })
    }

    /// `{pod}.{peer}.{ns}.{svc}:{port}` of one capture replica
    fn address(&self, cluster: &ClusterSpec, ordinal: u32) -> String {
        format!(
            "{}.{}.{}.{}:{}",
            pod_name(&cluster.name, ComponentKind::Cdc, ordinal),
            peer_member_name(&cluster.name, ComponentKind::Cdc),
            cluster.namespace,
            cluster.service_suffix(),
            self.port
        )
    }

    async fn list_captures(&self, address: &str) -> Result<Vec<CaptureEntry>> {
        let url = format!("http://{}/api/v1/captures", address);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Capture(format!(
                "list captures on {} failed with {}: {}",
                address,
                status,
                body.trim()
            )));
        }
        Ok(resp.json().await?)
    }

    /// All captures plus the entry for `address`
    async fn locate(&self, address: &str) -> Result<(Vec<CaptureEntry>, CaptureEntry)> {
        let captures = self.list_captures(address).await?;
        let this = captures
            .iter()
            .find(|c| c.address == address)
            .cloned()
            .ok_or_else(|| Error::Capture(format!("capture {} not registered", address)))?;
        Ok((captures, this))
    }
}

#[async_trait]
impl CaptureControl for HttpCaptureControl {
    async fn drain(&self, cluster: &ClusterSpec, ordinal: u32) -> Result<DrainStatus> {
        let address = self.address(cluster, ordinal);
        let (captures, this) = self.locate(&address).await?;

        // nowhere to move tables to; the owner resigns instead
        if captures.len() <= 1 || this.is_owner {
            return Ok(DrainStatus::default());
        }

        let url = format!("http://{}/api/v1/captures/drain", address);
        let resp = self
            .client
            .put(&url)
            .json(&DrainRequest {
                capture_id: &this.id,
            })
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::info!("capture {} asked to retry drain later", address);
            return Ok(DrainStatus {
                remaining: 0,
                retry: true,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Capture(format!(
                "drain {} failed with {}: {}",
                address,
                status,
                body.trim()
            )));
        }
        let body: DrainResponse = resp.json().await?;
        Ok(DrainStatus {
            remaining: body.current_table_count,
            retry: false,
        })
    }

    async fn resign_ownership(&self, cluster: &ClusterSpec, ordinal: u32) -> Result<bool> {
        let address = self.address(cluster, ordinal);
        let (captures, this) = self.locate(&address).await?;

        if !this.is_owner || captures.len() <= 1 {
            return Ok(true);
        }

        let url = format!("http://{}/api/v1/owner/resign", address);
        let resp = self.client.post(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Capture(format!(
                "resign owner {} failed with {}: {}",
                address,
                status,
                body.trim()
            )));
        }
        // ownership moves asynchronously; confirm on the next call
        tracing::info!("capture {} resigned ownership", address);
        Ok(false)
    }
}
