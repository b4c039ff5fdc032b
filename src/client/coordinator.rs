//! HTTP client for the placement coordinator's control API

use super::{MemberHealth, ReplicationConfig, StoreControl, StoreInfo};
use crate::common::{ControllerConfig, Error, Result};
use crate::model::ClusterSpec;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

const API_PREFIX: &str = "/pd/api/v1";
/// Store state filter selecting tombstones
const TOMBSTONE_STATE: u8 = 2;
const EVICT_LEADER_SCHEDULER: &str = "evict-leader-scheduler";

#[derive(Debug, Deserialize)]
struct StoresResponse {
    #[serde(default)]
    stores: Vec<StoreEntry>,
}

#[derive(Debug, Deserialize)]
struct StoreEntry {
    store: Option<StoreMeta>,
    status: Option<StoreStats>,
}

#[derive(Debug, Deserialize)]
struct StoreMeta {
    id: u64,
    #[serde(default)]
    address: String,
    #[serde(default)]
    labels: Vec<StoreLabel>,
    #[serde(default)]
    state_name: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct StoreLabel {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct StoreStats {
    #[serde(default)]
    leader_count: u32,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    name: String,
    #[serde(default)]
    health: bool,
}

impl StoreEntry {
    /// Entries without store metadata or status are still registering
    fn into_info(self) -> Option<StoreInfo> {
        let store = self.store?;
        let status = self.status?;
        Some(StoreInfo {
            id: store.id,
            address: store.address,
            state_name: store.state_name,
            labels: store
                .labels
                .into_iter()
                .map(|l| (l.key, l.value))
                .collect(),
            leader_count: status.leader_count,
        })
    }
}

/// The coordinator encodes list and bool settings as strings
fn parse_replication(value: &Value) -> ReplicationConfig {
    let location_labels = match value.get("location-labels") {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    };
    let enable_placement_rules = match value.get("enable-placement-rules") {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    let max_replicas = value
        .get("max-replicas")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    ReplicationConfig {
        location_labels,
        enable_placement_rules,
        max_replicas,
    }
}

/// [`StoreControl`] over the coordinator's HTTP API
pub struct HttpStoreControl {
    client: Client,
    url_override: Option<String>,
    port: u16,
}

impl HttpStoreControl {
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        Self::with_timeout(
            config.coordinator_url.clone(),
            config.coordinator_port,
            config.rpc_timeout,
        )
    }

    pub fn with_timeout(
        url_override: Option<String>,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url_override,
            port,
        })
    }

    fn base_url(&self, cluster: &ClusterSpec) -> String {
        match &self.url_override {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "http://{}-coordinator.{}.{}:{}",
                cluster.name,
                cluster.namespace,
                cluster.service_suffix(),
                self.port
            ),
        }
    }

    async fn call(
        &self,
        cluster: &ClusterSpec,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, String)> {
        let url = format!("{}{}{}", self.base_url(cluster), API_PREFIX, path);
        let mut req = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        tracing::debug!("{} {} -> {}", method, url, status);
        Ok((status, text))
    }

    async fn expect_ok(
        &self,
        cluster: &ClusterSpec,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<String> {
        let (status, text) = self.call(cluster, method.clone(), path, body).await?;
        if !status.is_success() {
            return Err(Error::Store(format!(
                "{} {} failed with {}: {}",
                method,
                path,
                status,
                text.trim()
            )));
        }
        Ok(text)
    }

    async fn list_stores(&self, cluster: &ClusterSpec, path: &str) -> Result<Vec<StoreInfo>> {
        let text = self.expect_ok(cluster, Method::GET, path, None).await?;
        let resp: StoresResponse = serde_json::from_str(&text)?;
        Ok(resp
            .stores
            .into_iter()
            .filter_map(StoreEntry::into_info)
            .collect())
    }
}

#[async_trait]
impl StoreControl for HttpStoreControl {
    async fn get_stores(&self, cluster: &ClusterSpec) -> Result<Vec<StoreInfo>> {
        self.list_stores(cluster, "/stores").await
    }

    async fn get_tombstone_stores(&self, cluster: &ClusterSpec) -> Result<Vec<StoreInfo>> {
        self.list_stores(cluster, &format!("/stores?state={}", TOMBSTONE_STATE))
            .await
    }

    async fn get_config(&self, cluster: &ClusterSpec) -> Result<ReplicationConfig> {
        let text = self
            .expect_ok(cluster, Method::GET, "/config/replicate", None)
            .await?;
        let value: Value = serde_json::from_str(&text)?;
        Ok(parse_replication(&value))
    }

    async fn update_replication_config(
        &self,
        cluster: &ClusterSpec,
        config: &ReplicationConfig,
    ) -> Result<()> {
        let mut body = serde_json::Map::new();
        if let Some(enable) = config.enable_placement_rules {
            body.insert("enable-placement-rules".into(), json!(enable.to_string()));
        }
        if !config.location_labels.is_empty() {
            body.insert(
                "location-labels".into(),
                json!(config.location_labels.join(",")),
            );
        }
        if config.max_replicas > 0 {
            body.insert("max-replicas".into(), json!(config.max_replicas));
        }
        self.expect_ok(
            cluster,
            Method::POST,
            "/config/replicate",
            Some(Value::Object(body)),
        )
        .await?;
        Ok(())
    }

    async fn set_store_labels(
        &self,
        cluster: &ClusterSpec,
        store_id: u64,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let (status, text) = self
            .call(
                cluster,
                Method::POST,
                &format!("/store/{}/label", store_id),
                Some(json!(labels)),
            )
            .await?;
        if status.is_success() {
            return Ok(true);
        }
        Err(Error::Store(format!(
            "set labels on store {} failed with {}: {}",
            store_id,
            status,
            text.trim()
        )))
    }

    async fn delete_store(&self, cluster: &ClusterSpec, store_id: u64) -> Result<()> {
        let (status, text) = self
            .call(cluster, Method::DELETE, &format!("/store/{}", store_id), None)
            .await?;
        // already gone
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Error::Store(format!(
            "delete store {} failed with {}: {}",
            store_id,
            status,
            text.trim()
        )))
    }

    async fn begin_evict_leader(&self, cluster: &ClusterSpec, store_id: u64) -> Result<()> {
        let body = json!({ "name": EVICT_LEADER_SCHEDULER, "store_id": store_id });
        let (status, text) = self
            .call(cluster, Method::POST, "/schedulers", Some(body))
            .await?;
        if status.is_success() || text.contains("already exists") {
            return Ok(());
        }
        Err(Error::Store(format!(
            "begin evict leader on store {} failed with {}: {}",
            store_id,
            status,
            text.trim()
        )))
    }

    async fn end_evict_leader(&self, cluster: &ClusterSpec, store_id: u64) -> Result<()> {
        let path = format!("/schedulers/{}-{}", EVICT_LEADER_SCHEDULER, store_id);
        let (status, text) = self.call(cluster, Method::DELETE, &path, None).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Error::Store(format!(
            "end evict leader on store {} failed with {}: {}",
            store_id,
            status,
            text.trim()
        )))
    }

    async fn get_members(&self, cluster: &ClusterSpec) -> Result<Vec<MemberHealth>> {
        let text = self.expect_ok(cluster, Method::GET, "/health", None).await?;
        let entries: Vec<HealthEntry> = serde_json::from_str(&text)?;
        Ok(entries
            .into_iter()
            .map(|e| MemberHealth {
                name: e.name,
                healthy: e.health,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(url: String) -> HttpStoreControl {
        HttpStoreControl::with_timeout(Some(url), 2379, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_get_stores_skips_incomplete_entries() {
        let router = Router::new().route(
            "/pd/api/v1/stores",
            get(|| async {
                Json(json!({
                    "count": 2,
                    "stores": [
                        {
                            "store": {
                                "id": 1,
                                "address": "basic-storage-0.basic-storage-peer.default.svc:20160",
                                "labels": [{"key": "zone", "value": "z1"}],
                                "state_name": "Up"
                            },
                            "status": {"leader_count": 7}
                        },
                        { "store": { "id": 2, "address": "x:1", "state_name": "Up" } }
                    ]
                }))
            }),
        );
        let url = serve(router).await;
        let cluster = ClusterSpec::new("default", "basic");

        let stores = client(url).get_stores(&cluster).await.unwrap();
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].id, 1);
        assert_eq!(stores[0].leader_count, 7);
        assert_eq!(stores[0].labels.get("zone").map(String::as_str), Some("z1"));
    }

    #[tokio::test]
    async fn test_replication_config_string_encoding() {
        let router = Router::new().route(
            "/pd/api/v1/config/replicate",
            get(|| async {
                Json(json!({
                    "max-replicas": 3,
                    "location-labels": "zone,host",
                    "enable-placement-rules": "false"
                }))
            }),
        );
        let url = serve(router).await;
        let cluster = ClusterSpec::new("default", "basic");

        let config = client(url).get_config(&cluster).await.unwrap();
        assert_eq!(config.location_labels, vec!["zone", "host"]);
        assert_eq!(config.enable_placement_rules, Some(false));
        assert_eq!(config.max_replicas, 3);
    }

    #[tokio::test]
    async fn test_delete_store_not_found_is_success() {
        let router = Router::new()
            .route(
                "/pd/api/v1/store/:id",
                delete(|| async { (StatusCode::NOT_FOUND, "store not found") }),
            )
            .route(
                "/pd/api/v1/store/:id/label",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            );
        let url = serve(router).await;
        let cluster = ClusterSpec::new("default", "basic");
        let client = client(url);

        client.delete_store(&cluster, 9).await.unwrap();
        let err = client
            .set_store_labels(&cluster, 9, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn test_default_base_url() {
        let client = HttpStoreControl::with_timeout(None, 2379, Duration::from_secs(1)).unwrap();
        let mut cluster = ClusterSpec::new("prod", "basic");
        assert_eq!(
            client.base_url(&cluster),
            "http://basic-coordinator.prod.svc:2379"
        );
        cluster.cluster_domain = "cluster.local".into();
        assert_eq!(
            client.base_url(&cluster),
            "http://basic-coordinator.prod.svc.cluster.local:2379"
        );
    }
}
