//! Outbound supervisor RPCs and the coordination that keeps the catalog in
//! step with the control plane.
//!
//! The client is deliberately blocking: supervisor calls happen on the
//! blocking worker pool (`tokio::task::spawn_blocking`), never on the
//! request scheduler. Callers await the worker's completion; the RPCs are
//! not cancellable by the inbound request.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::{CatalogRepository, NewSupervisor, Supervisor};
use crate::config::ProxyConfig;
use crate::errors::{ProxyError, Result};
use crate::schema::{NodeMetadata, RegistrySchema, ResourcesResult, SupervisorInfo};
use crate::utils::{is_loopback_host, resources_etag, url_host, url_join};

// ── Client ───────────────────────────────────────────────────────────────────

/// Response envelope from the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorResponse<T> {
    pub status: u16,
    pub result: Option<T>,
    pub text: String,
}

impl<T> SupervisorResponse<T> {
    /// 2xx, plus 304 for the etag-checked resources upload.
    pub fn success(&self) -> bool {
        (200..300).contains(&self.status) || self.status == 304
    }
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    #[serde(default)]
    result: Option<T>,
}

/// Blocking HTTP client for the supervisor.
///
/// Initial contact authenticates with the cluster key; post-connect calls
/// authenticate with the node key the supervisor assigned.
pub struct SupervisorClient {
    base_url: String,
    cluster_id: String,
    cluster_key: Option<String>,
    node_id: Option<String>,
    node_key: Option<String>,
    http: reqwest::blocking::Client,
}

impl SupervisorClient {
    pub fn new(base_url: &str, cluster_id: &str, timeout: u64) -> Self {
        SupervisorClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            cluster_id: cluster_id.to_string(),
            cluster_key: None,
            node_id: None,
            node_key: None,
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(timeout))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
        }
    }

    pub fn with_cluster_key(mut self, cluster_key: &str) -> Self {
        self.cluster_key = Some(cluster_key.to_string());
        self
    }

    pub fn with_node(mut self, node_id: &str, node_key: Option<&str>) -> Self {
        self.node_id = Some(node_id.to_string());
        self.node_key = node_key.map(|k| k.to_string());
        self
    }

    fn apply_auth(&self, mut request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        request = request.header("X-Cluster-Id", &self.cluster_id);
        if let Some(key) = &self.cluster_key {
            request = request.header("X-Cluster-Key", key);
        }
        if let Some(node_id) = &self.node_id {
            request = request.header("X-Node-Id", node_id);
        }
        if let Some(node_key) = &self.node_key {
            request = request.header("X-Node-Key", node_key);
        }
        request
    }

    fn parse<T: DeserializeOwned>(
        response: reqwest::blocking::Response,
    ) -> Result<SupervisorResponse<T>> {
        let status = response.status().as_u16();
        let text = response
            .text()
            .map_err(|e| ProxyError::Internal(format!("supervisor response read failed: {}", e)))?;
        let result = if text.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<Envelope<T>>(&text)
                .ok()
                .and_then(|envelope| envelope.result)
        };
        Ok(SupervisorResponse { status, result, text })
    }

    /// Registers a service node with the supervisor.
    pub fn add_node(&self, metadata: &NodeMetadata) -> Result<SupervisorResponse<SupervisorInfo>> {
        let url = url_join(&self.base_url, "add_node");
        let response = self
            .apply_auth(self.http.post(&url))
            .json(metadata)
            .send()
            .map_err(|e| ProxyError::Internal(format!("connect to supervisor failed: {}", e)))?;
        Self::parse(response)
    }

    /// Uploads a resources snapshot. May answer 304 when the supervisor
    /// already holds an identical set.
    pub fn upload_resources(&self, resources: &Value) -> Result<SupervisorResponse<ResourcesResult>> {
        let url = url_join(&self.base_url, "resources");
        let response = self
            .apply_auth(self.http.post(&url))
            .json(resources)
            .send()
            .map_err(|e| ProxyError::Internal(format!("resources upload failed: {}", e)))?;
        Self::parse(response)
    }

    /// Fetches the supervisor's service info document.
    pub fn get_info(&self) -> Result<SupervisorResponse<Value>> {
        let url = url_join(&self.base_url, "info");
        let response = self
            .apply_auth(self.http.get(&url))
            .send()
            .map_err(|e| ProxyError::Internal(format!("supervisor info failed: {}", e)))?;
        Self::parse(response)
    }
}

// ── Coordination ─────────────────────────────────────────────────────────────

/// Connect/sync coordination between registrations and the supervisor.
pub struct SupervisorCoordinator {
    config: Arc<ProxyConfig>,
    catalog: Arc<dyn CatalogRepository>,
}

impl SupervisorCoordinator {
    pub fn new(config: Arc<ProxyConfig>, catalog: Arc<dyn CatalogRepository>) -> Self {
        SupervisorCoordinator { config, catalog }
    }

    /// Reconciles a placeholder supervisor row from an `add_node` response.
    async fn save_supervisor(
        &self,
        mut placeholder: Supervisor,
        info: &SupervisorInfo,
    ) -> Result<Supervisor> {
        placeholder.node_id = Some(info.node_id.clone());
        placeholder.public_key = info.public_key.clone();
        placeholder.backup_urls = info.backup_urls.clone();
        if info.url.is_some() {
            placeholder.url = info.url.clone();
        }
        placeholder.local = info.local
            || url_host(&placeholder.base_url)
                .map(|host| is_loopback_host(&host))
                .unwrap_or(false);
        self.catalog.update_supervisor(placeholder).await
    }

    async fn abort_connect(&self, placeholder_id: i64, service_id: i64, err: ProxyError) -> ProxyError {
        if let Err(cleanup) = self.catalog.delete_supervisor(placeholder_id).await {
            warn!(error = %cleanup, "placeholder supervisor cleanup failed");
        }
        if let Err(cleanup) = self.catalog.set_service_node_id(service_id, None).await {
            warn!(error = %cleanup, "service node reset failed");
        }
        err
    }

    /// Connects a service to the supervisor for the first time.
    ///
    /// Creates a placeholder row, posts `add_node` on the worker pool,
    /// reconciles (or deletes) the placeholder, binds the node id to the
    /// service and pushes the initial resources snapshot.
    pub async fn connect_supervisor(&self, service_id: i64, data: &RegistrySchema) -> Result<()> {
        let service = self
            .catalog
            .find_service_by_id(service_id)
            .await?
            .ok_or_else(|| ProxyError::Internal(format!("service [{}] not found", service_id)))?;

        let ops_api = service
            .ops_api
            .clone()
            .or_else(|| (!data.ops_api.is_empty()).then(|| data.ops_api.clone()));
        let placeholder = self
            .catalog
            .create_supervisor(NewSupervisor {
                service: service.name.clone(),
                base_url: self.config.supervisor_base_url.clone(),
                init_key: Some(self.config.cluster_key.clone()),
                ops_api,
            })
            .await?;

        // the blocking client lives entirely on the worker thread
        let base_url = self.config.supervisor_base_url.clone();
        let cluster_id = self.config.supervisor_cluster_id.clone();
        let cluster_key = self.config.cluster_key.clone();
        let timeout = self.config.default_timeout;
        let metadata = data.node_metadata();
        let response = tokio::task::spawn_blocking(move || {
            SupervisorClient::new(&base_url, &cluster_id, timeout)
                .with_cluster_key(&cluster_key)
                .add_node(&metadata)
        })
        .await
        .map_err(|e| ProxyError::Internal(format!("supervisor worker failed: {}", e)))?;

        let response = match response {
            Ok(response) if response.success() => response,
            Ok(response) => {
                return Err(self
                    .abort_connect(
                        placeholder.id,
                        service.id,
                        ProxyError::Internal(format!(
                            "connect to supervisor failed with error: {}",
                            response.text
                        )),
                    )
                    .await);
            }
            Err(err) => {
                return Err(self.abort_connect(placeholder.id, service.id, err).await);
            }
        };

        let supervisor = match &response.result {
            Some(info) => {
                let row = match self.save_supervisor(placeholder.clone(), info).await {
                    Ok(row) => row,
                    Err(err) => {
                        return Err(self.abort_connect(placeholder.id, service.id, err).await)
                    }
                };
                if row.node_id.as_deref() != Some(info.node_id.as_str()) {
                    return Err(self
                        .abort_connect(
                            placeholder.id,
                            service.id,
                            ProxyError::Internal(format!(
                                "supervisor failed to create: inconsistent node id: {:?}, {}",
                                row.node_id, info.node_id
                            )),
                        )
                        .await);
                }
                row
            }
            None => {
                // no body: the supervisor filled the placeholder through a
                // concurrent POST to the operations surface
                let row = self.catalog.find_supervisor(placeholder.id).await?;
                match row {
                    Some(row) if row.node_id.is_some() => row,
                    _ => {
                        return Err(self
                            .abort_connect(
                                placeholder.id,
                                service.id,
                                ProxyError::Internal("supervisor failed to create".to_string()),
                            )
                            .await);
                    }
                }
            }
        };

        let node_id = match supervisor.node_id.clone() {
            Some(node_id) => node_id,
            None => {
                return Err(self
                    .abort_connect(
                        placeholder.id,
                        service.id,
                        ProxyError::Internal("supervisor failed to create".to_string()),
                    )
                    .await);
            }
        };
        self.catalog
            .set_service_node_id(service.id, Some(node_id.clone()))
            .await?;

        if !supervisor.local && supervisor.public_key.is_none() {
            return Err(self
                .abort_connect(
                    placeholder.id,
                    service.id,
                    ProxyError::Internal("supervisor failed to create: no public key".to_string()),
                )
                .await);
        }

        info!(service = %service.name, node_id = %node_id, "supervisor connected");
        self.sync_supervisor(service.id, data.resources.as_ref(), None)
            .await
    }

    /// Pushes a resources snapshot to the supervisor when its fingerprint
    /// moved. No-op without a connected node, a snapshot or a supervisor row.
    pub async fn sync_supervisor(
        &self,
        service_id: i64,
        resources: Option<&Value>,
        etag: Option<&str>,
    ) -> Result<()> {
        let service = self
            .catalog
            .find_service_by_id(service_id)
            .await?
            .ok_or_else(|| ProxyError::Internal(format!("service [{}] not found", service_id)))?;
        let node_id = match &service.node_id {
            Some(node_id) => node_id.clone(),
            None => return Ok(()),
        };
        let resources = match resources {
            Some(resources) if !resources.is_null() => resources.clone(),
            _ => return Ok(()),
        };
        let mut supervisor = match self
            .catalog
            .find_supervisor_for_service(&service.name, &node_id)
            .await?
        {
            Some(supervisor) => supervisor,
            None => match self.catalog.find_supervisor_by_node_id(&node_id).await? {
                // service was renamed since the row was written
                Some(supervisor) => supervisor,
                None => return Ok(()),
            },
        };

        let etag = etag
            .map(|etag| etag.to_string())
            .unwrap_or_else(|| resources_etag(&resources));
        if supervisor.resources_etag.as_deref() == Some(etag.as_str()) {
            info!(node_id = %node_id, "resources identical to supervisor");
            return Ok(());
        }

        let base_url = supervisor.base_url.clone();
        let cluster_id = self.config.supervisor_cluster_id.clone();
        let timeout = self.config.default_timeout;
        let node = node_id.clone();
        let node_key = supervisor.public_key.clone();
        let payload = resources.clone();
        let response = tokio::task::spawn_blocking(move || {
            SupervisorClient::new(&base_url, &cluster_id, timeout)
                .with_node(&node, node_key.as_deref())
                .upload_resources(&payload)
        })
        .await
        .map_err(|e| ProxyError::Internal(format!("supervisor worker failed: {}", e)))??;

        if !response.success() {
            return Err(ProxyError::Internal(format!(
                "sync to supervisor[{}] failed with error: {}",
                node_id, response.text
            )));
        }

        if supervisor.service != service.name {
            info!(
                service = %service.name,
                "updating supervisor and resources service name"
            );
            let old_name = supervisor.service.clone();
            supervisor.service = service.name.clone();
            supervisor = self.catalog.update_supervisor(supervisor).await?;
            self.catalog
                .update_resources_service(&old_name, &service.name, &node_id)
                .await?;
        }

        if response.status == 304 {
            info!(node_id = %node_id, "resources identical to the remote supervisor");
            return Ok(());
        }

        if let Some(result) = response.result {
            if result.resources_etag.is_some() {
                supervisor.resources_etag = result.resources_etag.clone();
                supervisor = self.catalog.update_supervisor(supervisor).await?;
            }
            self.catalog
                .save_resources(&service.name, &node_id, &result.resources)
                .await?;
            if let Some(url) = result.url {
                if supervisor.url.as_deref() != Some(url.as_str()) {
                    supervisor.url = Some(url.clone());
                    self.catalog.update_supervisor(supervisor).await?;
                }
                info!(url = %url, node_id = %node_id, "resources synced to supervisor");
            } else {
                info!(node_id = %node_id, "resources synced to supervisor");
            }
        }
        Ok(())
    }
}

/// Startup reachability probe against the supervisor's info endpoint.
///
/// Retries every 500ms until `LOAD_TIMEOUT` elapses. Purely advisory: the
/// proxy serves either way, this only surfaces a dead control plane early.
pub async fn probe_supervisor(config: &ProxyConfig) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(config.load_timeout);
    loop {
        let base_url = config.supervisor_base_url.clone();
        let cluster_id = config.supervisor_cluster_id.clone();
        let timeout = config.default_timeout;
        let live = tokio::task::spawn_blocking(move || {
            SupervisorClient::new(&base_url, &cluster_id, timeout).get_info()
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .map(|r| r.success())
        .unwrap_or(false);
        if live {
            info!(supervisor = %config.supervisor_base_url, "supervisor is live");
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                supervisor = %config.supervisor_base_url,
                "supervisor not reachable within load timeout"
            );
            return false;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
