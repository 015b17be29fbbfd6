//! Service catalog: entities, the repository contract and the in-memory
//! store shipped with the proxy.
//!
//! The relational store behind the catalog is an external collaborator; the
//! proxy only depends on the [`CatalogRepository`] trait, whose operations
//! are exactly the lookups and upserts the registration protocol and the
//! proxy engine need. [`MemoryCatalog`] implements the contract over shared
//! in-process state and is what the binary and the tests run against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::{ProxyError, Result};
use crate::schema::{InstanceRegistry, ResourceEntry};
use crate::utils::unix_now;

// ── Entities ─────────────────────────────────────────────────────────────────

/// A logical service inside the cluster.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: i64,
    /// Current canonical name; historical names live in [`ServiceNameRecord`]s.
    pub name: String,
    /// Identity of the connected supervisor node; set once registration
    /// succeeds end to end.
    pub node_id: Option<String>,
    pub base_url: Option<String>,
    pub ops_api: Option<String>,
    pub public: bool,
    pub created_time: u64,
    pub data: Value,
}

/// Alias history entry. `name` is unique across all services ever registered.
#[derive(Debug, Clone)]
pub struct ServiceNameRecord {
    pub id: i64,
    pub service_id: i64,
    pub name: String,
    pub created_time: u64,
    pub deprecated_time: Option<u64>,
}

/// A running endpoint of a service.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: i64,
    pub service_id: i64,
    pub host: String,
    pub port: Option<u16>,
    /// `host:port`, unique across all services.
    pub address: String,
    pub base_url: String,
    pub ops_api: String,
    /// External identity assigned by the supervisor's resource catalog.
    pub resource_id: String,
    pub server_id: Option<String>,
    pub remote_id: Option<String>,
    pub weight: f64,
    pub connected: bool,
    pub public: bool,
    pub version: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub version_patch: u32,
    pub asynchronous: bool,
    pub production: bool,
    pub language: String,
    pub language_version: Option<String>,
    pub utilmeta_version: String,
    pub backend: String,
    pub backend_version: Option<String>,
    pub cwd: Option<String>,
    pub created_time: u64,
    pub deprecated: bool,
    /// Last resources snapshot known for this instance, opaque.
    pub resources: Option<Value>,
    pub resources_etag: Option<String>,
    pub data: Value,
    pub avg_load: f64,
    pub avg_time: f64,
    pub avg_rps: f64,
}

/// A connected control-plane node record for a service.
#[derive(Debug, Clone)]
pub struct Supervisor {
    pub id: i64,
    pub service: String,
    /// Unique once assigned; placeholder rows carry `None` until connect
    /// completes.
    pub node_id: Option<String>,
    pub base_url: String,
    pub backup_urls: Vec<String>,
    pub public_key: Option<String>,
    pub resources_etag: Option<String>,
    pub local: bool,
    /// Human-facing UI URL reported by the supervisor.
    pub url: Option<String>,
    pub disabled: bool,
    pub init_key: Option<String>,
    pub ops_api: Option<String>,
    pub created_time: u64,
}

/// Opaque external entity mirrored from the supervisor's resource catalog.
/// Queried read-only during registration, upserted from sync responses.
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: i64,
    /// External id (`Resource.id` on the supervisor side).
    pub resource_id: String,
    pub kind: String,
    pub service: String,
    pub ident: String,
    pub node_id: Option<String>,
    pub remote_id: Option<String>,
    pub server_id: Option<String>,
    pub data: Value,
}

/// Fields for a new (placeholder) supervisor row.
#[derive(Debug, Clone)]
pub struct NewSupervisor {
    pub service: String,
    pub base_url: String,
    pub init_key: Option<String>,
    pub ops_api: Option<String>,
}

/// Health signals written out of band by the operations collaborator.
#[derive(Debug, Clone, Copy)]
pub struct InstanceHealth {
    pub connected: bool,
    pub weight: f64,
    pub avg_load: f64,
    pub avg_time: f64,
    pub avg_rps: f64,
}

// ── Repository contract ──────────────────────────────────────────────────────

/// Persistent store of catalog entities.
///
/// Mutations are scoped to single rows; registration-level serialization is
/// the caller's responsibility (the registry holds a per-address lock).
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Resolves a service by its current name or any historical alias.
    async fn find_service_by_current_or_historical_name(
        &self,
        name: &str,
    ) -> Result<Option<Service>>;
    async fn find_service_by_id(&self, id: i64) -> Result<Option<Service>>;
    /// Creates the service, or returns the existing row with the same name.
    async fn create_service(&self, name: &str, node_id: Option<String>) -> Result<Service>;
    /// Renames the canonical service name, deprecating superseded aliases.
    async fn rename_service(&self, service_id: i64, name: &str) -> Result<Service>;
    async fn set_service_node_id(&self, service_id: i64, node_id: Option<String>) -> Result<()>;
    /// Ensures the alias record `(service, name)` exists.
    async fn ensure_name_record(&self, service_id: i64, name: &str) -> Result<ServiceNameRecord>;
    async fn list_name_records(&self, service_id: i64) -> Result<Vec<ServiceNameRecord>>;

    async fn find_instance_by_address(&self, address: &str) -> Result<Option<Instance>>;
    /// First instance whose host equals the given IP/host, if any.
    async fn find_instance_by_host(&self, host: &str) -> Result<Option<Instance>>;
    async fn list_connected_instances(&self, service_id: i64) -> Result<Vec<Instance>>;
    async fn upsert_instance(&self, record: InstanceRegistry) -> Result<Instance>;
    /// Writes the out-of-band health signals for an instance.
    async fn update_instance_health(&self, instance_id: i64, health: InstanceHealth) -> Result<()>;

    async fn create_supervisor(&self, record: NewSupervisor) -> Result<Supervisor>;
    async fn find_supervisor(&self, id: i64) -> Result<Option<Supervisor>>;
    async fn find_supervisor_by_node_id(&self, node_id: &str) -> Result<Option<Supervisor>>;
    async fn find_supervisor_for_service(
        &self,
        service: &str,
        node_id: &str,
    ) -> Result<Option<Supervisor>>;
    /// Enabled supervisors for a node that carry a public key, for bearer
    /// token validation.
    async fn list_enabled_supervisors(&self, node_id: &str) -> Result<Vec<Supervisor>>;
    async fn update_supervisor(&self, supervisor: Supervisor) -> Result<Supervisor>;
    async fn delete_supervisor(&self, id: i64) -> Result<()>;

    async fn find_resource(
        &self,
        resource_id: &str,
        kind: &str,
        service: &str,
        ident: &str,
    ) -> Result<Option<Resource>>;
    async fn insert_resource(&self, resource: Resource) -> Result<Resource>;
    /// Upserts canonical resource entries returned by a supervisor sync.
    async fn save_resources(
        &self,
        service: &str,
        node_id: &str,
        entries: &[ResourceEntry],
    ) -> Result<()>;
    /// Cascades a service rename to the mirrored resource rows.
    async fn update_resources_service(
        &self,
        old_service: &str,
        new_service: &str,
        node_id: &str,
    ) -> Result<()>;
}

// ── In-memory implementation ─────────────────────────────────────────────────

#[derive(Default)]
struct CatalogState {
    services: HashMap<i64, Service>,
    name_records: Vec<ServiceNameRecord>,
    instances: HashMap<i64, Instance>,
    supervisors: HashMap<i64, Supervisor>,
    resources: Vec<Resource>,
}

/// In-memory catalog store behind a shared lock.
///
/// Reads and writes are await points, matching the suspension model of a
/// real repository; no lock is held across an outbound call.
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
    next_id: AtomicI64,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        MemoryCatalog {
            state: RwLock::new(CatalogState::default()),
            next_id: AtomicI64::new(1),
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogRepository for MemoryCatalog {
    async fn find_service_by_current_or_historical_name(
        &self,
        name: &str,
    ) -> Result<Option<Service>> {
        let state = self.state.read().await;
        if let Some(service) = state.services.values().find(|s| s.name == name) {
            return Ok(Some(service.clone()));
        }
        let record = state.name_records.iter().find(|r| r.name == name);
        Ok(record.and_then(|r| state.services.get(&r.service_id).cloned()))
    }

    async fn find_service_by_id(&self, id: i64) -> Result<Option<Service>> {
        Ok(self.state.read().await.services.get(&id).cloned())
    }

    async fn create_service(&self, name: &str, node_id: Option<String>) -> Result<Service> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.services.values().find(|s| s.name == name) {
            return Ok(existing.clone());
        }
        let service = Service {
            id: self.allocate_id(),
            name: name.to_string(),
            node_id,
            base_url: None,
            ops_api: None,
            public: false,
            created_time: unix_now(),
            data: Value::Null,
        };
        state.services.insert(service.id, service.clone());
        Ok(service)
    }

    async fn rename_service(&self, service_id: i64, name: &str) -> Result<Service> {
        let mut state = self.state.write().await;
        let now = unix_now();
        for record in state
            .name_records
            .iter_mut()
            .filter(|r| r.service_id == service_id)
        {
            if record.name == name {
                record.deprecated_time = None;
            } else if record.deprecated_time.is_none() {
                record.deprecated_time = Some(now);
            }
        }
        let service = state
            .services
            .get_mut(&service_id)
            .ok_or_else(|| ProxyError::Internal(format!("service [{}] not found", service_id)))?;
        service.name = name.to_string();
        Ok(service.clone())
    }

    async fn set_service_node_id(&self, service_id: i64, node_id: Option<String>) -> Result<()> {
        let mut state = self.state.write().await;
        let service = state
            .services
            .get_mut(&service_id)
            .ok_or_else(|| ProxyError::Internal(format!("service [{}] not found", service_id)))?;
        service.node_id = node_id;
        Ok(())
    }

    async fn ensure_name_record(&self, service_id: i64, name: &str) -> Result<ServiceNameRecord> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.name_records.iter().find(|r| r.name == name) {
            if existing.service_id != service_id {
                return Err(ProxyError::Internal(format!(
                    "service name [{}] is already recorded for service [{}]",
                    name, existing.service_id
                )));
            }
            return Ok(existing.clone());
        }
        let record = ServiceNameRecord {
            id: self.allocate_id(),
            service_id,
            name: name.to_string(),
            created_time: unix_now(),
            deprecated_time: None,
        };
        state.name_records.push(record.clone());
        Ok(record)
    }

    async fn list_name_records(&self, service_id: i64) -> Result<Vec<ServiceNameRecord>> {
        Ok(self
            .state
            .read()
            .await
            .name_records
            .iter()
            .filter(|r| r.service_id == service_id)
            .cloned()
            .collect())
    }

    async fn find_instance_by_address(&self, address: &str) -> Result<Option<Instance>> {
        Ok(self
            .state
            .read()
            .await
            .instances
            .values()
            .find(|i| i.address == address)
            .cloned())
    }

    async fn find_instance_by_host(&self, host: &str) -> Result<Option<Instance>> {
        Ok(self
            .state
            .read()
            .await
            .instances
            .values()
            .find(|i| i.host == host)
            .cloned())
    }

    async fn list_connected_instances(&self, service_id: i64) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .state
            .read()
            .await
            .instances
            .values()
            .filter(|i| i.service_id == service_id && i.connected)
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.id);
        Ok(instances)
    }

    async fn upsert_instance(&self, record: InstanceRegistry) -> Result<Instance> {
        let mut state = self.state.write().await;

        // address and resource_id stay unique across all rows
        if let Some(conflict) = state
            .instances
            .values()
            .find(|i| i.address == record.address && Some(i.id) != record.id)
        {
            return Err(ProxyError::Internal(format!(
                "instance address [{}] already registered as [{}]",
                record.address, conflict.id
            )));
        }
        if let Some(conflict) = state
            .instances
            .values()
            .find(|i| i.resource_id == record.resource_id && Some(i.id) != record.id)
        {
            return Err(ProxyError::Internal(format!(
                "instance resource [{}] already registered at [{}]",
                record.resource_id, conflict.address
            )));
        }

        let instance = match record.id {
            Some(id) => {
                let instance = state.instances.get_mut(&id).ok_or_else(|| {
                    ProxyError::Internal(format!("instance [{}] not found", id))
                })?;
                instance.service_id = record.service_id;
                instance.host = record.host;
                instance.port = record.port;
                instance.address = record.address;
                instance.base_url = record.base_url;
                instance.ops_api = record.ops_api;
                instance.resource_id = record.resource_id;
                instance.server_id = record.server_id;
                instance.remote_id = record.remote_id;
                instance.public = record.public;
                instance.version = record.version;
                instance.version_major = record.version_major;
                instance.version_minor = record.version_minor;
                instance.version_patch = record.version_patch;
                instance.asynchronous = record.asynchronous;
                instance.production = record.production;
                instance.language = record.language;
                instance.language_version = record.language_version;
                instance.utilmeta_version = record.utilmeta_version;
                instance.backend = record.backend;
                instance.backend_version = record.backend_version;
                instance.cwd = record.cwd;
                if let Some(data) = record.data {
                    instance.data = data;
                }
                if let Some(resources) = record.resources {
                    instance.resources = Some(resources);
                    instance.resources_etag = record.resources_etag;
                }
                instance.clone()
            }
            None => {
                let instance = Instance {
                    id: self.allocate_id(),
                    service_id: record.service_id,
                    host: record.host,
                    port: record.port,
                    address: record.address,
                    base_url: record.base_url,
                    ops_api: record.ops_api,
                    resource_id: record.resource_id,
                    server_id: record.server_id,
                    remote_id: record.remote_id,
                    weight: 1.0,
                    connected: true,
                    public: record.public,
                    version: record.version,
                    version_major: record.version_major,
                    version_minor: record.version_minor,
                    version_patch: record.version_patch,
                    asynchronous: record.asynchronous,
                    production: record.production,
                    language: record.language,
                    language_version: record.language_version,
                    utilmeta_version: record.utilmeta_version,
                    backend: record.backend,
                    backend_version: record.backend_version,
                    cwd: record.cwd,
                    created_time: unix_now(),
                    deprecated: false,
                    resources: record.resources,
                    resources_etag: record.resources_etag,
                    data: record.data.unwrap_or(Value::Null),
                    avg_load: 0.0,
                    avg_time: 0.0,
                    avg_rps: 0.0,
                };
                state.instances.insert(instance.id, instance.clone());
                instance
            }
        };
        Ok(instance)
    }

    async fn update_instance_health(&self, instance_id: i64, health: InstanceHealth) -> Result<()> {
        let mut state = self.state.write().await;
        let instance = state.instances.get_mut(&instance_id).ok_or_else(|| {
            ProxyError::Internal(format!("instance [{}] not found", instance_id))
        })?;
        instance.connected = health.connected;
        instance.weight = health.weight;
        instance.avg_load = health.avg_load;
        instance.avg_time = health.avg_time;
        instance.avg_rps = health.avg_rps;
        Ok(())
    }

    async fn create_supervisor(&self, record: NewSupervisor) -> Result<Supervisor> {
        let mut state = self.state.write().await;
        let supervisor = Supervisor {
            id: self.allocate_id(),
            service: record.service,
            node_id: None,
            base_url: record.base_url,
            backup_urls: Vec::new(),
            public_key: None,
            resources_etag: None,
            local: false,
            url: None,
            disabled: false,
            init_key: record.init_key,
            ops_api: record.ops_api,
            created_time: unix_now(),
        };
        state.supervisors.insert(supervisor.id, supervisor.clone());
        Ok(supervisor)
    }

    async fn find_supervisor(&self, id: i64) -> Result<Option<Supervisor>> {
        Ok(self.state.read().await.supervisors.get(&id).cloned())
    }

    async fn find_supervisor_by_node_id(&self, node_id: &str) -> Result<Option<Supervisor>> {
        Ok(self
            .state
            .read()
            .await
            .supervisors
            .values()
            .find(|s| s.node_id.as_deref() == Some(node_id))
            .cloned())
    }

    async fn find_supervisor_for_service(
        &self,
        service: &str,
        node_id: &str,
    ) -> Result<Option<Supervisor>> {
        Ok(self
            .state
            .read()
            .await
            .supervisors
            .values()
            .find(|s| s.service == service && s.node_id.as_deref() == Some(node_id))
            .cloned())
    }

    async fn list_enabled_supervisors(&self, node_id: &str) -> Result<Vec<Supervisor>> {
        let mut supervisors: Vec<Supervisor> = self
            .state
            .read()
            .await
            .supervisors
            .values()
            .filter(|s| {
                s.node_id.as_deref() == Some(node_id) && !s.disabled && s.public_key.is_some()
            })
            .cloned()
            .collect();
        supervisors.sort_by_key(|s| s.id);
        Ok(supervisors)
    }

    async fn update_supervisor(&self, supervisor: Supervisor) -> Result<Supervisor> {
        let mut state = self.state.write().await;
        if !state.supervisors.contains_key(&supervisor.id) {
            return Err(ProxyError::Internal(format!(
                "supervisor [{}] not found",
                supervisor.id
            )));
        }
        state.supervisors.insert(supervisor.id, supervisor.clone());
        Ok(supervisor)
    }

    async fn delete_supervisor(&self, id: i64) -> Result<()> {
        self.state.write().await.supervisors.remove(&id);
        Ok(())
    }

    async fn find_resource(
        &self,
        resource_id: &str,
        kind: &str,
        service: &str,
        ident: &str,
    ) -> Result<Option<Resource>> {
        Ok(self
            .state
            .read()
            .await
            .resources
            .iter()
            .find(|r| {
                r.resource_id == resource_id
                    && r.kind == kind
                    && r.service == service
                    && r.ident == ident
            })
            .cloned())
    }

    async fn insert_resource(&self, mut resource: Resource) -> Result<Resource> {
        let mut state = self.state.write().await;
        if resource.id == 0 {
            resource.id = self.allocate_id();
        }
        state.resources.push(resource.clone());
        Ok(resource)
    }

    async fn save_resources(
        &self,
        service: &str,
        node_id: &str,
        entries: &[ResourceEntry],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        for entry in entries {
            if let Some(existing) = state.resources.iter_mut().find(|r| {
                r.resource_id == entry.id
                    && r.kind == entry.kind
                    && r.service == service
                    && r.ident == entry.ident
            }) {
                existing.node_id = Some(node_id.to_string());
                existing.remote_id = entry.remote_id.clone();
                existing.server_id = entry.server_id.clone();
            } else {
                let resource = Resource {
                    id: self.allocate_id(),
                    resource_id: entry.id.clone(),
                    kind: entry.kind.clone(),
                    service: service.to_string(),
                    ident: entry.ident.clone(),
                    node_id: Some(node_id.to_string()),
                    remote_id: entry.remote_id.clone(),
                    server_id: entry.server_id.clone(),
                    data: Value::Null,
                };
                state.resources.push(resource);
            }
        }
        Ok(())
    }

    async fn update_resources_service(
        &self,
        old_service: &str,
        new_service: &str,
        node_id: &str,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        for resource in state
            .resources
            .iter_mut()
            .filter(|r| r.service == old_service && r.node_id.as_deref() == Some(node_id))
        {
            resource.service = new_service.to_string();
        }
        Ok(())
    }
}
