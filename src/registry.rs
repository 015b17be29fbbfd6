//! Instance registration: validates a registering endpoint against the
//! operations catalog, upserts its rows and keeps the supervisor in step.
//!
//! Registrations for one address serialize through an in-process lock table,
//! so concurrent re-registrations observe each other's writes; the first
//! writer binds the owning service, later writers win on fields.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::catalog::CatalogRepository;
use crate::config::ProxyConfig;
use crate::errors::{ProxyError, Result};
use crate::metrics::REGISTRATIONS_TOTAL;
use crate::schema::{InstanceRegistry, InstanceSchema, RegistrySchema};
use crate::supervisor::SupervisorCoordinator;
use crate::utils::{is_private_ip, parse_address, resources_etag, split_netloc, url_join};

/// Registration service behind `POST /registry`.
pub struct RegistryService {
    config: Arc<ProxyConfig>,
    catalog: Arc<dyn CatalogRepository>,
    coordinator: SupervisorCoordinator,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Composes a registered URL onto the instance address, or verifies that an
/// absolute URL points at the address itself.
fn compose_instance_url(address: &str, url: &str, label: &str) -> Result<String> {
    match split_netloc(url) {
        None => Ok(url_join(&format!("http://{}", address), url)),
        Some((netloc, _)) if netloc == address => Ok(url.to_string()),
        Some((netloc, _)) => Err(ProxyError::bad_request(format!(
            "service register failed: {} netloc: {} inconsistent to instance address: {}",
            label, netloc, address
        ))),
    }
}

impl RegistryService {
    pub fn new(config: Arc<ProxyConfig>, catalog: Arc<dyn CatalogRepository>) -> Self {
        let coordinator = SupervisorCoordinator::new(config.clone(), catalog.clone());
        RegistryService {
            config,
            catalog,
            coordinator,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handles one registration request.
    pub async fn register(&self, client_ip: IpAddr, data: RegistrySchema) -> Result<InstanceSchema> {
        let result = self.register_inner(client_ip, data).await;
        let outcome = match &result {
            Ok(_) => "registered",
            Err(
                ProxyError::NotFound(_)
                | ProxyError::BadRequest { .. }
                | ProxyError::PermissionDenied(_),
            ) => "rejected",
            Err(_) => "failed",
        };
        REGISTRATIONS_TOTAL.with_label_values(&[outcome]).inc();
        result
    }

    async fn address_lock(&self, address: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn register_inner(
        &self,
        client_ip: IpAddr,
        mut data: RegistrySchema,
    ) -> Result<InstanceSchema> {
        let lock = self.address_lock(&data.address).await;
        let _serialized = lock.lock().await;

        let (host, port) = parse_address(&data.address);

        if self.config.private {
            // privacy rejections alias to not-found
            if !is_private_ip(&client_ip) {
                return Err(ProxyError::not_found("not found"));
            }
            if !self.config.public_base_url && client_ip.to_string() != host {
                return Err(ProxyError::PermissionDenied(format!(
                    "service register failed, your request ip: {} is inconsistent to instance host: {}",
                    client_ip, host
                )));
            }
        }

        let resource = self
            .catalog
            .find_resource(&data.instance_id, "instance", &data.name, &data.address)
            .await?
            .ok_or_else(|| {
                ProxyError::bad_request(format!(
                    "service register failed: instance(id={}, address={}) not found in operations database",
                    data.instance_id, data.address
                ))
            })?;

        data.ops_api = compose_instance_url(&data.address, &data.ops_api, "OperationsAPI")?;
        data.base_url = compose_instance_url(&data.address, &data.base_url, "base_url")?;

        let mut service = match self
            .catalog
            .find_service_by_current_or_historical_name(&data.name)
            .await?
        {
            Some(service) => service,
            None => {
                self.catalog
                    .create_service(&data.name, resource.node_id.clone())
                    .await?
            }
        };
        self.catalog.ensure_name_record(service.id, &data.name).await?;
        if service.name != data.name {
            service = self.catalog.rename_service(service.id, &data.name).await?;
        }

        let existing = self.catalog.find_instance_by_address(&data.address).await?;
        if let Some(existing) = &existing {
            if existing.service_id != service.id {
                return Err(ProxyError::bad_request(format!(
                    "service register failed: address: {} has been registered by service: [{}]",
                    existing.address, existing.service_id
                )));
            }
        }

        let mut record = InstanceRegistry::from_registration(
            &data,
            service.id,
            host,
            port,
            resource.remote_id.clone(),
            resource.server_id.clone(),
        );
        record.id = existing.map(|i| i.id);
        if let Some(resources) = &data.resources {
            if !resources.is_null() {
                record.resources_etag = Some(resources_etag(resources));
                record.resources = Some(resources.clone());
            }
        }
        let snapshot_etag = record.resources_etag.clone();
        let instance = self.catalog.upsert_instance(record).await?;

        info!(
            service = %service.name,
            address = %instance.address,
            instance_id = %instance.resource_id,
            "instance registered"
        );

        if service.node_id.is_none() {
            // first registration of this service end to end
            self.coordinator.connect_supervisor(service.id, &data).await?;
        } else if data.resources.is_some() {
            self.coordinator
                .sync_supervisor(service.id, data.resources.as_ref(), snapshot_etag.as_deref())
                .await?;
        }

        let node_id = self
            .catalog
            .find_service_by_id(service.id)
            .await?
            .and_then(|s| s.node_id);
        Ok(InstanceSchema::from_instance(&instance, node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MemoryCatalog, Resource};
    use serde_json::json;

    fn config(private: bool) -> Arc<ProxyConfig> {
        Arc::new(ProxyConfig {
            base_url: "http://10.0.0.2:9090".to_string(),
            bind_port: 9090,
            private,
            validate_forward_ips: false,
            production: false,
            supervisor_base_url: "http://127.0.0.1:1".to_string(),
            supervisor_cluster_id: "cluster-1".to_string(),
            cluster_key: "secret".to_string(),
            default_timeout: 1,
            load_timeout: 1,
            cors_max_age: 86400,
            trusted_hosts: vec![],
            public_base_url: false,
        })
    }

    fn registration(name: &str, address: &str, instance_id: &str) -> RegistrySchema {
        serde_json::from_value(json!({
            "name": name,
            "address": address,
            "instance_id": instance_id,
            "ops_api": "/ops",
            "base_url": "/",
            "version": "1.4.2-beta",
            "language": "python",
            "utilmeta_version": "2.6.0",
            "backend": "django",
        }))
        .unwrap()
    }

    async fn seed_resource(catalog: &MemoryCatalog, name: &str, address: &str, instance_id: &str) {
        catalog
            .insert_resource(Resource {
                id: 0,
                resource_id: instance_id.to_string(),
                kind: "instance".to_string(),
                service: name.to_string(),
                ident: address.to_string(),
                node_id: Some("node-1".to_string()),
                remote_id: Some("rmt-1".to_string()),
                server_id: Some("srv-1".to_string()),
                data: serde_json::Value::Null,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn public_source_rejected_as_not_found_in_private_cluster() {
        let catalog = Arc::new(MemoryCatalog::new());
        let registry = RegistryService::new(config(true), catalog);
        let err = registry
            .register(
                "8.8.8.8".parse().unwrap(),
                registration("svc", "10.0.0.1:8000", "ins-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[tokio::test]
    async fn private_source_must_match_instance_host() {
        let catalog = Arc::new(MemoryCatalog::new());
        let registry = RegistryService::new(config(true), catalog);
        let err = registry
            .register(
                "10.0.0.9".parse().unwrap(),
                registration("svc", "10.0.0.1:8000", "ins-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected() {
        let catalog = Arc::new(MemoryCatalog::new());
        let registry = RegistryService::new(config(false), catalog);
        let err = registry
            .register(
                "10.0.0.1".parse().unwrap(),
                registration("svc", "10.0.0.1:8000", "ins-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::BadRequest { .. }));
        assert!(err.to_string().contains("not found in operations database"));
    }

    #[tokio::test]
    async fn netloc_mismatch_is_rejected() {
        let catalog = Arc::new(MemoryCatalog::new());
        seed_resource(&catalog, "svc", "10.0.0.1:8000", "ins-1").await;
        let registry = RegistryService::new(config(false), catalog);
        let mut data = registration("svc", "10.0.0.1:8000", "ins-1");
        data.ops_api = "http://10.0.0.2:8000/ops".to_string();
        let err = registry
            .register("10.0.0.1".parse().unwrap(), data)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("netloc"));
    }

    #[tokio::test]
    async fn re_registration_under_other_service_is_rejected() {
        let catalog = Arc::new(MemoryCatalog::new());
        // seed a connected service owning the address, so no supervisor RPC runs
        let service = catalog.create_service("svc", Some("node-1".to_string())).await.unwrap();
        catalog.ensure_name_record(service.id, "svc").await.unwrap();
        seed_resource(&catalog, "svc", "10.0.0.1:8000", "ins-1").await;
        seed_resource(&catalog, "other", "10.0.0.1:8000", "ins-2").await;

        let registry = RegistryService::new(config(false), catalog.clone());
        registry
            .register(
                "10.0.0.1".parse().unwrap(),
                registration("svc", "10.0.0.1:8000", "ins-1"),
            )
            .await
            .unwrap();

        let err = registry
            .register(
                "10.0.0.1".parse().unwrap(),
                registration("other", "10.0.0.1:8000", "ins-2"),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has been registered by service"));
    }

    #[tokio::test]
    async fn registration_projects_resource_identity_and_version() {
        let catalog = Arc::new(MemoryCatalog::new());
        let service = catalog.create_service("svc", Some("node-1".to_string())).await.unwrap();
        catalog.ensure_name_record(service.id, "svc").await.unwrap();
        seed_resource(&catalog, "svc", "10.0.0.1:8000", "ins-1").await;

        let registry = RegistryService::new(config(false), catalog.clone());
        let schema = registry
            .register(
                "10.0.0.1".parse().unwrap(),
                registration("svc", "10.0.0.1:8000", "ins-1"),
            )
            .await
            .unwrap();

        assert_eq!(schema.remote_id.as_deref(), Some("rmt-1"));
        assert_eq!(schema.server_id.as_deref(), Some("srv-1"));
        assert_eq!(
            (schema.version_major, schema.version_minor, schema.version_patch),
            (1, 4, 2)
        );
        assert_eq!(schema.node_id.as_deref(), Some("node-1"));
        assert_eq!(schema.base_url, "http://10.0.0.1:8000");
        assert_eq!(schema.ops_api, "http://10.0.0.1:8000/ops");
        assert_eq!(schema.host, "10.0.0.1");
        assert_eq!(schema.port, Some(8000));
    }

    #[tokio::test]
    async fn historical_alias_reuses_service_and_renames_back() {
        let catalog = Arc::new(MemoryCatalog::new());
        // service currently named "current", with "legacy" kept as an alias
        let service = catalog
            .create_service("current", Some("node-1".to_string()))
            .await
            .unwrap();
        catalog.ensure_name_record(service.id, "legacy").await.unwrap();
        catalog.ensure_name_record(service.id, "current").await.unwrap();
        seed_resource(&catalog, "legacy", "10.0.0.1:8000", "ins-1").await;

        let registry = RegistryService::new(config(false), catalog.clone());
        registry
            .register(
                "10.0.0.1".parse().unwrap(),
                registration("legacy", "10.0.0.1:8000", "ins-1"),
            )
            .await
            .unwrap();

        // lookup went through the alias and the canonical name followed it
        let renamed = catalog
            .find_service_by_current_or_historical_name("current")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.id, service.id);
        assert_eq!(renamed.name, "legacy");

        let records = catalog.list_name_records(service.id).await.unwrap();
        let current = records.iter().find(|r| r.name == "current").unwrap();
        let legacy = records.iter().find(|r| r.name == "legacy").unwrap();
        assert!(current.deprecated_time.is_some());
        assert!(legacy.deprecated_time.is_none());
    }
}
