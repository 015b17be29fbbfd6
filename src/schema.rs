//! Wire schemas for registration and supervisor exchanges.
//!
//! Registration uses two distinct record types sharing one projection: the
//! inbound [`RegistrySchema`] body becomes an [`InstanceRegistry`] write
//! record (with the semantic version triple derived post-parse), and the
//! catalog row is rendered back as an [`InstanceSchema`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::Instance;
use crate::version::parse_version;

/// Body of `POST /registry`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrySchema {
    pub name: String,
    pub address: String,
    /// External identity assigned by the supervisor's resource catalog.
    pub instance_id: String,
    #[serde(default)]
    pub ops_api: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub asynchronous: bool,
    #[serde(default)]
    pub production: bool,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub language_version: Option<String>,
    #[serde(default)]
    pub utilmeta_version: String,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub backend_version: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub cwd: Option<String>,

    /// Opaque resources snapshot to sync to the supervisor, if any.
    #[serde(default)]
    pub resources: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RegistrySchema {
    /// Node metadata posted to the supervisor on first connect.
    pub fn node_metadata(&self) -> NodeMetadata {
        NodeMetadata {
            name: self.name.clone(),
            base_url: self.base_url.clone(),
            ops_api: self.ops_api.clone(),
            version: self.version.clone(),
            production: self.production,
            language: self.language.clone(),
            utilmeta_version: self.utilmeta_version.clone(),
            backend: self.backend.clone(),
        }
    }
}

/// Metadata describing a service node, sent with `add_node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub name: String,
    pub base_url: String,
    pub ops_api: String,
    pub version: String,
    pub production: bool,
    pub language: String,
    pub utilmeta_version: String,
    pub backend: String,
}

/// Write record for an instance upsert.
///
/// `id` is set when re-registering an existing row; `resources` stays `None`
/// when the registration carried no snapshot, in which case the previous
/// snapshot and etag on the row are preserved.
#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    pub id: Option<i64>,
    pub service_id: i64,
    pub host: String,
    pub port: Option<u16>,
    pub address: String,
    pub base_url: String,
    pub ops_api: String,
    pub resource_id: String,
    pub server_id: Option<String>,
    pub remote_id: Option<String>,
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
    pub resources: Option<Value>,
    pub resources_etag: Option<String>,
    pub data: Option<Value>,
}

impl InstanceRegistry {
    /// Builds the write record from a validated registration, deriving the
    /// numeric version triple from the advertised version string.
    pub fn from_registration(
        data: &RegistrySchema,
        service_id: i64,
        host: String,
        port: Option<u16>,
        remote_id: Option<String>,
        server_id: Option<String>,
    ) -> Self {
        let (version_major, version_minor, version_patch) = parse_version(&data.version);
        InstanceRegistry {
            id: None,
            service_id,
            host,
            port,
            address: data.address.clone(),
            base_url: data.base_url.clone(),
            ops_api: data.ops_api.clone(),
            resource_id: data.instance_id.clone(),
            server_id,
            remote_id,
            public: data.public,
            version: data.version.clone(),
            version_major,
            version_minor,
            version_patch,
            asynchronous: data.asynchronous,
            production: data.production,
            language: data.language.clone(),
            language_version: data.language_version.clone(),
            utilmeta_version: data.utilmeta_version.clone(),
            backend: data.backend.clone(),
            backend_version: data.backend_version.clone(),
            cwd: data.cwd.clone(),
            resources: None,
            resources_etag: None,
            data: data.data.clone(),
        }
    }
}

/// Response projection of a catalog instance row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSchema {
    pub id: i64,
    pub service_id: String,
    pub node_id: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub address: String,
    pub base_url: String,
    pub ops_api: String,
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
    pub created_time: u64,
    pub deprecated: bool,
    pub avg_load: f64,
    pub avg_time: f64,
    pub avg_rps: f64,
}

impl InstanceSchema {
    pub fn from_instance(instance: &Instance, node_id: Option<String>) -> Self {
        InstanceSchema {
            id: instance.id,
            service_id: instance.service_id.to_string(),
            node_id,
            host: instance.host.clone(),
            port: instance.port,
            address: instance.address.clone(),
            base_url: instance.base_url.clone(),
            ops_api: instance.ops_api.clone(),
            resource_id: instance.resource_id.clone(),
            server_id: instance.server_id.clone(),
            remote_id: instance.remote_id.clone(),
            weight: instance.weight,
            connected: instance.connected,
            public: instance.public,
            version: instance.version.clone(),
            version_major: instance.version_major,
            version_minor: instance.version_minor,
            version_patch: instance.version_patch,
            asynchronous: instance.asynchronous,
            production: instance.production,
            language: instance.language.clone(),
            language_version: instance.language_version.clone(),
            utilmeta_version: instance.utilmeta_version.clone(),
            backend: instance.backend.clone(),
            backend_version: instance.backend_version.clone(),
            created_time: instance.created_time,
            deprecated: instance.deprecated,
            avg_load: instance.avg_load,
            avg_time: instance.avg_time,
            avg_rps: instance.avg_rps,
        }
    }
}

/// Supervisor node description returned by `add_node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorInfo {
    pub node_id: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub backup_urls: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub local: bool,
}

/// One canonical resource entry from an `upload_resources` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ident: String,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
}

/// Result payload of `upload_resources`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesResult {
    #[serde(default)]
    pub resources_etag: Option<String>,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
    /// Human-facing UI URL for the synced node, when the supervisor has one.
    #[serde(default)]
    pub url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registration() -> RegistrySchema {
        serde_json::from_value(json!({
            "name": "billing",
            "address": "10.0.0.5:8000",
            "instance_id": "ins-1",
            "ops_api": "/ops",
            "base_url": "/",
            "version": "1.4.2-beta",
            "language": "python",
            "utilmeta_version": "2.6.0",
            "backend": "django"
        }))
        .unwrap()
    }

    #[test]
    fn registry_body_parses_with_defaults() {
        let data = registration();
        assert_eq!(data.name, "billing");
        assert!(!data.asynchronous);
        assert!(data.resources.is_none());
        assert!(data.backend_version.is_none());
    }

    #[test]
    fn registry_record_derives_version_triple() {
        let data = registration();
        let record = InstanceRegistry::from_registration(
            &data,
            7,
            "10.0.0.5".to_string(),
            Some(8000),
            Some("rmt-1".to_string()),
            None,
        );
        assert_eq!(
            (
                record.version_major,
                record.version_minor,
                record.version_patch
            ),
            (1, 4, 2)
        );
        assert_eq!(record.resource_id, "ins-1");
        assert_eq!(record.remote_id.as_deref(), Some("rmt-1"));
        assert!(record.id.is_none());
    }

    #[test]
    fn supervisor_info_defaults() {
        let info: SupervisorInfo =
            serde_json::from_value(json!({"node_id": "node-9"})).unwrap();
        assert_eq!(info.node_id, "node-9");
        assert!(info.backup_urls.is_empty());
        assert!(!info.local);
    }
}
