//! The proxy engine: header parsing, mode dispatch, authentication, target
//! selection and the idempotency-gated retry loop.
//!
//! Every `/proxy/{path}` request runs through one [`ProxyRequest`]: a
//! mode-specific pre-dispatch populates the ordered candidate list (and,
//! for service modes, the instances behind it), then `make_request` walks
//! the candidates re-issuing the original request until a response should
//! be kept. Transport failures become aborted sentinel responses, never
//! panics or synthesized statuses.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Body, Method, Response, StatusCode};
use tracing::debug;

use crate::catalog::{CatalogRepository, Instance, Supervisor};
use crate::config::ProxyConfig;
use crate::errors::{ProxyError, Result};
use crate::metrics::{PROXIED_REQUESTS_TOTAL, PROXY_RETRIES_TOTAL};
use crate::ranker::rank_instances;
use crate::token::{decode_token, strip_scheme, validate_proxy_authorization};
use crate::utils::{is_hop_by_hop, is_private_ip, url_join};
use crate::version::VersionConstraint;

pub const UTILMETA_HEADER_PREFIX: &str = "x-utilmeta-";

/// Headers never forwarded upstream besides the hop-by-hop set.
const EXCLUDE_HEADERS: &[&str] = &[
    "content-length",
    "x-forwarded-for",
    "x-real-ip",
    "remote_addr",
];

/// Upstream statuses that permit a retry on an idempotent operation.
pub const DEFAULT_RETRY_ON_STATUSES: &[u16] = &[502, 503, 504];

/// Methods treated as idempotent when the request does not say.
const DEFAULT_IDEMPOTENT_METHODS: &[&str] = &["GET", "HEAD", "OPTIONS", "PUT", "DELETE"];

/// Whether an incoming header survives forwarding: control headers consumed
/// by the engine, hop-by-hop headers and the exclusion set all drop out.
pub fn forward_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !lower.starts_with(UTILMETA_HEADER_PREFIX)
        && !is_hop_by_hop(&lower)
        && !EXCLUDE_HEADERS.contains(&lower.as_str())
}

// ── Control headers ──────────────────────────────────────────────────────────

/// Proxy dispatch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Discovery,
    Supervisor,
    Operations,
    Forward,
}

impl ProxyMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "discovery" => Some(ProxyMode::Discovery),
            "supervisor" => Some(ProxyMode::Supervisor),
            "operations" => Some(ProxyMode::Operations),
            "forward" => Some(ProxyMode::Forward),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Discovery => "discovery",
            ProxyMode::Supervisor => "supervisor",
            ProxyMode::Operations => "operations",
            ProxyMode::Forward => "forward",
        }
    }
}

/// Reads a control header under its canonical `X-UtilMeta-*` name or its
/// short `X-*` alias.
fn header_param(headers: &HeaderMap, canonical: &str, short: &str) -> Option<String> {
    headers
        .get(canonical)
        .or_else(|| headers.get(short))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

/// Parsed control headers of a proxy request.
#[derive(Debug, Clone)]
pub struct ProxyHeaders {
    pub mode: Option<ProxyMode>,
    pub cluster_id: Option<String>,
    pub node_id: Option<String>,
    pub service_name: Option<String>,
    pub accept_version: Option<String>,
    pub instance_id: Option<String>,
    pub operation_idempotent: bool,
    /// Per-attempt timeout, seconds.
    pub timeout: u64,
    pub proxy_authorization: Option<String>,
    /// Bearer token from a plain `Authorization` header, scheme stripped.
    pub bearer_token: Option<String>,
}

impl ProxyHeaders {
    pub fn parse(method: &Method, headers: &HeaderMap, config: &ProxyConfig) -> Self {
        let mode = header_param(headers, "x-utilmeta-proxy-type", "x-proxy-type")
            .and_then(|v| ProxyMode::parse(&v));
        let operation_idempotent =
            match header_param(headers, "x-utilmeta-operation-idempotent", "x-operation-idempotent")
            {
                Some(value) => value.eq_ignore_ascii_case("true"),
                None => DEFAULT_IDEMPOTENT_METHODS.contains(&method.as_str()),
            };
        let timeout = header_param(headers, "x-utilmeta-request-timeout", "x-request-timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.default_timeout);
        let proxy_authorization = headers
            .get("proxy-authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .or_else(|| header_param(headers, "x-utilmeta-proxy-token", "x-proxy-token"));
        let bearer_token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| strip_scheme(v).to_string())
            .filter(|v| !v.is_empty());

        ProxyHeaders {
            mode,
            cluster_id: header_param(headers, "x-utilmeta-cluster-id", "x-cluster-id"),
            node_id: header_param(headers, "x-utilmeta-node-id", "x-node-id"),
            service_name: header_param(headers, "x-utilmeta-service-name", "x-service-name"),
            accept_version: header_param(headers, "x-utilmeta-accept-version", "x-accept-version"),
            instance_id: header_param(headers, "x-utilmeta-instance-id", "x-instance-id"),
            operation_idempotent,
            timeout,
            proxy_authorization,
            bearer_token,
        }
    }
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

// ── Upstream responses ───────────────────────────────────────────────────────

/// One upstream attempt's outcome. A transport failure is an *aborted*
/// response, carrying the error instead of a status.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
    pub aborted: bool,
    pub error: Option<String>,
}

impl UpstreamResponse {
    fn aborted(error: String) -> Self {
        UpstreamResponse {
            status: 0,
            headers: Vec::new(),
            body: Bytes::new(),
            aborted: true,
            error: Some(error),
        }
    }
}

// ── Request pipeline ─────────────────────────────────────────────────────────

/// State machine for one proxied request.
pub struct ProxyRequest {
    config: Arc<ProxyConfig>,
    catalog: Arc<dyn CatalogRepository>,
    client: reqwest::Client,
    client_ip: IpAddr,
    method: Method,
    query: Option<String>,
    body: Bytes,
    mode: ProxyMode,
    pub headers: ProxyHeaders,
    forward_headers: reqwest::header::HeaderMap,
    supervisor: Option<Supervisor>,
    instances: Vec<Instance>,
    base_urls: Vec<String>,
    base_url: Option<String>,
    instance: Option<Instance>,
    retries: u32,
    started: Instant,
}

impl ProxyRequest {
    /// Builds the per-request state. Fails not-found when no proxy mode was
    /// given.
    pub fn new(
        config: Arc<ProxyConfig>,
        catalog: Arc<dyn CatalogRepository>,
        client: reqwest::Client,
        client_ip: IpAddr,
        method: Method,
        headers: &HeaderMap,
        query: Option<String>,
        body: Bytes,
    ) -> Result<Self> {
        let parsed = ProxyHeaders::parse(&method, headers, &config);
        let mode = parsed.mode.ok_or_else(|| ProxyError::not_found("not found"))?;
        let forward_headers = build_forward_headers(headers);
        Ok(ProxyRequest {
            config,
            catalog,
            client,
            client_ip,
            method,
            query,
            body,
            mode,
            headers: parsed,
            forward_headers,
            supervisor: None,
            instances: Vec::new(),
            base_urls: Vec::new(),
            base_url: None,
            instance: None,
            retries: 0,
            started: Instant::now(),
        })
    }

    fn set_forward_header(&mut self, name: &'static str, value: &str) {
        if let Ok(value) = reqwest::header::HeaderValue::from_str(value) {
            self.forward_headers
                .insert(reqwest::header::HeaderName::from_static(name), value);
        }
    }

    fn setdefault_forward_header(&mut self, name: &'static str, value: &str) {
        let name = reqwest::header::HeaderName::from_static(name);
        if !self.forward_headers.contains_key(&name) {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(value) {
                self.forward_headers.insert(name, value);
            }
        }
    }

    /// Runs the full pipeline and renders the response.
    pub async fn execute(mut self, path: &str) -> Result<Response<Body>> {
        match self.mode {
            ProxyMode::Discovery => self.handle_discovery().await?,
            // `supervisor` is an intentional alias onto the operations path
            ProxyMode::Supervisor | ProxyMode::Operations => self.handle_operations().await?,
            ProxyMode::Forward => self.handle_forward().await?,
        }
        let upstream = self.make_request(path).await?;
        Ok(self.build_response(upstream))
    }

    // ── Pre-dispatch handlers ────────────────────────────────────────────

    /// Service-discovery proxying between internal services.
    async fn handle_discovery(&mut self) -> Result<()> {
        if self.headers.service_name.is_none() {
            return Err(ProxyError::not_found("not found"));
        }
        if self.config.private && !is_private_ip(&self.client_ip) {
            return Err(ProxyError::not_found("not found"));
        }
        let source = self
            .catalog
            .find_instance_by_host(&self.client_ip.to_string())
            .await?;
        match source {
            Some(instance) => {
                if let Some(remote_id) = &instance.remote_id {
                    let remote_id = remote_id.clone();
                    self.set_forward_header("x-utilmeta-source-instance-id", &remote_id);
                }
                let service_id = instance.service_id.to_string();
                self.set_forward_header("x-utilmeta-source-service", &service_id);
            }
            None => {
                if self.config.validate_forward_ips {
                    return Err(ProxyError::not_found("not found"));
                }
            }
        }
        self.handle_service().await
    }

    /// Control-plane proxying to a service's operations endpoint, from the
    /// supervisor (proxy-authorization) or a platform admin (bearer token).
    async fn handle_operations(&mut self) -> Result<()> {
        let node_id = match self
            .headers
            .node_id
            .clone()
            .or_else(|| query_param(self.query.as_deref(), "node"))
        {
            Some(node_id) => node_id,
            None => return Err(ProxyError::not_found("not found")),
        };

        if let Some(token) = self.headers.bearer_token.clone() {
            // user token from a client: the first node key that decodes it
            // authenticates the request
            for supervisor in self.catalog.list_enabled_supervisors(&node_id).await? {
                let key = supervisor
                    .public_key
                    .clone()
                    .unwrap_or_default();
                match decode_token(&token, &key) {
                    Ok(_) => {
                        self.supervisor = Some(supervisor);
                        break;
                    }
                    Err(_) => {
                        return Err(ProxyError::PermissionDenied(
                            "permission denied".to_string(),
                        ))
                    }
                }
            }
        } else if let Some(authorization) = self.headers.proxy_authorization.clone() {
            // from the platform, through the supervisor's signed token
            match &self.headers.cluster_id {
                None => return Err(ProxyError::not_found("not found")),
                Some(cluster_id) if cluster_id != &self.config.supervisor_cluster_id => {
                    return Err(ProxyError::not_found("not found"));
                }
                Some(_) => {}
            }
            validate_proxy_authorization(&self.config, &authorization, Some(&node_id))?;
            self.supervisor = match self.catalog.find_supervisor_by_node_id(&node_id).await? {
                Some(supervisor) => Some(supervisor),
                None => {
                    // first /ops contact before the supervisor row exists;
                    // the signed token already authorized the request
                    match &self.headers.service_name {
                        None => return Err(ProxyError::not_found("not found")),
                        Some(service_name) => Some(Supervisor {
                            id: 0,
                            service: service_name.clone(),
                            node_id: Some(node_id.clone()),
                            base_url: self.config.supervisor_base_url.clone(),
                            backup_urls: Vec::new(),
                            public_key: None,
                            resources_etag: None,
                            local: false,
                            url: None,
                            disabled: false,
                            init_key: None,
                            ops_api: None,
                            created_time: 0,
                        }),
                    }
                }
            };
        } else {
            return Err(ProxyError::ProxyAuthenticationRequired);
        }

        let supervisor = match self.supervisor.clone() {
            Some(supervisor) => supervisor,
            None => return Err(ProxyError::not_found("not found")),
        };
        self.headers.service_name = Some(supervisor.service.clone());
        self.set_forward_header("x-utilmeta-node-id", &node_id);
        self.set_forward_header("x-node-id", &node_id);
        let client_ip = self.client_ip.to_string();
        self.set_forward_header("x-forwarded-for", &client_ip);
        self.handle_service().await
    }

    /// Outbound forwarding from internal instances to the supervisor.
    async fn handle_forward(&mut self) -> Result<()> {
        let node_id = match self.headers.node_id.clone() {
            Some(node_id) => node_id,
            None => return Err(ProxyError::not_found("not found")),
        };
        if self.config.private && !is_private_ip(&self.client_ip) {
            return Err(ProxyError::not_found("not found"));
        }
        let cluster_id = self.config.supervisor_cluster_id.clone();
        self.set_forward_header("x-cluster-id", &cluster_id);

        let source = self
            .catalog
            .find_instance_by_host(&self.client_ip.to_string())
            .await?;
        match source {
            Some(instance) => {
                if let Some(remote_id) = instance.remote_id {
                    self.set_forward_header("x-source-instance-id", &remote_id);
                }
            }
            None => {
                if self.config.validate_forward_ips {
                    return Err(ProxyError::not_found("not found"));
                }
            }
        }

        let supervisor = self
            .catalog
            .find_supervisor_by_node_id(&node_id)
            .await?
            .ok_or_else(|| ProxyError::not_found("not found"))?;
        self.setdefault_forward_header("x-node-id", &node_id);
        if let Some(public_key) = supervisor.public_key.clone() {
            self.setdefault_forward_header("x-node-key", &public_key);
        }

        // defense in depth: even a poisoned catalog row cannot point the
        // forward at an untrusted host
        for base_url in std::iter::once(supervisor.base_url.clone())
            .chain(supervisor.backup_urls.iter().cloned())
        {
            if self.config.check_trusted_host(&base_url) {
                self.base_urls.push(base_url);
            } else {
                debug!(base_url = %base_url, "untrusted forward candidate skipped");
            }
        }
        self.supervisor = Some(supervisor);
        Ok(())
    }

    /// Builds the ordered candidate set for the named service.
    async fn handle_service(&mut self) -> Result<()> {
        let service_name = self
            .headers
            .service_name
            .clone()
            .ok_or_else(|| ProxyError::not_found("not found"))?;
        let service = self
            .catalog
            .find_service_by_current_or_historical_name(&service_name)
            .await?
            .ok_or_else(|| ProxyError::not_found("not found"))?;

        let mut instances = self.catalog.list_connected_instances(service.id).await?;
        if let Some(instance_id) = &self.headers.instance_id {
            instances.retain(|i| i.remote_id.as_deref() == Some(instance_id.as_str()));
        } else if let Some(accept_version) = &self.headers.accept_version {
            if accept_version != "*" {
                let constraint = VersionConstraint::parse(accept_version);
                instances.retain(|i| {
                    constraint.matches(i.version_major, i.version_minor, i.version_patch)
                });
            }
        }

        let use_ops_api = self.mode == ProxyMode::Operations;
        self.instances = rank_instances(instances)?;
        self.base_urls = self
            .instances
            .iter()
            .map(|i| {
                if use_ops_api {
                    i.ops_api.clone()
                } else {
                    i.base_url.clone()
                }
            })
            .collect();
        Ok(())
    }

    // ── Outbound loop ────────────────────────────────────────────────────

    fn should_retry(&self, response: &UpstreamResponse) -> bool {
        if !self.headers.operation_idempotent {
            return false;
        }
        response.aborted || DEFAULT_RETRY_ON_STATUSES.contains(&response.status)
    }

    async fn attempt(&self, base_url: &str, path: &str) -> UpstreamResponse {
        let mut url = url_join(base_url, path);
        if let Some(query) = &self.query {
            url.push('?');
            url.push_str(query);
        }
        let method = reqwest::Method::from_bytes(self.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let request = self
            .client
            .request(method, &url)
            .headers(self.forward_headers.clone())
            .timeout(Duration::from_secs(self.headers.timeout))
            .body(self.body.to_vec());

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return UpstreamResponse::aborted(e.to_string()),
        };
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        match response.bytes().await {
            Ok(body) => UpstreamResponse {
                status,
                headers,
                body: Bytes::from(body.to_vec()),
                aborted: false,
                error: None,
            },
            Err(e) => UpstreamResponse::aborted(e.to_string()),
        }
    }

    /// Walks the candidates in order, retrying only idempotent operations
    /// on aborted attempts and retryable statuses. The last response is
    /// returned as-is.
    async fn make_request(&mut self, path: &str) -> Result<UpstreamResponse> {
        if self.base_urls.is_empty() {
            return Err(ProxyError::not_found("not found"));
        }
        let base_urls = self.base_urls.clone();
        let last = base_urls.len() - 1;
        for (i, base_url) in base_urls.iter().enumerate() {
            let response = self.attempt(base_url, path).await;
            self.base_url = Some(base_url.clone());
            self.instance = self.instances.get(i).cloned();
            if i < last && self.should_retry(&response) {
                self.retries += 1;
                PROXY_RETRIES_TOTAL.inc();
                debug!(
                    base_url = %base_url,
                    status = response.status,
                    aborted = response.aborted,
                    "retrying on next candidate"
                );
                continue;
            }
            return Ok(response);
        }
        Err(ProxyError::Internal("no upstream attempt performed".to_string()))
    }

    // ── Post-processing ──────────────────────────────────────────────────

    fn build_response(self, upstream: UpstreamResponse) -> Response<Body> {
        let elapsed_ms = self.started.elapsed().as_millis();
        let status = if upstream.aborted {
            StatusCode::BAD_GATEWAY
        } else {
            StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY)
        };

        let mut builder = Response::builder().status(status);
        let mut upstream_timing = None;
        for (name, value) in &upstream.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if name.eq_ignore_ascii_case("server-timing") {
                upstream_timing = String::from_utf8(value.clone()).ok();
                continue;
            }
            builder = builder.header(name.as_str(), value.as_slice());
        }

        let proxy_timing = format!("proxy;dur={}", elapsed_ms);
        let server_timing = match upstream_timing {
            Some(existing) => format!("{},{}", proxy_timing, existing),
            None => proxy_timing,
        };
        builder = builder.header("server-timing", server_timing);

        if let Some(base_url) = &self.base_url {
            builder = builder.header("x-utilmeta-proxy-destination-base-url", base_url.as_str());
            if self.retries > 0 {
                builder = builder.header("x-utilmeta-proxy-retries", self.retries.to_string());
            }
            if let Some(remote_id) = self.instance.as_ref().and_then(|i| i.remote_id.as_deref()) {
                builder = builder.header("x-utilmeta-proxy-destination-instance-id", remote_id);
            }
        }

        PROXIED_REQUESTS_TOTAL
            .with_label_values(&[self.mode.as_str(), status.as_str()])
            .inc();

        let body = if upstream.aborted {
            let message = upstream
                .error
                .unwrap_or_else(|| "upstream request aborted".to_string());
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::json!({ "error": message }).to_string())
        } else {
            Body::from(upstream.body)
        };
        builder
            .body(body)
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

/// Copies forwardable inbound headers into the outbound header map.
fn build_forward_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if !forward_header(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.append(name, value);
        }
    }
    out
}
