//! HTTP surface of the proxy: routing, CORS and error translation.
//!
//! Three routes carry the whole system — the liveness ping, the registry
//! and the proxy family — plus the metrics exposition. Domain errors render
//! uniformly as `{"error": <message>}` with the status of the error kind.

use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tracing::{info, warn};

use crate::catalog::CatalogRepository;
use crate::config::ProxyConfig;
use crate::errors::ProxyError;
use crate::metrics::gather_metrics_string;
use crate::proxy::ProxyRequest;
use crate::registry::RegistryService;

/// Platform spec version advertised by the liveness ping.
pub const UTILMETA_SPEC_VERSION: &str = "0.5.8";

const CORS_ALLOW_HEADERS: &str = "x-utilmeta-proxy-type, x-utilmeta-cluster-id, authorization";

/// Shared per-process state handed to every request handler.
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub catalog: Arc<dyn CatalogRepository>,
    pub registry: RegistryService,
    /// Pooled outbound client for proxied requests.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Arc<ProxyConfig>, catalog: Arc<dyn CatalogRepository>) -> Arc<Self> {
        let registry = RegistryService::new(config.clone(), catalog.clone());
        Arc::new(AppState {
            config,
            catalog,
            registry,
            http: reqwest::Client::new(),
        })
    }
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn error_response(err: &ProxyError) -> Response<Body> {
    let mut payload = serde_json::json!({ "error": err.to_string() });
    if let Some(state) = err.state() {
        payload["state"] = serde_json::Value::String(state.to_string());
    }
    json_response(err.status(), payload)
}

fn apply_cors(config: &ProxyConfig, response: &mut Response<Body>, preflight: bool) {
    let headers = response.headers_mut();
    headers.insert(
        "access-control-allow-origin",
        hyper::header::HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-expose-headers",
        hyper::header::HeaderValue::from_static("server-timing"),
    );
    if preflight {
        headers.insert(
            "access-control-allow-headers",
            hyper::header::HeaderValue::from_static(CORS_ALLOW_HEADERS),
        );
        headers.insert(
            "access-control-allow-methods",
            hyper::header::HeaderValue::from_static(
                "GET, POST, PUT, PATCH, DELETE, OPTIONS, HEAD",
            ),
        );
        if let Ok(max_age) = hyper::header::HeaderValue::from_str(&config.cors_max_age.to_string())
        {
            headers.insert("access-control-max-age", max_age);
        }
    }
}

async fn route(
    state: Arc<AppState>,
    client_ip: IpAddr,
    req: Request<Body>,
) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    if method == Method::OPTIONS && req.headers().contains_key("access-control-request-method") {
        // CORS preflight; headers are applied by the caller
        return Response::new(Body::empty());
    }

    match path.as_str() {
        "/" if method == Method::GET => json_response(
            StatusCode::OK,
            serde_json::json!({
                "utilmeta": UTILMETA_SPEC_VERSION,
                "type": "proxy",
                "registry_url": "/registry",
                "proxy_url": "/proxy",
            }),
        ),
        "/metrics" if method == Method::GET => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Body::from(gather_metrics_string()))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        "/registry" if method == Method::POST => {
            let body = match hyper::body::to_bytes(req.into_body()).await {
                Ok(body) => body,
                Err(e) => {
                    return error_response(&ProxyError::bad_request(format!(
                        "invalid request body: {}",
                        e
                    )))
                }
            };
            let data = match serde_json::from_slice(&body) {
                Ok(data) => data,
                Err(e) => {
                    return error_response(&ProxyError::bad_request(format!(
                        "invalid registry body: {}",
                        e
                    )))
                }
            };
            match state.registry.register(client_ip, data).await {
                Ok(schema) => match serde_json::to_value(&schema) {
                    Ok(value) => json_response(StatusCode::OK, value),
                    Err(e) => error_response(&ProxyError::Internal(e.to_string())),
                },
                Err(err) => error_response(&err),
            }
        }
        p if p == "/proxy" || p.starts_with("/proxy/") => {
            let forward_path = path
                .strip_prefix("/proxy")
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string();
            let headers = req.headers().clone();
            let body = match hyper::body::to_bytes(req.into_body()).await {
                Ok(body) => body,
                Err(e) => {
                    return error_response(&ProxyError::bad_request(format!(
                        "invalid request body: {}",
                        e
                    )))
                }
            };
            let request = match ProxyRequest::new(
                state.config.clone(),
                state.catalog.clone(),
                state.http.clone(),
                client_ip,
                method,
                &headers,
                query,
                body,
            ) {
                Ok(request) => request,
                Err(err) => return error_response(&err),
            };
            match request.execute(&forward_path).await {
                Ok(response) => response,
                Err(err) => error_response(&err),
            }
        }
        _ => error_response(&ProxyError::not_found("not found")),
    }
}

/// Handles one request end to end: routing, CORS and the request log line.
pub async fn handle_request(
    state: Arc<AppState>,
    client_ip: IpAddr,
    req: Request<Body>,
) -> Response<Body> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let preflight =
        method == Method::OPTIONS && req.headers().contains_key("access-control-request-method");

    let mut response = route(state.clone(), client_ip, req).await;
    apply_cors(&state.config, &mut response, preflight);

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        client_ip = %client_ip,
        duration_ms = started.elapsed().as_millis() as u64,
        "request handled"
    );
    response
}

/// Binds the server on the given address and returns the bound address with
/// the serving future. Port 0 picks an ephemeral port.
pub fn bind_server(
    state: Arc<AppState>,
    addr: SocketAddr,
) -> std::result::Result<
    (SocketAddr, impl Future<Output = std::result::Result<(), hyper::Error>>),
    hyper::Error,
> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let remote_ip = conn.remote_addr().ip();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle_request(state, remote_ip, req).await) }
            }))
        }
    });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    let local_addr = server.local_addr();
    Ok((local_addr, server))
}

/// Runs the server on the configured bind port until it fails or the
/// process exits.
pub async fn serve(state: Arc<AppState>) -> std::result::Result<(), hyper::Error> {
    let addr: SocketAddr = ([0, 0, 0, 0], state.config.bind_port).into();
    let (local_addr, server) = bind_server(state, addr)?;
    info!(addr = %local_addr, "utilmeta-proxy listening");
    if let Err(e) = server.await {
        warn!(error = %e, "server error");
        return Err(e);
    }
    Ok(())
}
