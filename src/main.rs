use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use utilmeta_proxy::catalog::MemoryCatalog;
use utilmeta_proxy::config::ProxyConfig;
use utilmeta_proxy::metrics::register_metrics;
use utilmeta_proxy::router::{serve, AppState};
use utilmeta_proxy::supervisor::probe_supervisor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("check") => check().await,
        Some("version") | Some("-v") => {
            println!("utilmeta-proxy v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some("run") | None => run().await,
        Some(other) => {
            eprintln!(
                "unknown command: {} (expected: check | version | run)",
                other
            );
            std::process::exit(2);
        }
    }
}

/// Liveness probe against the configured base URL. Exit 0 when the proxy
/// answers its ping payload, non-zero otherwise.
async fn check() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = ProxyConfig::from_env()?;
    let live = match reqwest::get(format!("{}/", config.base_url.trim_end_matches('/'))).await {
        Ok(response) if response.status().is_success() => response
            .json::<serde_json::Value>()
            .await
            .map(|data| data.get("utilmeta").is_some())
            .unwrap_or(false),
        _ => false,
    };
    if live {
        println!("utilmeta-proxy is live at: {}", config.base_url);
        Ok(())
    } else {
        eprintln!(
            "utilmeta-proxy is not live at: {}, please setup and start the proxy service",
            config.base_url
        );
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Arc::new(ProxyConfig::from_env()?);
    if let Err(e) = register_metrics() {
        warn!(error = %e, "metrics registration failed");
    }

    info!(
        base_url = %config.base_url,
        supervisor = %config.supervisor_base_url,
        private = config.private,
        "starting utilmeta-proxy"
    );

    let catalog = Arc::new(MemoryCatalog::new());
    let state = AppState::new(config.clone(), catalog);

    // advisory reachability probe; the proxy serves either way
    let probe_config = config.clone();
    tokio::spawn(async move {
        probe_supervisor(&probe_config).await;
    });

    serve(state).await?;
    Ok(())
}
