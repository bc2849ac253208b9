//! Server assembly: router construction, listeners, signal handling, and
//! the shutdown sequence (drain handlers, then stop the fleet).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::env;
use crate::management;
use crate::proxy::router::{gateway_health, proxy_fallback};
use crate::proxy::ws::ws_upgrade;
use crate::registry::Registry;
use crate::state::AppState;
use crate::tls::{CertificateSource, ExternalUrlSource, SettingsCertSource, SettingsExternalUrl};

/// Grace given to in-flight HTTPS handlers at shutdown.
const HTTPS_DRAIN: Duration = Duration::from_secs(5);

/// Assemble the full router: health, WebSocket upgrade, management API,
/// and the proxy catch-all.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let ws_path = state.registry.ws_upgrade_path();

    Router::new()
        .route("/health", get(gateway_health))
        .route(&ws_path, get(ws_upgrade))
        .nest("/api", management::router(state.clone()))
        .fallback(proxy_fallback)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the gateway until SIGINT/SIGTERM. Returns an error only for fatal
/// startup problems; the caller maps that to exit code 1.
pub async fn run(
    registry: Arc<Registry>,
    host_override: Option<String>,
    port_override: Option<u16>,
) -> anyhow::Result<()> {
    let state = AppState::new(Arc::clone(&registry));

    bootstrap_api_key(&registry)?;

    state
        .manager
        .boot(&registry)
        .await
        .map_err(|e| anyhow::anyhow!("recovering services at boot: {e}"))?;
    state.limiter.spawn_sweeper();
    state.cache.spawn_sweeper();

    let app = build_router(state.clone());

    let host = host_override.unwrap_or_else(|| registry.listen_host());
    let port = port_override.unwrap_or_else(|| registry.listen_port());
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("mcp-gateway listening on http://{addr} ({})", env::env_name());
    if let Some(url) = SettingsExternalUrl::new(Arc::clone(&registry)).external_url() {
        info!("externally reachable at {url}");
    }

    let https = start_https_listener(&registry, app.clone()).await;
    if https.is_none() {
        info!("https listener disabled (no certificate material)");
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving http")?;

    info!("draining and stopping services");
    if let Some((handle, task)) = https {
        handle.graceful_shutdown(Some(HTTPS_DRAIN));
        let _ = task.await;
    }
    state.manager.stop_all().await;
    info!("mcp-gateway stopped");
    Ok(())
}

/// Start the HTTPS listener iff the certificate hook yields material.
async fn start_https_listener(
    registry: &Arc<Registry>,
    app: Router,
) -> Option<(axum_server::Handle, tokio::task::JoinHandle<()>)> {
    let source = SettingsCertSource::new(Arc::clone(registry));
    let material = match source.certificate() {
        Ok(Some(material)) => material,
        Ok(None) => return None,
        Err(e) => {
            warn!("certificate hook failed, https disabled: {e:#}");
            return None;
        }
    };

    let mut cert_pem = material.cert_pem;
    if let Some(chain) = material.chain_pem {
        cert_pem.extend_from_slice(&chain);
    }
    let config = match RustlsConfig::from_pem(cert_pem, material.key_pem).await {
        Ok(config) => config,
        Err(e) => {
            warn!("invalid certificate material, https disabled: {e}");
            return None;
        }
    };

    let https_addr: SocketAddr = format!("{}:{}", registry.listen_host(), registry.https_port())
        .parse()
        .ok()?;
    let handle = axum_server::Handle::new();
    let serve_handle = handle.clone();
    let task = tokio::spawn(async move {
        info!("mcp-gateway listening on https://{https_addr}");
        if let Err(e) = axum_server::bind_rustls(https_addr, config)
            .handle(serve_handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            error!("https listener failed: {e}");
        }
    });
    Some((handle, task))
}

/// First-run convenience: with `INITIAL_SETUP` set and no key on record,
/// issue one and print it exactly once.
fn bootstrap_api_key(registry: &Registry) -> anyhow::Result<()> {
    if !env::initial_setup() {
        return Ok(());
    }
    if registry
        .count_api_keys()
        .map_err(|e| anyhow::anyhow!("{e}"))?
        > 0
    {
        return Ok(());
    }
    let secret = registry
        .issue_api_key("initial-setup")
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("initial management API key (store it now, it is not shown again): {secret}");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(t), Ok(i)) => (t, i),
            _ => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl+C");
    }
}
