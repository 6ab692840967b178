use anyhow::Context;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vsfleet_orchestrator::config::{self, PluginConfig};
use vsfleet_orchestrator::http::{self, AppState};
use vsfleet_orchestrator::provider_manager::ProviderManager;
use vsfleet_orchestrator::InstanceGroup;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let provider_name = ProviderManager::current_provider_name();
    let connector = ProviderManager::get_connector(&provider_name)
        .with_context(|| format!("gateway '{}' is not available in this build", provider_name))?;

    let cancel = CancellationToken::new();
    let mut group = InstanceGroup::new(connector);
    let info = group
        .init(&PluginConfig::from_env(), config::settings_from_env(), &cancel)
        .await
        .context("instance group init failed")?;
    tracing::info!(
        "🚀 [main] {} plugin {} ({}) via {} gateway",
        info.id,
        info.version,
        info.build_info,
        provider_name
    );

    let state = Arc::new(AppState::new(group, cancel.clone()));
    let addr = env::var("VSFLEET_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8001".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("🎧 [main] Listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, http::router(state.clone()))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::warn!("⚠️ [main] Ctrl-C handler unavailable, waiting for cancellation");
                shutdown.cancelled().await;
                return;
            }
            tracing::info!("🛑 [main] Shutting down");
            shutdown.cancel();
        })
        .await?;

    match Arc::try_unwrap(state) {
        Ok(state) => {
            let mut group = state.group;
            group.shutdown().await?;
        }
        Err(_) => tracing::warn!("⚠️ [main] Requests still in flight, skipping session logout"),
    }
    Ok(())
}
