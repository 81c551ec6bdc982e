use admin_portal::config::get_configuration;
use admin_portal::services::allow_list::PgAllowList;
use admin_portal::services::auth_client::AuthClient;
use admin_portal::services::guard_registry::{GuardRegistry, ProviderBackend};
use admin_portal::services::kv_store::{KeyValueStore, RedisStore};
use admin_portal::services::session_source::SessionEventHub;
use admin_portal::services::token_store::TokenStore;
use admin_portal::startup::build_router;
use admin_portal::AppState;
use dotenvy::dotenv;
use service_core::observability::logging::init_tracing;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let configuration = get_configuration().map_err(|e| {
        eprintln!("Failed to read configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    // Initialize tracing using shared logic
    init_tracing(
        "admin-portal",
        &configuration.observability.log_level,
        configuration.observability.otlp_endpoint.as_deref(),
    )?;

    admin_portal::services::metrics::init_metrics()
        .map_err(|e| anyhow::anyhow!("Failed to register metrics: {}", e))?;

    let allow_list = PgAllowList::connect(
        &configuration.database.url,
        configuration.database.max_connections,
        configuration.database.min_connections,
    )
    .await?;
    allow_list.health_check().await?;
    if configuration.database.run_migrations {
        allow_list.run_migrations().await?;
    }

    let store = Arc::new(RedisStore::connect(&configuration.redis.url).await?);
    store.health_check().await?;
    let auth_client = Arc::new(AuthClient::new(configuration.auth_service.clone())?);
    let tokens = TokenStore::new(
        store.clone(),
        &configuration.redis.key_prefix,
        configuration.redis.token_ttl_seconds,
    );
    let hub = SessionEventHub::new();

    let backend = ProviderBackend::new(
        auth_client.clone(),
        store,
        Arc::new(allow_list),
        tokens.clone(),
        hub.clone(),
        &configuration.redis,
    );
    let guards = Arc::new(GuardRegistry::new(
        Arc::new(backend),
        configuration.guard.clone(),
    ));

    let shutdown = CancellationToken::new();
    let sweeper = guards.clone().spawn_sweeper(shutdown.clone());

    let state = AppState::new(auth_client, tokens, hub, guards);
    let app = build_router(state, configuration.server.secure_cookies);

    let address = format!(
        "{}:{}",
        configuration.server.host, configuration.server.port
    );
    let listener = tokio::net::TcpListener::bind(&address).await.map_err(|e| {
        tracing::error!("Failed to bind TCP listener to {}: {}", address, e);
        anyhow::anyhow!("Failed to bind to address {}: {}", address, e)
    })?;

    info!("Starting admin-portal on {}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            tracing::error!("Server error: {}", e);
            anyhow::anyhow!("Server error: {}", e)
        })?;

    // Unmount every guard before exit
    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("Guard sweeper ended abnormally: {}", e);
    }

    info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
