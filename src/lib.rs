pub mod api;
pub mod config;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use logic::{ChangeNotifier, HookContext, LogNotifier, Reconciler, TableField, TableFieldError};

// Export all model types
pub use model::*;

// Export store types
pub use store::{MemoryStore, PostgresStore, RelationStore, RelationTransaction, SessionCache, StoreError};

use crate::api::handlers::AppContext;
use crate::config::{AppConfig, StorageBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Builds the shared state for `store` from the loaded configuration.
pub fn app_state<S: RelationStore>(store: S, config: &AppConfig) -> api::handlers::AppState<S> {
    Arc::new(AppContext::new(
        store,
        RelationRegistry::new(config.relationships.clone()),
        config.fields.clone(),
        SessionCache::new(config.session_ttl()),
    ))
}

/// Serves the API on `listener` until the server stops.
pub async fn serve<S: RelationStore + 'static>(listener: TcpListener, store: S, config: &AppConfig) -> anyhow::Result<()> {
    let state = app_state(store, config);
    let sweep_every = (state.sessions.ttl() / 2).max(Duration::from_secs(1));
    let sweeper = state.sessions.spawn_sweeper(sweep_every);

    let app = api::routes::create_router::<S>().with_state(state);
    let served = axum::serve(listener, app).await;
    sweeper.abort();
    served?;
    Ok(())
}

/// Loads configuration, connects the configured backend and serves the API.
pub async fn run_server() -> anyhow::Result<()> {
    use anyhow::Context;

    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;

    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    log::info!("table-field server running on http://{}", bind_address);

    match config.storage.backend {
        StorageBackend::Memory => {
            let store = MemoryStore::new();
            if config.should_seed() {
                log::info!("Loading demo data...");
                seed::load_demo_data(&store)?;
            }
            serve(listener, store, &config).await
        }
        StorageBackend::Postgres => {
            let database_url = config.database_url()?;
            let max_connections = config.database.max_connections.unwrap_or(20);
            log::info!("Connecting to PostgreSQL...");
            let store = PostgresStore::new(&database_url, max_connections).await?;
            if config.should_seed() {
                log::warn!("Demo data is only available for the memory backend");
            }
            serve(listener, store, &config).await
        }
    }
}
