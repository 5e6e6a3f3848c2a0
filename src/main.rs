use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use rapport_backend::config::AppConfig;
use rapport_backend::database::ChatStore;
use rapport_backend::graph::stage_manage::StageProfileSet;
use rapport_backend::graph::GraphExecutor;
use rapport_backend::invoker::HttpInvoker;
use rapport_backend::server;
use rapport_backend::session::SessionManager;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,rapport_backend=debug")),
        )
        .init();

    let config = Arc::new(AppConfig::load());
    tracing::info!("rapport backend starting (db: {})", config.database_path);

    let store = match ChatStore::new(&config.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let stage_profiles = match StageProfileSet::load(config.stage_profiles_path.as_deref()) {
        Ok(profiles) => Arc::new(profiles),
        Err(e) => {
            tracing::warn!("Stage profile load failed ({}); using built-ins", e);
            Arc::new(StageProfileSet::builtin())
        }
    };

    let invoker = Arc::new(HttpInvoker::new(config.invoker.clone()));
    let executor = Arc::new(GraphExecutor::new(
        invoker,
        store,
        config.clone(),
        stage_profiles,
    ));
    let sessions = SessionManager::new(executor, config.clone());

    if let Err(e) = server::serve(sessions, config).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
