use std::sync::Arc;

use chat_service::{
    config::Config, db, error::AppError, logging, routes, state::AppState,
    websocket::{pubsub, ConnectionRegistry},
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Arc::new(Config::from_env()?);

    let db = db::init_pool(&cfg)
        .await
        .map_err(|e| AppError::StartServer(format!("db: {e}")))?;

    // Schema must be in sync before serving; a failed migration is fatal.
    db::MIGRATOR
        .run(&db)
        .await
        .map_err(|e| AppError::StartServer(format!("migrations: {e}")))?;

    let redis = redis::Client::open(cfg.redis_url.as_str())
        .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;

    let registry = ConnectionRegistry::new();
    let instance_id = Uuid::new_v4();

    let state = AppState {
        db,
        registry: registry.clone(),
        redis: redis.clone(),
        config: cfg.clone(),
        instance_id,
    };

    // Bridge events published by other instances into the local registry.
    tokio::spawn(async move {
        if let Err(e) = pubsub::start_psub_listener(redis, registry, instance_id).await {
            tracing::error!(error = %e, "redis pubsub listener failed");
        }
    });

    let app = routes::build_router().with_state(state);
    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, %instance_id, "starting chat-service");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AppError::StartServer(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::StartServer(e.to_string()))?;

    Ok(())
}
