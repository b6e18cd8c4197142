use crate::{config::Config, websocket::ConnectionRegistry};
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub db: Pool<Postgres>,
    pub registry: ConnectionRegistry,
    pub redis: redis::Client,
    pub config: Arc<Config>,
    /// Identifies this process on the redis bus so the pub/sub bridge can
    /// drop payloads it published itself (local delivery already happened).
    pub instance_id: Uuid,
}
