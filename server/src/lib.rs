pub mod auth;
pub mod board;
pub mod config;
pub mod entities;
pub mod error;
pub mod leaderboard;
pub mod matches;
pub mod session;

#[cfg(test)]
mod test_logger;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::Router;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::config::{ResolvedConfig, RuntimeConfig};

pub struct AppState {
    pub db: DatabaseConnection,
    pub cfg: RuntimeConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.cfg.cors_origins);
    Router::new()
        .nest("/api/auth", auth::routes())
        .nest("/api/match", matches::routes())
        .nest("/api/leaderboard", leaderboard::routes())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Connect to the store and, unless disabled, bring the schema up to date.
pub async fn setup(cfg: &ResolvedConfig) -> anyhow::Result<DatabaseConnection> {
    let mut opts = ConnectOptions::new(cfg.db_url.clone());
    opts.max_connections(cfg.db_max_conns);
    let db = Database::connect(opts).await?;
    if cfg.migrate_on_start {
        Migrator::up(&db, None).await?;
    }
    Ok(db)
}
