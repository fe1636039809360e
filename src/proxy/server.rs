use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tracing::info;

use crate::accounts::AccountStore;
use crate::dispatch::DispatchEngine;
use crate::error::{AppError, AppResult};
use crate::models::AppConfig;

use super::handlers;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DispatchEngine>,
    pub accounts: Arc<AccountStore>,
    pub config: Arc<AppConfig>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handlers::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::handle_count_tokens),
        )
        .route("/health", get(handlers::handle_health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn serve(state: AppState) -> AppResult<()> {
    let bind_addr = format!(
        "{}:{}",
        state.config.proxy.host, state.config.proxy.port
    );
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AppError::Config(format!("failed to bind {}: {}", bind_addr, e)))?;
    info!("proxy listening on http://{}", bind_addr);

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| AppError::Unknown(format!("server error: {}", e)))?;
    Ok(())
}
