pub mod accounts;
pub mod auth;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod logger;
pub mod mappers;
pub mod models;
pub mod proxy;
pub mod upstream;

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::accounts::AccountStore;
use crate::auth::AuthBroker;
use crate::dispatch::{DispatchEngine, DispatchState};
use crate::models::config::{apply_env_overrides, load_app_config, validate_app_config};
use crate::proxy::AppState;

fn data_dir() -> PathBuf {
    std::env::var("TRESTLE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

async fn start(data_dir: PathBuf) -> Result<(), String> {
    let mut config = load_app_config(&data_dir)?;
    apply_env_overrides(&mut config);
    validate_app_config(&config).map_err(|errors| {
        format!("configuration validation failed:\n{}", errors.join("\n"))
    })?;

    let accounts = Arc::new(AccountStore::new(data_dir));
    let loaded = accounts
        .load()
        .map_err(|e| format!("failed to load accounts: {}", e))?;
    if loaded == 0 {
        tracing::warn!("no accounts loaded, every request will fail until accounts are added");
    }

    let auth = Arc::new(AuthBroker::from_env());
    let state = Arc::new(DispatchState::new(&config.dispatch));
    state.start_sweeper().await;

    let engine = Arc::new(DispatchEngine::with_state(
        config.dispatch.clone(),
        accounts.clone(),
        auth,
        state.clone(),
    ));

    info!(
        accounts = loaded,
        policy = ?config.dispatch.policy,
        "dispatch engine ready"
    );

    let app_state = AppState {
        engine,
        accounts,
        config: Arc::new(config),
    };
    let result = proxy::serve(app_state)
        .await
        .map_err(|e| format!("proxy server failed: {}", e));

    state.shutdown().await;
    result
}

pub fn run() {
    let data_dir = data_dir();
    logger::init_logger(&data_dir);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(async {
        if let Err(e) = start(data_dir).await {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    });
}
