//! Kirpich development backend.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 127.0.0.1:9100
//! cargo run --bin kirpich-backend
//!
//! # Run on custom address
//! cargo run --bin kirpich-backend -- --bind 0.0.0.0:8080
//!
//! # Or via environment variable
//! KIRPICH_BACKEND_ADDR=0.0.0.0:8080 cargo run --bin kirpich-backend
//! ```

use std::sync::Arc;

use clap::Parser;
use kirpich_backend::config::{BackendCliArgs, BackendConfig};
use kirpich_backend::server::{self, BackendState};
use kirpich_backend::store::Store;
use kirpich_proto::ids::ChatId;

#[tokio::main]
async fn main() {
    let cli = BackendCliArgs::parse();

    let config = match BackendConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting kirpich backend");

    let store = Store::new(config.token_ttl);
    for title in &config.chats {
        store.create_chat(chat_id_for(title), title.as_str()).await;
    }
    let state = Arc::new(BackendState::with_config(config.max_frame_size, store));

    match server::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "backend listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "backend server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start backend");
            std::process::exit(1);
        }
    }
}

/// "Team Updates" becomes `team-updates`.
fn chat_id_for(title: &str) -> ChatId {
    let slug: Vec<String> = title
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    ChatId::new(slug.join("-"))
}
