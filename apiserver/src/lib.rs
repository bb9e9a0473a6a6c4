//! The exposed surface for multi-cluster apps: request-path validation, the
//! v3 HTTP routes and a client for them.

pub mod api;
pub mod client;
pub mod config;
pub mod errors;
pub mod metrics_defs;
pub mod service;
pub mod types;

use service::MCAppService;
use std::sync::Arc;
use tokio::net::TcpListener;

pub use client::{Client, ClientError};
pub use errors::ApiError;

#[derive(thiserror::Error, Debug)]
pub enum ApiServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Binds the configured listener and serves the API until it fails.
pub async fn run(
    listener: &config::Listener,
    service: Arc<MCAppService>,
) -> Result<(), ApiServerError> {
    let tcp = TcpListener::bind(listener.addr()).await?;
    api::serve(tcp, service).await?;
    Ok(())
}
