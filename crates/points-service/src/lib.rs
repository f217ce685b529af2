// Copyright 2026 Primev, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Loyalty points for validators and operators participating in the staking registries.
//!
//! Registry opt-in and opt-out events are replayed into a ledger of participation intervals
//! ([db]), guarded by a durable ingestion [cursor]. Points are never stored: the [api] recomputes
//! them from the raw intervals at whatever reference block a caller asks for, using the tiered
//! schedule in [accrual].

use std::future::Future;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

pub mod accrual;
pub mod api;
pub mod cursor;
pub mod db;
pub mod events;
pub mod ingest;
pub mod points;
pub mod status;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: std::sync::Arc<api::AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read listener address")?;
    tracing::info!("REST API listening on: {addr}");

    axum::serve(listener, api::app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("REST API service failed")?;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
