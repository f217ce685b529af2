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

use std::{sync::Arc, time::Duration};

use alloy::{primitives::Address, providers::ProviderBuilder};
use anyhow::{bail, Context, Result};
use clap::Parser;
use points_service::{
    api::{ApiConfig, AppState},
    cursor::BlockCursor,
    db::{AnyDb, DbObj},
    ingest::{run_ingestion_supervisor, IngestionConfig, IngestionService, RegistryAddresses, RpcEventSource},
    serve, shutdown_signal,
    status::IngestionStatus,
};
use url::Url;

/// Arguments of the points service.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct MainArgs {
    /// URL of the Ethereum RPC endpoint.
    #[clap(short, long, env)]
    rpc_url: Url,
    /// DB connection string.
    #[clap(long, env = "DATABASE_URL", default_value = "sqlite:points.db?mode=rwc")]
    db: String,
    /// Address of the vanilla staking registry contract.
    #[clap(long, env)]
    vanilla_registry_address: Address,
    /// Address of the EigenLayer AVS contract.
    #[clap(long, env)]
    avs_address: Address,
    /// Address of the Symbiotic middleware contract.
    #[clap(long, env)]
    middleware_address: Address,
    /// ValidatorOptInRouter contract, queried for opt-in status when a vault is slashed.
    #[clap(long, env)]
    router_address: Address,
    /// Block to start indexing from when no cursor is persisted.
    #[clap(long, env, default_value = "21344601")]
    start_block: u64,
    /// Bind address for the REST API.
    #[clap(long, env, default_value = "0.0.0.0:8080")]
    bind_addr: String,
    /// Interval in seconds between checking for new events.
    #[clap(long, default_value = "12")]
    interval: u64,
    /// Number of blocks to process in each batch.
    #[clap(long, default_value = "500")]
    batch_size: u64,
    /// Bearer token for the admin endpoints. Admin endpoints are disabled when unset.
    #[clap(long, env = "POINTS_API_AUTH_TOKEN")]
    api_auth_token: Option<String>,
    /// Network address reported in the `/all` listing.
    #[clap(long, env, default_value = "0x9101eda106A443A0fA82375936D0D1680D5a64F5")]
    network_address: String,
    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(e) if e.not_found() => {}
        Err(e) => bail!("failed to load .env file: {e}"),
    }

    let args = MainArgs::parse();

    if args.log_json {
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    if let Err(err) = run(args).await {
        bail!("FATAL: Error running the points service: {err:?}");
    }

    Ok(())
}

async fn run(args: MainArgs) -> Result<()> {
    if args.batch_size == 0 {
        bail!("--batch-size must be greater than zero");
    }

    let db: DbObj = Arc::new(AnyDb::new(&args.db).await.context("Failed to open the database")?);
    let cursor = BlockCursor::new(db.clone());
    let start = cursor.init(args.start_block).await.context("Failed to initialise the cursor")?;
    tracing::info!("Ingestion resumes after block {start}");

    let provider = ProviderBuilder::new().connect_http(args.rpc_url.clone());
    let addresses = RegistryAddresses {
        vanilla_registry: args.vanilla_registry_address,
        middleware: args.middleware_address,
        avs: args.avs_address,
        router: args.router_address,
    };
    let source = RpcEventSource::new(provider, addresses);

    let status = IngestionStatus::new();
    let ingestion = Arc::new(IngestionService::new(
        source,
        db.clone(),
        cursor.clone(),
        status.clone(),
        IngestionConfig {
            interval: Duration::from_secs(args.interval),
            batch_size: args.batch_size,
        },
    ));
    let ingestion_task = tokio::spawn(run_ingestion_supervisor(ingestion));

    if args.api_auth_token.as_deref().map_or(true, str::is_empty) {
        tracing::warn!("No API auth token configured, admin endpoints are disabled");
    }
    let state = AppState::new(
        db,
        cursor,
        status,
        ApiConfig { auth_token: args.api_auth_token, network_address: args.network_address },
    );

    let listener = tokio::net::TcpListener::bind(&args.bind_addr)
        .await
        .context("Failed to bind a TCP listener")?;
    let res = serve(listener, state, shutdown_signal()).await;

    ingestion_task.abort();
    tracing::info!("Points service stopped");
    res
}
