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

mod rpc;

pub use rpc::{
    IMevCommitAVS, IMevCommitMiddleware, ISymbioticVault, IValidatorOptInRouter, IVanillaRegistry,
    RegistryAddresses, RpcEventSource,
};

use std::{cmp::min, sync::Arc, time::Duration};

use alloy::{
    primitives::Address,
    transports::{RpcError, TransportErrorKind},
};
use anyhow::anyhow;
use async_trait::async_trait;
use thiserror::Error;

use crate::{
    cursor::BlockCursor,
    db::{DbError, DbObj, IntervalUpdate, NewInterval},
    events::{address_key, EventKind, EventLog, RegistryEvent, RegistryType},
    status::IngestionStatus,
};

const RESTART_DELAY_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 120;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbError),

    #[error("RPC error: {0}")]
    RpcError(#[from] RpcError<TransportErrorKind>),

    #[error("Log decoding error: {0}")]
    DecodeError(#[from] alloy::sol_types::Error),

    #[error("Contract call error: {0}")]
    ContractError(#[from] alloy::contract::Error),

    #[error("Error: {0}")]
    Error(#[from] anyhow::Error),
}

/// Upstream supplier of decoded registry events.
#[async_trait]
pub trait EventSource {
    /// Latest block the source can serve events for.
    async fn head_block(&self) -> Result<u64, ServiceError>;

    /// Events in `[from, to]`, ordered by block then log index. Slashing events are reported for
    /// `vaults` and for every vault registered within the range.
    async fn fetch_events(
        &self,
        from: u64,
        to: u64,
        vaults: &[Address],
    ) -> Result<Vec<EventLog>, ServiceError>;

    /// Whether each validator is still opted in through the middleware as of `block`.
    async fn middleware_opted_in(
        &self,
        identities: &[String],
        block: u64,
    ) -> Result<Vec<bool>, ServiceError>;
}

#[derive(Clone, Debug)]
pub struct IngestionConfig {
    /// Delay between head polls once caught up.
    pub interval: Duration,
    /// Maximum number of blocks fetched per batch.
    pub batch_size: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(12), batch_size: 500 }
    }
}

/// Single writer that replays registry events into the ledger and advances the cursor.
pub struct IngestionService<S> {
    pub source: S,
    pub db: DbObj,
    pub cursor: BlockCursor,
    pub status: IngestionStatus,
    pub config: IngestionConfig,
}

impl<S> IngestionService<S>
where
    S: EventSource + Send + Sync + 'static,
{
    pub fn new(
        source: S,
        db: DbObj,
        cursor: BlockCursor,
        status: IngestionStatus,
        config: IngestionConfig,
    ) -> Self {
        Self { source, db, cursor, status, config }
    }

    /// Poll the source forever. Failures are retried from the durable cursor with exponential
    /// back-off; this only returns if the task is cancelled.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.config.interval);
        let mut attempt: u32 = 0;

        loop {
            interval.tick().await;

            loop {
                match self.sync_once().await {
                    Ok(Some(_)) => {
                        attempt = 0;
                    }
                    Ok(None) => {
                        attempt = 0;
                        break;
                    }
                    Err(err) => {
                        attempt += 1;
                        // exponential backoff with a maximum delay of 120 seconds
                        let delay = Duration::from_secs(
                            2u64.saturating_pow(attempt - 1).min(MAX_BACKOFF_SECS),
                        );
                        tracing::error!(
                            "Ingestion failed: {err:?}, attempt number {attempt}, retrying in {}s",
                            delay.as_secs()
                        );
                        self.status.subscription_down(&err).await;
                        tokio::time::sleep(delay).await;
                        break;
                    }
                }
            }
        }
    }

    /// Process the next batch after the cursor. Returns the processed range, or `None` if the
    /// cursor is already at the source head.
    pub async fn sync_once(&self) -> Result<Option<(u64, u64)>, ServiceError> {
        let head = self.source.head_block().await?;
        self.status.subscription_up().await;

        let from = self.cursor.current_block().await? + 1;
        if head < from {
            return Ok(None);
        }
        let to = min(head, from.saturating_add(self.config.batch_size.max(1) - 1));

        self.process_blocks(from, to).await?;
        Ok(Some((from, to)))
    }

    /// Apply every event in `[from, to]` in order, then advance the cursor to `to`.
    pub async fn process_blocks(&self, from: u64, to: u64) -> Result<usize, ServiceError> {
        let start = std::time::Instant::now();
        let vaults = self.watched_vaults().await?;
        let events = self.source.fetch_events(from, to, &vaults).await?;

        for log in &events {
            self.apply_event(log).await?;
        }

        self.cursor.advance_to(to).await?;
        tracing::info!(
            "Processed blocks {from} to {to} in {:?} [num_events={}]",
            start.elapsed(),
            events.len()
        );
        Ok(events.len())
    }

    async fn watched_vaults(&self) -> Result<Vec<Address>, ServiceError> {
        let mut vaults = Vec::new();
        for vault in self.db.watched_vaults().await? {
            match vault.parse::<Address>() {
                Ok(addr) => vaults.push(addr),
                Err(err) => tracing::warn!("Ignoring malformed vault address {vault}: {err}"),
            }
        }
        Ok(vaults)
    }

    /// Apply one event to the ledger. Store failures are returned; ledger conflicts are logged
    /// and dropped.
    pub async fn apply_event(&self, log: &EventLog) -> Result<(), ServiceError> {
        let block = log.block_number;

        let res = match &log.event {
            RegistryEvent::OptedIn { kind, registry, identity, delegate, vault } => {
                let interval = NewInterval {
                    registry: *registry,
                    identity: identity.clone(),
                    delegate: delegate.as_ref().map(address_key),
                    vault: vault.as_ref().map(address_key),
                    kind: *kind,
                    opened_at: block,
                };
                self.db.open_interval(&interval).await.map(|update| {
                    log_update(update, kind.as_str(), identity, block);
                })
            }
            RegistryEvent::OptedOut { kind, registry, identity } => {
                self.db.close_interval(*registry, identity, block).await.map(|update| {
                    log_update(update, kind.as_str(), identity, block);
                })
            }
            RegistryEvent::VaultDeregistered { vault } => {
                let vault = address_key(vault);
                self.db.close_intervals_by_vault(&vault, block).await.map(|closed| {
                    tracing::info!("VaultDeregistered {vault} at block {block}: closed {closed} intervals");
                })
            }
            RegistryEvent::OperatorDeregistered { registry, operator } => {
                let operator = address_key(operator);
                self.db.close_intervals_by_delegate(*registry, &operator, block).await.map(
                    |closed| {
                        tracing::info!(
                            "OperatorDeregistered {operator} at block {block}: closed {closed} intervals"
                        );
                    },
                )
            }
            RegistryEvent::VaultSlashed { vault } => return self.apply_slash(log, vault).await,
        };

        self.handle_ledger_result(log, res).await
    }

    /// Close the intervals of validators behind a slashed vault that the middleware no longer
    /// reports as opted in at the slash block.
    async fn apply_slash(&self, log: &EventLog, vault: &Address) -> Result<(), ServiceError> {
        let block = log.block_number;
        let vault = address_key(vault);
        let identities =
            self.db.open_identities_by_vault(RegistryType::Symbiotic, &vault, block).await?;
        if identities.is_empty() {
            tracing::debug!("OnSlash for vault {vault} at block {block}: no open intervals");
            return Ok(());
        }

        let opted_in = self.source.middleware_opted_in(&identities, block).await?;
        if opted_in.len() != identities.len() {
            return Err(anyhow!(
                "Opt-in status for {} validators returned {} entries",
                identities.len(),
                opted_in.len()
            )
            .into());
        }

        let kind = EventKind::OnSlashAutoOptOut.as_str();
        let mut closed = 0;
        for (identity, still_opted_in) in identities.iter().zip(opted_in) {
            if still_opted_in {
                continue;
            }
            let res = self.db.close_interval(RegistryType::Symbiotic, identity, block).await.map(
                |update| {
                    log_update(update, kind, identity, block);
                },
            );
            self.handle_ledger_result(log, res).await?;
            closed += 1;
        }
        tracing::info!(
            "OnSlash for vault {vault} at block {block}: {closed} of {} validators no longer opted in",
            identities.len()
        );
        Ok(())
    }

    async fn handle_ledger_result(
        &self,
        log: &EventLog,
        res: Result<(), DbError>,
    ) -> Result<(), ServiceError> {
        let block = log.block_number;
        let kind = log.event.kind();
        match res {
            Ok(()) => Ok(()),
            Err(DbError::NoOpenInterval { registry, identity }) => {
                // Identities registered before the configured start block close without a record.
                tracing::warn!(
                    "Dropping {kind} at block {block}: {registry} identity {identity} has no interval"
                );
                Ok(())
            }
            Err(err) if err.is_consistency_error() => {
                tracing::warn!("Dropping {kind} at block {block} [log_index={}]: {err}", log.log_index);
                self.status.record_inconsistency(format!("{kind} at block {block}: {err}")).await;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn log_update(update: IntervalUpdate, kind: &str, identity: &str, block: u64) {
    match update {
        IntervalUpdate::Applied => tracing::info!("{kind} {identity} at block {block}"),
        IntervalUpdate::Replayed => {
            tracing::debug!("Skipping replayed {kind} {identity} at block {block}")
        }
    }
}

/// Keep the ingestion task alive, restarting it if it ever stops, and reflect its liveness in
/// the shared [IngestionStatus].
pub async fn run_ingestion_supervisor<S>(service: Arc<IngestionService<S>>)
where
    S: EventSource + Send + Sync + 'static,
{
    loop {
        tracing::info!("Starting ingestion task");
        service.status.set_running(true).await;

        let service_clone = service.clone();
        let handle = tokio::spawn(async move {
            service_clone.run().await;
        });

        let res = handle.await;
        service.status.set_running(false).await;
        match res {
            Ok(()) => {
                tracing::error!(
                    "Ingestion task returned unexpectedly, restarting in {} seconds",
                    RESTART_DELAY_SECS
                );
            }
            Err(e) if e.is_panic() => {
                tracing::error!(
                    "Ingestion task panicked, restarting in {} seconds",
                    RESTART_DELAY_SECS
                );
            }
            Err(e) => {
                tracing::error!(
                    "Ingestion task cancelled ({e}), restarting in {} seconds",
                    RESTART_DELAY_SECS
                );
            }
        }

        tokio::time::sleep(Duration::from_secs(RESTART_DELAY_SECS)).await;
    }
}
