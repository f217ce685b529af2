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

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use alloy::primitives::Address;
use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::{any::install_default_drivers, AnyPool};
use tempfile::NamedTempFile;

use crate::{
    db::{AnyDb, DbError, DbObj},
    events::{EventLog, RegistryEvent},
    ingest::{EventSource, ServiceError},
};

pub struct TestDb {
    pub db: DbObj,
    pub db_url: String,
    pub pool: AnyPool,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Fresh migrated SQLite database in a temporary file.
    pub async fn new() -> Result<Self, DbError> {
        install_default_drivers();

        let temp_file = NamedTempFile::new().map_err(|e| DbError::SqlErr(sqlx::Error::Io(e)))?;
        let db_url = format!("sqlite:{}", temp_file.path().display());
        let any_db = AnyDb::new(&db_url).await?;
        let pool = any_db.pool().clone();

        Ok(Self { db: Arc::new(any_db), db_url, pool, _temp_file: temp_file })
    }
}

#[derive(Default)]
struct MockChain {
    head: u64,
    events: Vec<EventLog>,
    failures: u32,
    middleware_opted_out: HashSet<String>,
}

/// Scripted in-memory [EventSource]. Clones share the same chain.
#[derive(Clone, Default)]
pub struct MockEventSource {
    chain: Arc<Mutex<MockChain>>,
}

impl MockEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self) -> std::sync::MutexGuard<'_, MockChain> {
        self.chain.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an event; the head moves up to its block if needed.
    pub fn push(&self, event: EventLog) {
        let mut chain = self.chain();
        chain.head = chain.head.max(event.block_number);
        chain.events.push(event);
        chain.events.sort_by_key(|e| (e.block_number, e.log_index));
    }

    pub fn set_head(&self, head: u64) {
        self.chain().head = head;
    }

    /// Fail the next `n` calls to the source.
    pub fn fail_next(&self, n: u32) {
        self.chain().failures = n;
    }

    /// Report `identity` as no longer opted in through the middleware.
    pub fn set_middleware_opted_out(&self, identity: &str) {
        self.chain().middleware_opted_out.insert(identity.to_string());
    }

    fn take_failure(&self) -> Result<(), ServiceError> {
        let mut chain = self.chain();
        if chain.failures > 0 {
            chain.failures -= 1;
            return Err(anyhow!("mock source unavailable").into());
        }
        Ok(())
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn head_block(&self) -> Result<u64, ServiceError> {
        self.take_failure()?;
        Ok(self.chain().head)
    }

    async fn fetch_events(
        &self,
        from: u64,
        to: u64,
        vaults: &[Address],
    ) -> Result<Vec<EventLog>, ServiceError> {
        self.take_failure()?;
        let chain = self.chain();
        let in_range: Vec<&EventLog> =
            chain.events.iter().filter(|e| e.block_number >= from && e.block_number <= to).collect();

        // Slashes only surface for vaults the caller watches or that registered in this range.
        let mut watched: HashSet<Address> = vaults.iter().copied().collect();
        watched.extend(in_range.iter().filter_map(|e| match &e.event {
            RegistryEvent::OptedIn { vault, .. } => *vault,
            _ => None,
        }));

        Ok(in_range
            .into_iter()
            .filter(|e| match &e.event {
                RegistryEvent::VaultSlashed { vault } => watched.contains(vault),
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn middleware_opted_in(
        &self,
        identities: &[String],
        _block: u64,
    ) -> Result<Vec<bool>, ServiceError> {
        self.take_failure()?;
        let chain = self.chain();
        Ok(identities.iter().map(|id| !chain.middleware_opted_out.contains(id)).collect())
    }
}
