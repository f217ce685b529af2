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

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{DbError, DbObj};

/// Durable bookmark of the last block whose events are fully applied to the ledger.
///
/// Clones share the same handle. Writes are serialised so the persisted height never moves
/// backwards, even if a second writer (an admin request) races the ingestion loop.
#[derive(Clone)]
pub struct BlockCursor {
    db: DbObj,
    write_lock: Arc<Mutex<()>>,
}

impl BlockCursor {
    pub fn new(db: DbObj) -> Self {
        Self { db, write_lock: Arc::new(Mutex::new(())) }
    }

    /// Persist `start_block - 1` unless a cursor already exists, so the start block itself is
    /// processed. Returns the resulting cursor height.
    pub async fn init(&self, start_block: u64) -> Result<u64, DbError> {
        let _guard = self.write_lock.lock().await;
        if let Some(block) = self.db.get_last_block().await? {
            tracing::info!("Resuming from persisted cursor at block {block}");
            return Ok(block);
        }
        let block = start_block.saturating_sub(1);
        self.db.set_last_block(block).await?;
        tracing::info!("Initialised cursor at block {block}");
        Ok(block)
    }

    /// Last block whose events were applied, or 0 before the cursor is initialised.
    pub async fn current_block(&self) -> Result<u64, DbError> {
        Ok(self.db.get_last_block().await?.unwrap_or(0))
    }

    /// Move the cursor to `block`. Heights at or below the current one are ignored and return
    /// `false`.
    pub async fn advance_to(&self, block: u64) -> Result<bool, DbError> {
        let _guard = self.write_lock.lock().await;
        if let Some(current) = self.db.get_last_block().await? {
            if block <= current {
                tracing::debug!("Ignoring cursor update to {block}, already at {current}");
                return Ok(false);
            }
        }
        self.db.set_last_block(block).await?;
        Ok(true)
    }
}
