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

//! Point-in-time aggregation over the participation ledger.
//!
//! Nothing is cached: every query reloads the raw intervals opened at or before the reference
//! block and runs them through the accrual schedule, so any historical block can be answered
//! exactly. A reference block beyond the ingestion cursor under-counts.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    db::{DbError, LedgerDb, ParticipationRecord},
    events::RegistryType,
};

fn sum_points(records: &[ParticipationRecord], reference_block: u64) -> u64 {
    records.iter().map(|r| r.points_at(reference_block)).sum()
}

/// Points earned by `key` in `registry` as of `reference_block`, matching the key against the
/// identity, delegate and vault of each interval. Returns 0 when nothing matches.
pub async fn points_for_identity<D>(
    db: &D,
    registry: RegistryType,
    key: &str,
    reference_block: u64,
) -> Result<u64, DbError>
where
    D: LedgerDb + ?Sized,
{
    let records = db.records_for_identity(Some(registry), key, reference_block).await?;
    Ok(sum_points(&records, reference_block))
}

/// Same as [points_for_identity] across every registry.
pub async fn points_for_address<D>(db: &D, key: &str, reference_block: u64) -> Result<u64, DbError>
where
    D: LedgerDb + ?Sized,
{
    let records = db.records_for_identity(None, key, reference_block).await?;
    Ok(sum_points(&records, reference_block))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PopulationStats {
    pub total_points: u64,
    pub stakers: u64,
    pub networks: u64,
    pub operators: u64,
}

/// Points summed over a whole registry, plus the number of distinct operators that ever
/// delegated in it up to `reference_block`.
pub async fn population_stats<D>(
    db: &D,
    registry: RegistryType,
    reference_block: u64,
) -> Result<PopulationStats, DbError>
where
    D: LedgerDb + ?Sized,
{
    let records = db.records_for_registry(registry, reference_block).await?;
    let operators: BTreeSet<&str> = records.iter().filter_map(|r| r.delegate.as_deref()).collect();

    Ok(PopulationStats {
        total_points: sum_points(&records, reference_block),
        stakers: 0,
        networks: 0,
        operators: operators.len() as u64,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveIdentityPoints {
    pub delegate: String,
    pub vault: Option<String>,
    pub points: u64,
}

/// Page of delegates still registered at `reference_block`, each with its recomputed points.
///
/// Pages over `SELECT DISTINCT ... LIMIT/OFFSET` and recomputes each delegate from scratch, which
/// is fine while the ledger stays small.
pub async fn list_active_identities<D>(
    db: &D,
    registry: RegistryType,
    reference_block: u64,
    limit: u64,
    offset: u64,
) -> Result<Vec<ActiveIdentityPoints>, DbError>
where
    D: LedgerDb + ?Sized,
{
    let delegates = db.active_delegates(registry, reference_block, limit, offset).await?;

    let mut out = Vec::with_capacity(delegates.len());
    for active in delegates {
        let points = points_for_identity(db, registry, &active.delegate, reference_block).await?;
        out.push(ActiveIdentityPoints { delegate: active.delegate, vault: active.vault, points });
    }
    Ok(out)
}
