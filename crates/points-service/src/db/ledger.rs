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

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use sqlx::{
    any::{install_default_drivers, AnyArguments, AnyConnectOptions, AnyPoolOptions, AnyRow},
    query::Query,
    Any, AnyPool, Row,
};

use super::DbError;
use crate::{
    accrual,
    events::{EventKind, RegistryType},
};

const SQL_BLOCK_KEY: i64 = 0;

/// Block heights and counts are stored as BIGINT; heights beyond `i64::MAX` saturate.
fn sql_block(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

const RECORD_COLUMNS: &str =
    "registry_type, identity_key, delegate, vault, event_type, opted_in_block, opted_out_block";

/// One participation interval of an identity in a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipationRecord {
    pub registry_type: RegistryType,
    pub identity_key: String,
    pub delegate: Option<String>,
    pub vault: Option<String>,
    pub event_type: String,
    pub opted_in_block: u64,
    pub opted_out_block: Option<u64>,
}

impl ParticipationRecord {
    /// True if the interval closed at or before `reference_block`.
    pub fn is_closed_at(&self, reference_block: u64) -> bool {
        self.opted_out_block.is_some_and(|out| out <= reference_block)
    }

    /// Points this interval has earned as of `reference_block`.
    pub fn points_at(&self, reference_block: u64) -> u64 {
        if self.opted_in_block > reference_block {
            return 0;
        }
        accrual::interval_points(self.opted_in_block, self.opted_out_block, reference_block)
    }

    fn from_row(row: &AnyRow) -> Result<Self, DbError> {
        let registry: String = row.try_get("registry_type")?;
        let registry_type =
            RegistryType::from_str(&registry).map_err(|_| DbError::BadRegistryType(registry))?;
        let opted_in: i64 = row.try_get("opted_in_block")?;
        let opted_out: Option<i64> = row.try_get("opted_out_block")?;

        Ok(Self {
            registry_type,
            identity_key: row.try_get("identity_key")?,
            delegate: row.try_get("delegate")?,
            vault: row.try_get("vault")?,
            event_type: row.try_get("event_type")?,
            opted_in_block: opted_in as u64,
            opted_out_block: opted_out.map(|b| b as u64),
        })
    }
}

/// Opt-in to be written to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInterval {
    pub registry: RegistryType,
    pub identity: String,
    pub delegate: Option<String>,
    pub vault: Option<String>,
    pub kind: EventKind,
    pub opened_at: u64,
}

/// Outcome of a ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUpdate {
    /// The row was written.
    Applied,
    /// The mutation was already present; nothing changed.
    Replayed,
}

/// Distinct (delegate, vault) pair with an interval open at the reference block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDelegate {
    pub delegate: String,
    pub vault: Option<String>,
}

#[async_trait]
pub trait LedgerDb {
    /// Record an opt-in. Fails with [DbError::DuplicateOpenInterval] if a different interval is
    /// still open for the identity, and with [DbError::OverlappingInterval] if it would start
    /// inside a closed one.
    async fn open_interval(&self, interval: &NewInterval) -> Result<IntervalUpdate, DbError>;

    /// Close the open interval of an identity. Closing an identity whose intervals are all closed
    /// is a replay and leaves the ledger untouched.
    async fn close_interval(
        &self,
        registry: RegistryType,
        identity: &str,
        closed_at: u64,
    ) -> Result<IntervalUpdate, DbError>;

    /// Close every open interval backed by `vault`, returning the number of rows closed.
    async fn close_intervals_by_vault(&self, vault: &str, closed_at: u64) -> Result<u64, DbError>;

    /// Close every open interval delegated to `delegate` in `registry`.
    async fn close_intervals_by_delegate(
        &self,
        registry: RegistryType,
        delegate: &str,
        closed_at: u64,
    ) -> Result<u64, DbError>;

    /// Identities of `registry` backed by `vault` with an interval open at `block`.
    async fn open_identities_by_vault(
        &self,
        registry: RegistryType,
        vault: &str,
        block: u64,
    ) -> Result<Vec<String>, DbError>;

    /// Every vault that ever backed an interval.
    async fn watched_vaults(&self) -> Result<Vec<String>, DbError>;

    /// All intervals of an identity, oldest first.
    async fn intervals(
        &self,
        registry: RegistryType,
        identity: &str,
    ) -> Result<Vec<ParticipationRecord>, DbError>;

    /// Intervals opened at or before `reference_block` whose identity, delegate or vault is
    /// `key`. `None` searches every registry.
    async fn records_for_identity(
        &self,
        registry: Option<RegistryType>,
        key: &str,
        reference_block: u64,
    ) -> Result<Vec<ParticipationRecord>, DbError>;

    /// Intervals of a registry opened at or before `reference_block`.
    async fn records_for_registry(
        &self,
        registry: RegistryType,
        reference_block: u64,
    ) -> Result<Vec<ParticipationRecord>, DbError>;

    /// Page of distinct delegates with an interval open at `reference_block`.
    async fn active_delegates(
        &self,
        registry: RegistryType,
        reference_block: u64,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<ActiveDelegate>, DbError>;

    async fn count_records(&self) -> Result<u64, DbError>;

    async fn get_last_block(&self) -> Result<Option<u64>, DbError>;
    async fn set_last_block(&self, block_numb: u64) -> Result<(), DbError>;
}

pub type DbObj = Arc<dyn LedgerDb + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AnyDb {
    pub pool: AnyPool,
}

impl AnyDb {
    /// For SQLite use a `sqlite:file_path` URL; for Postgres `postgres://`.
    pub async fn new(conn_str: &str) -> Result<Self, DbError> {
        install_default_drivers();
        let opts = AnyConnectOptions::from_str(conn_str)?;

        // Every connection to an in-memory SQLite database sees its own empty database.
        let max_connections = if conn_str.contains(":memory:") { 1 } else { 5 };
        let pool = AnyPoolOptions::new().max_connections(max_connections).connect_with(opts).await?;

        // apply any migrations
        sqlx::migrate!().run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn fetch_records<'q>(
        &self,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<Vec<ParticipationRecord>, DbError> {
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(ParticipationRecord::from_row).collect()
    }
}

#[async_trait]
impl LedgerDb for AnyDb {
    async fn open_interval(&self, interval: &NewInterval) -> Result<IntervalUpdate, DbError> {
        let registry = interval.registry;
        let opened_at = sql_block(interval.opened_at);
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT opted_in_block FROM participation_records
             WHERE registry_type = $1 AND identity_key = $2 AND opted_in_block = $3",
        )
        .bind(registry.as_str())
        .bind(interval.identity.as_str())
        .bind(opened_at)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Ok(IntervalUpdate::Replayed);
        }

        let open = sqlx::query(
            "SELECT opted_in_block FROM participation_records
             WHERE registry_type = $1 AND identity_key = $2 AND opted_out_block IS NULL",
        )
        .bind(registry.as_str())
        .bind(interval.identity.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = open {
            let open_since: i64 = row.try_get("opted_in_block")?;
            return Err(DbError::DuplicateOpenInterval {
                registry,
                identity: interval.identity.clone(),
                opened_at: open_since as u64,
            });
        }

        let last_close = sqlx::query(
            "SELECT opted_out_block FROM participation_records
             WHERE registry_type = $1 AND identity_key = $2 AND opted_out_block IS NOT NULL
             ORDER BY opted_out_block DESC LIMIT 1",
        )
        .bind(registry.as_str())
        .bind(interval.identity.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = last_close {
            let closed_at: i64 = row.try_get("opted_out_block")?;
            if opened_at < closed_at {
                return Err(DbError::OverlappingInterval {
                    registry,
                    identity: interval.identity.clone(),
                    opened_at: interval.opened_at,
                    closed_at: closed_at as u64,
                });
            }
        }

        let res = sqlx::query(
            "INSERT INTO participation_records
             (registry_type, identity_key, delegate, vault, event_type, opted_in_block, opted_out_block)
             VALUES ($1, $2, $3, $4, $5, $6, NULL)
             ON CONFLICT (registry_type, identity_key, opted_in_block) DO NOTHING",
        )
        .bind(registry.as_str())
        .bind(interval.identity.as_str())
        .bind(interval.delegate.clone())
        .bind(interval.vault.clone())
        .bind(interval.kind.as_str())
        .bind(opened_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if res.rows_affected() == 0 {
            return Ok(IntervalUpdate::Replayed);
        }
        Ok(IntervalUpdate::Applied)
    }

    async fn close_interval(
        &self,
        registry: RegistryType,
        identity: &str,
        closed_at: u64,
    ) -> Result<IntervalUpdate, DbError> {
        let mut tx = self.pool.begin().await?;

        let open = sqlx::query(
            "SELECT opted_in_block FROM participation_records
             WHERE registry_type = $1 AND identity_key = $2 AND opted_out_block IS NULL
             ORDER BY opted_in_block DESC LIMIT 1",
        )
        .bind(registry.as_str())
        .bind(identity)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = open else {
            let known = sqlx::query(
                "SELECT COUNT(*) AS cnt FROM participation_records
                 WHERE registry_type = $1 AND identity_key = $2",
            )
            .bind(registry.as_str())
            .bind(identity)
            .fetch_one(&mut *tx)
            .await?;
            let cnt: i64 = known.try_get("cnt")?;
            if cnt > 0 {
                return Ok(IntervalUpdate::Replayed);
            }
            return Err(DbError::NoOpenInterval { registry, identity: identity.to_string() });
        };

        let opened_at: i64 = row.try_get("opted_in_block")?;

        // A redelivered close of an earlier interval arriving after the identity re-opened, at a
        // later block or within the same one.
        let earlier = sqlx::query(
            "SELECT opted_in_block FROM participation_records
             WHERE registry_type = $1 AND identity_key = $2 AND opted_out_block = $3",
        )
        .bind(registry.as_str())
        .bind(identity)
        .bind(sql_block(closed_at))
        .fetch_optional(&mut *tx)
        .await?;
        if earlier.is_some() {
            return Ok(IntervalUpdate::Replayed);
        }

        if sql_block(closed_at) < opened_at {
            return Err(DbError::InvalidInterval {
                registry,
                identity: identity.to_string(),
                opened_at: opened_at as u64,
                closed_at,
            });
        }

        let res = sqlx::query(
            "UPDATE participation_records SET opted_out_block = $1
             WHERE registry_type = $2 AND identity_key = $3 AND opted_in_block = $4
               AND opted_out_block IS NULL",
        )
        .bind(sql_block(closed_at))
        .bind(registry.as_str())
        .bind(identity)
        .bind(opened_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if res.rows_affected() == 0 {
            return Ok(IntervalUpdate::Replayed);
        }
        Ok(IntervalUpdate::Applied)
    }

    async fn close_intervals_by_vault(&self, vault: &str, closed_at: u64) -> Result<u64, DbError> {
        let res = sqlx::query(
            "UPDATE participation_records SET opted_out_block = $1
             WHERE vault = $2 AND opted_out_block IS NULL AND opted_in_block <= $1",
        )
        .bind(sql_block(closed_at))
        .bind(vault)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn close_intervals_by_delegate(
        &self,
        registry: RegistryType,
        delegate: &str,
        closed_at: u64,
    ) -> Result<u64, DbError> {
        let res = sqlx::query(
            "UPDATE participation_records SET opted_out_block = $1
             WHERE registry_type = $2 AND delegate = $3
               AND opted_out_block IS NULL AND opted_in_block <= $1",
        )
        .bind(sql_block(closed_at))
        .bind(registry.as_str())
        .bind(delegate)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn open_identities_by_vault(
        &self,
        registry: RegistryType,
        vault: &str,
        block: u64,
    ) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query(
            "SELECT identity_key FROM participation_records
             WHERE registry_type = $1 AND vault = $2
               AND opted_in_block <= $3 AND opted_out_block IS NULL
             ORDER BY identity_key",
        )
        .bind(registry.as_str())
        .bind(vault)
        .bind(sql_block(block))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| row.try_get("identity_key").map_err(DbError::from)).collect()
    }

    async fn watched_vaults(&self) -> Result<Vec<String>, DbError> {
        let rows = sqlx::query(
            "SELECT DISTINCT vault FROM participation_records WHERE vault IS NOT NULL ORDER BY vault",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| row.try_get("vault").map_err(DbError::from)).collect()
    }

    async fn intervals(
        &self,
        registry: RegistryType,
        identity: &str,
    ) -> Result<Vec<ParticipationRecord>, DbError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM participation_records
             WHERE registry_type = $1 AND identity_key = $2
             ORDER BY opted_in_block"
        );
        self.fetch_records(sqlx::query(&sql).bind(registry.as_str()).bind(identity)).await
    }

    async fn records_for_identity(
        &self,
        registry: Option<RegistryType>,
        key: &str,
        reference_block: u64,
    ) -> Result<Vec<ParticipationRecord>, DbError> {
        match registry {
            Some(registry) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM participation_records
                     WHERE registry_type = $1
                       AND (identity_key = $2 OR delegate = $2 OR vault = $2)
                       AND opted_in_block <= $3
                     ORDER BY identity_key, opted_in_block"
                );
                self.fetch_records(
                    sqlx::query(&sql)
                        .bind(registry.as_str())
                        .bind(key)
                        .bind(sql_block(reference_block)),
                )
                .await
            }
            None => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM participation_records
                     WHERE (identity_key = $1 OR delegate = $1 OR vault = $1)
                       AND opted_in_block <= $2
                     ORDER BY registry_type, identity_key, opted_in_block"
                );
                self.fetch_records(sqlx::query(&sql).bind(key).bind(sql_block(reference_block))).await
            }
        }
    }

    async fn records_for_registry(
        &self,
        registry: RegistryType,
        reference_block: u64,
    ) -> Result<Vec<ParticipationRecord>, DbError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM participation_records
             WHERE registry_type = $1 AND opted_in_block <= $2
             ORDER BY identity_key, opted_in_block"
        );
        self.fetch_records(sqlx::query(&sql).bind(registry.as_str()).bind(sql_block(reference_block)))
            .await
    }

    async fn active_delegates(
        &self,
        registry: RegistryType,
        reference_block: u64,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<ActiveDelegate>, DbError> {
        let rows = sqlx::query(
            "SELECT DISTINCT delegate, vault FROM participation_records
             WHERE registry_type = $1 AND delegate IS NOT NULL
               AND opted_in_block <= $2
               AND (opted_out_block IS NULL OR opted_out_block > $2)
             ORDER BY delegate, vault
             LIMIT $3 OFFSET $4",
        )
        .bind(registry.as_str())
        .bind(sql_block(reference_block))
        .bind(sql_block(limit))
        .bind(sql_block(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ActiveDelegate, DbError> {
                Ok(ActiveDelegate { delegate: row.try_get("delegate")?, vault: row.try_get("vault")? })
            })
            .collect()
    }

    async fn count_records(&self) -> Result<u64, DbError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM participation_records")
            .fetch_one(&self.pool)
            .await?;
        let cnt: i64 = row.try_get("cnt")?;
        Ok(cnt as u64)
    }

    async fn get_last_block(&self) -> Result<Option<u64>, DbError> {
        let res = sqlx::query("SELECT block FROM last_block WHERE id = $1")
            .bind(SQL_BLOCK_KEY)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = res else {
            return Ok(None);
        };

        let block_str: String = row.try_get("block")?;

        Ok(Some(block_str.parse().map_err(|_err| DbError::BadBlockNumb(block_str))?))
    }

    async fn set_last_block(&self, block_numb: u64) -> Result<(), DbError> {
        let res = sqlx::query(
            "INSERT INTO last_block (id, block) VALUES ($1, $2)
         ON CONFLICT (id) DO UPDATE SET block = EXCLUDED.block",
        )
        .bind(SQL_BLOCK_KEY)
        .bind(block_numb.to_string())
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(DbError::SetBlockFail);
        }

        Ok(())
    }
}
