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

pub mod ledger;

use thiserror::Error;

use crate::events::RegistryType;

pub use ledger::{
    ActiveDelegate, AnyDb, DbObj, IntervalUpdate, LedgerDb, NewInterval, ParticipationRecord,
};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQL error {0:?}")]
    SqlErr(#[from] sqlx::Error),

    #[error("SQL Migration error {0:?}")]
    MigrateErr(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid block number: {0}")]
    BadBlockNumb(String),

    #[error("Failed to set last block")]
    SetBlockFail,

    #[error("Invalid registry type: {0}")]
    BadRegistryType(String),

    #[error("{registry} identity {identity} already has an open interval starting at block {opened_at}")]
    DuplicateOpenInterval { registry: RegistryType, identity: String, opened_at: u64 },

    #[error("{registry} identity {identity} has no interval to close")]
    NoOpenInterval { registry: RegistryType, identity: String },

    #[error("{registry} identity {identity} cannot open at block {opened_at}, a previous interval closed at block {closed_at}")]
    OverlappingInterval { registry: RegistryType, identity: String, opened_at: u64, closed_at: u64 },

    #[error("{registry} identity {identity} cannot close at block {closed_at}, its interval opened at block {opened_at}")]
    InvalidInterval { registry: RegistryType, identity: String, opened_at: u64, closed_at: u64 },
}

impl DbError {
    /// Errors raised because an event contradicts the ledger, as opposed to store failures.
    pub fn is_consistency_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateOpenInterval { .. }
                | Self::NoOpenInterval { .. }
                | Self::OverlappingInterval { .. }
                | Self::InvalidInterval { .. }
        )
    }
}
