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

use std::{fmt, str::FromStr};

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registry an interval was recorded in. Identity keys are only unique within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryType {
    Vanilla,
    Symbiotic,
    #[serde(rename = "eigenlayer")]
    EigenLayer,
}

impl RegistryType {
    pub const ALL: [RegistryType; 3] =
        [RegistryType::Vanilla, RegistryType::Symbiotic, RegistryType::EigenLayer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vanilla => "vanilla",
            Self::Symbiotic => "symbiotic",
            Self::EigenLayer => "eigenlayer",
        }
    }
}

impl fmt::Display for RegistryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("unknown registry type: {0}")]
pub struct UnknownRegistry(pub String);

impl FromStr for RegistryType {
    type Err = UnknownRegistry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vanilla" => Ok(Self::Vanilla),
            "symbiotic" => Ok(Self::Symbiotic),
            "eigenlayer" => Ok(Self::EigenLayer),
            other => Err(UnknownRegistry(other.to_string())),
        }
    }
}

/// Name of the on-chain event (or manual action) that produced a ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Staked,
    Unstaked,
    StakeWithdrawn,
    ValRecordAdded,
    ValRecordDeleted,
    VaultDeregistered,
    OperatorDeregistered,
    ValidatorRegistered,
    LstRestakerRegistered,
    ValidatorDeregistered,
    ValidatorDeregistrationRequested,
    OnSlash,
    OnSlashAutoOptOut,
    ManualEntry,
    ManualOptOut,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staked => "Staked",
            Self::Unstaked => "Unstaked",
            Self::StakeWithdrawn => "StakeWithdrawn",
            Self::ValRecordAdded => "ValRecordAdded",
            Self::ValRecordDeleted => "ValRecordDeleted",
            Self::VaultDeregistered => "VaultDeregistered",
            Self::OperatorDeregistered => "OperatorDeregistered",
            Self::ValidatorRegistered => "ValidatorRegistered",
            Self::LstRestakerRegistered => "LSTRestakerRegistered",
            Self::ValidatorDeregistered => "ValidatorDeregistered",
            Self::ValidatorDeregistrationRequested => "ValidatorDeregistrationRequested",
            Self::OnSlash => "OnSlash",
            Self::OnSlashAutoOptOut => "OnSlashAutoOptOut",
            Self::ManualEntry => "ManualEntry",
            Self::ManualOptOut => "ManualOptOut",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded registry event, already mapped onto the ledger operation it triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Identity joined a registry.
    OptedIn {
        kind: EventKind,
        registry: RegistryType,
        identity: String,
        delegate: Option<Address>,
        vault: Option<Address>,
    },
    /// Identity left a registry.
    OptedOut { kind: EventKind, registry: RegistryType, identity: String },
    /// Every open interval backed by this vault ends.
    VaultDeregistered { vault: Address },
    /// Every open interval delegated to this operator ends.
    OperatorDeregistered { registry: RegistryType, operator: Address },
    /// A watched vault was slashed. Validators it backed that the middleware no longer
    /// considers opted in are closed at this block.
    VaultSlashed { vault: Address },
}

impl RegistryEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::OptedIn { kind, .. } | Self::OptedOut { kind, .. } => *kind,
            Self::VaultDeregistered { .. } => EventKind::VaultDeregistered,
            Self::OperatorDeregistered { .. } => EventKind::OperatorDeregistered,
            Self::VaultSlashed { .. } => EventKind::OnSlash,
        }
    }
}

/// A [RegistryEvent] with its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLog {
    pub block_number: u64,
    pub log_index: u64,
    pub event: RegistryEvent,
}

impl EventLog {
    pub fn new(block_number: u64, log_index: u64, event: RegistryEvent) -> Self {
        Self { block_number, log_index, event }
    }
}

/// Canonical form of identity keys and addresses: lower-case hex with a `0x` prefix.
pub fn identity_key(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn address_key(addr: &Address) -> String {
    format!("{addr:#x}")
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid hex identity: {0}")]
pub struct InvalidIdentity(pub String);

/// Normalise a user supplied hex identity or address into its canonical form.
pub fn normalize_identity(raw: &str) -> Result<String, InvalidIdentity> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(InvalidIdentity(raw.to_string()));
    }
    let bytes = hex::decode(digits).map_err(|_| InvalidIdentity(raw.to_string()))?;
    Ok(identity_key(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_type_round_trips_through_str() {
        for registry in RegistryType::ALL {
            assert_eq!(registry.as_str().parse::<RegistryType>().unwrap(), registry);
        }
        assert!("eigen-avs".parse::<RegistryType>().is_err());
    }

    #[test]
    fn registry_type_serde_names() {
        assert_eq!(serde_json::to_string(&RegistryType::EigenLayer).unwrap(), "\"eigenlayer\"");
        let parsed: RegistryType = serde_json::from_str("\"symbiotic\"").unwrap();
        assert_eq!(parsed, RegistryType::Symbiotic);
    }

    #[test]
    fn normalize_identity_forms() {
        let addr = "0x9101eda106A443A0fA82375936D0D1680D5a64F5";
        assert_eq!(
            normalize_identity(addr).unwrap(),
            "0x9101eda106a443a0fa82375936d0d1680d5a64f5"
        );
        assert_eq!(normalize_identity("ABCD").unwrap(), "0xabcd");
        assert!(normalize_identity("0x").is_err());
        assert!(normalize_identity("0xabc").is_err());
        assert!(normalize_identity("not-hex").is_err());
    }

    #[test]
    fn address_key_matches_normalized_identity() {
        let addr = Address::repeat_byte(0xAB);
        assert_eq!(address_key(&addr), normalize_identity(&addr.to_string()).unwrap());
    }

    #[test]
    fn event_kind_names() {
        assert_eq!(EventKind::LstRestakerRegistered.as_str(), "LSTRestakerRegistered");
        let ev = RegistryEvent::VaultDeregistered { vault: Address::ZERO };
        assert_eq!(ev.kind(), EventKind::VaultDeregistered);
        let ev = RegistryEvent::VaultSlashed { vault: Address::ZERO };
        assert_eq!(ev.kind().as_str(), "OnSlash");
    }
}
