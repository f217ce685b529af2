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

use std::collections::{HashMap, HashSet};

use alloy::{
    network::{Ethereum, TransactionResponse},
    primitives::{Address, Bytes, B256},
    providers::Provider,
    rpc::types::{BlockId, Filter, Log},
    sol_types::SolEvent,
};
use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::future::try_join_all;

use super::{EventSource, ServiceError};
use crate::events::{identity_key, EventKind, EventLog, RegistryEvent, RegistryType};

const TX_LOOKUP_CHUNK_SIZE: usize = 50;

alloy::sol! {
    interface IVanillaRegistry {
        event Staked(address indexed msgSender, address indexed withdrawalAddress, bytes valBLSPubKey, uint256 amount);
        event Unstaked(address indexed msgSender, address indexed withdrawalAddress, bytes valBLSPubKey, uint256 amount);
        event StakeWithdrawn(address indexed msgSender, address indexed withdrawalAddress, bytes valBLSPubKey, uint256 amount);
    }

    interface IMevCommitMiddleware {
        event ValRecordAdded(bytes blsPubkey, address indexed operator, address indexed vault, uint256 indexed position);
        event ValRecordDeleted(bytes blsPubkey, address indexed msgSender);
        event VaultDeregistered(address indexed vault);
        event OperatorDeregistered(address indexed operator);
    }

    interface IMevCommitAVS {
        event ValidatorRegistered(bytes validatorPubKey, address indexed podOwner);
        event LSTRestakerRegistered(bytes chosenValidator, uint256 numChosen, address indexed lstRestaker);
        event ValidatorDeregistered(bytes validatorPubKey, address indexed podOwner);
        event ValidatorDeregistrationRequested(bytes validatorPubKey, address indexed podOwner);
    }

    interface ISymbioticVault {
        event OnSlash(uint256 amount, uint48 captureTimestamp, uint256 slashedAmount);
    }

    #[sol(rpc)]
    interface IValidatorOptInRouter {
        struct OptInStatus {
            bool isVanillaOptedIn;
            bool isAvsOptedIn;
            bool isMiddlewareOptedIn;
        }

        function areValidatorsOptedIn(bytes[] calldata valBLSPubKeys) external view returns (OptInStatus[] memory);
    }
}

/// Event signatures that are indexed, across all registries.
const REGISTRY_EVENT_SIGNATURES: &[B256] = &[
    IVanillaRegistry::Staked::SIGNATURE_HASH,
    IVanillaRegistry::Unstaked::SIGNATURE_HASH,
    IVanillaRegistry::StakeWithdrawn::SIGNATURE_HASH,
    IMevCommitMiddleware::ValRecordAdded::SIGNATURE_HASH,
    IMevCommitMiddleware::ValRecordDeleted::SIGNATURE_HASH,
    IMevCommitMiddleware::VaultDeregistered::SIGNATURE_HASH,
    IMevCommitMiddleware::OperatorDeregistered::SIGNATURE_HASH,
    IMevCommitAVS::ValidatorRegistered::SIGNATURE_HASH,
    IMevCommitAVS::LSTRestakerRegistered::SIGNATURE_HASH,
    IMevCommitAVS::ValidatorDeregistered::SIGNATURE_HASH,
    IMevCommitAVS::ValidatorDeregistrationRequested::SIGNATURE_HASH,
];

/// Deployed registry contracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryAddresses {
    pub vanilla_registry: Address,
    pub middleware: Address,
    pub avs: Address,
    /// Aggregated opt-in view, consulted when a vault is slashed.
    pub router: Address,
}

impl RegistryAddresses {
    fn all(&self) -> Vec<Address> {
        vec![self.vanilla_registry, self.middleware, self.avs]
    }
}

/// [EventSource] reading registry logs over JSON-RPC.
#[derive(Clone)]
pub struct RpcEventSource<P> {
    provider: P,
    addresses: RegistryAddresses,
}

impl<P> RpcEventSource<P>
where
    P: Provider<Ethereum> + Clone + 'static,
{
    pub fn new(provider: P, addresses: RegistryAddresses) -> Self {
        Self { provider, addresses }
    }

    /// Resolve the sender of every AVS opt-in transaction; the events do not carry it.
    async fn fetch_senders(&self, logs: &[Log]) -> Result<HashMap<B256, Address>, ServiceError> {
        let hashes: Vec<B256> = logs
            .iter()
            .filter(|log| needs_sender(&self.addresses, log))
            .filter_map(|log| log.transaction_hash)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut senders = HashMap::with_capacity(hashes.len());
        for chunk in hashes.chunks(TX_LOOKUP_CHUNK_SIZE) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|&tx_hash| {
                    let provider = self.provider.clone();
                    async move {
                        let tx = provider.get_transaction_by_hash(tx_hash).await?;
                        Ok::<_, ServiceError>((tx_hash, tx))
                    }
                })
                .collect();

            for (tx_hash, tx) in try_join_all(futures).await? {
                let tx = tx.ok_or_else(|| anyhow!("Transaction {tx_hash} not found"))?;
                senders.insert(tx_hash, tx.from());
            }
        }
        Ok(senders)
    }
}

#[async_trait]
impl<P> EventSource for RpcEventSource<P>
where
    P: Provider<Ethereum> + Clone + 'static,
{
    async fn head_block(&self) -> Result<u64, ServiceError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn fetch_events(
        &self,
        from: u64,
        to: u64,
        vaults: &[Address],
    ) -> Result<Vec<EventLog>, ServiceError> {
        let filter = Filter::new()
            .address(self.addresses.all())
            .from_block(from)
            .to_block(to)
            .event_signature(REGISTRY_EVENT_SIGNATURES.to_vec());

        tracing::debug!("Fetching logs from RPC: block {} to block {}", from, to);
        let mut logs = self.provider.get_logs(&filter).await?;
        logs.retain(|log| !log.removed);
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        tracing::debug!("Fetched {} logs from block {} to block {}", logs.len(), from, to);

        let senders = self.fetch_senders(&logs).await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            if let Some(event) = decode_log(&self.addresses, log, &senders)? {
                events.push(event);
            }
        }

        let mut watched: HashSet<Address> = vaults.iter().copied().collect();
        watched.extend(events.iter().filter_map(|e| match &e.event {
            RegistryEvent::OptedIn { vault, .. } => *vault,
            _ => None,
        }));
        if !watched.is_empty() {
            let filter = Filter::new()
                .address(watched.into_iter().collect::<Vec<_>>())
                .from_block(from)
                .to_block(to)
                .event_signature(ISymbioticVault::OnSlash::SIGNATURE_HASH);
            let slashes = self.provider.get_logs(&filter).await?;
            for log in slashes.iter().filter(|log| !log.removed) {
                if let Some(event) = decode_vault_log(log)? {
                    events.push(event);
                }
            }
            events.sort_by_key(|e| (e.block_number, e.log_index));
        }
        Ok(events)
    }

    async fn middleware_opted_in(
        &self,
        identities: &[String],
        block: u64,
    ) -> Result<Vec<bool>, ServiceError> {
        let pubkeys = identities
            .iter()
            .map(|id| id.parse::<Bytes>().map_err(|e| anyhow!("Invalid BLS pubkey {id}: {e}")))
            .collect::<Result<Vec<_>, _>>()?;

        let router = IValidatorOptInRouter::new(self.addresses.router, &self.provider);
        let statuses =
            router.areValidatorsOptedIn(pubkeys).block(BlockId::number(block)).call().await?;
        Ok(statuses.into_iter().map(|status| status.isMiddlewareOptedIn).collect())
    }
}

fn needs_sender(addresses: &RegistryAddresses, log: &Log) -> bool {
    log.address() == addresses.avs
        && log.topic0().is_some_and(|t| {
            *t == IMevCommitAVS::ValidatorRegistered::SIGNATURE_HASH
                || *t == IMevCommitAVS::LSTRestakerRegistered::SIGNATURE_HASH
        })
}

/// Map a raw log onto a [RegistryEvent]. Logs from unknown contracts or with unknown
/// signatures yield `None`.
pub(crate) fn decode_log(
    addresses: &RegistryAddresses,
    log: &Log,
    senders: &HashMap<B256, Address>,
) -> Result<Option<EventLog>, ServiceError> {
    let Some(topic0) = log.topic0().copied() else {
        return Ok(None);
    };
    let block_number =
        log.block_number.ok_or_else(|| anyhow!("Log is missing its block number"))?;
    let log_index = log.log_index.unwrap_or_default();
    let address = log.address();

    let event = if address == addresses.vanilla_registry {
        decode_vanilla(log, topic0)?
    } else if address == addresses.middleware {
        decode_middleware(log, topic0)?
    } else if address == addresses.avs {
        let sender = || -> Result<Address, ServiceError> {
            let tx_hash =
                log.transaction_hash.ok_or_else(|| anyhow!("Log is missing its transaction hash"))?;
            senders
                .get(&tx_hash)
                .copied()
                .ok_or_else(|| anyhow!("No sender resolved for transaction {tx_hash}").into())
        };
        decode_avs(log, topic0, sender)?
    } else {
        None
    };

    Ok(event.map(|event| EventLog::new(block_number, log_index, event)))
}

/// Map a vault log onto a [RegistryEvent::VaultSlashed]. Other signatures yield `None`.
pub(crate) fn decode_vault_log(log: &Log) -> Result<Option<EventLog>, ServiceError> {
    if log.topic0() != Some(&ISymbioticVault::OnSlash::SIGNATURE_HASH) {
        return Ok(None);
    }
    log.log_decode::<ISymbioticVault::OnSlash>()?;
    let block_number =
        log.block_number.ok_or_else(|| anyhow!("Log is missing its block number"))?;
    let event = RegistryEvent::VaultSlashed { vault: log.address() };
    Ok(Some(EventLog::new(block_number, log.log_index.unwrap_or_default(), event)))
}

fn decode_vanilla(log: &Log, topic0: B256) -> Result<Option<RegistryEvent>, ServiceError> {
    let registry = RegistryType::Vanilla;
    let event = if topic0 == IVanillaRegistry::Staked::SIGNATURE_HASH {
        let ev = log.log_decode::<IVanillaRegistry::Staked>()?.inner.data;
        RegistryEvent::OptedIn {
            kind: EventKind::Staked,
            registry,
            identity: identity_key(&ev.valBLSPubKey),
            delegate: Some(ev.msgSender),
            vault: None,
        }
    } else if topic0 == IVanillaRegistry::Unstaked::SIGNATURE_HASH {
        let ev = log.log_decode::<IVanillaRegistry::Unstaked>()?.inner.data;
        RegistryEvent::OptedOut {
            kind: EventKind::Unstaked,
            registry,
            identity: identity_key(&ev.valBLSPubKey),
        }
    } else if topic0 == IVanillaRegistry::StakeWithdrawn::SIGNATURE_HASH {
        let ev = log.log_decode::<IVanillaRegistry::StakeWithdrawn>()?.inner.data;
        RegistryEvent::OptedOut {
            kind: EventKind::StakeWithdrawn,
            registry,
            identity: identity_key(&ev.valBLSPubKey),
        }
    } else {
        return Ok(None);
    };
    Ok(Some(event))
}

fn decode_middleware(log: &Log, topic0: B256) -> Result<Option<RegistryEvent>, ServiceError> {
    let registry = RegistryType::Symbiotic;
    let event = if topic0 == IMevCommitMiddleware::ValRecordAdded::SIGNATURE_HASH {
        let ev = log.log_decode::<IMevCommitMiddleware::ValRecordAdded>()?.inner.data;
        RegistryEvent::OptedIn {
            kind: EventKind::ValRecordAdded,
            registry,
            identity: identity_key(&ev.blsPubkey),
            delegate: Some(ev.operator),
            vault: Some(ev.vault),
        }
    } else if topic0 == IMevCommitMiddleware::ValRecordDeleted::SIGNATURE_HASH {
        let ev = log.log_decode::<IMevCommitMiddleware::ValRecordDeleted>()?.inner.data;
        RegistryEvent::OptedOut {
            kind: EventKind::ValRecordDeleted,
            registry,
            identity: identity_key(&ev.blsPubkey),
        }
    } else if topic0 == IMevCommitMiddleware::VaultDeregistered::SIGNATURE_HASH {
        let ev = log.log_decode::<IMevCommitMiddleware::VaultDeregistered>()?.inner.data;
        RegistryEvent::VaultDeregistered { vault: ev.vault }
    } else if topic0 == IMevCommitMiddleware::OperatorDeregistered::SIGNATURE_HASH {
        let ev = log.log_decode::<IMevCommitMiddleware::OperatorDeregistered>()?.inner.data;
        RegistryEvent::OperatorDeregistered { registry, operator: ev.operator }
    } else {
        return Ok(None);
    };
    Ok(Some(event))
}

fn decode_avs(
    log: &Log,
    topic0: B256,
    sender: impl FnOnce() -> Result<Address, ServiceError>,
) -> Result<Option<RegistryEvent>, ServiceError> {
    let registry = RegistryType::EigenLayer;
    let event = if topic0 == IMevCommitAVS::ValidatorRegistered::SIGNATURE_HASH {
        let ev = log.log_decode::<IMevCommitAVS::ValidatorRegistered>()?.inner.data;
        RegistryEvent::OptedIn {
            kind: EventKind::ValidatorRegistered,
            registry,
            identity: identity_key(&ev.validatorPubKey),
            delegate: Some(sender()?),
            vault: None,
        }
    } else if topic0 == IMevCommitAVS::LSTRestakerRegistered::SIGNATURE_HASH {
        let ev = log.log_decode::<IMevCommitAVS::LSTRestakerRegistered>()?.inner.data;
        RegistryEvent::OptedIn {
            kind: EventKind::LstRestakerRegistered,
            registry,
            identity: identity_key(&ev.chosenValidator),
            delegate: Some(sender()?),
            vault: None,
        }
    } else if topic0 == IMevCommitAVS::ValidatorDeregistered::SIGNATURE_HASH {
        let ev = log.log_decode::<IMevCommitAVS::ValidatorDeregistered>()?.inner.data;
        RegistryEvent::OptedOut {
            kind: EventKind::ValidatorDeregistered,
            registry,
            identity: identity_key(&ev.validatorPubKey),
        }
    } else if topic0 == IMevCommitAVS::ValidatorDeregistrationRequested::SIGNATURE_HASH {
        let ev = log.log_decode::<IMevCommitAVS::ValidatorDeregistrationRequested>()?.inner.data;
        RegistryEvent::OptedOut {
            kind: EventKind::ValidatorDeregistrationRequested,
            registry,
            identity: identity_key(&ev.validatorPubKey),
        }
    } else {
        return Ok(None);
    };
    Ok(Some(event))
}
