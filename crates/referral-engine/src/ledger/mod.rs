//! Bacon payout ledger.
//!
//! Applies each completed distribution once: referrers are credited their
//! line amounts and the unallocated remainder goes to [`OVERFLOW_FUND`].

use std::collections::{BTreeMap, BTreeSet};

use bacon_core::payout::Cents;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::payout::BaconDistribution;
use crate::types::{ChainId, ListingId};

pub type AccountId = String;

pub const OVERFLOW_FUND: &str = "overflow-fund";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("distribution for chain {chain_id} already applied")]
    DuplicateDistribution { chain_id: ChainId },
    #[error("distribution for chain {chain_id} pays out more than its pool")]
    Overdrawn { chain_id: ChainId },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountBalance {
    pub earned: Cents,
    pub credits: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    BaconPaid {
        chain_id: ChainId,
        listing_id: ListingId,
        recipient: AccountId,
        degree: u8,
        amount: Cents,
    },
    Overflow {
        chain_id: ChainId,
        listing_id: ListingId,
        amount: Cents,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub timestamp_ms: u64,
    pub last_chain: Option<ChainId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub accounts: BTreeMap<AccountId, AccountBalance>,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "hex_root")]
    pub merkle_root: [u8; 32],
}

#[derive(Debug, Default, Clone)]
pub struct PayoutLedger {
    meta: SnapshotMetadata,
    accounts: BTreeMap<AccountId, AccountBalance>,
    events: Vec<LedgerEvent>,
    applied: BTreeSet<ChainId>,
}

impl PayoutLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay stored distributions in `computed_at_ms` order.
    pub fn replay<'a, I>(distributions: I) -> Result<Self, LedgerError>
    where
        I: IntoIterator<Item = &'a BaconDistribution>,
    {
        let mut ordered: Vec<&BaconDistribution> = distributions.into_iter().collect();
        ordered.sort_by_key(|d| (d.computed_at_ms, d.chain_id));
        let mut ledger = Self::new();
        for distribution in ordered {
            ledger.apply_distribution(distribution)?;
        }
        Ok(ledger)
    }

    pub fn balance(&self, account: &str) -> Cents {
        self.accounts
            .get(account)
            .map(|b| b.earned)
            .unwrap_or(Cents::ZERO)
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    fn credit(&mut self, account: &str, amount: Cents) {
        let balance = self.accounts.entry(account.to_string()).or_default();
        balance.earned = Cents(balance.earned.0 + amount.0);
        balance.credits += 1;
    }

    pub fn apply_distribution(&mut self, distribution: &BaconDistribution) -> Result<(), LedgerError> {
        let chain_id = distribution.chain_id;
        if self.applied.contains(&chain_id) {
            return Err(LedgerError::DuplicateDistribution { chain_id });
        }
        if distribution.distributed().0 + distribution.unallocated.0 > distribution.pool.0 {
            return Err(LedgerError::Overdrawn { chain_id });
        }

        for line in &distribution.lines {
            self.credit(&line.referrer_id, line.amount);
            self.events.push(LedgerEvent::BaconPaid {
                chain_id,
                listing_id: distribution.listing_id.clone(),
                recipient: line.referrer_id.clone(),
                degree: line.degree,
                amount: line.amount,
            });
        }
        if distribution.unallocated > Cents::ZERO {
            self.credit(OVERFLOW_FUND, distribution.unallocated);
            self.events.push(LedgerEvent::Overflow {
                chain_id,
                listing_id: distribution.listing_id.clone(),
                amount: distribution.unallocated,
            });
        }

        self.meta.height += 1;
        self.meta.timestamp_ms = distribution.computed_at_ms;
        self.meta.last_chain = Some(chain_id);
        self.applied.insert(chain_id);
        info!(
            %chain_id,
            referrers = distribution.lines.len(),
            distributed = %distribution.distributed(),
            overflow = %distribution.unallocated,
            "distribution applied"
        );
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            accounts: self.accounts.clone(),
            events: self.events.clone(),
            merkle_root: compute_merkle_root(&self.accounts),
        }
    }
}

fn compute_merkle_root(accounts: &BTreeMap<AccountId, AccountBalance>) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = accounts
        .iter()
        .map(|(account, balance)| {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            hasher.update((account.len() as u64).to_le_bytes());
            hasher.update(account.as_bytes());
            hasher.update(balance.earned.0.to_le_bytes());
            hasher.update(balance.credits.to_le_bytes());
            <[u8; 32]>::from(hasher.finalize())
        })
        .collect();
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"uob-ledger-empty").into();
    }
    while leaves.len() > 1 {
        leaves = leaves
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(b"node");
                hasher.update(pair[0]);
                // Odd node pairs with itself.
                hasher.update(pair.get(1).unwrap_or(&pair[0]));
                <[u8; 32]>::from(hasher.finalize())
            })
            .collect();
    }
    leaves[0]
}

mod hex_root {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(root: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(root))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("merkle root must be 32 bytes"))
    }
}
