//! Records shared by the store, the chain manager and the fraud monitor.

use bacon_core::fingerprint::{ContactHash, Fingerprint};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ListingId = String;
pub type UserId = String;
pub type ChainId = Uuid;
pub type LinkId = Uuid;
pub type LockId = Uuid;

pub const MS_PER_HOUR: u64 = 60 * 60 * 1_000;
pub const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

/// Lifecycle of a referral chain.
///
/// `Open -> Full` when the last degree fills, then `Completed` on a paid-out
/// sale or `Expired` after inactivity. Terminal states never change.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Open,
    Full,
    Completed,
    Expired,
}

impl ChainStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChainStatus::Completed | ChainStatus::Expired)
    }

    pub fn accepts_degrees(self) -> bool {
        self == ChainStatus::Open
    }

    pub fn can_transition_to(self, next: ChainStatus) -> bool {
        use ChainStatus::*;
        matches!(
            (self, next),
            (Open, Full) | (Open, Completed) | (Open, Expired) | (Full, Completed) | (Full, Expired)
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralChain {
    pub id: ChainId,
    pub listing_id: ListingId,
    pub code: String,
    pub status: ChainStatus,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
}

impl ReferralChain {
    /// Status as seen at `now_ms`, treating an inactive chain as expired
    /// without requiring a write.
    pub fn effective_status(&self, now_ms: u64, inactivity_window_ms: u64) -> ChainStatus {
        if !self.status.is_terminal()
            && now_ms >= self.last_activity_ms.saturating_add(inactivity_window_ms)
        {
            ChainStatus::Expired
        } else {
            self.status
        }
    }
}

/// One referrer occupying one degree of a chain.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralLink {
    pub id: LinkId,
    pub chain_id: ChainId,
    pub degree: u8,
    pub referrer_id: UserId,
    pub referral_code: String,
    pub created_at_ms: u64,
}

/// Time-bounded claim of a contact fingerprint by one chain.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactLock {
    pub id: LockId,
    pub listing_id: ListingId,
    pub chain_id: ChainId,
    pub primary_hash: ContactHash,
    pub hashes: Vec<ContactHash>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl ContactLock {
    pub fn new(listing_id: ListingId, chain_id: ChainId, fingerprint: &Fingerprint, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id,
            chain_id,
            primary_hash: fingerprint.primary_hash.clone(),
            hashes: fingerprint.all_hashes.clone(),
            created_at_ms: now_ms,
            expires_at_ms: now_ms
                .saturating_add(fingerprint.lock_duration_hours as u64 * MS_PER_HOUR),
        }
    }

    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }

    /// Locks conflict on the primary hash only; secondary hashes feed the
    /// fraud monitor.
    pub fn claims(&self, fingerprint: &Fingerprint) -> bool {
        self.primary_hash == fingerprint.primary_hash
    }

    pub fn overlaps(&self, fingerprint: &Fingerprint) -> bool {
        self.hashes.iter().any(|h| fingerprint.contains(h))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    Unverified,
    Email,
    Phone,
    Identity,
}

/// The user performing a chain action, as known to the auth collaborator.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub account_created_ms: u64,
    pub verification: VerificationLevel,
    pub device: Option<String>,
}

impl Actor {
    pub fn new(user_id: impl Into<UserId>, account_created_ms: u64) -> Self {
        Self {
            user_id: user_id.into(),
            account_created_ms,
            verification: VerificationLevel::Unverified,
            device: None,
        }
    }

    pub fn verified(mut self, level: VerificationLevel) -> Self {
        self.verification = level;
        self
    }

    pub fn on_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn account_age_days(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.account_created_ms) / MS_PER_DAY
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Share,
    Purchase,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityRecord {
    pub user_id: UserId,
    pub kind: ActivityKind,
    pub listing_id: ListingId,
    pub at_ms: u64,
}
