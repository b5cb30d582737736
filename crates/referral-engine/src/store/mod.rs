//! The Chain Store collaborator.
//!
//! Every method is one logical transaction against the backing database. The
//! conditional writes (`create_chain`, `append_link`, `insert_lock_if_absent`,
//! `transition_chain`, `complete_chain`) stand in for unique constraints on
//! (chain, degree), (chain, referrer) and (listing, fingerprint, active).
//!
//! A lock only holds while its chain is live: once the chain is stored as
//! `Completed` or `Expired`, the lock no longer claims the prospect.

use bacon_core::fingerprint::Fingerprint;

use crate::audit::RevealReceipt;
use crate::fraud::RiskAssessment;
use crate::listing::{Listing, ListingStatus};
use crate::payout::BaconDistribution;
use crate::types::{
    ActivityKind, ActivityRecord, ChainId, ChainStatus, ContactLock, ReferralChain,
    ReferralLink, UserId,
};

mod memory;

pub use memory::{MemoryChainStore, StoreSnapshot};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A conditional write lost to a concurrent writer.
    #[error("write conflict on {what}")]
    Conflict { what: String },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl StoreError {
    pub fn conflict(what: impl Into<String>) -> Self {
        StoreError::Conflict { what: what.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Chain plus first link, and optionally the lock claiming a prospect for it.
#[derive(Clone, Debug)]
pub struct NewChain {
    pub chain: ReferralChain,
    pub first_link: ReferralLink,
    pub lock: Option<ContactLock>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainCreate {
    Created,
    /// An active lock already claims the fingerprint; nothing was written.
    LockHeld(ContactLock),
}

/// A link to place at the next free degree.
#[derive(Clone, Debug)]
pub struct NewLink {
    pub referrer_id: UserId,
    pub referral_code: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkAppend {
    Inserted(ReferralLink),
    /// The referrer already holds a degree in this chain.
    Existing(ReferralLink),
    Full,
    /// The chain reached a terminal state before the write.
    Closed(ChainStatus),
}

/// Outcome of [`ChainStore::complete_chain`]. Only `Committed` writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaleCommit {
    Committed(ReferralChain),
    /// The chain reached a terminal state first.
    ChainClosed(ChainStatus),
    /// The listing is no longer `Active`, typically sold through another chain.
    ListingUnavailable(ListingStatus),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockInsert {
    Created(ContactLock),
    Existing(ContactLock),
}

pub trait ChainStore: Send + Sync {
    fn insert_listing(&self, listing: Listing) -> Result<(), StoreError>;
    fn listing(&self, id: &str) -> Result<Option<Listing>, StoreError>;
    fn set_listing_status(&self, id: &str, status: ListingStatus) -> Result<(), StoreError>;

    /// Insert chain, degree-1 link and lock atomically. When `new.lock` is
    /// set and a live lock already claims the same fingerprint under the
    /// listing, nothing is written and the existing lock is returned.
    fn create_chain(&self, new: NewChain, now_ms: u64) -> Result<ChainCreate, StoreError>;

    /// Insert `link` at `max(degree) + 1` unless the referrer is already
    /// present or `max_degrees` are occupied. Marks the chain `Full` when the
    /// insert fills the last degree.
    fn append_link(
        &self,
        chain_id: ChainId,
        link: NewLink,
        max_degrees: u8,
        now_ms: u64,
    ) -> Result<LinkAppend, StoreError>;

    fn insert_lock_if_absent(&self, lock: ContactLock, now_ms: u64) -> Result<LockInsert, StoreError>;

    /// The live lock whose primary hash matches: not expired at `now_ms` and
    /// naming a chain that is not stored as terminal.
    fn active_lock(
        &self,
        listing_id: &str,
        fingerprint: &Fingerprint,
        now_ms: u64,
    ) -> Result<Option<ContactLock>, StoreError>;

    /// Locks created since `since_ms` sharing any hash with `fingerprint`,
    /// active or not.
    fn locks_matching(
        &self,
        listing_id: &str,
        fingerprint: &Fingerprint,
        since_ms: u64,
    ) -> Result<Vec<ContactLock>, StoreError>;

    fn chain(&self, id: ChainId) -> Result<Option<ReferralChain>, StoreError>;
    fn chain_by_code(&self, code: &str) -> Result<Option<ReferralChain>, StoreError>;
    fn chains_for_listing(&self, listing_id: &str) -> Result<Vec<ReferralChain>, StoreError>;
    /// Links of a chain ordered by degree.
    fn links(&self, chain_id: ChainId) -> Result<Vec<ReferralLink>, StoreError>;
    fn link_by_code(&self, chain_id: ChainId, referral_code: &str) -> Result<Option<ReferralLink>, StoreError>;

    /// Compare-and-set on chain status.
    fn transition_chain(
        &self,
        chain_id: ChainId,
        expected: ChainStatus,
        next: ChainStatus,
    ) -> Result<ReferralChain, StoreError>;

    /// Settle a sale in one transaction: mark the listing `Sold`, the chain
    /// `Completed` and record `distribution`. Requires an `Active` listing, a
    /// non-terminal chain without a distribution, and exactly
    /// `distribution.lines.len()` links on the chain; a degree appended since
    /// the distribution was computed is a `Conflict`.
    fn complete_chain(&self, distribution: BaconDistribution) -> Result<SaleCommit, StoreError>;
    fn distribution(&self, chain_id: ChainId) -> Result<Option<BaconDistribution>, StoreError>;

    fn record_activity(&self, record: ActivityRecord) -> Result<(), StoreError>;
    fn count_activity(&self, user_id: &str, kind: ActivityKind, since_ms: u64) -> Result<usize, StoreError>;

    /// Associate a device with a user and return how many distinct users
    /// have been seen on it.
    fn register_device(&self, device: &str, user_id: &str) -> Result<usize, StoreError>;

    fn record_assessment(&self, assessment: RiskAssessment) -> Result<(), StoreError>;
    fn assessments(&self, user_id: &str) -> Result<Vec<RiskAssessment>, StoreError>;

    /// Insert-once per (listing, buyer).
    fn record_reveal(&self, receipt: RevealReceipt) -> Result<(), StoreError>;
    fn reveals(&self, listing_id: &str) -> Result<Vec<RevealReceipt>, StoreError>;
}
