use bacon_core::CoreError;
use thiserror::Error;

use crate::audit::AuditError;
use crate::fraud::RiskDecision;
use crate::store::StoreError;
use crate::types::{ChainId, ChainStatus};

/// Errors surfaced by chain, sale and reveal operations.
#[derive(Debug, Error)]
pub enum ReferralError {
    /// The contact has neither an email nor a phone after normalisation.
    #[error("contact must include an email or a phone number")]
    InvalidContact,

    #[error("chain {chain_id} already has the maximum number of degrees")]
    ChainFull { chain_id: ChainId },

    /// Unknown or expired chain/referral code. Shown to buyers as is.
    #[error("link no longer valid")]
    ChainNotFound,

    #[error("contact is already locked to chain {chain_code} until {expires_at_ms}")]
    ContactAlreadyLocked {
        chain_code: String,
        expires_at_ms: u64,
    },

    #[error("action blocked by risk review (score {points}/100, {decision:?})")]
    RiskBlocked { points: u32, decision: RiskDecision },

    /// Lost a race that one retry did not recover.
    #[error("concurrent update conflict, try again")]
    StoreConflict,

    #[error("listing {0} not found")]
    ListingNotFound(String),

    #[error("listing {0} is not accepting referrals")]
    ListingUnavailable(String),

    #[error("chain is {status:?}")]
    ChainClosed { status: ChainStatus },

    #[error("payment has not been captured")]
    PaymentNotCaptured,

    #[error("payment confirmation does not match this buyer and listing")]
    RevealDenied,

    #[error("payment confirmation does not match this sale")]
    PaymentMismatch,

    #[error("contact already revealed to this buyer")]
    AlreadyRevealed,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Core(CoreError),
}

impl From<CoreError> for ReferralError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidContact => ReferralError::InvalidContact,
            other => ReferralError::Core(other),
        }
    }
}

impl From<StoreError> for ReferralError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { .. } => ReferralError::StoreConflict,
            other => ReferralError::Store(other),
        }
    }
}
