use thiserror::Error;

/// Canonical error type exposed by the core primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Neither an email nor a phone number survived normalisation.
    #[error("contact must carry an email or a phone number")]
    InvalidContact,

    /// A chain or tracking code did not match its expected shape.
    #[error("invalid code: {0}")]
    InvalidCode(String),

    /// A share URL could not be understood.
    #[error("invalid share url: {0}")]
    InvalidShareUrl(String),

    /// Reward rate outside 0..=100%.
    #[error("reward rate of {bps} bps exceeds 10000")]
    InvalidRewardRate { bps: u32 },

    /// Degree outside 1..=6.
    #[error("degree {0} is outside 1..=6")]
    InvalidDegree(u8),
}
