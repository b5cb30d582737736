//! Core primitives for the University of Bacon referral engine.
//!
//! This crate exposes the building blocks that the chain manager, the fraud
//! monitor and the CLI rely upon:
//!
//! * [`fingerprint`]: normalisation and SHA-256 digests of a prospective
//!   buyer's contact identity.
//! * [`payout`]: degree-weighted bacon arithmetic over integer cents.
//! * [`codes`]: chain codes, `UOB-` tracking codes and share URLs.
//! * [`anonymity`]: keyed BLAKE3 derivation of stable anonymous seller
//!   identities.
//!
//! Nothing here performs I/O. Persistence, clocks and policy live in the
//! `referral-engine` crate.

pub mod anonymity;
pub mod codes;
pub mod fingerprint;
pub mod payout;

mod error;

pub use error::CoreError;

/// Highest degree a referral chain can reach.
pub const MAX_DEGREES: u8 = 6;
