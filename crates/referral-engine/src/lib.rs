//! Referral chain engine for University of Bacon listings.
//!
//! [`chain::ChainManager`] is the entry point. Persistence goes through the
//! [`store::ChainStore`] trait; [`store::MemoryChainStore`] is the in-process
//! implementation used by the CLI and the tests.

pub mod audit;
pub mod chain;
pub mod clock;
pub mod config;
pub mod fraud;
pub mod ledger;
pub mod listing;
pub mod payout;
pub mod store;
pub mod types;

mod error;

pub use chain::{ChainContext, ChainManager, ChainResult, SaleConfirmation, ShareRequest};
pub use config::{ConfigError, EngineConfig};
pub use error::ReferralError;
