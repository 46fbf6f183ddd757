// Library interface for the ambient wallet core
// Exposes public modules for the CLI and integration tests

pub mod addressing;
pub mod bitcoin_provider;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod sync;
pub mod tx_builder;

pub use error::{Result, WalletError};
