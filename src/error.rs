//! Error taxonomy for the wallet core
//!
//! Lower-level failures (`LedgerError`, `CryptoError`) are caught at each
//! component boundary and lifted into `WalletError` with enough context to log
//! which stage and how many items were involved.

use crate::addressing::AddressingError;
use crate::crypto::CryptoError;
use crate::ledger::LedgerError;

/// Which logical operation a backend failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Utxos,
    UtxoSum,
    History,
    UsedAddresses,
    TxBodies,
    Broadcast,
}

impl SyncStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStage::Utxos => "utxos",
            SyncStage::UtxoSum => "utxo sum",
            SyncStage::History => "history",
            SyncStage::UsedAddresses => "used addresses",
            SyncStage::TxBodies => "tx bodies",
            SyncStage::Broadcast => "broadcast",
        }
    }
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Backend request failed during {stage} ({items} items): {source}")]
    Backend {
        stage: SyncStage,
        items: usize,
        #[source]
        source: LedgerError,
    },

    #[error("Transaction rejected, invalid witness: {0}")]
    InvalidWitness(String),

    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    #[error("Crypto provider error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid addressing: {0}")]
    Addressing(#[from] AddressingError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl WalletError {
    /// Lift a ledger failure into the taxonomy.
    ///
    /// Witness rejections stay distinct from generic network failures.
    pub fn backend(stage: SyncStage, items: usize, source: LedgerError) -> Self {
        match source {
            LedgerError::InvalidWitness(msg) => WalletError::InvalidWitness(msg),
            source => WalletError::Backend { stage, items, source },
        }
    }

    /// Build an invariant violation, logging it loudly.
    pub fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("❌ Internal invariant violated: {}", msg);
        WalletError::Invariant(msg)
    }

    /// Programming errors that must not be retried or shown as user errors
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WalletError::Invariant(_) | WalletError::Addressing(_) | WalletError::Config(_)
        )
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WalletError::InsufficientFunds { .. } | WalletError::Backend { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;
