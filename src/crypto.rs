//! Crypto provider abstraction
//!
//! Key derivation, transaction assembly and signature production are supplied
//! by an implementation of [`CryptoProvider`] passed in explicitly by the
//! caller. All methods are synchronous, pure functions of their inputs.
//! Implementations can be:
//! - [`crate::bitcoin_provider::Bip84Provider`]: software keys, P2WPKH
//! - hardware-device bridges (signing forwarded to the device)
//! - deterministic fakes for tests

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::addressing::{AccountPath, AddressInfo, Addressing, Chain, Utxo, UtxoPointer};
use crate::error::{Result, WalletError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    Derivation(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transaction assembly failed: {0}")]
    Build(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Linear fee model: `constant + coefficient * size`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearFee {
    pub constant: u64,
    pub coefficient: u64,
}

impl LinearFee {
    pub fn new(constant: u64, coefficient: u64) -> Self {
        Self { constant, coefficient }
    }

    pub fn fee_for_size(&self, size: u64) -> u64 {
        self.constant
            .saturating_add(self.coefficient.saturating_mul(size))
    }
}

impl Default for LinearFee {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
}

/// Result of low-level transaction assembly
#[derive(Debug, Clone)]
pub struct BuiltTx<T> {
    pub tx: T,
    /// Spent outputs in transaction input order
    pub inputs: Vec<UtxoPointer>,
    /// Change outputs that actually appear in the transaction
    pub change: Vec<TxOutput>,
    /// Minimum fee the transaction requires under the fee model
    pub fee: u64,
}

pub trait CryptoProvider: Send + Sync {
    /// Public account-level key addresses are derived from
    type AccountKey: Clone + Send + Sync;
    /// Private key at some level of the HD tree
    type SigningKey: Clone + Send + Sync;
    type UnsignedTx: Clone + std::fmt::Debug + Send + Sync;
    type SignedTx: Send + Sync;

    /// Addresses at `indices` on `chain`, in the same order
    fn derive_addresses(
        &self,
        account: &Self::AccountKey,
        chain: Chain,
        indices: &[u32],
    ) -> std::result::Result<Vec<String>, CryptoError>;

    /// Minimum fee for a transaction spending `inputs` into exactly `outputs`
    fn estimate_fee(
        &self,
        inputs: &[Utxo],
        outputs: &[TxOutput],
        fee: &LinearFee,
    ) -> std::result::Result<u64, CryptoError>;

    /// Assemble a transaction spending `inputs` in the given order. Value left
    /// over after outputs and fee goes to the change addresses when it is
    /// worth an output, otherwise it is absorbed as fee. Whether the inputs
    /// cover outputs plus `BuiltTx::fee` is checked by the caller.
    fn build_unsigned_tx(
        &self,
        inputs: &[Utxo],
        outputs: &[TxOutput],
        change_addresses: &[String],
        fee: &LinearFee,
    ) -> std::result::Result<BuiltTx<Self::UnsignedTx>, CryptoError>;

    /// Walk `path` (relative child indices) down from `key`
    fn derive_key(
        &self,
        key: &Self::SigningKey,
        path: &[u32],
    ) -> std::result::Result<Self::SigningKey, CryptoError>;

    /// One witness key per input, in input order
    fn sign(
        &self,
        tx: &Self::UnsignedTx,
        witnesses: &[Self::SigningKey],
    ) -> std::result::Result<Self::SignedTx, CryptoError>;

    fn serialize_signed(&self, tx: &Self::SignedTx) -> Vec<u8>;
}

/// An account's public key bound to the provider that can derive from it
pub struct Account<P: CryptoProvider> {
    provider: Arc<P>,
    key: P::AccountKey,
    path: AccountPath,
}

impl<P: CryptoProvider> Clone for Account<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            key: self.key.clone(),
            path: self.path,
        }
    }
}

impl<P: CryptoProvider> Account<P> {
    pub fn new(provider: Arc<P>, key: P::AccountKey, path: AccountPath) -> Self {
        Self { provider, key, path }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn path(&self) -> &AccountPath {
        &self.path
    }

    /// Derive addresses with their addressing attached
    pub fn derive(&self, chain: Chain, indices: &[u32]) -> Result<Vec<AddressInfo>> {
        let addresses = self.provider.derive_addresses(&self.key, chain, indices)?;
        if addresses.len() != indices.len() {
            return Err(WalletError::invariant(format!(
                "provider derived {} addresses for {} indices",
                addresses.len(),
                indices.len()
            )));
        }
        addresses
            .into_iter()
            .zip(indices)
            .map(|(address, &index)| {
                Ok(AddressInfo {
                    address,
                    addressing: Addressing::new(self.path, chain, index)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_fee() {
        let fee = LinearFee::new(155_381, 44);
        assert_eq!(fee.fee_for_size(0), 155_381);
        assert_eq!(fee.fee_for_size(200), 155_381 + 8_800);
        assert_eq!(LinearFee::new(1, u64::MAX).fee_for_size(2), u64::MAX);
    }
}
