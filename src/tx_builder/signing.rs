//! Signing handoff
//!
//! The caller supplies one private key at a known level of the HD tree (the
//! master key, an account key, ...). For every input the remaining part of
//! the input's addressing path is walked down from that key, producing one
//! witness key per input in input order. The signature itself is produced by
//! the crypto provider.

use tracing::info;

use crate::addressing::AddressedUtxo;
use crate::crypto::CryptoProvider;
use crate::error::{Result, WalletError};
use crate::sync::BatchedSynchronizer;

use super::UnsignedTxResponse;

/// A private key and the tree level it sits at (see [`crate::addressing::levels`])
#[derive(Debug, Clone)]
pub struct LeveledKey<K> {
    pub key: K,
    pub level: u32,
}

impl<K> LeveledKey<K> {
    pub fn new(key: K, level: u32) -> Self {
        Self { key, level }
    }
}

/// Path components still to derive below a key at `key_level`
fn remaining_path(input: &AddressedUtxo, key_level: u32) -> Result<Vec<u32>> {
    let addressing = &input.addressing;
    let start = addressing.start_level();
    let leaf = addressing.leaf_level();

    // The key must sit at or above the path start and strictly above the leaf
    let skip = match key_level.checked_add(1) {
        Some(below) if below >= start && key_level < leaf => (below - start) as usize,
        _ => {
            return Err(WalletError::invariant(format!(
                "key at level {} cannot derive input {}:{} (path levels {}..={})",
                key_level, input.utxo.tx_hash, input.utxo.output_index, start, leaf
            )))
        }
    };

    Ok(addressing.path()[skip..].to_vec())
}

/// One witness key per input, in input order
pub fn derive_witness_keys<P: CryptoProvider>(
    provider: &P,
    key: &LeveledKey<P::SigningKey>,
    inputs: &[AddressedUtxo],
) -> Result<Vec<P::SigningKey>> {
    inputs
        .iter()
        .map(|input| {
            let path = remaining_path(input, key.level)?;
            Ok(provider.derive_key(&key.key, &path)?)
        })
        .collect()
}

pub fn sign_transaction<P: CryptoProvider>(
    provider: &P,
    unsigned: &UnsignedTxResponse<P::UnsignedTx>,
    key: &LeveledKey<P::SigningKey>,
) -> Result<P::SignedTx> {
    let witnesses = derive_witness_keys(provider, key, &unsigned.sender_utxos)?;
    let signed = provider.sign(&unsigned.unsigned_tx, &witnesses)?;
    info!("✍️  Signed {} inputs", witnesses.len());
    Ok(signed)
}

/// Sign and submit. Change outputs of `unsigned` should only be recorded by
/// the wallet once this returns the ledger's tx id.
pub async fn sign_and_broadcast<P: CryptoProvider>(
    provider: &P,
    sync: &BatchedSynchronizer,
    unsigned: &UnsignedTxResponse<P::UnsignedTx>,
    key: &LeveledKey<P::SigningKey>,
) -> Result<String> {
    let signed = sign_transaction(provider, unsigned, key)?;
    let bytes = provider.serialize_signed(&signed);
    sync.broadcast(&bytes).await
}
