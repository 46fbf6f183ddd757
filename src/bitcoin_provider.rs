//! Software crypto provider for BIP84 (native segwit P2WPKH) accounts
//!
//! Addresses are derived from the account-level xpub
//! (`m/84'/<coin_type>'/<account>'`), so discovery never needs private keys.
//! Private keys only enter at signing time, as `Xpriv`s handed in by the
//! caller and walked down to each input's leaf.

use std::str::FromStr;

use bdk_wallet::bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bdk_wallet::bitcoin::hashes::Hash;
use bdk_wallet::bitcoin::secp256k1::{All, Message, Secp256k1};
use bdk_wallet::bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bdk_wallet::bitcoin::transaction::Version;
use bdk_wallet::bitcoin::{
    absolute::LockTime, consensus, ecdsa, Address, Amount, CompressedPublicKey, Network,
    OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use bdk_wallet::keys::bip39::Mnemonic;
use tracing::debug;
use zeroize::Zeroizing;

use crate::addressing::{AccountPath, Chain, Utxo};
use crate::crypto::{BuiltTx, CryptoError, CryptoProvider, LinearFee, TxOutput};

/// Outputs below this value are not relayed for P2WPKH
pub const P2WPKH_DUST_LIMIT: u64 = 294;

// Weight units: version, locktime, counts and the segwit marker/flag
const TX_OVERHEAD_WU: u64 = 42;
// Outpoint, empty scriptSig, sequence, plus a 72-byte signature and 33-byte key witness
const P2WPKH_INPUT_WU: u64 = 272;
// Amount and a 22-byte witness program
const P2WPKH_OUTPUT_WU: u64 = 124;

/// Unsigned transaction plus the outputs it spends, needed for segwit sighashes
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    pub tx: Transaction,
    pub prevouts: Vec<TxOut>,
}

pub struct Bip84Provider {
    network: Network,
    secp: Secp256k1<All>,
    dust_limit: u64,
}

impl Bip84Provider {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            secp: Secp256k1::new(),
            dust_limit: P2WPKH_DUST_LIMIT,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// SLIP-44 coin type used in the account path
    pub fn coin_type(&self) -> u32 {
        if self.network == Network::Bitcoin {
            0
        } else {
            1
        }
    }

    /// Master key from a BIP39 mnemonic. The seed buffer is wiped on drop.
    pub fn master_key_from_mnemonic(
        &self,
        mnemonic: &str,
        passphrase: &str,
    ) -> Result<Xpriv, CryptoError> {
        let mnemonic = Mnemonic::parse(mnemonic)
            .map_err(|e| CryptoError::Derivation(format!("invalid mnemonic: {}", e)))?;
        let seed = Zeroizing::new(mnemonic.to_seed(passphrase));
        Xpriv::new_master(self.network, &seed[..])
            .map_err(|e| CryptoError::Derivation(e.to_string()))
    }

    /// Account-level xpriv and xpub for `path`
    pub fn account_keys(&self, master: &Xpriv, path: &AccountPath) -> Result<(Xpriv, Xpub), CryptoError> {
        let steps: Vec<ChildNumber> = path.path().iter().map(|&i| ChildNumber::from(i)).collect();
        let account_xpriv = master
            .derive_priv(&self.secp, &steps)
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        let account_xpub = Xpub::from_priv(&self.secp, &account_xpriv);
        Ok((account_xpriv, account_xpub))
    }

    fn parse_address(&self, address: &str) -> Result<Address, CryptoError> {
        Address::from_str(address)
            .and_then(|a| a.require_network(self.network))
            .map_err(|e| CryptoError::InvalidAddress(format!("{}: {}", address, e)))
    }

    fn vsize(inputs: usize, outputs: usize) -> u64 {
        let weight = TX_OVERHEAD_WU
            + P2WPKH_INPUT_WU * inputs as u64
            + P2WPKH_OUTPUT_WU * outputs as u64;
        weight.div_ceil(4)
    }

    fn tx_out(&self, output: &TxOutput) -> Result<TxOut, CryptoError> {
        Ok(TxOut {
            value: Amount::from_sat(output.amount),
            script_pubkey: self.parse_address(&output.address)?.script_pubkey(),
        })
    }
}

impl CryptoProvider for Bip84Provider {
    type AccountKey = Xpub;
    type SigningKey = Xpriv;
    type UnsignedTx = UnsignedTransaction;
    type SignedTx = Transaction;

    fn derive_addresses(
        &self,
        account: &Xpub,
        chain: Chain,
        indices: &[u32],
    ) -> Result<Vec<String>, CryptoError> {
        let chain_step = ChildNumber::from_normal_idx(chain.index())
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;
        let chain_xpub = account
            .derive_pub(&self.secp, &[chain_step])
            .map_err(|e| CryptoError::Derivation(e.to_string()))?;

        indices
            .iter()
            .map(|&index| {
                let step = ChildNumber::from_normal_idx(index)
                    .map_err(|e| CryptoError::Derivation(e.to_string()))?;
                let child = chain_xpub
                    .derive_pub(&self.secp, &[step])
                    .map_err(|e| CryptoError::Derivation(e.to_string()))?;
                let address = Address::p2wpkh(&CompressedPublicKey(child.public_key), self.network);
                Ok(address.to_string())
            })
            .collect()
    }

    fn estimate_fee(
        &self,
        inputs: &[Utxo],
        outputs: &[TxOutput],
        fee: &LinearFee,
    ) -> Result<u64, CryptoError> {
        Ok(fee.fee_for_size(Self::vsize(inputs.len(), outputs.len())))
    }

    /// Change goes to the first change address when the leftover after the
    /// with-change fee is at least the dust limit. Sufficiency of the inputs
    /// is left to the caller.
    fn build_unsigned_tx(
        &self,
        inputs: &[Utxo],
        outputs: &[TxOutput],
        change_addresses: &[String],
        fee: &LinearFee,
    ) -> Result<BuiltTx<UnsignedTransaction>, CryptoError> {
        if inputs.is_empty() {
            return Err(CryptoError::Build("transaction has no inputs".into()));
        }

        let mut tx_inputs = Vec::with_capacity(inputs.len());
        let mut prevouts = Vec::with_capacity(inputs.len());
        for utxo in inputs {
            let txid = Txid::from_str(&utxo.tx_hash)
                .map_err(|e| CryptoError::Build(format!("txid {}: {}", utxo.tx_hash, e)))?;
            tx_inputs.push(TxIn {
                previous_output: OutPoint::new(txid, utxo.output_index),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            });
            prevouts.push(TxOut {
                value: Amount::from_sat(utxo.amount),
                script_pubkey: self.parse_address(&utxo.receiver)?.script_pubkey(),
            });
        }

        let mut tx_outputs = outputs
            .iter()
            .map(|o| self.tx_out(o))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(dust) = outputs.iter().find(|o| o.amount < self.dust_limit) {
            return Err(CryptoError::Build(format!(
                "output of {} to {} is below dust limit {}",
                dust.amount, dust.address, self.dust_limit
            )));
        }

        let total_in = checked_total(inputs.iter().map(|u| u.amount))?;
        let total_out = checked_total(outputs.iter().map(|o| o.amount))?;
        let fee_without_change = fee.fee_for_size(Self::vsize(inputs.len(), outputs.len()));
        let fee_with_change = fee.fee_for_size(Self::vsize(inputs.len(), outputs.len() + 1));

        let mut change = Vec::new();
        let mut required_fee = fee_without_change;
        if let Some(change_address) = change_addresses.first() {
            let leftover = total_in
                .checked_sub(total_out)
                .and_then(|v| v.checked_sub(fee_with_change))
                .unwrap_or(0);
            if leftover >= self.dust_limit {
                let change_output = TxOutput {
                    address: change_address.clone(),
                    amount: leftover,
                };
                tx_outputs.push(self.tx_out(&change_output)?);
                change.push(change_output);
                required_fee = fee_with_change;
            } else {
                debug!("Change of {} sats below dust, absorbed as fee", leftover);
            }
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        };

        Ok(BuiltTx {
            tx: UnsignedTransaction { tx, prevouts },
            inputs: inputs.iter().map(Utxo::pointer).collect(),
            change,
            fee: required_fee,
        })
    }

    fn derive_key(&self, key: &Xpriv, path: &[u32]) -> Result<Xpriv, CryptoError> {
        let steps: Vec<ChildNumber> = path.iter().map(|&i| ChildNumber::from(i)).collect();
        key.derive_priv(&self.secp, &steps)
            .map_err(|e| CryptoError::Derivation(e.to_string()))
    }

    fn sign(&self, unsigned: &UnsignedTransaction, witnesses: &[Xpriv]) -> Result<Transaction, CryptoError> {
        let input_count = unsigned.tx.input.len();
        if witnesses.len() != input_count || unsigned.prevouts.len() != input_count {
            return Err(CryptoError::Signing(format!(
                "{} keys and {} prevouts for {} inputs",
                witnesses.len(),
                unsigned.prevouts.len(),
                input_count
            )));
        }

        let mut signed = unsigned.tx.clone();
        let mut sighasher = SighashCache::new(&unsigned.tx);
        let mut input_witnesses = Vec::with_capacity(input_count);

        for (i, (xpriv, prevout)) in witnesses.iter().zip(&unsigned.prevouts).enumerate() {
            let secret = xpriv.private_key;
            let pubkey = CompressedPublicKey(secret.public_key(&self.secp));
            let expected = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
            if expected != prevout.script_pubkey {
                return Err(CryptoError::Signing(format!(
                    "key for input {} does not own the spent output",
                    i
                )));
            }

            let sighash = sighasher
                .p2wpkh_signature_hash(i, &prevout.script_pubkey, prevout.value, EcdsaSighashType::All)
                .map_err(|e| CryptoError::Signing(format!("sighash for input {}: {}", i, e)))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = ecdsa::Signature {
                signature: self.secp.sign_ecdsa(&message, &secret),
                sighash_type: EcdsaSighashType::All,
            };

            let mut witness = Witness::new();
            witness.push(signature.to_vec());
            witness.push(pubkey.to_bytes());
            input_witnesses.push(witness);
        }

        for (input, witness) in signed.input.iter_mut().zip(input_witnesses) {
            input.witness = witness;
        }
        Ok(signed)
    }

    fn serialize_signed(&self, tx: &Transaction) -> Vec<u8> {
        consensus::encode::serialize(tx)
    }
}

fn checked_total(amounts: impl IntoIterator<Item = u64>) -> Result<u64, CryptoError> {
    amounts
        .into_iter()
        .try_fold(0u64, |acc, v| acc.checked_add(v))
        .ok_or_else(|| CryptoError::Build("amount total overflows u64".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::HARDENED;

    const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn mainnet_account() -> (Bip84Provider, Xpriv, Xpub) {
        let provider = Bip84Provider::new(Network::Bitcoin);
        let master = provider.master_key_from_mnemonic(MNEMONIC, "").unwrap();
        let path = AccountPath::bip84(provider.coin_type(), 0).unwrap();
        let (xpriv, xpub) = provider.account_keys(&master, &path).unwrap();
        (provider, xpriv, xpub)
    }

    #[test]
    fn test_bip84_test_vector() {
        let (provider, _, xpub) = mainnet_account();
        let external = provider.derive_addresses(&xpub, Chain::External, &[0, 1]).unwrap();
        assert_eq!(external[0], "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
        assert_eq!(external[1], "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g");

        let change = provider.derive_addresses(&xpub, Chain::Internal, &[0]).unwrap();
        assert_eq!(change[0], "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el");
    }

    #[test]
    fn test_fee_grows_with_inputs_and_outputs() {
        let provider = Bip84Provider::new(Network::Signet);
        let fee = LinearFee::new(0, 2);
        let utxo = Utxo {
            tx_hash: "00".repeat(32),
            output_index: 0,
            receiver: String::new(),
            amount: 10_000,
        };
        let output = TxOutput { address: String::new(), amount: 1_000 };

        let one_in = provider.estimate_fee(&[utxo.clone()], &[output.clone()], &fee).unwrap();
        let two_in = provider.estimate_fee(&[utxo.clone(), utxo], &[output], &fee).unwrap();
        // 42 + 272 + 124 = 438 WU = 110 vB
        assert_eq!(one_in, 220);
        assert_eq!(two_in, 2 * Bip84Provider::vsize(2, 1));
    }

    #[test]
    fn test_build_and_sign_with_change() {
        let (provider, account_xpriv, xpub) = mainnet_account();
        let receive = provider.derive_addresses(&xpub, Chain::External, &[0, 1]).unwrap();
        let change = provider.derive_addresses(&xpub, Chain::Internal, &[0]).unwrap();

        let utxo = Utxo {
            tx_hash: "11".repeat(32),
            output_index: 1,
            receiver: receive[0].clone(),
            amount: 100_000,
        };
        let outputs = vec![TxOutput { address: receive[1].clone(), amount: 40_000 }];
        let fee = LinearFee::new(0, 1);

        let built = provider
            .build_unsigned_tx(&[utxo.clone()], &outputs, &change, &fee)
            .unwrap();
        assert_eq!(built.change.len(), 1);
        assert_eq!(built.change[0].amount, 100_000 - 40_000 - built.fee);
        assert_eq!(built.tx.tx.output.len(), 2);
        assert_eq!(built.inputs, vec![utxo.pointer()]);

        let witness_key = provider.derive_key(&account_xpriv, &[0, 0]).unwrap();
        let signed = provider.sign(&built.tx, &[witness_key]).unwrap();
        assert_eq!(signed.input[0].witness.len(), 2);
        assert!(!provider.serialize_signed(&signed).is_empty());

        // A key for a different address must not sign
        let wrong_key = provider.derive_key(&account_xpriv, &[0, 1]).unwrap();
        assert!(matches!(provider.sign(&built.tx, &[wrong_key]), Err(CryptoError::Signing(_))));
    }

    #[test]
    fn test_dust_change_is_omitted() {
        let (provider, _, xpub) = mainnet_account();
        let receive = provider.derive_addresses(&xpub, Chain::External, &[0, 1]).unwrap();
        let change = provider.derive_addresses(&xpub, Chain::Internal, &[0]).unwrap();
        let utxo = Utxo {
            tx_hash: "22".repeat(32),
            output_index: 0,
            receiver: receive[0].clone(),
            amount: 10_000,
        };
        let outputs = vec![TxOutput { address: receive[1].clone(), amount: 9_700 }];

        let built = provider
            .build_unsigned_tx(&[utxo], &outputs, &change, &LinearFee::default())
            .unwrap();
        assert!(built.change.is_empty());
        assert_eq!(built.tx.tx.output.len(), 1);
    }

    #[test]
    fn test_overflowing_input_total_is_build_error() {
        let (provider, _, xpub) = mainnet_account();
        let receive = provider.derive_addresses(&xpub, Chain::External, &[0, 1]).unwrap();
        let huge = |n: &str| Utxo {
            tx_hash: n.repeat(32),
            output_index: 0,
            receiver: receive[0].clone(),
            amount: u64::MAX / 2 + 1,
        };
        let outputs = vec![TxOutput { address: receive[1].clone(), amount: 1_000 }];

        let result = provider.build_unsigned_tx(&[huge("33"), huge("44")], &outputs, &[], &LinearFee::default());
        assert!(matches!(result, Err(CryptoError::Build(_))));
    }

    #[test]
    fn test_hardened_path_derivation_matches_account_keys() {
        let (provider, account_xpriv, _) = mainnet_account();
        let master = provider.master_key_from_mnemonic(MNEMONIC, "").unwrap();
        let from_root = provider
            .derive_key(&master, &[84 + HARDENED, HARDENED, HARDENED, 0, 0])
            .unwrap();
        let from_account = provider.derive_key(&account_xpriv, &[0, 0]).unwrap();
        assert_eq!(from_root.private_key, from_account.private_key);
    }
}
