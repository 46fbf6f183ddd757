//! Unsigned transaction construction
//!
//! [`TransactionBuilder`] resolves candidate addresses to UTXOs, selects
//! inputs, lets the crypto provider assemble the transaction and hands back
//! an [`UnsignedTxResponse`] whose every input carries the addressing needed
//! to sign it. Two amount modes are supported:
//! - **Send-all**: every UTXO is spent into one output of `balance - fee`.
//! - **Exact amount**: with one change address inputs are picked
//!   first-match-first; with none, every candidate input is spent and any
//!   leftover is absorbed as fee.

pub mod coin_selection;
pub mod signing;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::addressing::{AddressInfo, AddressedUtxo, AddressingMap, Utxo, UtxoLookup};
use crate::crypto::{BuiltTx, CryptoProvider, LinearFee, TxOutput};
use crate::error::{Result, WalletError};
use crate::sync::BatchedSynchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAmount {
    /// Spend the whole candidate balance minus fee
    All,
    Exact(u64),
}

#[derive(Debug, Clone)]
pub struct TxRequest {
    pub receiver: String,
    pub amount: SendAmount,
    /// Addresses whose UTXOs may fund the transaction, in preference order
    pub candidates: Vec<AddressInfo>,
    /// Zero or one address to receive change
    pub change_addresses: Vec<AddressInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuilderConfig {
    pub fee: LinearFee,
}

/// A change output that will appear on-chain, with the addressing of its
/// address so the wallet can record it once the transaction is broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutput {
    pub info: AddressInfo,
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct UnsignedTxResponse<T> {
    /// Spent UTXOs in transaction input order
    pub sender_utxos: Vec<AddressedUtxo>,
    pub unsigned_tx: T,
    /// Requested (non-change) outputs
    pub outputs: Vec<TxOutput>,
    pub change: Vec<ChangeOutput>,
    /// Everything not paid to outputs or change
    pub fee: u64,
}

impl<T> UnsignedTxResponse<T> {
    pub fn total_input(&self) -> u64 {
        self.sender_utxos.iter().map(|u| u.amount()).sum()
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum::<u64>()
            + self.change.iter().map(|c| c.amount).sum::<u64>()
    }

    /// `inputs == outputs + change + fee`
    pub fn check_balance(&self) -> Result<()> {
        let total_in = checked_sum(self.sender_utxos.iter().map(|u| u.amount()))?;
        let total_out = checked_sum(
            self.outputs
                .iter()
                .map(|o| o.amount)
                .chain(self.change.iter().map(|c| c.amount))
                .chain(std::iter::once(self.fee)),
        )?;
        if total_in != total_out {
            return Err(WalletError::invariant(format!(
                "unbalanced transaction: inputs {} != outputs + change + fee {}",
                total_in, total_out
            )));
        }
        Ok(())
    }
}

fn checked_sum(values: impl IntoIterator<Item = u64>) -> Result<u64> {
    values
        .into_iter()
        .try_fold(0u64, |acc, v| acc.checked_add(v))
        .ok_or_else(|| WalletError::invariant("amount total overflows u64"))
}

pub struct TransactionBuilder<'a, P: CryptoProvider> {
    provider: Arc<P>,
    sync: &'a BatchedSynchronizer,
    config: BuilderConfig,
}

impl<'a, P: CryptoProvider> TransactionBuilder<'a, P> {
    pub fn new(provider: Arc<P>, sync: &'a BatchedSynchronizer, config: BuilderConfig) -> Self {
        Self { provider, sync, config }
    }

    /// Fetch the candidates' UTXOs from the ledger and build
    pub async fn build(&self, request: &TxRequest) -> Result<UnsignedTxResponse<P::UnsignedTx>> {
        check_change_policy(request)?;

        let addresses: Vec<String> = request.candidates.iter().map(|c| c.address.clone()).collect();
        let utxos = self.sync.utxos_for_addresses(&addresses).await?;
        debug!(
            "Fetched {} UTXOs for {} candidate addresses",
            utxos.len(),
            addresses.len()
        );
        self.build_from_utxos(request, utxos)
    }

    /// Build from an already-known UTXO set (for instance a local cache).
    /// UTXOs owned by addresses outside `request.candidates` are dropped.
    pub fn build_from_utxos(
        &self,
        request: &TxRequest,
        utxos: Vec<Utxo>,
    ) -> Result<UnsignedTxResponse<P::UnsignedTx>> {
        check_change_policy(request)?;

        let addressing = AddressingMap::from_infos(&request.candidates);
        let offered = utxos.len();
        let lookup: UtxoLookup = utxos
            .into_iter()
            .filter(|u| addressing.contains(&u.receiver))
            .collect();
        if lookup.len() < offered {
            warn!(
                "Ignoring {} UTXOs that are duplicates or not owned by the candidate addresses",
                offered - lookup.len()
            );
        }

        let change = request.change_addresses.first();
        let (built, outputs) = match request.amount {
            SendAmount::All => self.send_all(&request.receiver, lookup.utxos())?,
            SendAmount::Exact(amount) => self.send_exact(&request.receiver, amount, lookup.utxos(), change)?,
        };

        let response = finalize(built, outputs, &lookup, &addressing, change)?;
        info!(
            "🔨 Built unsigned tx: {} inputs, {} change outputs, fee {}",
            response.sender_utxos.len(),
            response.change.len(),
            response.fee
        );
        Ok(response)
    }

    fn send_all(
        &self,
        receiver: &str,
        utxos: &[Utxo],
    ) -> Result<(BuiltTx<P::UnsignedTx>, Vec<TxOutput>)> {
        let balance = checked_sum(utxos.iter().map(|u| u.amount))?;
        if balance == 0 {
            return Err(WalletError::InsufficientFunds { available: 0, required: 1 });
        }

        // The output amount's encoding can affect size, so the trial carries the full balance
        let trial = [TxOutput { address: receiver.to_string(), amount: balance }];
        let trial_fee = self.provider.estimate_fee(utxos, &trial, &self.config.fee)?;
        let amount = match balance.checked_sub(trial_fee) {
            Some(amount) if amount > 0 => amount,
            _ => {
                return Err(WalletError::InsufficientFunds {
                    available: balance,
                    required: trial_fee.saturating_add(1),
                })
            }
        };

        let outputs = vec![TxOutput { address: receiver.to_string(), amount }];
        let built = self
            .provider
            .build_unsigned_tx(utxos, &outputs, &[], &self.config.fee)?;

        // A smaller amount may shrink the fee; a positive residual is kept as fee
        let required = amount.saturating_add(built.fee);
        if required > balance {
            return Err(WalletError::InsufficientFunds { available: balance, required });
        }
        debug!(
            "Send-all: balance {}, amount {}, residual {}",
            balance,
            amount,
            balance - required
        );
        Ok((built, outputs))
    }

    fn send_exact(
        &self,
        receiver: &str,
        amount: u64,
        utxos: &[Utxo],
        change: Option<&AddressInfo>,
    ) -> Result<(BuiltTx<P::UnsignedTx>, Vec<TxOutput>)> {
        let outputs = vec![TxOutput { address: receiver.to_string(), amount }];
        let fee = &self.config.fee;

        let built = match change {
            None => {
                let available = checked_sum(utxos.iter().map(|u| u.amount))?;
                if utxos.is_empty() {
                    return Err(WalletError::InsufficientFunds { available, required: amount });
                }
                self.provider.build_unsigned_tx(utxos, &outputs, &[], fee)?
            }
            Some(change) => {
                let change_addresses = [change.address.clone()];
                let selected = coin_selection::first_match_first(utxos, amount, |trial| {
                    self.provider
                        .build_unsigned_tx(trial, &outputs, &change_addresses, fee)
                        .map(|built| built.fee)
                })?;
                self.provider
                    .build_unsigned_tx(&selected, &outputs, &change_addresses, fee)?
            }
        };
        Ok((built, outputs))
    }
}

fn check_change_policy(request: &TxRequest) -> Result<()> {
    if request.change_addresses.len() > 1 {
        return Err(WalletError::invariant(format!(
            "{} change addresses supplied, at most one is supported",
            request.change_addresses.len()
        )));
    }
    Ok(())
}

/// Attach addressing to the provider's chosen inputs and change, then settle
/// the fee as everything the outputs do not claim
fn finalize<T>(
    built: BuiltTx<T>,
    outputs: Vec<TxOutput>,
    lookup: &UtxoLookup,
    addressing: &AddressingMap,
    change_info: Option<&AddressInfo>,
) -> Result<UnsignedTxResponse<T>> {
    let sender_utxos = built
        .inputs
        .iter()
        .map(|pointer| {
            let utxo = lookup.get(pointer).ok_or_else(|| {
                WalletError::invariant(format!(
                    "provider spent unknown output {}:{}",
                    pointer.tx_hash, pointer.output_index
                ))
            })?;
            addressing.addressed(utxo)
        })
        .collect::<Result<Vec<_>>>()?;

    let change = built
        .change
        .iter()
        .map(|output| match change_info {
            Some(info) if info.address == output.address => Ok(ChangeOutput {
                info: info.clone(),
                amount: output.amount,
            }),
            _ => Err(WalletError::invariant(format!(
                "provider produced change to unexpected address {}",
                output.address
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    let total_in = checked_sum(sender_utxos.iter().map(|u| u.amount()))?;
    let total_out = checked_sum(
        outputs
            .iter()
            .map(|o| o.amount)
            .chain(change.iter().map(|c| c.amount)),
    )?;
    let required = total_out.saturating_add(built.fee);
    if total_in < required {
        return Err(WalletError::InsufficientFunds { available: total_in, required });
    }

    let response = UnsignedTxResponse {
        sender_utxos,
        unsigned_tx: built.tx,
        outputs,
        change,
        fee: total_in - total_out,
    };
    response.check_balance()?;
    Ok(response)
}
