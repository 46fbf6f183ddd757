//! Input selection for fixed-amount sends
//!
//! First-match-first: candidates are taken in the order given and the
//! selection stops at the first prefix that covers the target plus the fee
//! that prefix requires. No reordering, no search.

use tracing::debug;

use crate::addressing::Utxo;
use crate::crypto::CryptoError;
use crate::error::{Result, WalletError};

/// Smallest prefix of `candidates` whose total covers `target + fee_for(prefix)`.
///
/// `fee_for` is asked after every addition, since each input changes the
/// transaction size and whether a change output is produced.
pub fn first_match_first<F>(candidates: &[Utxo], target: u64, mut fee_for: F) -> Result<Vec<Utxo>>
where
    F: FnMut(&[Utxo]) -> std::result::Result<u64, CryptoError>,
{
    let mut selected: Vec<Utxo> = Vec::new();
    let mut total = 0u64;
    let mut required = target;

    for utxo in candidates {
        selected.push(utxo.clone());
        total = total
            .checked_add(utxo.amount)
            .ok_or_else(|| WalletError::invariant("candidate total overflows u64"))?;

        let fee = fee_for(&selected)?;
        required = target.saturating_add(fee);
        if total >= required {
            debug!(
                "Selected {} of {} inputs: {} covers {} + fee {}",
                selected.len(),
                candidates.len(),
                total,
                target,
                fee
            );
            return Ok(selected);
        }
    }

    Err(WalletError::InsufficientFunds {
        available: total,
        required,
    })
}
