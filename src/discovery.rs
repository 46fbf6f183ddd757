//! Gap-limit address discovery
//!
//! Walks one chain of an account in derivation batches, asking the ledger
//! which addresses are used, until a full `scan_size`-wide window past the
//! highest used index contains no used address. Each batch depends on the
//! outcome of the previous one, so the loop is sequential; the two chains of
//! an account are independent and scanned concurrently.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::addressing::{AddressInfo, AddressRecord, Chain};
use crate::crypto::{Account, CryptoProvider};
use crate::error::{Result, WalletError};
use crate::sync::BatchedSynchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Width of the trailing unused window (gap limit)
    pub scan_size: usize,
    /// Addresses derived and checked per batch
    pub request_size: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_size: 20,
            request_size: 50,
        }
    }
}

impl DiscoveryConfig {
    /// A batch must always be able to fill the next scan window, or the scan
    /// could stall without terminating.
    pub fn validate(&self) -> Result<()> {
        if self.scan_size == 0 {
            return Err(WalletError::Config("address scan size must be at least 1".into()));
        }
        if self.request_size < self.scan_size {
            return Err(WalletError::invariant(format!(
                "address request size {} is smaller than scan size {}",
                self.request_size, self.scan_size
            )));
        }
        Ok(())
    }
}

/// Used address space of both chains of one account
#[derive(Debug, Clone, Default)]
pub struct RestoredAccount {
    pub external: Vec<AddressRecord>,
    pub internal: Vec<AddressRecord>,
}

impl RestoredAccount {
    pub fn is_empty(&self) -> bool {
        self.external.is_empty() && self.internal.is_empty()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.external
            .iter()
            .chain(self.internal.iter())
            .map(|r| r.info.address.clone())
            .collect()
    }
}

pub struct AddressDiscovery<'a> {
    sync: &'a BatchedSynchronizer,
    config: DiscoveryConfig,
}

impl<'a> AddressDiscovery<'a> {
    pub fn new(sync: &'a BatchedSynchronizer, config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { sync, config })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// All addresses of `chain` up to and including the highest used index.
    ///
    /// Unused addresses below that index are included with `is_used = false`.
    /// An account that was never used yields an empty list.
    pub async fn scan_chain<P: CryptoProvider>(
        &self,
        account: &Account<P>,
        chain: Chain,
    ) -> Result<Vec<AddressRecord>> {
        let scan_size = self.config.scan_size;
        let mut records: Vec<AddressRecord> = Vec::new();
        let mut highest_used: Option<usize> = None;
        let mut batches = 0usize;

        loop {
            let window_start = highest_used.map_or(0, |h| h + 1);
            let window_end = window_start + scan_size;

            if records.len() < window_end {
                let batch = self.fetch_batch(account, chain, records.len()).await?;
                records.extend(batch);
                batches += 1;

                if records.len() < window_end {
                    return Err(WalletError::invariant(format!(
                        "{} chain batch of {} cannot fill scan window ending at {}",
                        chain, self.config.request_size, window_end
                    )));
                }
            }

            match records[window_start..window_end].iter().rposition(|r| r.is_used) {
                Some(offset) => {
                    highest_used = Some(window_start + offset);
                    debug!("{} chain: highest used index now {}", chain, window_start + offset);
                }
                None => break,
            }
        }

        records.truncate(highest_used.map_or(0, |h| h + 1));
        info!(
            "🔍 {} chain scanned: {} addresses in use range after {} batches",
            chain,
            records.len(),
            batches
        );
        Ok(records)
    }

    async fn fetch_batch<P: CryptoProvider>(
        &self,
        account: &Account<P>,
        chain: Chain,
        start: usize,
    ) -> Result<Vec<AddressRecord>> {
        let start = u32::try_from(start)
            .map_err(|_| WalletError::invariant(format!("scan start {} out of range", start)))?;
        let count = u32::try_from(self.config.request_size)
            .map_err(|_| WalletError::Config("address request size out of range".into()))?;
        let end = start
            .checked_add(count)
            .ok_or_else(|| WalletError::invariant("derivation index overflow"))?;
        let indices: Vec<u32> = (start..end).collect();

        let infos = account.derive(chain, &indices)?;
        let addresses: Vec<String> = infos.iter().map(|i| i.address.clone()).collect();
        let used: HashSet<String> = self
            .sync
            .filter_used_addresses(&addresses)
            .await?
            .into_iter()
            .collect();

        debug!(
            "{} chain batch {}..{}: {} used",
            chain,
            start,
            end,
            used.len()
        );
        Ok(infos
            .into_iter()
            .map(|info| {
                let is_used = used.contains(&info.address);
                AddressRecord { info, is_used }
            })
            .collect())
    }

    /// Scan the external and internal chains concurrently
    pub async fn restore_account<P: CryptoProvider>(&self, account: &Account<P>) -> Result<RestoredAccount> {
        let (external, internal) = futures::try_join!(
            self.scan_chain(account, Chain::External),
            self.scan_chain(account, Chain::Internal),
        )?;
        info!(
            "✅ Account {} restored: {} external, {} internal addresses",
            account.path().account(),
            external.len(),
            internal.len()
        );
        Ok(RestoredAccount { external, internal })
    }
}

/// Derive the address right after the highest known index on `chain`
/// (index 0 when nothing is known). Used to allocate a fresh address, for
/// instance after discovery found an empty account.
pub fn next_address<P: CryptoProvider>(
    account: &Account<P>,
    chain: Chain,
    known: &[AddressRecord],
) -> Result<AddressInfo> {
    let next = known
        .iter()
        .filter(|r| r.info.addressing.chain() == chain)
        .map(|r| r.index())
        .max()
        .map_or(Some(0), |highest| highest.checked_add(1))
        .ok_or_else(|| WalletError::invariant("derivation index overflow"))?;

    account
        .derive(chain, &[next])?
        .pop()
        .ok_or_else(|| WalletError::invariant("provider returned no address"))
}
