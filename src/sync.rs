//! Batched ledger synchronization
//!
//! Turns one logical bulk query into as many ledger requests as the server
//! limits require:
//! - **Chunked fan-out**: the input list is split into fixed-size chunks, all
//!   chunks are requested concurrently, and results are merged (concatenated,
//!   deduplicated or summed) independent of arrival order.
//! - **Paginated walk**: history for one chunk is fetched page by page. The
//!   next cursor always comes from the last row of the most recent page, and
//!   the walk ends on the first short page. Rows repeated across pages are
//!   kept once, and a full page with nothing new is an error.
//!
//! Any failing request fails the whole logical call. Partial data is dropped.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info};

use crate::addressing::{Utxo, UtxoLookup};
use crate::error::{Result, SyncStage, WalletError};
use crate::ledger::{
    parse_amount, CursorKind, HistoryCursor, HistoryRequest, LedgerApi, LedgerError,
    RemoteTransaction, ServerLimits,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub address_chunk_size: usize,
    pub tx_hash_chunk_size: usize,
    pub history_page_size: usize,
    pub cursor_kind: CursorKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let limits = ServerLimits::default();
        Self {
            address_chunk_size: limits.addresses_per_request,
            tx_hash_chunk_size: limits.tx_hashes_per_request,
            history_page_size: limits.history_page_size,
            cursor_kind: CursorKind::default(),
        }
    }
}

impl SyncConfig {
    /// Sizes must be non-zero and never exceed what the server accepts;
    /// an oversized chunk would otherwise be rejected or silently truncated.
    pub fn validate(&self, limits: &ServerLimits) -> Result<()> {
        let checks = [
            ("address chunk size", self.address_chunk_size, limits.addresses_per_request),
            ("tx hash chunk size", self.tx_hash_chunk_size, limits.tx_hashes_per_request),
            ("history page size", self.history_page_size, limits.history_page_size),
        ];
        for (name, value, limit) in checks {
            if value == 0 {
                return Err(WalletError::Config(format!("{} must be at least 1", name)));
            }
            if value > limit {
                return Err(WalletError::Config(format!(
                    "{} {} exceeds server limit {}",
                    name, value, limit
                )));
            }
        }
        Ok(())
    }
}

/// Chain state for a set of addresses, fetched as one unit
#[derive(Debug, Clone, Default)]
pub struct AccountState {
    pub utxos: Vec<Utxo>,
    pub balance: Option<u64>,
    pub history: Vec<RemoteTransaction>,
}

pub struct BatchedSynchronizer {
    api: Arc<dyn LedgerApi>,
    config: SyncConfig,
}

impl BatchedSynchronizer {
    pub fn new(api: Arc<dyn LedgerApi>, config: SyncConfig) -> Result<Self> {
        config.validate(&api.limits())?;
        Ok(Self { api, config })
    }

    /// Issue one request per chunk concurrently; results come back in chunk order
    async fn fan_out<'a, T, F, Fut>(
        &self,
        items: &'a [String],
        chunk_size: usize,
        stage: SyncStage,
        request: F,
    ) -> Result<Vec<T>>
    where
        F: Fn(&'a [String]) -> Fut,
        Fut: Future<Output = std::result::Result<T, LedgerError>>,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let chunks: Vec<&'a [String]> = items.chunks(chunk_size).collect();
        debug!("📦 {}: {} items in {} chunks", stage, items.len(), chunks.len());

        try_join_all(chunks.into_iter().map(|chunk| request(chunk)))
            .await
            .map_err(|e| WalletError::backend(stage, items.len(), e))
    }

    /// UTXOs owned by `addresses`, deduplicated by `(txHash, outputIndex)`
    pub async fn utxos_for_addresses(&self, addresses: &[String]) -> Result<Vec<Utxo>> {
        let addresses = dedupe_preserving_order(addresses);
        let pages = self
            .fan_out(&addresses, self.config.address_chunk_size, SyncStage::Utxos, |chunk| {
                self.api.utxos_for_addresses(chunk)
            })
            .await?;

        let mut lookup = UtxoLookup::new();
        for remote in pages.into_iter().flatten() {
            let utxo = remote
                .into_utxo()
                .map_err(|e| WalletError::backend(SyncStage::Utxos, addresses.len(), e))?;
            lookup.insert(utxo);
        }
        debug!("Fetched {} UTXOs for {} addresses", lookup.len(), addresses.len());
        Ok(lookup.utxos().to_vec())
    }

    /// Sum of UTXO values; `None` when no chunk reported anything
    pub async fn utxo_sum_for_addresses(&self, addresses: &[String]) -> Result<Option<u64>> {
        let addresses = dedupe_preserving_order(addresses);
        let sums = self
            .fan_out(&addresses, self.config.address_chunk_size, SyncStage::UtxoSum, |chunk| {
                self.api.utxo_sum_for_addresses(chunk)
            })
            .await?;

        let mut total: Option<u64> = None;
        for response in sums {
            if let Some(raw) = response.sum {
                let value = parse_amount(&raw)
                    .map_err(|e| WalletError::backend(SyncStage::UtxoSum, addresses.len(), e))?;
                total = Some(total.unwrap_or(0).checked_add(value).ok_or_else(|| {
                    WalletError::backend(
                        SyncStage::UtxoSum,
                        addresses.len(),
                        LedgerError::Malformed("balance overflow".into()),
                    )
                })?);
            }
        }
        Ok(total)
    }

    /// The subset of `addresses` the ledger has seen used
    pub async fn filter_used_addresses(&self, addresses: &[String]) -> Result<Vec<String>> {
        let addresses = dedupe_preserving_order(addresses);
        let used = self
            .fan_out(
                &addresses,
                self.config.address_chunk_size,
                SyncStage::UsedAddresses,
                |chunk| self.api.filter_used_addresses(chunk),
            )
            .await?;
        let used: Vec<String> = used.into_iter().flatten().collect();
        Ok(dedupe_preserving_order(&used))
    }

    /// Transaction bodies keyed by hash
    pub async fn tx_bodies(&self, hashes: &[String]) -> Result<HashMap<String, String>> {
        let hashes = dedupe_preserving_order(hashes);
        let maps = self
            .fan_out(&hashes, self.config.tx_hash_chunk_size, SyncStage::TxBodies, |chunk| {
                self.api.tx_bodies_for_hashes(chunk)
            })
            .await?;
        Ok(maps.into_iter().flatten().collect())
    }

    /// Full history for `addresses` after `cursor`.
    ///
    /// Each address chunk is paginated independently; a transaction touching
    /// addresses in several chunks is returned once (first-seen instance).
    pub async fn history_for_addresses(
        &self,
        addresses: &[String],
        cursor: Option<HistoryCursor>,
    ) -> Result<Vec<RemoteTransaction>> {
        let addresses = dedupe_preserving_order(addresses);
        let walks = self
            .fan_out(&addresses, self.config.address_chunk_size, SyncStage::History, |chunk| {
                self.walk_history(chunk, cursor.clone())
            })
            .await?;

        let history = dedupe_by_hash(walks.into_iter().flatten());
        debug!("Fetched {} history rows for {} addresses", history.len(), addresses.len());
        Ok(history)
    }

    async fn walk_history(
        &self,
        addresses: &[String],
        mut cursor: Option<HistoryCursor>,
    ) -> std::result::Result<Vec<RemoteTransaction>, LedgerError> {
        let page_size = self.config.history_page_size;
        let mut accumulated = Vec::new();
        let mut seen = HashSet::new();
        let mut pages = 0usize;

        loop {
            let request = HistoryRequest {
                addresses: addresses.to_vec(),
                cursor: cursor.clone(),
            };
            let page = self.api.history_for_addresses(&request).await?;
            pages += 1;

            if page.len() > page_size {
                return Err(LedgerError::Malformed(format!(
                    "history page of {} rows exceeds page size {}",
                    page.len(),
                    page_size
                )));
            }

            let next = match page.last() {
                Some(last) if page.len() == page_size => {
                    Some(HistoryCursor::after_tx(self.config.cursor_kind, last)?)
                }
                _ => None,
            };

            // Inclusive cursors repeat rows at the page boundary
            let before = accumulated.len();
            accumulated.extend(page.into_iter().filter(|tx| seen.insert(tx.hash.clone())));

            match next {
                None => break,
                Some(_) if accumulated.len() == before => {
                    return Err(LedgerError::Malformed(format!(
                        "history page after {:?} returned no new rows",
                        cursor
                    )));
                }
                Some(next) => cursor = Some(next),
            }
        }

        debug!("History walk: {} pages, {} rows", pages, accumulated.len());
        Ok(accumulated)
    }

    /// UTXOs, balance and full history for `addresses`
    pub async fn fetch_account_state(&self, addresses: &[String]) -> Result<AccountState> {
        let (utxos, balance, history) = futures::try_join!(
            self.utxos_for_addresses(addresses),
            self.utxo_sum_for_addresses(addresses),
            self.history_for_addresses(addresses, None),
        )?;
        info!(
            "✅ Account state: {} UTXOs, balance {:?}, {} transactions",
            utxos.len(),
            balance,
            history.len()
        );
        Ok(AccountState { utxos, balance, history })
    }

    /// Submit signed transaction bytes, returning the ledger's tx id
    pub async fn broadcast(&self, signed_tx: &[u8]) -> Result<String> {
        let response = self
            .api
            .broadcast_tx(signed_tx)
            .await
            .map_err(|e| WalletError::backend(SyncStage::Broadcast, 1, e))?;
        info!("📡 Broadcast accepted: {}", response.tx_id);
        Ok(response.tx_id)
    }
}

pub fn dedupe_preserving_order(items: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .filter(|item| seen.insert(item.as_str()))
        .cloned()
        .collect()
}

/// Drop repeated transactions, keeping the first-seen instance of each hash
pub fn dedupe_by_hash<I>(rows: I) -> Vec<RemoteTransaction>
where
    I: IntoIterator<Item = RemoteTransaction>,
{
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|tx| seen.insert(tx.hash.clone()))
        .collect()
}
