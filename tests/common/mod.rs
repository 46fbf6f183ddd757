#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use ambient_core::addressing::{AccountPath, AddressInfo, Chain, Utxo, UtxoPointer};
use ambient_core::crypto::{Account, BuiltTx, CryptoError, CryptoProvider, LinearFee, TxOutput};
use ambient_core::ledger::{
    check_request_size, BroadcastResponse, HistoryCursor, HistoryRequest, LedgerApi, LedgerError,
    RemoteTransaction, RemoteUtxo, ServerLimits, TxIo, TxState, UtxoSumResponse,
};
use ambient_core::sync::{BatchedSynchronizer, SyncConfig};

// ============================================================
// IN-MEMORY LEDGER
// ============================================================

/// Ledger API backed by in-memory tables.
///
/// Enforces `limits` like a real server, records every request size, and
/// can be told to fail a method or serve scripted history pages.
pub struct FakeLedger {
    limits: ServerLimits,
    utxos: Vec<RemoteUtxo>,
    /// Rows returned for every UTXO request regardless of the addresses asked
    leaked_utxos: Vec<RemoteUtxo>,
    used: HashSet<String>,
    history: Vec<RemoteTransaction>,
    scripted_pages: Mutex<VecDeque<Vec<RemoteTransaction>>>,
    failing: Mutex<HashSet<&'static str>>,
    broadcast_rejection: Mutex<Option<String>>,
    pub requests: Mutex<Vec<(&'static str, usize)>>,
    pub history_requests: Mutex<Vec<HistoryRequest>>,
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
}

impl Default for FakeLedger {
    fn default() -> Self {
        Self::new(ServerLimits::default())
    }
}

impl FakeLedger {
    pub fn new(limits: ServerLimits) -> Self {
        Self {
            limits,
            utxos: Vec::new(),
            leaked_utxos: Vec::new(),
            used: HashSet::new(),
            history: Vec::new(),
            scripted_pages: Mutex::new(VecDeque::new()),
            failing: Mutex::new(HashSet::new()),
            broadcast_rejection: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            history_requests: Mutex::new(Vec::new()),
            broadcasts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_utxos(mut self, utxos: Vec<RemoteUtxo>) -> Self {
        self.utxos = utxos;
        self
    }

    pub fn with_leaked_utxos(mut self, utxos: Vec<RemoteUtxo>) -> Self {
        self.leaked_utxos = utxos;
        self
    }

    pub fn with_used<I, S>(mut self, used: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.used = used.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_history(mut self, history: Vec<RemoteTransaction>) -> Self {
        self.history = history;
        self
    }

    /// Serve these pages in order, ignoring addresses and cursor
    pub fn with_scripted_pages(self, pages: Vec<Vec<RemoteTransaction>>) -> Self {
        *self.scripted_pages.lock().unwrap() = pages.into();
        self
    }

    pub fn fail(&self, method: &'static str) {
        self.failing.lock().unwrap().insert(method);
    }

    pub fn reject_broadcast(&self, reason: &str) {
        *self.broadcast_rejection.lock().unwrap() = Some(reason.to_string());
    }

    pub fn request_sizes(&self, method: &str) -> Vec<usize> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| *m == method)
            .map(|(_, n)| *n)
            .collect()
    }

    fn enter(&self, method: &'static str, len: usize, limit: usize) -> Result<(), LedgerError> {
        check_request_size(len, limit)?;
        self.requests.lock().unwrap().push((method, len));
        if self.failing.lock().unwrap().contains(method) {
            return Err(LedgerError::Status {
                status: 503,
                body: format!("{} unavailable", method),
            });
        }
        Ok(())
    }

    fn owned_utxos(&self, addresses: &[String]) -> Vec<RemoteUtxo> {
        let wanted: HashSet<&String> = addresses.iter().collect();
        self.utxos
            .iter()
            .filter(|u| wanted.contains(&u.receiver))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl LedgerApi for FakeLedger {
    fn limits(&self) -> ServerLimits {
        self.limits
    }

    async fn utxos_for_addresses(&self, addresses: &[String]) -> Result<Vec<RemoteUtxo>, LedgerError> {
        self.enter("utxos", addresses.len(), self.limits.addresses_per_request)?;
        let mut rows = self.owned_utxos(addresses);
        rows.extend(self.leaked_utxos.iter().cloned());
        Ok(rows)
    }

    async fn utxo_sum_for_addresses(&self, addresses: &[String]) -> Result<UtxoSumResponse, LedgerError> {
        self.enter("utxo_sum", addresses.len(), self.limits.addresses_per_request)?;
        let rows = self.owned_utxos(addresses);
        if rows.is_empty() {
            return Ok(UtxoSumResponse { sum: None });
        }
        let sum: u64 = rows.iter().map(|u| u.amount.parse::<u64>().unwrap()).sum();
        Ok(UtxoSumResponse { sum: Some(sum.to_string()) })
    }

    async fn history_for_addresses(
        &self,
        request: &HistoryRequest,
    ) -> Result<Vec<RemoteTransaction>, LedgerError> {
        self.enter("history", request.addresses.len(), self.limits.addresses_per_request)?;
        self.history_requests.lock().unwrap().push(request.clone());

        if let Some(page) = self.scripted_pages.lock().unwrap().pop_front() {
            return Ok(page);
        }

        let wanted: HashSet<&String> = request.addresses.iter().collect();
        let touching: Vec<&RemoteTransaction> = self
            .history
            .iter()
            .filter(|tx| {
                tx.inputs
                    .iter()
                    .chain(tx.outputs.iter())
                    .any(|io| wanted.contains(&io.address))
            })
            .collect();

        let remaining: Vec<&RemoteTransaction> = match &request.cursor {
            None => touching,
            // Inclusive of `ts`, resuming after `after_tx` when it is known
            Some(HistoryCursor::DateFrom { ts, after_tx }) => {
                let start = touching
                    .iter()
                    .position(|t| &t.hash == after_tx)
                    .map_or(0, |i| i + 1);
                touching[start..]
                    .iter()
                    .copied()
                    .filter(|tx| tx.last_update >= *ts)
                    .collect()
            }
            Some(HistoryCursor::After { tx, .. }) => match touching.iter().position(|t| &t.hash == tx) {
                Some(i) => touching[i + 1..].to_vec(),
                None => Vec::new(),
            },
        };

        Ok(remaining
            .into_iter()
            .take(self.limits.history_page_size)
            .cloned()
            .collect())
    }

    async fn filter_used_addresses(&self, addresses: &[String]) -> Result<Vec<String>, LedgerError> {
        self.enter("filter_used", addresses.len(), self.limits.addresses_per_request)?;
        Ok(addresses
            .iter()
            .filter(|a| self.used.contains(*a))
            .cloned()
            .collect())
    }

    async fn tx_bodies_for_hashes(&self, hashes: &[String]) -> Result<HashMap<String, String>, LedgerError> {
        self.enter("tx_bodies", hashes.len(), self.limits.tx_hashes_per_request)?;
        Ok(hashes
            .iter()
            .map(|h| (h.clone(), format!("body-{}", h)))
            .collect())
    }

    async fn broadcast_tx(&self, signed_tx: &[u8]) -> Result<BroadcastResponse, LedgerError> {
        self.enter("broadcast", 1, 1)?;
        if let Some(reason) = self.broadcast_rejection.lock().unwrap().clone() {
            return Err(LedgerError::InvalidWitness(reason));
        }
        self.broadcasts.lock().unwrap().push(signed_tx.to_vec());
        Ok(BroadcastResponse {
            tx_id: format!("txid-{}", self.broadcasts.lock().unwrap().len()),
        })
    }
}

pub fn synchronizer(ledger: Arc<FakeLedger>, config: SyncConfig) -> BatchedSynchronizer {
    BatchedSynchronizer::new(ledger, config).unwrap()
}

// ============================================================
// DETERMINISTIC CRYPTO PROVIDER
// ============================================================

/// Addresses are `"<account key>/<chain>/<index>"`; size is
/// `10 + 100 * inputs + 50 * outputs`; any positive leftover becomes change.
#[derive(Debug, Default)]
pub struct FakeProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeTx {
    pub inputs: Vec<UtxoPointer>,
    pub outputs: Vec<TxOutput>,
}

/// A "private key" is the path walked to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeKey(pub Vec<u32>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeSignedTx {
    pub tx: FakeTx,
    pub witnesses: Vec<FakeKey>,
}

impl FakeProvider {
    pub fn size(inputs: usize, outputs: usize) -> u64 {
        10 + 100 * inputs as u64 + 50 * outputs as u64
    }
}

impl CryptoProvider for FakeProvider {
    type AccountKey = String;
    type SigningKey = FakeKey;
    type UnsignedTx = FakeTx;
    type SignedTx = FakeSignedTx;

    fn derive_addresses(
        &self,
        account: &String,
        chain: Chain,
        indices: &[u32],
    ) -> Result<Vec<String>, CryptoError> {
        Ok(indices
            .iter()
            .map(|i| format!("{}/{}/{}", account, chain.index(), i))
            .collect())
    }

    fn estimate_fee(
        &self,
        inputs: &[Utxo],
        outputs: &[TxOutput],
        fee: &LinearFee,
    ) -> Result<u64, CryptoError> {
        Ok(fee.fee_for_size(Self::size(inputs.len(), outputs.len())))
    }

    fn build_unsigned_tx(
        &self,
        inputs: &[Utxo],
        outputs: &[TxOutput],
        change_addresses: &[String],
        fee: &LinearFee,
    ) -> Result<BuiltTx<FakeTx>, CryptoError> {
        if inputs.is_empty() {
            return Err(CryptoError::Build("no inputs".into()));
        }
        let total_in = inputs
            .iter()
            .try_fold(0u64, |acc, u| acc.checked_add(u.amount))
            .ok_or_else(|| CryptoError::Build("input total overflows".into()))?;
        let total_out = outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
            .ok_or_else(|| CryptoError::Build("output total overflows".into()))?;
        let fee_without = fee.fee_for_size(Self::size(inputs.len(), outputs.len()));
        let fee_with = fee.fee_for_size(Self::size(inputs.len(), outputs.len() + 1));

        let mut all_outputs = outputs.to_vec();
        let mut change = Vec::new();
        let mut required = fee_without;
        if let Some(address) = change_addresses.first() {
            let leftover = total_in.saturating_sub(total_out).saturating_sub(fee_with);
            if leftover > 0 {
                let output = TxOutput { address: address.clone(), amount: leftover };
                all_outputs.push(output.clone());
                change.push(output);
                required = fee_with;
            }
        }

        Ok(BuiltTx {
            tx: FakeTx {
                inputs: inputs.iter().map(Utxo::pointer).collect(),
                outputs: all_outputs,
            },
            inputs: inputs.iter().map(Utxo::pointer).collect(),
            change,
            fee: required,
        })
    }

    fn derive_key(&self, key: &FakeKey, path: &[u32]) -> Result<FakeKey, CryptoError> {
        let mut full = key.0.clone();
        full.extend_from_slice(path);
        Ok(FakeKey(full))
    }

    fn sign(&self, tx: &FakeTx, witnesses: &[FakeKey]) -> Result<FakeSignedTx, CryptoError> {
        if witnesses.len() != tx.inputs.len() {
            return Err(CryptoError::Signing("witness count mismatch".into()));
        }
        Ok(FakeSignedTx { tx: tx.clone(), witnesses: witnesses.to_vec() })
    }

    fn serialize_signed(&self, tx: &FakeSignedTx) -> Vec<u8> {
        format!("{:?}", tx).into_bytes()
    }
}

// ============================================================
// FIXTURES
// ============================================================

pub fn account(key: &str) -> Account<FakeProvider> {
    Account::new(
        Arc::new(FakeProvider),
        key.to_string(),
        AccountPath::bip84(1, 0).unwrap(),
    )
}

pub fn address(key: &str, chain: Chain, index: u32) -> String {
    format!("{}/{}/{}", key, chain.index(), index)
}

pub fn infos(account: &Account<FakeProvider>, chain: Chain, indices: &[u32]) -> Vec<AddressInfo> {
    account.derive(chain, indices).unwrap()
}

pub fn remote_utxo(tx_hash: &str, index: u32, receiver: &str, amount: u64) -> RemoteUtxo {
    RemoteUtxo {
        tx_hash: tx_hash.to_string(),
        tx_index: index,
        receiver: receiver.to_string(),
        amount: amount.to_string(),
    }
}

pub fn remote_tx(hash: &str, block: u64, last_update: u64, addresses: &[&str]) -> RemoteTransaction {
    RemoteTransaction {
        hash: hash.to_string(),
        block_hash: Some(format!("block{}", block)),
        block_num: Some(block),
        tx_ordinal: Some(0),
        last_update,
        tx_state: TxState::Successful,
        inputs: Vec::new(),
        outputs: addresses
            .iter()
            .map(|a| TxIo { address: a.to_string(), amount: "1000".into() })
            .collect(),
    }
}
