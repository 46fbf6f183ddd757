//! Remote ledger (indexer) access
//!
//! [`LedgerApi`] is the stateless request/response surface of the remote
//! indexer. Every call accepts a bounded list of addresses or hashes; the
//! bounds are declared by [`LedgerApi::limits`] and enforced by
//! [`crate::sync::BatchedSynchronizer`], which splits logical queries into
//! requests the server accepts.
//!
//! [`HttpLedgerApi`] is the JSON-over-HTTP implementation.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::addressing::Utxo;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Ledger API timeout after {0}s")]
    Timeout(u64),

    #[error("Ledger API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed ledger response: {0}")]
    Malformed(String),

    #[error("Request of {len} items exceeds server limit of {limit}")]
    RequestTooLarge { len: usize, limit: usize },

    #[error("Signed transaction rejected: {0}")]
    InvalidWitness(String),
}

/// Server-declared request bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLimits {
    pub addresses_per_request: usize,
    pub tx_hashes_per_request: usize,
    pub history_page_size: usize,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            addresses_per_request: 50,
            tx_hashes_per_request: 20,
            history_page_size: 50,
        }
    }
}

/// Reject a request before any IO when it is larger than the server accepts
pub fn check_request_size(len: usize, limit: usize) -> Result<(), LedgerError> {
    if len > limit {
        return Err(LedgerError::RequestTooLarge { len, limit });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUtxo {
    pub tx_hash: String,
    pub tx_index: u32,
    pub receiver: String,
    /// Decimal string
    pub amount: String,
}

impl RemoteUtxo {
    pub fn into_utxo(self) -> Result<Utxo, LedgerError> {
        let amount = parse_amount(&self.amount)?;
        Ok(Utxo {
            tx_hash: self.tx_hash,
            output_index: self.tx_index,
            receiver: self.receiver,
            amount,
        })
    }
}

pub fn parse_amount(raw: &str) -> Result<u64, LedgerError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| LedgerError::Malformed(format!("amount '{}': {}", raw, e)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoSumResponse {
    /// `null` when the addresses hold nothing
    pub sum: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Successful,
    Failed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIo {
    pub address: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTransaction {
    pub hash: String,
    pub block_hash: Option<String>,
    pub block_num: Option<u64>,
    pub tx_ordinal: Option<u32>,
    /// Unix milliseconds of the last state change
    pub last_update: u64,
    pub tx_state: TxState,
    #[serde(default)]
    pub inputs: Vec<TxIo>,
    #[serde(default)]
    pub outputs: Vec<TxIo>,
}

/// Which cursor flavour the history endpoint expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorKind {
    Date,
    #[default]
    Block,
}

/// Position just after an already-fetched history row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryCursor {
    /// Rows updated at or after `ts`. Within `ts` the server continues past
    /// `after_tx`; servers that ignore it repeat the run and the walk drops
    /// rows it has already seen.
    DateFrom { ts: u64, after_tx: String },
    After { block: String, tx: String },
}

impl HistoryCursor {
    /// Cursor pointing just after `tx`, which must be the last row of the
    /// most recent page.
    pub fn after_tx(kind: CursorKind, tx: &RemoteTransaction) -> Result<Self, LedgerError> {
        match kind {
            CursorKind::Date => Ok(HistoryCursor::DateFrom {
                ts: tx.last_update,
                after_tx: tx.hash.clone(),
            }),
            CursorKind::Block => {
                let block = tx.block_hash.clone().ok_or_else(|| {
                    LedgerError::Malformed(format!(
                        "history row {} has no block to continue from",
                        tx.hash
                    ))
                })?;
                Ok(HistoryCursor::After {
                    block,
                    tx: tx.hash.clone(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub addresses: Vec<String>,
    pub cursor: Option<HistoryCursor>,
}

impl HistoryRequest {
    fn to_json(&self) -> Value {
        let mut body = json!({ "addresses": self.addresses });
        match &self.cursor {
            Some(HistoryCursor::DateFrom { ts, after_tx }) => {
                body["dateFrom"] = json!(ts);
                body["afterTx"] = json!(after_tx);
            }
            Some(HistoryCursor::After { block, tx }) => {
                body["after"] = json!({ "block": block, "tx": tx });
            }
            None => {}
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResponse {
    #[serde(rename = "txId")]
    pub tx_id: String,
}

/// Remote ledger endpoints consumed by the wallet core
#[async_trait::async_trait]
pub trait LedgerApi: Send + Sync {
    /// Request bounds the server enforces
    fn limits(&self) -> ServerLimits;

    async fn utxos_for_addresses(&self, addresses: &[String]) -> Result<Vec<RemoteUtxo>, LedgerError>;

    async fn utxo_sum_for_addresses(&self, addresses: &[String]) -> Result<UtxoSumResponse, LedgerError>;

    /// One page of history; at most `limits().history_page_size` rows.
    async fn history_for_addresses(
        &self,
        request: &HistoryRequest,
    ) -> Result<Vec<RemoteTransaction>, LedgerError>;

    /// Subset of `addresses` that appear on-chain
    async fn filter_used_addresses(&self, addresses: &[String]) -> Result<Vec<String>, LedgerError>;

    /// Hex-encoded transaction bodies keyed by hash
    async fn tx_bodies_for_hashes(&self, hashes: &[String]) -> Result<HashMap<String, String>, LedgerError>;

    async fn broadcast_tx(&self, signed_tx: &[u8]) -> Result<BroadcastResponse, LedgerError>;
}

/// JSON-over-HTTP ledger client
pub struct HttpLedgerApi {
    base_url: String,
    timeout_secs: u64,
    limits: ServerLimits,
    client: reqwest::Client,
}

impl HttpLedgerApi {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            timeout_secs,
            limits: ServerLimits::default(),
            client,
        })
    }

    pub fn with_limits(mut self, limits: ServerLimits) -> Self {
        self.limits = limits;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn map_err(&self, e: reqwest::Error) -> LedgerError {
        if e.is_timeout() {
            LedgerError::Timeout(self.timeout_secs)
        } else if e.is_decode() {
            LedgerError::Malformed(e.to_string())
        } else {
            LedgerError::Http(e)
        }
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, LedgerError> {
        let url = self.url(path);
        tracing::debug!("🌐 POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Ledger API returned {} for {}", status, url);
            return Err(LedgerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response.json::<T>().await.map_err(|e| self.map_err(e))
    }
}

#[async_trait::async_trait]
impl LedgerApi for HttpLedgerApi {
    fn limits(&self) -> ServerLimits {
        self.limits
    }

    async fn utxos_for_addresses(&self, addresses: &[String]) -> Result<Vec<RemoteUtxo>, LedgerError> {
        check_request_size(addresses.len(), self.limits.addresses_per_request)?;
        self.post("api/txs/utxoForAddresses", &json!({ "addresses": addresses }))
            .await
    }

    async fn utxo_sum_for_addresses(&self, addresses: &[String]) -> Result<UtxoSumResponse, LedgerError> {
        check_request_size(addresses.len(), self.limits.addresses_per_request)?;
        self.post("api/txs/utxoSumForAddresses", &json!({ "addresses": addresses }))
            .await
    }

    async fn history_for_addresses(
        &self,
        request: &HistoryRequest,
    ) -> Result<Vec<RemoteTransaction>, LedgerError> {
        check_request_size(request.addresses.len(), self.limits.addresses_per_request)?;
        self.post("api/v2/txs/history", &request.to_json()).await
    }

    async fn filter_used_addresses(&self, addresses: &[String]) -> Result<Vec<String>, LedgerError> {
        check_request_size(addresses.len(), self.limits.addresses_per_request)?;
        self.post("api/v2/addresses/filterUsed", &json!({ "addresses": addresses }))
            .await
    }

    async fn tx_bodies_for_hashes(&self, hashes: &[String]) -> Result<HashMap<String, String>, LedgerError> {
        check_request_size(hashes.len(), self.limits.tx_hashes_per_request)?;
        self.post("api/txs/txBodies", &json!({ "txsHashes": hashes }))
            .await
    }

    async fn broadcast_tx(&self, signed_tx: &[u8]) -> Result<BroadcastResponse, LedgerError> {
        let body = json!({ "signedTx": hex::encode(signed_tx) });
        match self.post::<BroadcastResponse>("api/txs/signed", &body).await {
            Err(LedgerError::Status { status, body }) if (400..500).contains(&status) && is_witness_rejection(&body) => {
                Err(LedgerError::InvalidWitness(body))
            }
            other => other,
        }
    }
}

fn is_witness_rejection(body: &str) -> bool {
    let body = body.to_lowercase();
    body.contains("witness") || body.contains("signature")
}
