//! HD addressing metadata and UTXO lookup utilities
//!
//! Every address the wallet controls carries an [`Addressing`] recording the
//! BIP44-style derivation path that produced it. Spending requires that
//! metadata, so the builder cross-references every selected UTXO back to its
//! owner's addressing through an [`AddressingMap`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WalletError};
use crate::ledger::RemoteTransaction;

/// First hardened child index
pub const HARDENED: u32 = 0x8000_0000;

/// Depth of each component in a `m / purpose' / coin_type' / account' / chain / index` path
pub mod levels {
    pub const ROOT: u32 = 0;
    pub const PURPOSE: u32 = 1;
    pub const COIN_TYPE: u32 = 2;
    pub const ACCOUNT: u32 = 3;
    pub const CHAIN: u32 = 4;
    pub const ADDRESS: u32 = 5;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressingError {
    #[error("Derivation index {0} is out of range (must be below 2^31)")]
    IndexOutOfRange(u32),

    #[error("Invalid chain {0} (expected 0 external or 1 internal)")]
    InvalidChain(u32),

    #[error("Invalid addressing path {path:?} starting at level {start_level}: {reason}")]
    InvalidPath {
        path: Vec<u32>,
        start_level: u32,
        reason: &'static str,
    },
}

/// External (receive) or internal (change) chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    External,
    Internal,
}

impl Chain {
    pub fn index(&self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    pub fn from_index(index: u32) -> std::result::Result<Self, AddressingError> {
        match index {
            0 => Ok(Chain::External),
            1 => Ok(Chain::Internal),
            other => Err(AddressingError::InvalidChain(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::External => "external",
            Chain::Internal => "internal",
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn check_index(index: u32) -> std::result::Result<u32, AddressingError> {
    if index >= HARDENED {
        return Err(AddressingError::IndexOutOfRange(index));
    }
    Ok(index)
}

/// Account-level prefix `purpose' / coin_type' / account'` (stored unhardened)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountPath {
    purpose: u32,
    coin_type: u32,
    account: u32,
}

impl AccountPath {
    pub fn new(purpose: u32, coin_type: u32, account: u32) -> std::result::Result<Self, AddressingError> {
        Ok(Self {
            purpose: check_index(purpose)?,
            coin_type: check_index(coin_type)?,
            account: check_index(account)?,
        })
    }

    /// `m/84'/coin_type'/account'`
    pub fn bip84(coin_type: u32, account: u32) -> std::result::Result<Self, AddressingError> {
        Self::new(84, coin_type, account)
    }

    pub fn purpose(&self) -> u32 {
        self.purpose
    }

    pub fn coin_type(&self) -> u32 {
        self.coin_type
    }

    pub fn account(&self) -> u32 {
        self.account
    }

    /// Hardened path components from the purpose level down to the account level
    pub fn path(&self) -> [u32; 3] {
        [
            self.purpose | HARDENED,
            self.coin_type | HARDENED,
            self.account | HARDENED,
        ]
    }
}

/// Immutable derivation metadata for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addressing {
    account: AccountPath,
    chain: Chain,
    index: u32,
}

impl Addressing {
    pub fn new(account: AccountPath, chain: Chain, index: u32) -> std::result::Result<Self, AddressingError> {
        Ok(Self {
            account,
            chain,
            index: check_index(index)?,
        })
    }

    /// Rebuild addressing from a raw path as stored by the host cache.
    ///
    /// The path must start at the purpose level and end at the address level.
    pub fn from_path(path: &[u32], start_level: u32) -> std::result::Result<Self, AddressingError> {
        let invalid = |reason| AddressingError::InvalidPath {
            path: path.to_vec(),
            start_level,
            reason,
        };
        if start_level != levels::PURPOSE {
            return Err(invalid("path must start at the purpose level"));
        }
        if path.len() as u32 != levels::ADDRESS - levels::PURPOSE + 1 {
            return Err(invalid("path must end at the address level"));
        }
        if path[..3].iter().any(|c| c & HARDENED == 0) {
            return Err(invalid("account components must be hardened"));
        }
        let account = AccountPath::new(
            path[0] & !HARDENED,
            path[1] & !HARDENED,
            path[2] & !HARDENED,
        )?;
        Self::new(account, Chain::from_index(path[3])?, path[4])
    }

    pub fn account(&self) -> &AccountPath {
        &self.account
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Full path, first component at [`Addressing::start_level`]
    pub fn path(&self) -> Vec<u32> {
        let mut path = self.account.path().to_vec();
        path.push(self.chain.index());
        path.push(self.index);
        path
    }

    pub fn start_level(&self) -> u32 {
        levels::PURPOSE
    }

    /// Level of the last path component
    pub fn leaf_level(&self) -> u32 {
        self.start_level() + self.path().len() as u32 - 1
    }
}

/// An address together with the derivation that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressInfo {
    pub address: String,
    pub addressing: Addressing,
}

/// One entry of a discovery run: `{address, isUsed, index}` plus addressing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub info: AddressInfo,
    pub is_used: bool,
}

impl AddressRecord {
    pub fn index(&self) -> u32 {
        self.info.addressing.index()
    }

    pub fn address(&self) -> &str {
        &self.info.address
    }
}

/// Set `is_used` on every record referenced by a transaction input or output.
///
/// Flags are only ever raised, never cleared. Returns how many were raised.
pub fn mark_used(records: &mut [AddressRecord], history: &[RemoteTransaction]) -> usize {
    let seen: HashSet<&str> = history
        .iter()
        .flat_map(|tx| tx.inputs.iter().chain(tx.outputs.iter()))
        .map(|io| io.address.as_str())
        .collect();

    let mut raised = 0;
    for record in records.iter_mut().filter(|r| !r.is_used) {
        if seen.contains(record.info.address.as_str()) {
            record.is_used = true;
            raised += 1;
        }
    }
    raised
}

/// `(txHash, outputIndex)` identity of an output
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoPointer {
    pub tx_hash: String,
    pub output_index: u32,
}

/// An unspent output as reported by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub tx_hash: String,
    pub output_index: u32,
    pub receiver: String,
    pub amount: u64,
}

impl Utxo {
    pub fn pointer(&self) -> UtxoPointer {
        UtxoPointer {
            tx_hash: self.tx_hash.clone(),
            output_index: self.output_index,
        }
    }
}

/// A UTXO enriched with its owner's addressing, as required for signing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressedUtxo {
    pub utxo: Utxo,
    pub addressing: Addressing,
}

impl AddressedUtxo {
    pub fn amount(&self) -> u64 {
        self.utxo.amount
    }
}

/// UTXOs indexed by `(txHash, outputIndex)`, insertion order preserved
#[derive(Debug, Clone, Default)]
pub struct UtxoLookup {
    by_pointer: HashMap<UtxoPointer, usize>,
    utxos: Vec<Utxo>,
}

impl UtxoLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an output with the same pointer is already present.
    /// Returns false for duplicates; the first-seen instance wins.
    pub fn insert(&mut self, utxo: Utxo) -> bool {
        let pointer = utxo.pointer();
        if self.by_pointer.contains_key(&pointer) {
            return false;
        }
        self.by_pointer.insert(pointer, self.utxos.len());
        self.utxos.push(utxo);
        true
    }

    pub fn get(&self, pointer: &UtxoPointer) -> Option<&Utxo> {
        self.by_pointer.get(pointer).map(|&i| &self.utxos[i])
    }

    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

impl FromIterator<Utxo> for UtxoLookup {
    fn from_iter<I: IntoIterator<Item = Utxo>>(iter: I) -> Self {
        let mut lookup = UtxoLookup::new();
        for utxo in iter {
            lookup.insert(utxo);
        }
        lookup
    }
}

/// Address → addressing map for a candidate address set
#[derive(Debug, Clone, Default)]
pub struct AddressingMap {
    map: HashMap<String, Addressing>,
}

impl AddressingMap {
    pub fn from_infos<'a, I>(infos: I) -> Self
    where
        I: IntoIterator<Item = &'a AddressInfo>,
    {
        let map = infos
            .into_iter()
            .map(|info| (info.address.clone(), info.addressing))
            .collect();
        Self { map }
    }

    pub fn get(&self, address: &str) -> Option<&Addressing> {
        self.map.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.map.contains_key(address)
    }

    /// Attach addressing to a UTXO. A miss is an invariant violation: callers
    /// only pass UTXOs already filtered to the candidate set.
    pub fn addressed(&self, utxo: &Utxo) -> Result<AddressedUtxo> {
        let addressing = self.get(&utxo.receiver).ok_or_else(|| {
            WalletError::invariant(format!(
                "no addressing for {} (output {}:{})",
                utxo.receiver, utxo.tx_hash, utxo.output_index
            ))
        })?;
        Ok(AddressedUtxo {
            utxo: utxo.clone(),
            addressing: *addressing,
        })
    }
}
