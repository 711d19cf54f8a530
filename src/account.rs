//! Snapshot of one derivation-path account. Queries over `info` return
//! degraded defaults until discovery attaches the on-chain snapshot; after
//! that, `info` is the sole source of truth and is never mutated again.

use serde::Serialize;
use serde_json::Value;

use crate::backend::{AccountInfo, Utxo};
use crate::coins::CoinInfo;
use crate::paths::{account_index, serialize_path};

/// Sentinel returned for address queries before `info` is populated.
pub const UNKNOWN_ADDRESS: &str = "unknown";

#[derive(Debug, Clone)]
pub struct Account {
    /// Non-hardened index component of `path`, fixed at construction.
    pub id: u32,
    pub path: Vec<u32>,
    pub xpub: String,
    pub coin: &'static CoinInfo,
    info: Option<AccountInfo>,
    /// Provisional transaction count shown while `info` is still loading.
    pub loading_transaction_count: usize,
}

/// Caller-facing projection of an account, sent to the UI account selector.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub id: u32,
    pub path: Vec<u32>,
    pub serialized_path: String,
    pub coin: &'static str,
    pub xpub: String,
    pub label: String,
    /// `-1` when the balance is not known yet.
    pub balance: i64,
    pub transactions: usize,
}

impl Account {
    pub fn new(path: Vec<u32>, xpub: String, coin: &'static CoinInfo) -> Self {
        Account {
            id: account_index(&path),
            path,
            xpub,
            coin,
            info: None,
            loading_transaction_count: 0,
        }
    }

    /// The single mutation of an account's lifecycle, applied by discovery.
    pub fn attach_info(&mut self, info: AccountInfo) {
        self.info = Some(info);
    }

    pub fn info(&self) -> Option<&AccountInfo> {
        self.info.as_ref()
    }

    pub fn is_used(&self) -> bool {
        self.info
            .as_ref()
            .map(|i| i.transaction_count > 0)
            .unwrap_or(false)
    }

    pub fn next_address(&self) -> &str {
        self.info
            .as_ref()
            .and_then(|i| i.unused_addresses.first())
            .map(String::as_str)
            .unwrap_or(UNKNOWN_ADDRESS)
    }

    /// Ordinal index of the next unused address, `-1` when unknown.
    pub fn next_address_index(&self) -> i64 {
        self.info
            .as_ref()
            .map(|i| i.used_addresses.len() as i64)
            .unwrap_or(-1)
    }

    pub fn used_addresses(&self) -> &[String] {
        self.info.as_ref().map(|i| i.used_addresses.as_slice()).unwrap_or(&[])
    }

    pub fn unused_addresses(&self) -> &[String] {
        self.info.as_ref().map(|i| i.unused_addresses.as_slice()).unwrap_or(&[])
    }

    pub fn change_index(&self) -> usize {
        self.info.as_ref().map(|i| i.change_index).unwrap_or(0)
    }

    pub fn next_change_address(&self) -> &str {
        self.info
            .as_ref()
            .and_then(|i| i.change_addresses.get(i.change_index))
            .map(String::as_str)
            .unwrap_or(UNKNOWN_ADDRESS)
    }

    pub fn balance(&self) -> u64 {
        self.info.as_ref().map(|i| i.balance).unwrap_or(0)
    }

    /// No separate unconfirmed tracking at this layer.
    pub fn confirmed_balance(&self) -> u64 {
        self.balance()
    }

    pub fn utxos(&self) -> &[Utxo] {
        self.info.as_ref().map(|i| i.utxos.as_slice()).unwrap_or(&[])
    }

    pub fn transaction_count(&self) -> usize {
        self.info
            .as_ref()
            .map(|i| i.transaction_count)
            .unwrap_or(self.loading_transaction_count)
    }

    /// Derivation path of an external address, found by a linear scan over
    /// used then unused addresses. Falls back to the account's own path when
    /// the address is unknown or `info` is absent.
    pub fn address_path(&self, address: &str) -> Vec<u32> {
        let Some(info) = self.info.as_ref() else {
            return self.path.clone();
        };
        let position = info
            .used_addresses
            .iter()
            .chain(info.unused_addresses.iter())
            .position(|a| a == address);
        match position {
            Some(index) => {
                let mut path = self.path.clone();
                path.push(0);
                path.push(index as u32);
                path
            }
            None => self.path.clone(),
        }
    }

    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            id: self.id,
            path: self.path.clone(),
            serialized_path: serialize_path(&self.path),
            coin: self.coin.shortcut,
            xpub: self.xpub.clone(),
            label: format!("Account #{}", self.id + 1),
            balance: self.info.as_ref().map(|i| i.balance as i64).unwrap_or(-1),
            transactions: self.transaction_count(),
        }
    }

    /// Full caller-facing response payload for account-info operations.
    pub fn to_response(&self) -> Value {
        let next_address = self.next_address().to_string();
        let address_path = self.address_path(&next_address);
        serde_json::json!({
            "id": self.id,
            "path": self.path,
            "serializedPath": serialize_path(&self.path),
            "address": next_address,
            "addressIndex": self.next_address_index(),
            "addressPath": address_path,
            "addressSerializedPath": serialize_path(&address_path),
            "xpub": self.xpub,
            "balance": self.balance(),
            "confirmed": self.confirmed_balance(),
            "transactions": self.transaction_count(),
            "utxo": self.utxos(),
            "usedAddresses": self.used_addresses(),
            "unusedAddresses": self.unused_addresses(),
        })
    }
}
