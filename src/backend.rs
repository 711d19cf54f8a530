//! Blockchain-indexing backend surface. The wire format and client mechanics
//! are external; the core only needs "account info for xpub" lookups.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::coins::CoinInfo;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
}

/// On-chain snapshot of one account, as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub used_addresses: Vec<String>,
    pub unused_addresses: Vec<String>,
    pub change_addresses: Vec<String>,
    pub change_index: usize,
    pub balance: u64,
    pub transaction_count: usize,
    pub utxos: Vec<Utxo>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_account_info(&self, xpub: &str) -> Result<AccountInfo>;
}

#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create_backend(&self, coin: &CoinInfo) -> Result<Arc<dyn Backend>>;
}
