//! Gap-limit account discovery: derives and probes accounts outward from
//! index 0, strictly sequentially, until the first unused account or an
//! explicit target xpub is found. Runs as a spawned worker emitting snapshot
//! events over a channel; cancellation is a cooperative flag observed
//! between account-resolution steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountSummary};
use crate::backend::Backend;
use crate::coins::CoinInfo;
use crate::device::DeviceQueueHandle;
use crate::error::{ConnectError, Result};
use crate::paths::to_hardened;

const EVENT_CHANNEL_SIZE: usize = 32;
const BIP44_PURPOSE: u32 = 44;

#[derive(Debug)]
pub enum DiscoveryEvent {
    /// Partial account list after one account was fully resolved.
    Update(Vec<AccountSummary>),
    /// Halting condition reached; carries the final list.
    Complete(Vec<AccountSummary>),
    /// Device or backend failure; the scan is over.
    Failed(ConnectError),
}

pub struct DiscoveryOptions {
    pub coin: &'static CoinInfo,
    pub backend: Arc<dyn Backend>,
    pub device: DeviceQueueHandle,
    /// Attach the backend snapshot to each scanned account. Targeted scans
    /// leave this off and load the matched account's info explicitly.
    pub load_info: bool,
    /// Stop immediately when this xpub turns up mid-scan.
    pub target_xpub: Option<String>,
}

#[derive(Default)]
struct DiscoveryShared {
    accounts: Mutex<Vec<Account>>,
    stopped: AtomicBool,
    completed: AtomicBool,
}

/// One discovery session. Owned exclusively by the method that created it;
/// `start` may be called once per session.
pub struct Discovery {
    options: Option<DiscoveryOptions>,
    coin: &'static CoinInfo,
    backend: Arc<dyn Backend>,
    shared: Arc<DiscoveryShared>,
}

impl Discovery {
    pub fn new(options: DiscoveryOptions) -> Self {
        let coin = options.coin;
        let backend = Arc::clone(&options.backend);
        Discovery {
            options: Some(options),
            coin,
            backend,
            shared: Arc::new(DiscoveryShared::default()),
        }
    }

    /// Spawn the scan worker. Fails fast when the session already ran.
    pub fn start(&mut self) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let options = self
            .options
            .take()
            .ok_or(ConnectError::DiscoveryAlreadyRunning)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let shared = Arc::clone(&self.shared);
        info!(coin = self.coin.shortcut, "starting account discovery");
        tokio::spawn(scan(options, shared, event_tx));
        Ok(event_rx)
    }

    /// Cooperative cancellation: observed by the worker between steps, never
    /// interrupting an in-flight device or backend call.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }

    pub fn completed(&self) -> bool {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Short-circuit for callers that already found what they need.
    pub fn set_completed(&self, completed: bool) {
        self.shared.completed.store(completed, Ordering::SeqCst);
    }

    /// Snapshot of the accounts resolved so far.
    pub fn accounts(&self) -> Vec<Account> {
        self.shared
            .accounts
            .lock()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    pub fn account(&self, index: usize) -> Option<Account> {
        self.shared
            .accounts
            .lock()
            .ok()
            .and_then(|a| a.get(index).cloned())
    }

    /// Fetch and attach the backend snapshot for one account. Used by flows
    /// that scan with `load_info` off.
    pub async fn load_account_info(&self, account: &mut Account) -> Result<()> {
        let info = self.backend.get_account_info(&account.xpub).await?;
        account.attach_info(info);
        Ok(())
    }

    /// Stop the session and detach; already-applied effects stay in place.
    pub fn dispose(&self) {
        self.stop();
    }
}

fn account_path(coin: &CoinInfo, index: u32) -> Vec<u32> {
    vec![
        to_hardened(BIP44_PURPOSE),
        to_hardened(coin.slip44),
        to_hardened(index),
    ]
}

fn summaries(accounts: &[Account]) -> Vec<AccountSummary> {
    accounts.iter().map(Account::summary).collect()
}

async fn scan(
    options: DiscoveryOptions,
    shared: Arc<DiscoveryShared>,
    events: mpsc::Sender<DiscoveryEvent>,
) {
    let DiscoveryOptions {
        coin,
        backend,
        device,
        load_info,
        target_xpub,
    } = options;

    let stopped = || shared.stopped.load(Ordering::SeqCst);
    let mut resolved: Vec<Account> = Vec::new();

    for index in 0.. {
        if stopped() {
            debug!(index, "discovery stopped");
            return;
        }

        let path = account_path(coin, index);
        let node = match device.get_hd_node(path.clone(), coin).await {
            Ok(node) => node,
            Err(e) => {
                warn!(index, "discovery device call failed: {e}");
                if !stopped() {
                    let _ = events.send(DiscoveryEvent::Failed(e)).await;
                }
                return;
            }
        };
        let mut account = Account::new(path, node.xpub, coin);

        // Target match halts immediately, skipping the rest of the boundary
        // search; the matched account's info is loaded by the caller.
        let matched = target_xpub.as_deref() == Some(account.xpub.as_str());

        let mut empty = false;
        if !matched {
            if stopped() {
                return;
            }
            match backend.get_account_info(&account.xpub).await {
                Ok(info) => {
                    empty = info.transaction_count == 0;
                    if load_info {
                        account.attach_info(info);
                    } else {
                        account.loading_transaction_count = info.transaction_count;
                    }
                }
                Err(e) => {
                    warn!(index, "discovery backend call failed: {e}");
                    if !stopped() {
                        let _ = events.send(DiscoveryEvent::Failed(e)).await;
                    }
                    return;
                }
            }
        }

        resolved.push(account);
        if let Ok(mut accounts) = shared.accounts.lock() {
            *accounts = resolved.clone();
        }
        if stopped() {
            return;
        }
        let _ = events.send(DiscoveryEvent::Update(summaries(&resolved))).await;

        // The first unused account is the standard gap boundary; it stays in
        // the result as the final, freshly-empty account.
        if matched || empty {
            shared.completed.store(true, Ordering::SeqCst);
            info!(
                accounts = resolved.len(),
                matched, "discovery complete"
            );
            let _ = events
                .send(DiscoveryEvent::Complete(summaries(&resolved)))
                .await;
            return;
        }
    }
}
