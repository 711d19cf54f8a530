//! Device command surface: a typed handle over a per-device worker task that
//! serializes all device communication. The physical transport and wire-level
//! command serialization live behind the [`DeviceTransport`] trait.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

use crate::coins::CoinInfo;
use crate::error::{ConnectError, Result};
use crate::firmware::{FirmwareVersion, Generation};

const DEVICE_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
const QUEUE_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareStatus {
    /// No firmware installed at all.
    None,
    /// Installed but below the mandatory floor; an update is required.
    Required,
    Valid,
}

/// Snapshot of the connected device's identity and settings, as reported by
/// the device itself at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFeatures {
    pub device_id: String,
    pub label: Option<String>,
    /// Hardware/firmware generation, derived from the major version.
    pub major_version: u32,
    pub version: Option<FirmwareVersion>,
    pub firmware_status: FirmwareStatus,
    pub bootloader_mode: bool,
    pub initialized: bool,
    /// Keys were never backed up during setup.
    pub no_backup: bool,
    pub pin_protection: bool,
    pub passphrase_protection: bool,
}

impl DeviceFeatures {
    pub fn generation(&self) -> Generation {
        if self.major_version >= 2 {
            Generation::Gen2
        } else {
            Generation::Gen1
        }
    }
}

/// Extended public node for a derivation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HdNode {
    pub xpub: String,
    pub chain_code: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressResponse {
    pub address: String,
}

/// Wire-level transport to one physical device. Implementations serialize
/// commands onto USB/HID or a simulator; the worker guarantees calls are
/// strictly sequential per device.
#[async_trait]
pub trait DeviceTransport: Send {
    async fn get_features(&mut self) -> Result<DeviceFeatures>;
    async fn get_hd_node(&mut self, path: &[u32], coin: &CoinInfo) -> Result<HdNode>;
    async fn get_address(
        &mut self,
        path: &[u32],
        coin: &CoinInfo,
        show_on_device: bool,
    ) -> Result<AddressResponse>;
}

/// Commands processed by the device worker.
#[derive(Debug)]
pub enum DeviceCmd {
    GetFeatures {
        respond_to: oneshot::Sender<Result<DeviceFeatures>>,
        enqueued_at: Instant,
    },
    GetHdNode {
        path: Vec<u32>,
        coin: &'static CoinInfo,
        respond_to: oneshot::Sender<Result<HdNode>>,
        enqueued_at: Instant,
    },
    GetAddress {
        path: Vec<u32>,
        coin: &'static CoinInfo,
        show_on_device: bool,
        respond_to: oneshot::Sender<Result<AddressResponse>>,
        enqueued_at: Instant,
    },
    Shutdown {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

impl DeviceCmd {
    fn enqueued_at(&self) -> Instant {
        match self {
            DeviceCmd::GetFeatures { enqueued_at, .. } => *enqueued_at,
            DeviceCmd::GetHdNode { enqueued_at, .. } => *enqueued_at,
            DeviceCmd::GetAddress { enqueued_at, .. } => *enqueued_at,
            DeviceCmd::Shutdown { .. } => Instant::now(),
        }
    }

    fn operation_name(&self) -> &'static str {
        match self {
            DeviceCmd::GetFeatures { .. } => "get_features",
            DeviceCmd::GetHdNode { .. } => "get_hd_node",
            DeviceCmd::GetAddress { .. } => "get_address",
            DeviceCmd::Shutdown { .. } => "shutdown",
        }
    }
}

/// Rolling timing metrics for one device queue.
#[derive(Debug, Default, Clone)]
pub struct DeviceQueueMetrics {
    pub queue_wait_ms: Vec<u64>,
    pub device_rtt_ms: Vec<u64>,
    pub queue_depth: usize,
}

impl DeviceQueueMetrics {
    fn record_operation(&mut self, queue_wait: Duration, device_rtt: Duration) {
        self.queue_wait_ms.push(queue_wait.as_millis() as u64);
        self.device_rtt_ms.push(device_rtt.as_millis() as u64);

        // Keep only the last 100 measurements.
        if self.queue_wait_ms.len() > 100 {
            self.queue_wait_ms.remove(0);
            self.device_rtt_ms.remove(0);
        }
    }
}

/// Worker task that processes device commands strictly sequentially.
pub struct DeviceWorker {
    device_id: String,
    transport: Box<dyn DeviceTransport>,
    metrics: DeviceQueueMetrics,
    cmd_rx: mpsc::Receiver<DeviceCmd>,
}

impl DeviceWorker {
    fn new(
        device_id: String,
        transport: Box<dyn DeviceTransport>,
        cmd_rx: mpsc::Receiver<DeviceCmd>,
    ) -> Self {
        Self {
            device_id,
            transport,
            metrics: DeviceQueueMetrics::default(),
            cmd_rx,
        }
    }

    pub async fn run(mut self) {
        info!("DeviceWorker starting for device {}", self.device_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            let started = Instant::now();
            let queue_wait = started.duration_since(cmd.enqueued_at());
            self.metrics.queue_depth = self.cmd_rx.len();

            debug!(
                "processing {} command (queue wait: {:?})",
                cmd.operation_name(),
                queue_wait
            );

            let shutdown = self.process_command(cmd).await;
            self.metrics.record_operation(queue_wait, started.elapsed());

            if shutdown {
                break;
            }
        }

        info!("DeviceWorker shutting down for device {}", self.device_id);
    }

    /// Process a single command. Returns true on shutdown.
    async fn process_command(&mut self, cmd: DeviceCmd) -> bool {
        match cmd {
            DeviceCmd::GetFeatures { respond_to, .. } => {
                let result = self.transport.get_features().await;
                if let Err(ref e) = result {
                    error!("get_features failed: {}", e);
                }
                let _ = respond_to.send(result);
            }
            DeviceCmd::GetHdNode { path, coin, respond_to, .. } => {
                let result = self.transport.get_hd_node(&path, coin).await;
                if let Err(ref e) = result {
                    error!("get_hd_node failed: {}", e);
                }
                let _ = respond_to.send(result);
            }
            DeviceCmd::GetAddress { path, coin, show_on_device, respond_to, .. } => {
                let result = self.transport.get_address(&path, coin, show_on_device).await;
                if let Err(ref e) = result {
                    error!("get_address failed: {}", e);
                }
                let _ = respond_to.send(result);
            }
            DeviceCmd::Shutdown { respond_to } => {
                let _ = respond_to.send(Ok(()));
                return true;
            }
        }
        false
    }
}

/// Handle for communicating with a device worker. Cloneable; all clones feed
/// the same sequential queue.
#[derive(Clone, Debug)]
pub struct DeviceQueueHandle {
    device_id: String,
    cmd_tx: mpsc::Sender<DeviceCmd>,
}

impl DeviceQueueHandle {
    pub fn new(device_id: String, cmd_tx: mpsc::Sender<DeviceCmd>) -> Self {
        Self { device_id, cmd_tx }
    }

    async fn dispatch<T>(
        &self,
        cmd: DeviceCmd,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ConnectError::Device("device worker unavailable".into()))?;

        timeout(DEVICE_OPERATION_TIMEOUT, rx)
            .await
            .map_err(|_| ConnectError::Device("device operation timed out".into()))?
            .map_err(|_| ConnectError::Device("device worker channel closed".into()))?
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn get_features(&self) -> Result<DeviceFeatures> {
        let (tx, rx) = oneshot::channel();
        let cmd = DeviceCmd::GetFeatures {
            respond_to: tx,
            enqueued_at: Instant::now(),
        };
        self.dispatch(cmd, rx).await
    }

    #[instrument(level = "debug", skip(self, coin), fields(coin = coin.shortcut))]
    pub async fn get_hd_node(&self, path: Vec<u32>, coin: &'static CoinInfo) -> Result<HdNode> {
        let (tx, rx) = oneshot::channel();
        let cmd = DeviceCmd::GetHdNode {
            path,
            coin,
            respond_to: tx,
            enqueued_at: Instant::now(),
        };
        self.dispatch(cmd, rx).await
    }

    #[instrument(level = "debug", skip(self, coin), fields(coin = coin.shortcut))]
    pub async fn get_address(
        &self,
        path: Vec<u32>,
        coin: &'static CoinInfo,
        show_on_device: bool,
    ) -> Result<AddressResponse> {
        let (tx, rx) = oneshot::channel();
        let cmd = DeviceCmd::GetAddress {
            path,
            coin,
            show_on_device,
            respond_to: tx,
            enqueued_at: Instant::now(),
        };
        self.dispatch(cmd, rx).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(DeviceCmd::Shutdown { respond_to: tx })
            .await
            .map_err(|_| ConnectError::Device("device worker unavailable".into()))?;

        timeout(Duration::from_secs(5), rx)
            .await
            .map_err(|_| ConnectError::Device("shutdown timed out".into()))?
            .map_err(|_| ConnectError::Device("device worker channel closed".into()))?
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Factory for spawning device workers and handles.
pub struct DeviceQueueFactory;

impl DeviceQueueFactory {
    pub fn spawn_worker(device_id: String, transport: Box<dyn DeviceTransport>) -> DeviceQueueHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_CHANNEL_SIZE);
        let worker = DeviceWorker::new(device_id.clone(), transport, cmd_rx);
        tokio::spawn(worker.run());
        DeviceQueueHandle::new(device_id, cmd_tx)
    }
}
