//! UI surface: the bidirectional message channel between the core and an
//! interactive confirmation surface. Every suspension point is an explicit
//! request carrying its own oneshot responder; the core never polls.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::account::AccountSummary;
use crate::error::{ConnectError, Result};
use crate::permissions::Permission;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PermissionDecision {
    pub granted: bool,
    pub remember: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectPhase {
    Start,
    Progress,
    Complete,
}

/// Requests sent to the UI surface. Interactive kinds carry a `respond_to`
/// channel; the others are fire-and-forget notifications.
#[derive(Debug)]
pub enum UiRequest {
    RequestPermission {
        permissions: Vec<Permission>,
        device_id: String,
        respond_to: oneshot::Sender<PermissionDecision>,
    },
    RequestConfirmation {
        view: &'static str,
        label: Option<String>,
        respond_to: oneshot::Sender<bool>,
    },
    SelectAccount {
        coin: &'static str,
        accounts: Vec<AccountSummary>,
        phase: SelectPhase,
        respond_to: Option<oneshot::Sender<usize>>,
    },
    BundleProgress {
        progress: usize,
        response: Value,
    },
    DeviceConnected {
        device_id: String,
    },
}

/// Wire-friendly projection of a [`UiRequest`]: the same payloads with the
/// responders dropped, for surfaces that forward requests over a wire and
/// route decisions back out-of-band.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    RequestPermission {
        permissions: Vec<Permission>,
        device_id: String,
    },
    RequestConfirmation {
        view: &'static str,
        label: Option<String>,
    },
    SelectAccount {
        coin: &'static str,
        accounts: Vec<AccountSummary>,
        phase: SelectPhase,
    },
    BundleProgress {
        progress: usize,
        response: Value,
    },
    DeviceConnected {
        device_id: String,
    },
}

impl From<&UiRequest> for UiEvent {
    fn from(request: &UiRequest) -> Self {
        match request {
            UiRequest::RequestPermission { permissions, device_id, .. } => {
                UiEvent::RequestPermission {
                    permissions: permissions.clone(),
                    device_id: device_id.clone(),
                }
            }
            UiRequest::RequestConfirmation { view, label, .. } => UiEvent::RequestConfirmation {
                view,
                label: label.clone(),
            },
            UiRequest::SelectAccount { coin, accounts, phase, .. } => UiEvent::SelectAccount {
                coin,
                accounts: accounts.clone(),
                phase: *phase,
            },
            UiRequest::BundleProgress { progress, response } => UiEvent::BundleProgress {
                progress: *progress,
                response: response.clone(),
            },
            UiRequest::DeviceConnected { device_id } => UiEvent::DeviceConnected {
                device_id: device_id.clone(),
            },
        }
    }
}

/// Typed sender half of the UI channel, held by the method executor.
#[derive(Clone, Debug)]
pub struct UiHandle {
    tx: mpsc::Sender<UiRequest>,
}

impl UiHandle {
    pub fn new(tx: mpsc::Sender<UiRequest>) -> Self {
        Self { tx }
    }

    /// Create a connected handle/receiver pair.
    pub fn channel(buffer: usize) -> (UiHandle, mpsc::Receiver<UiRequest>) {
        let (tx, rx) = mpsc::channel(buffer);
        (UiHandle::new(tx), rx)
    }

    async fn send(&self, request: UiRequest) -> Result<()> {
        self.tx.send(request).await.map_err(|_| ConnectError::UiClosed)
    }

    /// Suspend for a permission decision.
    pub async fn request_permission(
        &self,
        permissions: Vec<Permission>,
        device_id: String,
    ) -> Result<PermissionDecision> {
        let (tx, rx) = oneshot::channel();
        self.send(UiRequest::RequestPermission {
            permissions,
            device_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| ConnectError::UiClosed)
    }

    /// Suspend for a boolean confirmation of the given view.
    pub async fn request_confirmation(
        &self,
        view: &'static str,
        label: Option<String>,
    ) -> Result<bool> {
        debug!(view, "requesting confirmation");
        let (tx, rx) = oneshot::channel();
        self.send(UiRequest::RequestConfirmation {
            view,
            label,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| ConnectError::UiClosed)
    }

    /// Open the account selector and return the responder the caller awaits
    /// while pumping discovery updates into the same view.
    pub async fn open_account_selector(
        &self,
        coin: &'static str,
    ) -> Result<oneshot::Receiver<usize>> {
        let (tx, rx) = oneshot::channel();
        self.send(UiRequest::SelectAccount {
            coin,
            accounts: Vec::new(),
            phase: SelectPhase::Start,
            respond_to: Some(tx),
        })
        .await?;
        Ok(rx)
    }

    pub async fn update_account_selector(
        &self,
        coin: &'static str,
        accounts: Vec<AccountSummary>,
        phase: SelectPhase,
    ) -> Result<()> {
        self.send(UiRequest::SelectAccount {
            coin,
            accounts,
            phase,
            respond_to: None,
        })
        .await
    }

    pub async fn bundle_progress(&self, progress: usize, response: Value) -> Result<()> {
        self.send(UiRequest::BundleProgress { progress, response }).await
    }

    pub async fn notify_device_connected(&self, device_id: String) -> Result<()> {
        self.send(UiRequest::DeviceConnected { device_id }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirmation_round_trip() {
        let (ui, mut rx) = UiHandle::channel(4);
        let surface = tokio::spawn(async move {
            match rx.recv().await {
                Some(UiRequest::RequestConfirmation { view, respond_to, .. }) => {
                    assert_eq!(view, "export-address");
                    respond_to.send(true).unwrap();
                }
                other => panic!("unexpected request: {other:?}"),
            }
        });

        let approved = ui.request_confirmation("export-address", None).await.unwrap();
        assert!(approved);
        surface.await.unwrap();
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let (tx, _rx) = oneshot::channel();
        let request = UiRequest::RequestConfirmation {
            view: "export-xpub",
            label: Some("Export Ethereum public key".into()),
            respond_to: tx,
        };
        let value = serde_json::to_value(UiEvent::from(&request)).unwrap();
        assert_eq!(value["type"], "request_confirmation");
        assert_eq!(value["view"], "export-xpub");

        let event = UiEvent::from(&UiRequest::DeviceConnected { device_id: "dev1".into() });
        let value = serde_json::to_value(event).unwrap();
        assert_eq!(value["type"], "device_connected");
        assert_eq!(value["device_id"], "dev1");
    }

    #[tokio::test]
    async fn closed_channel_is_ui_closed() {
        let (ui, rx) = UiHandle::channel(1);
        drop(rx);
        let err = ui.request_confirmation("export-address", None).await.unwrap_err();
        assert_eq!(err.kind(), "ui_closed");
    }
}
