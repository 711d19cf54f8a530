//! Per-request method framework: registry dispatch, shared request
//! parameters, bundle normalization and the state machine that sequences
//! permissions, firmware checks and confirmations around device execution.

mod ethereum_get_address;
mod ethereum_get_public_key;
mod get_account_info;

pub use ethereum_get_address::EthereumGetAddress;
pub use ethereum_get_public_key::EthereumGetPublicKey;
pub use get_account_info::GetAccountInfo;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::BackendFactory;
use crate::device::{DeviceFeatures, DeviceQueueHandle};
use crate::error::{ConnectError, Result};
use crate::firmware::{check_compatibility, FirmwareRange};
use crate::params::{validate_params, Param, ParamType};
use crate::permissions::{Permission, PermissionStore};
use crate::ui::UiHandle;

/// Parameters shared by every request payload.
#[derive(Debug, Clone, Default)]
pub struct CommonParams {
    pub device_path: Option<String>,
    pub device_instance: u32,
    pub device_state: Option<String>,
    pub keep_session: bool,
    pub override_previous_call: bool,
    pub use_empty_passphrase: bool,
    pub allow_seedless_device: bool,
}

impl CommonParams {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        validate_params(
            payload,
            &[
                Param::optional("device", ParamType::Object),
                Param::optional("keepSession", ParamType::Boolean),
                Param::optional("override", ParamType::Boolean),
                Param::optional("useEmptyPassphrase", ParamType::Boolean),
                Param::optional("allowSeedlessDevice", ParamType::Boolean),
            ],
        )?;

        let device = payload.get("device");
        Ok(CommonParams {
            device_path: device
                .and_then(|d| d.get("path"))
                .and_then(Value::as_str)
                .map(str::to_string),
            device_instance: device
                .and_then(|d| d.get("instance"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            device_state: device
                .and_then(|d| d.get("state"))
                .and_then(Value::as_str)
                .map(str::to_string),
            keep_session: flag(payload, "keepSession"),
            override_previous_call: flag(payload, "override"),
            use_empty_passphrase: flag(payload, "useEmptyPassphrase"),
            allow_seedless_device: flag(payload, "allowSeedlessDevice"),
        })
    }
}

fn flag(payload: &Value, name: &str) -> bool {
    payload.get(name).and_then(Value::as_bool).unwrap_or(false)
}

/// Normalize a flat single-item payload into a one-element bundle. Responses
/// stay symmetric with the request: single in, single out.
pub fn normalize_bundle(payload: &Value) -> Result<(Vec<Value>, bool)> {
    match payload.get("bundle") {
        Some(_) => {
            validate_params(payload, &[Param::required("bundle", ParamType::Array)])?;
            let items = payload
                .get("bundle")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            Ok((items, true))
        }
        None => Ok((vec![payload.clone()], false)),
    }
}

/// Everything a method needs to talk to its collaborators. One context per
/// connected device session; origin is always explicit, never ambient.
#[derive(Clone)]
pub struct MethodContext {
    pub device: DeviceQueueHandle,
    pub features: DeviceFeatures,
    pub ui: Option<UiHandle>,
    pub permissions: PermissionStore,
    pub backends: Arc<dyn BackendFactory>,
    pub origin: String,
}

/// One privileged operation, constructed from a single request and single-use.
/// Parameter validation happens in the constructor, before any device or UI
/// interaction.
#[async_trait]
pub trait Method: Send {
    fn name(&self) -> &'static str;

    /// Human-readable operation label shown in confirmation surfaces.
    fn info(&self) -> String;

    fn common(&self) -> &CommonParams;

    fn required_permissions(&self) -> &[Permission];

    fn firmware_range(&self) -> &FirmwareRange;

    /// Method-specific human confirmation. Defaults to approved for methods
    /// whose guarantee is established elsewhere.
    async fn confirmation(&mut self, _ctx: &MethodContext) -> Result<bool> {
        Ok(true)
    }

    async fn run(&mut self, ctx: &MethodContext) -> Result<Value>;

    /// Release discovery sessions and listeners. Called on every terminal
    /// transition, successful or not.
    fn dispose(&mut self) {}
}

/// Closed operation-kind dispatch. Unknown names fail with `MethodNotFound`
/// without touching any collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    EthereumGetAddress,
    EthereumGetPublicKey,
    GetAccountInfo,
}

impl MethodKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "ethereumGetAddress" => Ok(MethodKind::EthereumGetAddress),
            "ethereumGetPublicKey" => Ok(MethodKind::EthereumGetPublicKey),
            "getAccountInfo" => Ok(MethodKind::GetAccountInfo),
            _ => Err(ConnectError::MethodNotFound(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MethodKind::EthereumGetAddress => "ethereumGetAddress",
            MethodKind::EthereumGetPublicKey => "ethereumGetPublicKey",
            MethodKind::GetAccountInfo => "getAccountInfo",
        }
    }
}

/// Total mapping from a request payload to a constructed method.
pub fn create_method(payload: &Value) -> Result<Box<dyn Method>> {
    let name = payload
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectError::invalid_parameter("method", "string"))?;

    match MethodKind::from_name(name)? {
        MethodKind::EthereumGetAddress => Ok(Box::new(EthereumGetAddress::new(payload)?)),
        MethodKind::EthereumGetPublicKey => Ok(Box::new(EthereumGetPublicKey::new(payload)?)),
        MethodKind::GetAccountInfo => Ok(Box::new(GetAccountInfo::new(payload)?)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodState {
    Created,
    PermissionPending,
    FirmwareCheckPending,
    Discovering,
    ConfirmationPending,
    Executing,
    Completed,
    Failed,
}

impl MethodState {
    fn as_str(&self) -> &'static str {
        match self {
            MethodState::Created => "created",
            MethodState::PermissionPending => "permission_pending",
            MethodState::FirmwareCheckPending => "firmware_check_pending",
            MethodState::Discovering => "discovering",
            MethodState::ConfirmationPending => "confirmation_pending",
            MethodState::Executing => "executing",
            MethodState::Completed => "completed",
            MethodState::Failed => "failed",
        }
    }
}

/// Drive one method through its state machine. `dispose` runs on every
/// terminal transition so discovery sessions and listeners never leak.
pub async fn execute_method(mut method: Box<dyn Method>, ctx: &MethodContext) -> Result<Value> {
    let name = method.name();
    let result = drive(method.as_mut(), ctx).await;
    method.dispose();

    match &result {
        Ok(_) => info!(method = name, "method completed"),
        Err(e) => warn!(method = name, kind = e.kind(), "method failed: {e}"),
    }
    result
}

fn transition(method: &str, state: MethodState) {
    debug!(method, state = state.as_str(), "method state");
}

async fn drive(method: &mut dyn Method, ctx: &MethodContext) -> Result<Value> {
    let name = method.name();

    // A seedless device can only serve methods that opted into it.
    if !ctx.features.initialized && !method.common().allow_seedless_device {
        transition(name, MethodState::Failed);
        return Err(ConnectError::Device("device not initialized".into()));
    }

    transition(name, MethodState::PermissionPending);
    let missing = ctx
        .permissions
        .check(method.required_permissions(), &ctx.origin, &ctx.features.device_id)
        .await;
    if !missing.is_empty() {
        let ui = ctx.ui.as_ref().ok_or(ConnectError::PermissionsNotGranted)?;
        let decision = ui
            .request_permission(missing.clone(), ctx.features.device_id.clone())
            .await?;
        if !decision.granted {
            transition(name, MethodState::Failed);
            return Err(ConnectError::PermissionsNotGranted);
        }
        let first_read_grant = ctx
            .permissions
            .save(&missing, &ctx.origin, &ctx.features.device_id, !decision.remember)
            .await;
        if first_read_grant {
            // One-time side effect: the origin only learns about the device
            // once it holds a read grant for it.
            ui.notify_device_connected(ctx.features.device_id.clone()).await?;
        }
    }

    transition(name, MethodState::FirmwareCheckPending);
    check_compatibility(method.firmware_range(), &ctx.features, ctx.ui.as_ref()).await?;

    transition(name, MethodState::ConfirmationPending);
    // The warning only applies to a device that actually holds keys.
    if ctx.features.no_backup && ctx.features.initialized {
        if let Some(ui) = ctx.ui.as_ref() {
            if !ui.request_confirmation("no-backup", None).await? {
                transition(name, MethodState::Failed);
                return Err(ConnectError::PermissionsNotGranted);
            }
        }
    }
    if !method.confirmation(ctx).await? {
        transition(name, MethodState::Failed);
        return Err(ConnectError::PermissionsNotGranted);
    }

    transition(name, MethodState::Executing);
    let result = method.run(ctx).await;
    transition(
        name,
        if result.is_ok() { MethodState::Completed } else { MethodState::Failed },
    );
    result
}

/// Create and execute in one step: the caller-facing entry point.
pub async fn call(ctx: &MethodContext, payload: &Value) -> Result<Value> {
    let method = create_method(payload)?;
    execute_method(method, ctx).await
}
