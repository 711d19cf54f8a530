//! End-to-end method flows against stub device, backend and UI surfaces.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio_test::assert_ok;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use keepkey_connect::backend::{AccountInfo, Backend, BackendFactory};
use keepkey_connect::coins::CoinInfo;
use keepkey_connect::device::{
    AddressResponse, DeviceFeatures, DeviceQueueFactory, DeviceTransport, FirmwareStatus, HdNode,
};
use keepkey_connect::firmware::{
    check_compatibility, FirmwareRange, FirmwareVersion, GenerationRange,
};
use keepkey_connect::paths::{account_index, from_hardened};
use keepkey_connect::permissions::{Permission, PermissionStore};
use keepkey_connect::storage::MemoryStorage;
use keepkey_connect::ui::{PermissionDecision, SelectPhase, UiHandle, UiRequest};
use keepkey_connect::{call, ConnectError, MethodContext, Result};

const ORIGIN: &str = "https://wallet.example.org";
const DEVICE_ID: &str = "device-1";

// ---- stubs -----------------------------------------------------------------

struct RecordingTransport {
    calls: Arc<Mutex<Vec<String>>>,
}

fn derived_address(path: &[u32]) -> String {
    format!("0xAbCdEf{:04}", from_hardened(*path.last().unwrap_or(&0)))
}

#[async_trait]
impl DeviceTransport for RecordingTransport {
    async fn get_features(&mut self) -> Result<DeviceFeatures> {
        Ok(valid_features())
    }

    async fn get_hd_node(&mut self, path: &[u32], _coin: &CoinInfo) -> Result<HdNode> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("hdnode:{}", account_index(path)));
        Ok(HdNode {
            xpub: format!("xpub-{}", account_index(path)),
            chain_code: "chain-code".into(),
            public_key: "public-key".into(),
        })
    }

    async fn get_address(
        &mut self,
        path: &[u32],
        _coin: &CoinInfo,
        show_on_device: bool,
    ) -> Result<AddressResponse> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("address:{}:{}", from_hardened(*path.last().unwrap()), show_on_device));
        Ok(AddressResponse { address: derived_address(path) })
    }
}

/// Backend with five transactions for accounts 0..=2 and none afterwards.
struct StubBackend;

#[async_trait]
impl Backend for StubBackend {
    async fn get_account_info(&self, xpub: &str) -> Result<AccountInfo> {
        let index: usize = xpub.trim_start_matches("xpub-").parse().unwrap();
        Ok(AccountInfo {
            used_addresses: vec![format!("1used-{index}")],
            unused_addresses: vec![format!("1fresh-{index}")],
            transaction_count: if index <= 2 { 5 } else { 0 },
            balance: if index <= 2 { 1000 } else { 0 },
            ..AccountInfo::default()
        })
    }
}

struct StubBackendFactory;

#[async_trait]
impl BackendFactory for StubBackendFactory {
    async fn create_backend(&self, _coin: &CoinInfo) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(StubBackend))
    }
}

#[derive(Clone, Copy)]
struct UiScript {
    grant: bool,
    remember: bool,
    confirm: bool,
    select_index: Option<usize>,
}

impl Default for UiScript {
    fn default() -> Self {
        UiScript { grant: true, remember: true, confirm: true, select_index: None }
    }
}

/// Scripted UI surface: answers every request per the script and returns the
/// ordered request log once the channel closes.
fn spawn_ui(script: UiScript) -> (UiHandle, JoinHandle<Vec<String>>) {
    let (ui, rx) = UiHandle::channel(32);
    let task = tokio::spawn(ui_task(rx, script));
    (ui, task)
}

async fn ui_task(mut rx: mpsc::Receiver<UiRequest>, script: UiScript) -> Vec<String> {
    let mut log = Vec::new();
    let mut selector: Option<oneshot::Sender<usize>> = None;
    while let Some(request) = rx.recv().await {
        match request {
            UiRequest::RequestPermission { permissions, respond_to, .. } => {
                let names: Vec<_> = permissions.iter().map(Permission::as_str).collect();
                log.push(format!("permission:{}", names.join("+")));
                let _ = respond_to.send(PermissionDecision {
                    granted: script.grant,
                    remember: script.remember,
                });
            }
            UiRequest::RequestConfirmation { view, respond_to, .. } => {
                log.push(format!("confirm:{view}"));
                let _ = respond_to.send(script.confirm);
            }
            UiRequest::SelectAccount { phase, accounts, respond_to, .. } => {
                log.push(format!("select:{phase:?}:{}", accounts.len()));
                if let Some(tx) = respond_to {
                    selector = Some(tx);
                }
                if phase == SelectPhase::Complete {
                    if let (Some(tx), Some(index)) = (selector.take(), script.select_index) {
                        let _ = tx.send(index);
                    }
                }
            }
            UiRequest::BundleProgress { progress, .. } => {
                log.push(format!("progress:{progress}"));
            }
            UiRequest::DeviceConnected { .. } => log.push("device_connected".into()),
        }
    }
    log
}

fn valid_features() -> DeviceFeatures {
    DeviceFeatures {
        device_id: DEVICE_ID.into(),
        label: Some("Test KeepKey".into()),
        major_version: 1,
        version: Some(FirmwareVersion::new(1, 9, 0)),
        firmware_status: FirmwareStatus::Valid,
        bootloader_mode: false,
        initialized: true,
        no_backup: false,
        pin_protection: true,
        passphrase_protection: false,
    }
}

struct TestBed {
    ctx: MethodContext,
    ui_log: JoinHandle<Vec<String>>,
    calls: Arc<Mutex<Vec<String>>>,
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn testbed(script: UiScript, features: DeviceFeatures) -> TestBed {
    init_tracing();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let device = DeviceQueueFactory::spawn_worker(
        DEVICE_ID.into(),
        Box::new(RecordingTransport { calls: Arc::clone(&calls) }),
    );
    let (ui, ui_log) = spawn_ui(script);
    let ctx = MethodContext {
        device,
        features,
        ui: Some(ui),
        permissions: PermissionStore::new(Arc::new(MemoryStorage::new())),
        backends: Arc::new(StubBackendFactory),
        origin: ORIGIN.into(),
    };
    TestBed { ctx, ui_log, calls }
}

async fn grant_read(ctx: &MethodContext) {
    ctx.permissions
        .save(&[Permission::Read], ORIGIN, DEVICE_ID, false)
        .await;
}

fn address_calls(calls: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.starts_with("address:"))
        .cloned()
        .collect()
}

// ---- construction ----------------------------------------------------------

#[tokio::test]
async fn malformed_request_fails_without_side_effects() {
    let bed = testbed(UiScript::default(), valid_features());
    // Missing obligatory path.
    let err = call(&bed.ctx, &json!({ "method": "ethereumGetAddress" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_parameter");

    drop(bed.ctx);
    assert!(bed.ui_log.await.unwrap().is_empty(), "UI was touched");
    assert!(bed.calls.lock().unwrap().is_empty(), "device was touched");
}

// ---- permissions -----------------------------------------------------------

#[tokio::test]
async fn first_grant_notifies_device_connected_once() {
    let bed = testbed(UiScript::default(), valid_features());
    let payload = json!({ "method": "ethereumGetPublicKey", "path": "m/44'/60'/0'" });

    assert_ok!(call(&bed.ctx, &payload).await);
    // Second call: the remembered grant short-circuits the permission flow.
    assert_ok!(call(&bed.ctx, &payload).await);

    drop(bed.ctx);
    let log = bed.ui_log.await.unwrap();
    let permissions = log.iter().filter(|l| l.starts_with("permission:")).count();
    let connected = log.iter().filter(|l| *l == "device_connected").count();
    assert_eq!(permissions, 1);
    assert_eq!(connected, 1);
    assert_eq!(log[0], "permission:read");
    assert_eq!(log[1], "device_connected");
}

#[tokio::test]
async fn permission_decline_is_terminal() {
    let bed = testbed(UiScript { grant: false, ..UiScript::default() }, valid_features());
    let err = call(&bed.ctx, &json!({ "method": "ethereumGetPublicKey", "path": "m/44'/60'/0'" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "permissions_not_granted");
    assert!(bed.calls.lock().unwrap().is_empty(), "device was touched after decline");
}

// ---- firmware --------------------------------------------------------------

#[tokio::test]
async fn old_firmware_is_rejected_before_confirmation() {
    let mut features = valid_features();
    features.version = Some(FirmwareVersion::new(1, 5, 0));
    let bed = testbed(UiScript::default(), features);
    grant_read(&bed.ctx).await;

    let err = call(&bed.ctx, &json!({ "method": "ethereumGetAddress", "path": "m/44'/60'/0'/0/0" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "firmware_old");

    drop(bed.ctx);
    assert!(bed.ui_log.await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_firmware_is_distinct_from_old() {
    let mut features = valid_features();
    features.version = None;
    features.firmware_status = FirmwareStatus::None;
    let bed = testbed(UiScript::default(), features);
    grant_read(&bed.ctx).await;

    let err = call(&bed.ctx, &json!({ "method": "ethereumGetPublicKey", "path": "m/44'/60'/0'" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "firmware_not_installed");
}

fn capped_range() -> FirmwareRange {
    FirmwareRange {
        gen1: GenerationRange {
            min: Some(FirmwareVersion::new(1, 0, 0)),
            max: Some(FirmwareVersion::new(1, 8, 0)),
        },
        gen2: GenerationRange {
            min: Some(FirmwareVersion::new(2, 0, 0)),
            max: None,
        },
    }
}

#[tokio::test]
async fn firmware_above_max_suspends_for_override() {
    // Approved override proceeds.
    let (ui, log) = spawn_ui(UiScript::default());
    check_compatibility(&capped_range(), &valid_features(), Some(&ui))
        .await
        .unwrap();
    drop(ui);
    assert_eq!(log.await.unwrap(), vec!["confirm:firmware-not-compatible"]);

    // Declined override is a fatal permission error.
    let (ui, _log) = spawn_ui(UiScript { confirm: false, ..UiScript::default() });
    let err = check_compatibility(&capped_range(), &valid_features(), Some(&ui))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "permissions_not_granted");

    // Without an interactive surface there is nothing to ask.
    let err = check_compatibility(&capped_range(), &valid_features(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "firmware_not_compatible");
}

// ---- seedless gate ---------------------------------------------------------

#[tokio::test]
async fn seedless_device_requires_opt_in() {
    let mut features = valid_features();
    features.initialized = false;
    let bed = testbed(UiScript::default(), features.clone());
    grant_read(&bed.ctx).await;

    let err = call(&bed.ctx, &json!({ "method": "ethereumGetPublicKey", "path": "m/44'/60'/0'" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "device");

    let ok = call(
        &bed.ctx,
        &json!({
            "method": "ethereumGetPublicKey",
            "path": "m/44'/60'/0'",
            "allowSeedlessDevice": true,
        }),
    )
    .await;
    assert_ok!(ok);
}

// ---- no-backup warning -----------------------------------------------------

#[tokio::test]
async fn no_backup_warning_precedes_method_confirmation() {
    let mut features = valid_features();
    features.no_backup = true;
    let bed = testbed(UiScript::default(), features);
    grant_read(&bed.ctx).await;

    assert_ok!(
        call(&bed.ctx, &json!({ "method": "ethereumGetPublicKey", "path": "m/44'/60'/0'" })).await
    );

    drop(bed.ctx);
    let log = bed.ui_log.await.unwrap();
    assert_eq!(log, vec!["confirm:no-backup", "confirm:export-xpub"]);
}

#[tokio::test]
async fn uninitialized_device_skips_no_backup_warning() {
    let mut features = valid_features();
    features.initialized = false;
    features.no_backup = true;
    let bed = testbed(UiScript::default(), features);
    grant_read(&bed.ctx).await;

    assert_ok!(
        call(
            &bed.ctx,
            &json!({
                "method": "ethereumGetPublicKey",
                "path": "m/44'/60'/0'",
                "allowSeedlessDevice": true,
            }),
        )
        .await
    );

    drop(bed.ctx);
    // No keys on the device yet, so there is nothing to warn about.
    let log = bed.ui_log.await.unwrap();
    assert_eq!(log, vec!["confirm:export-xpub"]);
}

// ---- address export --------------------------------------------------------

#[tokio::test]
async fn case_insensitive_address_match_proceeds() {
    let bed = testbed(UiScript::default(), valid_features());
    grant_read(&bed.ctx).await;

    let response = call(
        &bed.ctx,
        &json!({
            "method": "ethereumGetAddress",
            "path": "m/44'/60'/0'/0/5",
            "address": "0XABCDEF0005",
        }),
    )
    .await
    .unwrap();

    assert_eq!(response["address"], "0xAbCdEf0005");
    assert_eq!(response["serializedPath"], "m/44'/60'/0'/0/5");
    // Silent derivation first, then the on-device display call.
    assert_eq!(
        address_calls(&bed.calls),
        vec!["address:5:false", "address:5:true"]
    );
}

#[tokio::test]
async fn address_mismatch_is_fatal_with_no_further_device_calls() {
    let bed = testbed(UiScript::default(), valid_features());
    grant_read(&bed.ctx).await;

    let err = call(
        &bed.ctx,
        &json!({
            "method": "ethereumGetAddress",
            "path": "m/44'/60'/0'/0/5",
            "address": "0xDeadBeef0005",
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), "address_mismatch");
    assert_eq!(address_calls(&bed.calls), vec!["address:5:false"]);
}

// ---- bundles ---------------------------------------------------------------

#[tokio::test]
async fn three_item_bundle_emits_three_progress_events_in_order() {
    let bed = testbed(UiScript::default(), valid_features());
    grant_read(&bed.ctx).await;

    let response = call(
        &bed.ctx,
        &json!({
            "method": "ethereumGetAddress",
            "bundle": [
                { "path": "m/44'/60'/0'/0/0", "showOnDevice": false },
                { "path": "m/44'/60'/0'/0/1", "showOnDevice": false },
                { "path": "m/44'/60'/0'/0/2", "showOnDevice": false },
            ],
        }),
    )
    .await
    .unwrap();

    let items = response.as_array().expect("bundle in, sequence out");
    assert_eq!(items.len(), 3);
    assert_eq!(items[1]["address"], "0xAbCdEf0001");

    drop(bed.ctx);
    let log = bed.ui_log.await.unwrap();
    let progress: Vec<_> = log.iter().filter(|l| l.starts_with("progress:")).collect();
    assert_eq!(progress, vec!["progress:0", "progress:1", "progress:2"]);
}

#[tokio::test]
async fn single_item_returns_unwrapped_object_without_progress() {
    let bed = testbed(UiScript::default(), valid_features());
    grant_read(&bed.ctx).await;

    let response = call(
        &bed.ctx,
        &json!({ "method": "ethereumGetAddress", "path": "m/44'/60'/0'/0/0", "showOnDevice": false }),
    )
    .await
    .unwrap();
    assert!(response.is_object());

    drop(bed.ctx);
    let log = bed.ui_log.await.unwrap();
    assert!(log.iter().all(|l| !l.starts_with("progress:")));
}

#[tokio::test]
async fn device_failure_mid_bundle_aborts_remaining_items() {
    struct FailingTransport {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DeviceTransport for FailingTransport {
        async fn get_features(&mut self) -> Result<DeviceFeatures> {
            Ok(valid_features())
        }

        async fn get_hd_node(&mut self, path: &[u32], _coin: &CoinInfo) -> Result<HdNode> {
            let index = account_index(path);
            self.calls.lock().unwrap().push(format!("hdnode:{index}"));
            if index >= 1 {
                return Err(ConnectError::Device("unplugged".into()));
            }
            Ok(HdNode {
                xpub: format!("xpub-{index}"),
                chain_code: "cc".into(),
                public_key: "pk".into(),
            })
        }

        async fn get_address(
            &mut self,
            _path: &[u32],
            _coin: &CoinInfo,
            _show: bool,
        ) -> Result<AddressResponse> {
            unreachable!("not used by this flow")
        }
    }

    let calls = Arc::new(Mutex::new(Vec::new()));
    let device = DeviceQueueFactory::spawn_worker(
        DEVICE_ID.into(),
        Box::new(FailingTransport { calls: Arc::clone(&calls) }),
    );
    let (ui, _log) = spawn_ui(UiScript::default());
    let ctx = MethodContext {
        device,
        features: valid_features(),
        ui: Some(ui),
        permissions: PermissionStore::new(Arc::new(MemoryStorage::new())),
        backends: Arc::new(StubBackendFactory),
        origin: ORIGIN.into(),
    };
    grant_read(&ctx).await;

    let err = call(
        &ctx,
        &json!({
            "method": "ethereumGetPublicKey",
            "bundle": [
                { "path": "m/44'/60'/0'" },
                { "path": "m/44'/60'/1'" },
                { "path": "m/44'/60'/2'" },
            ],
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), "device");
    // The third item was never attempted.
    assert_eq!(*calls.lock().unwrap(), vec!["hdnode:0", "hdnode:1"]);
}

// ---- account info ----------------------------------------------------------

#[tokio::test]
async fn account_info_from_fixed_path() {
    let bed = testbed(UiScript::default(), valid_features());
    grant_read(&bed.ctx).await;

    let response = call(
        &bed.ctx,
        &json!({ "method": "getAccountInfo", "coin": "btc", "path": "m/44'/0'/1'" }),
    )
    .await
    .unwrap();

    assert_eq!(response["id"], 1);
    assert_eq!(response["xpub"], "xpub-1");
    assert_eq!(response["balance"], 1000);
    assert_eq!(response["transactions"], 5);
    assert_eq!(response["address"], "1fresh-1");

    drop(bed.ctx);
    let log = bed.ui_log.await.unwrap();
    assert_eq!(log, vec!["confirm:export-account-info"]);
}

#[tokio::test]
async fn account_info_from_target_xpub_stops_at_match() {
    let bed = testbed(UiScript::default(), valid_features());
    grant_read(&bed.ctx).await;

    let response = call(
        &bed.ctx,
        &json!({ "method": "getAccountInfo", "coin": "btc", "xpub": "xpub-2" }),
    )
    .await
    .unwrap();

    assert_eq!(response["xpub"], "xpub-2");
    assert_eq!(response["transactions"], 5);
    // Accounts 0..=2 derived during the scan; index 3 never probed.
    let hdnodes: Vec<_> = bed
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.starts_with("hdnode:"))
        .cloned()
        .collect();
    assert_eq!(hdnodes, vec!["hdnode:0", "hdnode:1", "hdnode:2"]);
}

#[tokio::test]
async fn account_info_unmatched_xpub_is_account_not_found() {
    let bed = testbed(UiScript::default(), valid_features());
    grant_read(&bed.ctx).await;

    let err = call(
        &bed.ctx,
        &json!({ "method": "getAccountInfo", "coin": "btc", "xpub": "xpub-99" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "account_not_found");
}

#[tokio::test]
async fn interactive_discovery_selects_account() {
    let bed = testbed(
        UiScript { select_index: Some(1), ..UiScript::default() },
        valid_features(),
    );
    grant_read(&bed.ctx).await;

    let response = call(&bed.ctx, &json!({ "method": "getAccountInfo", "coin": "btc" }))
        .await
        .unwrap();

    assert_eq!(response["xpub"], "xpub-1");
    assert_eq!(response["balance"], 1000);

    drop(bed.ctx);
    let log = bed.ui_log.await.unwrap();
    assert_eq!(log.first().map(String::as_str), Some("select:Start:0"));
    // Four incremental updates (accounts 0..=3), then the completion marker.
    let updates = log.iter().filter(|l| l.starts_with("select:Progress:")).count();
    assert_eq!(updates, 4);
    assert!(log.contains(&"select:Complete:4".to_string()));
}
