//! Export the on-chain snapshot of one account, resolved from a fixed path,
//! a target xpub, or an interactive discovery-driven account selection.

use async_trait::async_trait;
use serde_json::Value;

use crate::account::Account;
use crate::coins::{coin_by_name, coin_for_path, validate_coin_path, CoinInfo};
use crate::discovery::{Discovery, DiscoveryEvent, DiscoveryOptions};
use crate::error::{ConnectError, Result};
use crate::firmware::{resolve_range, FirmwareRange};
use crate::methods::{CommonParams, Method, MethodContext};
use crate::params::{validate_params, Param, ParamType};
use crate::paths::{account_index, validate_path};
use crate::permissions::Permission;
use crate::ui::SelectPhase;

const METHOD_NAME: &str = "getAccountInfo";

pub struct GetAccountInfo {
    common: CommonParams,
    path: Option<Vec<u32>>,
    xpub: Option<String>,
    coin: &'static CoinInfo,
    confirmed: bool,
    required_permissions: Vec<Permission>,
    firmware_range: FirmwareRange,
    discovery: Option<Discovery>,
}

impl GetAccountInfo {
    pub fn new(payload: &Value) -> Result<Self> {
        let common = CommonParams::from_payload(payload)?;
        validate_params(
            payload,
            &[
                Param::optional("coin", ParamType::String),
                Param::optional("xpub", ParamType::String),
                Param::optional("crossChain", ParamType::Boolean),
            ],
        )?;

        let mut coin = payload
            .get("coin")
            .and_then(Value::as_str)
            .and_then(coin_by_name);

        let mut path = None;
        if let Some(raw_path) = payload.get("path") {
            let parsed = validate_path(raw_path, 3, true)?;
            match coin {
                None => coin = coin_for_path(&parsed),
                Some(coin) => {
                    let cross_chain = payload
                        .get("crossChain")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    if !cross_chain {
                        validate_coin_path(coin, &parsed)?;
                    }
                }
            }
            path = Some(parsed);
        }

        let coin = coin.ok_or(ConnectError::NoCoinInfo)?;
        let firmware_range = resolve_range(METHOD_NAME, Some(coin), FirmwareRange::default());

        Ok(GetAccountInfo {
            common,
            path,
            xpub: payload.get("xpub").and_then(Value::as_str).map(str::to_string),
            coin,
            confirmed: false,
            required_permissions: vec![Permission::Read],
            firmware_range,
            discovery: None,
        })
    }

    fn discovery_options(
        &self,
        ctx: &MethodContext,
        backend: std::sync::Arc<dyn crate::backend::Backend>,
        load_info: bool,
        target_xpub: Option<String>,
    ) -> DiscoveryOptions {
        DiscoveryOptions {
            coin: self.coin,
            backend,
            device: ctx.device.clone(),
            load_info,
            target_xpub,
        }
    }

    async fn run_from_path(&mut self, ctx: &MethodContext, path: Vec<u32>) -> Result<Value> {
        let backend = ctx.backends.create_backend(self.coin).await?;
        let node = ctx.device.get_hd_node(path.clone(), self.coin).await?;
        let mut account = Account::new(path, node.xpub, self.coin);

        let options = self.discovery_options(ctx, backend, false, None);
        let discovery = self.discovery.insert(Discovery::new(options));
        discovery.load_account_info(&mut account).await?;
        Ok(account.to_response())
    }

    async fn run_from_xpub(&mut self, ctx: &MethodContext, xpub: String) -> Result<Value> {
        let backend = ctx.backends.create_backend(self.coin).await?;
        let options = self.discovery_options(ctx, backend, false, Some(xpub.clone()));
        let discovery = self.discovery.insert(Discovery::new(options));
        let mut events = discovery.start()?;

        loop {
            match events.recv().await {
                Some(DiscoveryEvent::Update(_)) => {}
                Some(DiscoveryEvent::Complete(_)) | None => break,
                Some(DiscoveryEvent::Failed(e)) => return Err(e),
            }
        }
        discovery.stop();

        match discovery.accounts().into_iter().find(|a| a.xpub == xpub) {
            Some(mut account) => {
                discovery.load_account_info(&mut account).await?;
                Ok(account.to_response())
            }
            None => Err(ConnectError::AccountNotFound),
        }
    }

    async fn run_interactive(&mut self, ctx: &MethodContext) -> Result<Value> {
        let ui = ctx.ui.as_ref().ok_or(ConnectError::UiClosed)?;
        let backend = ctx.backends.create_backend(self.coin).await?;
        let options = self.discovery_options(ctx, backend, true, None);
        let discovery = self.discovery.insert(Discovery::new(options));
        let mut events = discovery.start()?;

        let coin = self.coin.shortcut;
        let mut selection = ui.open_account_selector(coin).await?;
        let mut events_done = false;

        loop {
            tokio::select! {
                selected = &mut selection => {
                    let index = selected.map_err(|_| ConnectError::UiClosed)?;
                    discovery.stop();
                    let account = discovery
                        .account(index)
                        .ok_or(ConnectError::AccountNotFound)?;
                    return Ok(account.to_response());
                }
                event = events.recv(), if !events_done => match event {
                    Some(DiscoveryEvent::Update(accounts)) => {
                        ui.update_account_selector(coin, accounts, SelectPhase::Progress).await?;
                    }
                    Some(DiscoveryEvent::Complete(accounts)) => {
                        ui.update_account_selector(coin, accounts, SelectPhase::Complete).await?;
                    }
                    Some(DiscoveryEvent::Failed(e)) => return Err(e),
                    // Scan is over; keep waiting for the user's pick.
                    None => events_done = true,
                }
            }
        }
    }
}

#[async_trait]
impl Method for GetAccountInfo {
    fn name(&self) -> &'static str {
        METHOD_NAME
    }

    fn info(&self) -> String {
        "Export account info".to_string()
    }

    fn common(&self) -> &CommonParams {
        &self.common
    }

    fn required_permissions(&self) -> &[Permission] {
        &self.required_permissions
    }

    fn firmware_range(&self) -> &FirmwareRange {
        &self.firmware_range
    }

    async fn confirmation(&mut self, ctx: &MethodContext) -> Result<bool> {
        if self.confirmed {
            return Ok(true);
        }
        let Some(ui) = ctx.ui.as_ref() else {
            return Ok(true);
        };

        let label = if let Some(path) = &self.path {
            format!(
                "Export info for {} account #{}",
                self.coin.label(),
                account_index(path) + 1
            )
        } else if let Some(xpub) = &self.xpub {
            format!("Export info for {} account with public key {xpub}", self.coin.label())
        } else {
            // Interactive discovery: picking an account is the confirmation.
            return Ok(true);
        };

        let approved = ui.request_confirmation("export-account-info", Some(label)).await?;
        self.confirmed = approved;
        Ok(approved)
    }

    async fn run(&mut self, ctx: &MethodContext) -> Result<Value> {
        if let Some(path) = self.path.clone() {
            self.run_from_path(ctx, path).await
        } else if let Some(xpub) = self.xpub.clone() {
            self.run_from_xpub(ctx, xpub).await
        } else {
            self.run_interactive(ctx).await
        }
    }

    fn dispose(&mut self) {
        if let Some(discovery) = &self.discovery {
            discovery.dispose();
        }
    }
}
