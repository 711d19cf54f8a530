//! Export one or more extended public keys for Ethereum-family accounts.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::coins::{coin_by_name, coin_for_path, CoinInfo, CoinKind};
use crate::error::{ConnectError, Result};
use crate::firmware::{resolve_range, FirmwareRange};
use crate::methods::{normalize_bundle, CommonParams, Method, MethodContext};
use crate::params::{validate_params, Param};
use crate::paths::{serialize_path, validate_path};
use crate::permissions::Permission;

const METHOD_NAME: &str = "ethereumGetPublicKey";

#[derive(Debug, Clone)]
struct Batch {
    path: Vec<u32>,
    coin: &'static CoinInfo,
}

pub struct EthereumGetPublicKey {
    common: CommonParams,
    bundle: Vec<Batch>,
    bundled: bool,
    info: String,
    confirmed: bool,
    required_permissions: Vec<Permission>,
    firmware_range: FirmwareRange,
}

impl EthereumGetPublicKey {
    pub fn new(payload: &Value) -> Result<Self> {
        let common = CommonParams::from_payload(payload)?;
        let (items, bundled) = normalize_bundle(payload)?;

        let mut firmware_range = FirmwareRange::default();
        let mut bundle = Vec::with_capacity(items.len());
        for item in &items {
            validate_params(item, &[Param::present("path")])?;
            let path = validate_path(item.get("path").unwrap_or(&Value::Null), 3, false)?;
            let coin = coin_for_path(&path)
                .filter(|c| c.kind == CoinKind::Ethereum)
                .or_else(|| coin_by_name("ETH"))
                .ok_or(ConnectError::NoCoinInfo)?;
            firmware_range = resolve_range(METHOD_NAME, Some(coin), firmware_range);
            bundle.push(Batch { path, coin });
        }

        let info = if bundle.len() == 1 {
            format!("Export {} public key", bundle[0].coin.label())
        } else {
            "Export multiple public keys".to_string()
        };

        Ok(EthereumGetPublicKey {
            common,
            bundle,
            bundled,
            info,
            confirmed: false,
            required_permissions: vec![Permission::Read],
            firmware_range,
        })
    }
}

#[async_trait]
impl Method for EthereumGetPublicKey {
    fn name(&self) -> &'static str {
        METHOD_NAME
    }

    fn info(&self) -> String {
        self.info.clone()
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
        let approved = ui
            .request_confirmation("export-xpub", Some(self.info.clone()))
            .await?;
        self.confirmed = approved;
        Ok(approved)
    }

    async fn run(&mut self, ctx: &MethodContext) -> Result<Value> {
        let mut responses = Vec::with_capacity(self.bundle.len());

        for (i, batch) in self.bundle.iter().enumerate() {
            let node = ctx.device.get_hd_node(batch.path.clone(), batch.coin).await?;

            let response = json!({
                "xpub": node.xpub,
                "chainCode": node.chain_code,
                "publicKey": node.public_key,
                "path": batch.path,
                "serializedPath": serialize_path(&batch.path),
            });
            responses.push(response.clone());

            if self.bundled {
                if let Some(ui) = ctx.ui.as_ref() {
                    ui.bundle_progress(i, response).await?;
                }
            }
        }

        if self.bundled {
            Ok(Value::Array(responses))
        } else {
            Ok(responses.into_iter().next().unwrap_or(Value::Null))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requires_path_per_batch() {
        let err = EthereumGetPublicKey::new(&json!({ "bundle": [{}] })).err().unwrap();
        assert_eq!(err.kind(), "invalid_parameter");
    }

    #[test]
    fn xpub_override_tightens_gen2_minimum() {
        let method = EthereumGetPublicKey::new(&json!({ "path": "m/44'/60'/0'" })).unwrap();
        assert_eq!(
            method.firmware_range.gen2.min,
            Some(crate::firmware::FirmwareVersion::new(2, 0, 10))
        );
    }

    #[test]
    fn non_ethereum_path_falls_back_to_mainnet() {
        let method = EthereumGetPublicKey::new(&json!({ "path": "m/44'/0'/0'" })).unwrap();
        assert_eq!(method.bundle[0].coin.shortcut, "ETH");
    }

    #[test]
    fn uniform_bundle_label_names_the_network() {
        let method = EthereumGetPublicKey::new(&json!({ "path": "m/44'/60'/0'" })).unwrap();
        assert_eq!(method.info, "Export Ethereum public key");

        let method = EthereumGetPublicKey::new(&json!({
            "bundle": [{ "path": "m/44'/60'/0'" }, { "path": "m/44'/61'/0'" }]
        }))
        .unwrap();
        assert_eq!(method.info, "Export multiple public keys");
    }
}
