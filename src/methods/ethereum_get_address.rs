//! Export one or more Ethereum addresses, optionally displaying them on the
//! device and cross-checking against a caller-supplied expected address.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::coins::{coin_by_name, coin_for_path, CoinInfo, CoinKind};
use crate::error::{ConnectError, Result};
use crate::firmware::{resolve_range, FirmwareRange};
use crate::methods::{normalize_bundle, CommonParams, Method, MethodContext};
use crate::params::{validate_params, Param, ParamType};
use crate::paths::{serialize_path, validate_path};
use crate::permissions::Permission;

const METHOD_NAME: &str = "ethereumGetAddress";

#[derive(Debug, Clone)]
struct Batch {
    path: Vec<u32>,
    address: Option<String>,
    coin: &'static CoinInfo,
    show_on_device: bool,
}

pub struct EthereumGetAddress {
    common: CommonParams,
    bundle: Vec<Batch>,
    bundled: bool,
    info: String,
    /// Set when the device-side address match stands in for an explicit
    /// confirmation prompt.
    confirmed: bool,
    required_permissions: Vec<Permission>,
    firmware_range: FirmwareRange,
}

impl EthereumGetAddress {
    pub fn new(payload: &Value) -> Result<Self> {
        let common = CommonParams::from_payload(payload)?;
        let (items, bundled) = normalize_bundle(payload)?;

        let mut firmware_range = FirmwareRange::default();
        let mut bundle = Vec::with_capacity(items.len());
        for item in &items {
            validate_params(
                item,
                &[
                    Param::present("path"),
                    Param::optional("address", ParamType::String),
                    Param::optional("showOnDevice", ParamType::Boolean),
                ],
            )?;

            let path = validate_path(
                item.get("path").unwrap_or(&Value::Null),
                3,
                false,
            )?;
            // Only Ethereum-family networks resolve from the path; any other
            // coin type falls back to mainnet Ethereum.
            let coin = coin_for_path(&path)
                .filter(|c| c.kind == CoinKind::Ethereum)
                .or_else(|| coin_by_name("ETH"))
                .ok_or(ConnectError::NoCoinInfo)?;
            firmware_range = resolve_range(METHOD_NAME, Some(coin), firmware_range);

            bundle.push(Batch {
                path,
                address: item.get("address").and_then(Value::as_str).map(str::to_string),
                coin,
                show_on_device: item
                    .get("showOnDevice")
                    .and_then(Value::as_bool)
                    .unwrap_or(true),
            });
        }

        let info = if bundle.len() == 1 {
            format!("Export {} address", bundle[0].coin.label())
        } else {
            "Export multiple addresses".to_string()
        };

        // A caller that both supplies the expected address and asks for
        // on-device display gets its guarantee from the device-side match.
        let confirmed = bundle.len() == 1
            && bundle[0].address.is_some()
            && bundle[0].show_on_device;

        Ok(EthereumGetAddress {
            common,
            bundle,
            bundled,
            info,
            confirmed,
            required_permissions: vec![Permission::Read],
            firmware_range,
        })
    }
}

/// Case-insensitive address comparison after stripping the protocol prefix.
fn addresses_match(expected: &str, derived: &str, coin: &CoinInfo) -> bool {
    let strip = |s: &str| -> String {
        let s = match coin.address_prefix {
            Some(prefix) => s
                .strip_prefix(prefix)
                .or_else(|| {
                    // Prefix case may differ too.
                    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
                        Some(&s[prefix.len()..])
                    } else {
                        None
                    }
                })
                .unwrap_or(s),
            None => s,
        };
        s.to_ascii_lowercase()
    };
    strip(expected) == strip(derived)
}

#[async_trait]
impl Method for EthereumGetAddress {
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
            .request_confirmation("export-address", Some(self.info.clone()))
            .await?;
        self.confirmed = approved;
        Ok(approved)
    }

    async fn run(&mut self, ctx: &MethodContext) -> Result<Value> {
        let mut responses = Vec::with_capacity(self.bundle.len());

        for (i, batch) in self.bundle.iter_mut().enumerate() {
            if batch.show_on_device {
                // Silent derivation first: a mismatch means the device holds
                // a different key than the caller believes, and nothing more
                // may be sent to it.
                let silent = ctx
                    .device
                    .get_address(batch.path.clone(), batch.coin, false)
                    .await?;
                match &batch.address {
                    Some(expected) => {
                        if !addresses_match(expected, &silent.address, batch.coin) {
                            return Err(ConnectError::AddressMismatch);
                        }
                    }
                    None => batch.address = Some(silent.address),
                }
            }

            let response = ctx
                .device
                .get_address(batch.path.clone(), batch.coin, batch.show_on_device)
                .await?;

            let response = json!({
                "address": response.address,
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
    fn missing_path_fails_before_any_interaction() {
        let err = EthereumGetAddress::new(&json!({ "method": "ethereumGetAddress" })).err().unwrap();
        assert_eq!(err.kind(), "invalid_parameter");
    }

    #[test]
    fn show_on_device_defaults_to_true() {
        let method =
            EthereumGetAddress::new(&json!({ "path": "m/44'/60'/0'/0/0" })).unwrap();
        assert!(method.bundle[0].show_on_device);
        assert!(!method.bundled);
        assert!(!method.confirmed);
    }

    #[test]
    fn supplied_address_with_display_skips_confirmation() {
        let method = EthereumGetAddress::new(&json!({
            "path": "m/44'/60'/0'/0/0",
            "address": "0xABCDEF0123456789abcdef0123456789ABCDEF01",
        }))
        .unwrap();
        assert!(method.confirmed);
    }

    #[test]
    fn bundles_validate_each_item() {
        let err = EthereumGetAddress::new(&json!({
            "bundle": [
                { "path": "m/44'/60'/0'/0/0" },
                { "path": "m/44'/60'/1'/0/0", "address": 42 },
            ]
        }))
        .err().unwrap();
        assert_eq!(err.kind(), "invalid_parameter");
    }

    #[test]
    fn address_match_ignores_case_and_prefix() {
        let eth = coin_by_name("ETH").unwrap();
        assert!(addresses_match("0xABCdef01", "0xabcDEF01", eth));
        assert!(addresses_match("ABCdef01", "0xabcdef01", eth));
        assert!(!addresses_match("0xabcdef01", "0xabcdef02", eth));
    }

    #[test]
    fn non_ethereum_path_falls_back_to_mainnet() {
        // slip44 0 is Bitcoin; an Ethereum method must not bind it.
        let method =
            EthereumGetAddress::new(&json!({ "path": "m/44'/0'/0'/0/0" })).unwrap();
        assert_eq!(method.bundle[0].coin.shortcut, "ETH");
        assert_eq!(
            method.firmware_range.gen1.min,
            Some(crate::firmware::FirmwareVersion::new(1, 6, 2))
        );

        let method =
            EthereumGetAddress::new(&json!({ "path": "m/44'/61'/0'/0/0" })).unwrap();
        assert_eq!(method.bundle[0].coin.shortcut, "ETC");
    }

    #[test]
    fn firmware_range_reflects_coin_support() {
        let method =
            EthereumGetAddress::new(&json!({ "path": "m/44'/60'/0'/0/0" })).unwrap();
        assert_eq!(
            method.firmware_range.gen1.min,
            Some(crate::firmware::FirmwareVersion::new(1, 6, 2))
        );
    }
}
