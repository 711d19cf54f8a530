//! Firmware version arithmetic: per-generation supported ranges, the
//! constraint folding performed while a method is constructed, and the
//! one-shot compatibility check against the connected device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coins::{find_firmware_override, CoinInfo};
use crate::device::{DeviceFeatures, FirmwareStatus};
use crate::error::{ConnectError, Result};
use crate::ui::UiHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| ConnectError::invalid_parameter("version", "semver string"))
        };
        let version = FirmwareVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(ConnectError::invalid_parameter("version", "semver string"));
        }
        Ok(version)
    }
}

/// Device hardware/firmware generation. Two generations are modeled, each
/// with independent supported-version bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    Gen1,
    Gen2,
}

/// Supported firmware window for one generation.
///
/// `min == None` means the operation is not supported on that generation at
/// all; `max == None` means unbounded. While constraints fold in, `min`
/// tightens upward (a governing override's minimum supersedes an unsupported
/// marker) and `max` only ever tightens downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerationRange {
    pub min: Option<FirmwareVersion>,
    pub max: Option<FirmwareVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareRange {
    pub gen1: GenerationRange,
    pub gen2: GenerationRange,
}

impl Default for FirmwareRange {
    fn default() -> Self {
        FirmwareRange {
            gen1: GenerationRange {
                min: Some(FirmwareVersion::new(1, 0, 0)),
                max: None,
            },
            gen2: GenerationRange {
                min: Some(FirmwareVersion::new(2, 0, 0)),
                max: None,
            },
        }
    }
}

impl FirmwareRange {
    pub fn for_generation(&self, generation: Generation) -> &GenerationRange {
        match generation {
            Generation::Gen1 => &self.gen1,
            Generation::Gen2 => &self.gen2,
        }
    }
}

fn tighten_min(current: Option<FirmwareVersion>, constraint: FirmwareVersion) -> Option<FirmwareVersion> {
    match current {
        Some(min) if min >= constraint => Some(min),
        _ => Some(constraint),
    }
}

fn tighten_max(current: Option<FirmwareVersion>, constraint: FirmwareVersion) -> Option<FirmwareVersion> {
    // First binding constraint wins, later ones may only lower it.
    match current {
        Some(max) if max <= constraint => Some(max),
        _ => Some(constraint),
    }
}

/// Fold the coin's declared support and any governing config override into
/// `current`. Never fails; missing data leaves the permissive default.
/// Resolution is idempotent for a fixed (method, coin) pair.
pub fn resolve_range(
    method: &str,
    coin: Option<&CoinInfo>,
    mut current: FirmwareRange,
) -> FirmwareRange {
    if let Some(coin) = coin {
        current.gen1.min = match coin.support.gen1 {
            Some(min) => tighten_min(current.gen1.min, min),
            None => None,
        };
        current.gen2.min = match coin.support.gen2 {
            Some(min) => tighten_min(current.gen2.min, min),
            None => None,
        };
    }

    let Some(ov) = find_firmware_override(method, coin) else {
        return current;
    };
    // Selection and governance are independent predicates: an override with a
    // non-empty exclusion list only governs the methods it names.
    if !ov.excluded_methods.is_empty() && !ov.excluded_methods.contains(&method) {
        return current;
    }

    if let Some([g1, g2]) = ov.min {
        // An override minimum may re-enable a generation the coin table
        // leaves unsupported.
        current.gen1.min = tighten_min(current.gen1.min, g1);
        current.gen2.min = tighten_min(current.gen2.min, g2);
    }
    if let Some([g1, g2]) = ov.max {
        current.gen1.max = tighten_max(current.gen1.max, g1);
        current.gen2.max = tighten_max(current.gen2.max, g2);
    }

    debug!(method, range = ?current, "resolved firmware range");
    current
}

/// One-shot compatibility check against the connected device.
///
/// A firmware version above a bounded `max` suspends for a user override
/// decision when an interactive surface is available; a decline is fatal.
pub async fn check_compatibility(
    range: &FirmwareRange,
    features: &DeviceFeatures,
    ui: Option<&UiHandle>,
) -> Result<()> {
    if features.firmware_status == FirmwareStatus::None || features.version.is_none() {
        return Err(ConnectError::FirmwareNotInstalled);
    }
    let version = features.version.unwrap_or(FirmwareVersion::new(0, 0, 0));
    let generation = features.generation();
    let gen_range = range.for_generation(generation);

    let Some(min) = gen_range.min else {
        return Err(ConnectError::FirmwareNotSupported);
    };
    if features.firmware_status == FirmwareStatus::Required || version < min {
        return Err(ConnectError::FirmwareOld);
    }

    if let Some(max) = gen_range.max {
        if version > max {
            match ui {
                Some(ui) => {
                    let approved = ui
                        .request_confirmation("firmware-not-compatible", features.label.clone())
                        .await?;
                    if !approved {
                        return Err(ConnectError::PermissionsNotGranted);
                    }
                }
                None => return Err(ConnectError::FirmwareNotCompatible),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::coin_by_name;

    fn v(major: u32, minor: u32, patch: u32) -> FirmwareVersion {
        FirmwareVersion::new(major, minor, patch)
    }

    #[test]
    fn parses_and_orders_versions() {
        let a: FirmwareVersion = "1.6.2".parse().unwrap();
        assert_eq!(a, v(1, 6, 2));
        assert!(v(1, 6, 2) < v(1, 10, 0));
        assert!(v(2, 0, 0) > v(1, 9, 9));
        assert!("1.6".parse::<FirmwareVersion>().is_err());
        assert!("1.6.2.1".parse::<FirmwareVersion>().is_err());
    }

    #[test]
    fn coin_support_tightens_min() {
        let eth = coin_by_name("eth").unwrap();
        let range = resolve_range("ethereumGetAddress", Some(eth), FirmwareRange::default());
        assert_eq!(range.gen1.min, Some(v(1, 6, 2)));
        assert_eq!(range.gen2.min, Some(v(2, 0, 7)));
        assert_eq!(range.gen1.max, None);
    }

    #[test]
    fn unsupported_generation_forces_min_unset() {
        let doge = coin_by_name("doge").unwrap();
        let range = resolve_range("getAddress", Some(doge), FirmwareRange::default());
        assert_eq!(range.gen1.min, Some(v(1, 3, 5)));
        assert_eq!(range.gen2.min, None);
    }

    #[test]
    fn override_governs_only_named_methods() {
        let eth = coin_by_name("eth").unwrap();
        // Selected by coin kind but the exclusion list does not name this
        // method, so the coin default stands untouched.
        let range = resolve_range("ethereumGetAddress", Some(eth), FirmwareRange::default());
        assert_eq!(range.gen2.min, Some(v(2, 0, 7)));
        // The named method gets the tighter gen2 minimum.
        let range = resolve_range("ethereumGetPublicKey", Some(eth), FirmwareRange::default());
        assert_eq!(range.gen2.min, Some(v(2, 0, 10)));
    }

    #[test]
    fn override_min_reenables_unsupported_generation() {
        let doge = coin_by_name("doge").unwrap();
        let range = resolve_range("getAccountInfo", Some(doge), FirmwareRange::default());
        assert_eq!(range.gen1.min, Some(v(1, 5, 1)));
        // Dogecoin never shipped on gen2, but the discovery override's
        // minimum supersedes the coin table for the method it governs.
        assert_eq!(range.gen2.min, Some(v(2, 0, 8)));
    }

    #[test]
    fn resolution_is_idempotent() {
        let eth = coin_by_name("eth").unwrap();
        let once = resolve_range("ethereumGetPublicKey", Some(eth), FirmwareRange::default());
        let twice = resolve_range("ethereumGetPublicKey", Some(eth), once);
        assert_eq!(once, twice);
    }

    #[test]
    fn max_first_binding_wins_then_tightens() {
        let ltc = coin_by_name("ltc").unwrap();
        let range = resolve_range("getAddress", Some(ltc), FirmwareRange::default());
        assert_eq!(range.gen1.max, Some(v(1, 8, 0)));
        // Applying again does not widen.
        let again = resolve_range("getAddress", Some(ltc), range);
        assert_eq!(again.gen1.max, Some(v(1, 8, 0)));
    }
}
