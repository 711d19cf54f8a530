//! Static coin/network table and the firmware-support configuration folded
//! into every method's firmware range.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectError, Result};
use crate::firmware::FirmwareVersion;
use crate::paths::from_hardened;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinKind {
    Bitcoin,
    Ethereum,
}

/// Minimum supported firmware per device generation. `None` means the coin
/// is not supported on that generation at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinSupport {
    pub gen1: Option<FirmwareVersion>,
    pub gen2: Option<FirmwareVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoinInfo {
    pub name: &'static str,
    pub shortcut: &'static str,
    pub slip44: u32,
    pub kind: CoinKind,
    /// Protocol-specific address prefix stripped before address comparison.
    pub address_prefix: Option<&'static str>,
    #[serde(skip)]
    pub support: CoinSupport,
}

impl CoinInfo {
    pub fn label(&self) -> &'static str {
        self.name
    }
}

macro_rules! ver {
    ($maj:expr, $min:expr, $pat:expr) => {
        Some(FirmwareVersion::new($maj, $min, $pat))
    };
}

static COINS: Lazy<Vec<CoinInfo>> = Lazy::new(|| {
    vec![
        CoinInfo {
            name: "Bitcoin",
            shortcut: "BTC",
            slip44: 0,
            kind: CoinKind::Bitcoin,
            address_prefix: None,
            support: CoinSupport { gen1: ver!(1, 3, 3), gen2: ver!(2, 0, 5) },
        },
        CoinInfo {
            name: "Testnet",
            shortcut: "TEST",
            slip44: 1,
            kind: CoinKind::Bitcoin,
            address_prefix: None,
            support: CoinSupport { gen1: ver!(1, 3, 3), gen2: ver!(2, 0, 5) },
        },
        CoinInfo {
            name: "Litecoin",
            shortcut: "LTC",
            slip44: 2,
            kind: CoinKind::Bitcoin,
            address_prefix: None,
            support: CoinSupport { gen1: ver!(1, 3, 5), gen2: ver!(2, 0, 5) },
        },
        CoinInfo {
            name: "Ethereum",
            shortcut: "ETH",
            slip44: 60,
            kind: CoinKind::Ethereum,
            address_prefix: Some("0x"),
            support: CoinSupport { gen1: ver!(1, 6, 2), gen2: ver!(2, 0, 7) },
        },
        CoinInfo {
            name: "Ethereum Classic",
            shortcut: "ETC",
            slip44: 61,
            kind: CoinKind::Ethereum,
            address_prefix: Some("0x"),
            support: CoinSupport { gen1: ver!(1, 6, 2), gen2: ver!(2, 0, 7) },
        },
        // Dogecoin only ever shipped on generation 1.
        CoinInfo {
            name: "Dogecoin",
            shortcut: "DOGE",
            slip44: 3,
            kind: CoinKind::Bitcoin,
            address_prefix: None,
            support: CoinSupport { gen1: ver!(1, 3, 5), gen2: None },
        },
    ]
});

/// Look a coin up by name or shortcut, case-insensitive.
pub fn coin_by_name(name: &str) -> Option<&'static CoinInfo> {
    COINS.iter().find(|c| {
        c.name.eq_ignore_ascii_case(name) || c.shortcut.eq_ignore_ascii_case(name)
    })
}

pub fn coin_by_slip44(slip44: u32) -> Option<&'static CoinInfo> {
    COINS.iter().find(|c| c.slip44 == slip44)
}

/// Resolve a coin from a derivation path (`path[1]` carries the slip44 type).
pub fn coin_for_path(path: &[u32]) -> Option<&'static CoinInfo> {
    path.get(1).and_then(|i| coin_by_slip44(from_hardened(*i)))
}

/// Fail when a path's coin-type component disagrees with an explicitly
/// requested coin.
pub fn validate_coin_path(coin: &CoinInfo, path: &[u32]) -> Result<()> {
    match path.get(1) {
        Some(i) if from_hardened(*i) == coin.slip44 => Ok(()),
        _ => Err(ConnectError::invalid_parameter(
            "path",
            "path matching requested coin",
        )),
    }
}

/// A method/coin specific firmware constraint from the support config.
#[derive(Debug, Clone)]
pub struct FirmwareOverride {
    /// Coin kinds this override is keyed by.
    pub coin_kinds: &'static [CoinKind],
    /// Coin shortcuts (lowercase) this override is keyed by.
    pub coins: &'static [&'static str],
    /// When non-empty, the override only governs the named methods.
    pub excluded_methods: &'static [&'static str],
    /// Per-generation minimum, `[gen1, gen2]`.
    pub min: Option<[FirmwareVersion; 2]>,
    /// Per-generation maximum, `[gen1, gen2]`.
    pub max: Option<[FirmwareVersion; 2]>,
}

static SUPPORTED_FIRMWARE: Lazy<Vec<FirmwareOverride>> = Lazy::new(|| {
    vec![
        // Ethereum xpub export first shipped in 1.6.2 / 2.0.10.
        FirmwareOverride {
            coin_kinds: &[CoinKind::Ethereum],
            coins: &[],
            excluded_methods: &["ethereumGetPublicKey"],
            min: Some([FirmwareVersion::new(1, 6, 2), FirmwareVersion::new(2, 0, 10)]),
            max: None,
        },
        // Account discovery needs the fixed xpub serialization from 1.5.1 / 2.0.8.
        FirmwareOverride {
            coin_kinds: &[],
            coins: &[],
            excluded_methods: &["getAccountInfo"],
            min: Some([FirmwareVersion::new(1, 5, 1), FirmwareVersion::new(2, 0, 8)]),
            max: None,
        },
        // Litecoin address format change capped the legacy handler.
        FirmwareOverride {
            coin_kinds: &[],
            coins: &["ltc"],
            excluded_methods: &[],
            min: None,
            max: Some([FirmwareVersion::new(1, 8, 0), FirmwareVersion::new(2, 1, 0)]),
        },
    ]
});

/// First override selected for a (coin, method) pair, if any. Selection is by
/// coin kind or shortcut; an override keyed only by method names is selected
/// when its exclusion list names the method. Whether a selected override
/// actually governs the method is a separate predicate checked by the
/// firmware resolver.
pub fn find_firmware_override(
    method: &str,
    coin: Option<&CoinInfo>,
) -> Option<&'static FirmwareOverride> {
    SUPPORTED_FIRMWARE.iter().find(|ov| {
        if let Some(coin) = coin {
            if ov.coin_kinds.contains(&coin.kind) {
                return true;
            }
            if ov.coins.iter().any(|c| c.eq_ignore_ascii_case(coin.shortcut)) {
                return true;
            }
        }
        ov.excluded_methods.contains(&method)
    })
}
