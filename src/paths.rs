//! BIP-32 derivation path helpers shared by parameter validation, account
//! construction and response formatting.

use serde_json::Value;

use crate::error::{ConnectError, Result};

pub const HARDENED: u32 = 0x8000_0000;

pub fn is_hardened(index: u32) -> bool {
    index & HARDENED != 0
}

pub fn to_hardened(index: u32) -> u32 {
    index | HARDENED
}

pub fn from_hardened(index: u32) -> u32 {
    index & !HARDENED
}

/// Account index of a path: its last component with the hardened bit cleared.
/// Computed once at `Account` construction and never recomputed.
pub fn account_index(path: &[u32]) -> u32 {
    path.last().map(|i| from_hardened(*i)).unwrap_or(0)
}

/// Parse a path given either as `"m/44'/60'/0'/0/0"` (`'` or `h` hardens)
/// or as a JSON array of integers.
pub fn parse_path(value: &Value) -> Result<Vec<u32>> {
    match value {
        Value::String(s) => parse_path_str(s),
        Value::Array(items) => {
            let mut path = Vec::with_capacity(items.len());
            for item in items {
                let n = item
                    .as_u64()
                    .filter(|n| *n <= u32::MAX as u64)
                    .ok_or_else(|| ConnectError::invalid_parameter("path", "array of indices"))?;
                path.push(n as u32);
            }
            Ok(path)
        }
        _ => Err(ConnectError::invalid_parameter("path", "string or array")),
    }
}

fn parse_path_str(s: &str) -> Result<Vec<u32>> {
    let invalid = || ConnectError::invalid_parameter("path", "derivation path");
    let mut parts = s.split('/');
    match parts.next() {
        Some("m") | Some("M") => {}
        _ => return Err(invalid()),
    }

    let mut path = Vec::new();
    for part in parts {
        let (digits, hardened) = match part.strip_suffix('\'').or_else(|| part.strip_suffix('h')) {
            Some(rest) => (rest, true),
            None => (part, false),
        };
        let index: u32 = digits.parse().map_err(|_| invalid())?;
        if is_hardened(index) {
            return Err(invalid());
        }
        path.push(if hardened { to_hardened(index) } else { index });
    }

    if path.is_empty() {
        return Err(invalid());
    }
    Ok(path)
}

/// Parse a path and enforce a minimum depth. `base` additionally truncates the
/// path to the account level (first three components).
pub fn validate_path(value: &Value, min_len: usize, base: bool) -> Result<Vec<u32>> {
    let path = parse_path(value)?;
    if path.len() < min_len {
        return Err(ConnectError::invalid_parameter("path", "derivation path"));
    }
    if base {
        Ok(path.into_iter().take(3).collect())
    } else {
        Ok(path)
    }
}

pub fn serialize_path(path: &[u32]) -> String {
    let mut out = String::from("m");
    for index in path {
        if is_hardened(*index) {
            out.push_str(&format!("/{}'", from_hardened(*index)));
        } else {
            out.push_str(&format!("/{}", index));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_paths() {
        let path = parse_path(&json!("m/44'/60'/0'/0/0")).unwrap();
        assert_eq!(
            path,
            vec![to_hardened(44), to_hardened(60), to_hardened(0), 0, 0]
        );
    }

    #[test]
    fn parses_array_paths() {
        let path = parse_path(&json!([2147483692u32, 2147483708u32, 2147483648u32])).unwrap();
        assert_eq!(path, vec![to_hardened(44), to_hardened(60), to_hardened(0)]);
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_path(&json!("44'/60'/0'")).is_err());
        assert!(parse_path(&json!("m/x/0")).is_err());
        assert!(parse_path(&json!(42)).is_err());
        assert!(parse_path(&json!("m")).is_err());
    }

    #[test]
    fn validate_path_enforces_depth() {
        assert!(validate_path(&json!("m/44'/60'"), 3, false).is_err());
        let base = validate_path(&json!("m/44'/60'/0'/0/0"), 3, true).unwrap();
        assert_eq!(base.len(), 3);
    }

    #[test]
    fn round_trips_serialization() {
        let s = "m/44'/0'/7'";
        assert_eq!(serialize_path(&parse_path(&json!(s)).unwrap()), s);
    }

    #[test]
    fn account_index_clears_hardened_bit() {
        assert_eq!(account_index(&[to_hardened(44), to_hardened(0), to_hardened(5)]), 5);
        assert_eq!(account_index(&[]), 0);
    }
}
