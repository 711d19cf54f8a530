//! Structural validation of request payloads against field descriptors.
//! Runs synchronously in each method constructor, before any device or UI
//! interaction, and has no side effects.

use serde_json::Value;

use crate::error::{ConnectError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Array,
    Buffer,
    Boolean,
    Amount,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Array => "array",
            ParamType::Buffer => "buffer",
            ParamType::Boolean => "boolean",
            ParamType::Amount => "amount",
            ParamType::Object => "object",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Param {
    pub name: &'static str,
    pub ty: Option<ParamType>,
    pub obligatory: bool,
}

impl Param {
    pub const fn required(name: &'static str, ty: ParamType) -> Self {
        Param { name, ty: Some(ty), obligatory: true }
    }

    pub const fn optional(name: &'static str, ty: ParamType) -> Self {
        Param { name, ty: Some(ty), obligatory: false }
    }

    /// Obligatory field whose type is validated elsewhere (e.g. paths, which
    /// accept both string and array forms).
    pub const fn present(name: &'static str) -> Self {
        Param { name, ty: None, obligatory: true }
    }
}

/// Validate `values` against `fields`. Present fields must match their
/// declared type; absent obligatory fields fail. Arrays must be non-empty;
/// amounts must be canonical decimal integer strings; buffers are hex
/// strings of even length.
pub fn validate_params(values: &Value, fields: &[Param]) -> Result<()> {
    for field in fields {
        let value = values.get(field.name);
        match value {
            Some(value) => {
                if let Some(ty) = field.ty {
                    validate_type(field.name, value, ty)?;
                }
            }
            None => {
                if field.obligatory {
                    return Err(ConnectError::invalid_parameter(field.name, "missing"));
                }
            }
        }
    }
    Ok(())
}

fn validate_type(name: &str, value: &Value, ty: ParamType) -> Result<()> {
    let mismatch = || ConnectError::invalid_parameter(name, ty.as_str());
    match ty {
        ParamType::String => {
            value.as_str().ok_or_else(mismatch)?;
        }
        ParamType::Number => {
            if !value.is_number() {
                return Err(mismatch());
            }
        }
        ParamType::Boolean => {
            value.as_bool().ok_or_else(mismatch)?;
        }
        ParamType::Object => {
            value.as_object().ok_or_else(mismatch)?;
        }
        ParamType::Array => {
            let items = value.as_array().ok_or_else(mismatch)?;
            if items.is_empty() {
                return Err(ConnectError::invalid_parameter(name, "non-empty array"));
            }
        }
        ParamType::Amount => {
            let s = value.as_str().ok_or_else(mismatch)?;
            if !is_canonical_amount(s) {
                return Err(ConnectError::invalid_parameter(name, "integer amount string"));
            }
        }
        ParamType::Buffer => {
            let s = value.as_str().ok_or_else(mismatch)?;
            if s.len() % 2 != 0 || hex::decode(s).is_err() {
                return Err(mismatch());
            }
        }
    }
    Ok(())
}

/// An amount is valid iff its parse-and-restringify round-trip is exact:
/// `"100"` passes, `"100.0"` and `"0100"` do not.
fn is_canonical_amount(s: &str) -> bool {
    match s.parse::<i128>() {
        Ok(n) => n.to_string() == s,
        Err(_) => false,
    }
}
