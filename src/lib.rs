//! Command-execution core for KeepKey hardware signing devices.
//!
//! Accepts structured requests from an untrusted caller, validates them,
//! enforces a per-origin/per-device permission model, negotiates firmware
//! compatibility, optionally discovers accounts on the device's behalf, and
//! sequences human confirmations before executing privileged device
//! operations. Transport, backend, UI and storage collaborators plug in
//! behind the narrow traits in [`device`], [`backend`], [`ui`] and
//! [`storage`].
//!
//! ```no_run
//! # async fn demo(ctx: keepkey_connect::MethodContext) -> keepkey_connect::Result<()> {
//! let response = keepkey_connect::call(&ctx, &serde_json::json!({
//!     "method": "ethereumGetAddress",
//!     "path": "m/44'/60'/0'/0/0",
//! })).await?;
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod backend;
pub mod coins;
pub mod device;
pub mod discovery;
pub mod error;
pub mod firmware;
pub mod methods;
pub mod params;
pub mod paths;
pub mod permissions;
pub mod storage;
pub mod ui;

pub use account::{Account, AccountSummary};
pub use error::{ConnectError, Result};
pub use methods::{call, create_method, execute_method, Method, MethodContext, MethodKind};
