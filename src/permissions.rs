//! Per-origin, per-device permission grants. Grants are append-only records
//! deduplicated by the full `(origin, permission, device)` tuple; a grant is
//! either persistent or session-scoped, chosen at save time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::Storage;

pub const PERMISSIONS_KEY: &str = "permissions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Management,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Management => "management",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    pub origin: String,
    pub permission: Permission,
    pub device: String,
}

#[derive(Clone)]
pub struct PermissionStore {
    storage: Arc<dyn Storage>,
}

impl PermissionStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    async fn load_grants(&self, temporary: bool) -> Vec<PermissionGrant> {
        match self.storage.load(PERMISSIONS_KEY, temporary).await {
            Some(value) => serde_json::from_value(value).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn all_grants(&self) -> Vec<PermissionGrant> {
        let mut grants = self.load_grants(false).await;
        grants.extend(self.load_grants(true).await);
        grants
    }

    /// Subset of `required` not yet granted for `(origin, device_id)`.
    /// Never fails; absence of permission routes to the interactive flow.
    pub async fn check(
        &self,
        required: &[Permission],
        origin: &str,
        device_id: &str,
    ) -> Vec<Permission> {
        let grants = self.all_grants().await;
        required
            .iter()
            .copied()
            .filter(|p| {
                !grants
                    .iter()
                    .any(|g| g.origin == origin && g.permission == *p && g.device == device_id)
            })
            .collect()
    }

    /// Persist `permissions` for `(origin, device_id)`, deduplicating against
    /// existing grants for the same origin. Returns true when this save is
    /// the first-ever `read` grant for this device from this origin, which
    /// triggers a one-time device-connected notification upstream.
    pub async fn save(
        &self,
        permissions: &[Permission],
        origin: &str,
        device_id: &str,
        temporary: bool,
    ) -> bool {
        let existing = self.load_grants(temporary).await;

        let first_read_grant = permissions.contains(&Permission::Read)
            && !existing.iter().any(|g| {
                g.origin == origin && g.permission == Permission::Read && g.device == device_id
            });

        let mut to_save: Vec<PermissionGrant> = permissions
            .iter()
            .map(|p| PermissionGrant {
                origin: origin.to_string(),
                permission: *p,
                device: device_id.to_string(),
            })
            .collect();
        to_save.retain(|grant| !existing.contains(grant));

        if !to_save.is_empty() {
            debug!(origin, device_id, count = to_save.len(), temporary, "saving permission grants");
            let mut grants = existing;
            grants.extend(to_save);
            if let Ok(value) = serde_json::to_value(&grants) {
                self.storage.save(PERMISSIONS_KEY, value, temporary).await;
            }
        }

        first_read_grant
    }
}
