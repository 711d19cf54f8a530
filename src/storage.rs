//! Narrow persistence surface consumed by the permission store. The actual
//! storage mechanics (disk, browser storage, database) live behind this
//! trait; the in-memory implementation backs tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Load a value. `temporary` selects the session-scoped store.
    async fn load(&self, key: &str, temporary: bool) -> Option<Value>;

    /// Store a value, replacing any previous one under the same key.
    async fn save(&self, key: &str, value: Value, temporary: bool);
}

/// Two-scope in-memory storage: a persistent map and a session-temporary map.
#[derive(Default)]
pub struct MemoryStorage {
    persistent: RwLock<HashMap<String, Value>>,
    temporary: RwLock<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(&self, temporary: bool) -> &RwLock<HashMap<String, Value>> {
        if temporary {
            &self.temporary
        } else {
            &self.persistent
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn load(&self, key: &str, temporary: bool) -> Option<Value> {
        self.scope(temporary).read().ok()?.get(key).cloned()
    }

    async fn save(&self, key: &str, value: Value, temporary: bool) {
        if let Ok(mut map) = self.scope(temporary).write() {
            map.insert(key.to_string(), value);
        }
    }
}
