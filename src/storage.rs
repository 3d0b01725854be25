//! Key-value storage contract for server-side state
//!
//! The core only relies on [`Storage`]; persistence is up to the integrator.
//! [`MemoryStorage`] keeps everything in process memory.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::Result;

/// Key prefix of user records (`user:<name>` → password)
pub const USER_PREFIX: &str = "user:";

/// String key/value backend. No ordering or transactional guarantees.
pub trait Storage: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Returns `None` when the key is absent
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn del(&self, key: &str) -> Result<()>;

    fn all(&self) -> Result<HashMap<String, String>>;
}

/// Key under which a user's password is stored
pub fn user_key(name: &str) -> String {
    format!("{}{}", USER_PREFIX, name)
}

/// In-memory storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a user record
    pub fn with_user(self, name: &str, password: &str) -> Self {
        self.entries.write().insert(user_key(name), password.to_string());
        self
    }
}

impl Storage for MemoryStorage {
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn all(&self) -> Result<HashMap<String, String>> {
        Ok(self.entries.read().clone())
    }
}
