use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::scoped::StateStore;

/// Process-local [`StateStore`]; contents are lost when dropped.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStore {
    fn load(&self, scope: &str, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(&(scope.to_string(), key.to_string())).cloned())
    }

    fn save(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert((scope.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn remove(&self, scope: &str, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .remove(&(scope.to_string(), key.to_string()))
            .is_some())
    }

    fn clear_scope(&self, scope: &str) -> Result<usize> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let before = entries.len();
        entries.retain(|(s, _), _| s != scope);
        Ok(before - entries.len())
    }
}
