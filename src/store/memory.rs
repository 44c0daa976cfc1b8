use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{ObjectStore, StoreError};

/// In-memory object store with write counting and failure injection, for tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    puts: Arc<Mutex<HashMap<String, usize>>>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation on a key starting with `prefix` fails until cleared.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_prefixes.lock().unwrap_or_else(PoisonError::into_inner).push(prefix.into());
    }

    pub fn clear_failures(&self) {
        self.fail_prefixes.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of writes to `key` so far.
    pub fn put_count(&self, key: &str) -> usize {
        self.puts.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied().unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        let failing = self
            .fail_prefixes
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?
            .iter()
            .any(|p| key.starts_with(p.as_str()));
        if failing {
            return Err(StoreError::Backend(format!("injected failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.objects
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?
            .insert(key.to_string(), data.to_vec());
        *self
            .puts
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?
            .entry(key.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check(key)?;
        Ok(self
            .objects
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.objects
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?
            .remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check(prefix)?;
        Ok(self
            .objects
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
