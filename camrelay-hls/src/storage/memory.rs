// In-memory storage backend
//
// Data is lost when the process exits.

use super::SegmentStorage;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total payload bytes held.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.data.read().values().map(Bytes::len).sum()
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn clear(&self) {
        self.data.write().clear();
    }
}

#[async_trait]
impl SegmentStorage for MemoryStorage {
    async fn write(&self, key: &str, data: Bytes) -> Result<()> {
        self.data.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        self.data
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("Key not found: {key}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().contains_key(key))
    }
}
