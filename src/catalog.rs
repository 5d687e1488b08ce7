//! In-memory volume catalog
//!
//! Default [`VolumeCatalog`] for the binary and tests. Records live in a
//! `BTreeMap` behind an async `RwLock`, the same way volume adapters track
//! provisioned volumes when no external store is attached.

use crate::domain::{VolumeCatalog, VolumeRecord, VolumeStatus};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Catalog kept in process memory
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    records: RwLock<BTreeMap<String, VolumeRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Update the status of an existing record; missing records are ignored
    pub async fn set_status(&self, id: &str, status: VolumeStatus) {
        if let Some(record) = self.records.write().await.get_mut(id) {
            record.status = status;
            record.updated_at = Utc::now();
        }
    }

    /// Drop a record
    pub async fn remove(&self, id: &str) -> Option<VolumeRecord> {
        self.records.write().await.remove(id)
    }
}

#[async_trait]
impl VolumeCatalog for MemoryCatalog {
    async fn get_volume(&self, id: &str) -> Result<Option<VolumeRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn set_volume(&self, record: VolumeRecord) -> Result<()> {
        debug!("Catalog update: {} -> {:?}", record.id, record.status);
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> VolumeRecord {
        VolumeRecord {
            id: id.to_string(),
            name: format!("volume-{}", id),
            size_gb: 1,
            pool: Some("volpool".into()),
            status: VolumeStatus::Available,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.get_volume("a").await.unwrap().is_none());

        catalog.set_volume(record("a")).await.unwrap();
        let stored = catalog.get_volume("a").await.unwrap().unwrap();
        assert_eq!(stored.name, "volume-a");

        catalog.set_status("a", VolumeStatus::InUse).await;
        let stored = catalog.get_volume("a").await.unwrap().unwrap();
        assert_eq!(stored.status, VolumeStatus::InUse);
        assert_eq!(catalog.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let catalog = MemoryCatalog::new();
        catalog.set_volume(record("a")).await.unwrap();
        assert!(catalog.remove("a").await.is_some());
        assert!(catalog.is_empty().await);
    }
}
