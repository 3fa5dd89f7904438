use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{persistence_failure, TransferResult};
use crate::model::{RecordKind, TransferRecord};

use super::PersistentStore;

/// JSON-per-record store under a directory, one file per record id, with atomic
/// write-temp-then-rename durability on every mutation.
pub struct FileSystemStore {
    dir: PathBuf,
    index: RwLock<HashMap<String, TransferRecord>>,
}

impl FileSystemStore {
    /// Opens (creating if absent) `dir` and loads every `*.json` record already there.
    pub async fn open(dir: impl Into<PathBuf>) -> TransferResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| persistence_failure(format!("failed to create store dir: {err}")))?;

        let mut index = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|err| persistence_failure(format!("failed to read store dir: {err}")))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| persistence_failure(format!("failed to iterate store dir: {err}")))?
        {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let contents = tokio::fs::read(&path)
                    .await
                    .map_err(|err| persistence_failure(format!("failed to read record: {err}")))?;
                let record: TransferRecord = serde_json::from_slice(&contents).map_err(|err| {
                    persistence_failure(format!("failed to parse record {path:?}: {err}"))
                })?;
                index.insert(record.id().to_string(), record);
            }
        }

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn write_to_disk(&self, record: &TransferRecord) -> TransferResult<()> {
        let final_path = self.record_path(record.id());
        let temp_path = self.dir.join(format!("{}.tmp", record.id()));

        let contents = serde_json::to_vec_pretty(record)
            .map_err(|err| persistence_failure(format!("failed to serialize record: {err}")))?;
        tokio::fs::write(&temp_path, contents)
            .await
            .map_err(|err| persistence_failure(format!("failed to write record: {err}")))?;
        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|err| persistence_failure(format!("failed to commit record: {err}")))?;

        Ok(())
    }

    async fn remove_from_disk(&self, id: &str) -> TransferResult<()> {
        let path = self.record_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(persistence_failure(format!("failed to delete record: {err}"))),
        }
    }
}

#[async_trait]
impl PersistentStore for FileSystemStore {
    async fn insert(&self, record: TransferRecord) -> TransferResult<()> {
        self.write_to_disk(&record).await?;
        self.index.write().await.insert(record.id().to_string(), record);
        Ok(())
    }

    async fn update(&self, record: TransferRecord) -> TransferResult<()> {
        self.write_to_disk(&record).await?;
        self.index.write().await.insert(record.id().to_string(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> TransferResult<()> {
        let children: Vec<String> = {
            let index = self.index.read().await;
            index
                .values()
                .filter(|r| r.parent() == Some(id))
                .map(|r| r.id().to_string())
                .collect()
        };

        for child in &children {
            self.remove_from_disk(child).await?;
            self.index.write().await.remove(child);
        }

        self.remove_from_disk(id).await?;
        self.index.write().await.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> TransferResult<Option<TransferRecord>> {
        Ok(self.index.read().await.get(id).cloned())
    }

    async fn fetch_roots(&self) -> TransferResult<Vec<TransferRecord>> {
        Ok(self
            .index
            .read()
            .await
            .values()
            .filter(|r| r.kind() == RecordKind::Blob)
            .cloned()
            .collect())
    }

    async fn fetch_children(&self, blob_id: &str) -> TransferResult<Vec<TransferRecord>> {
        let mut children: Vec<TransferRecord> = self
            .index
            .read()
            .await
            .values()
            .filter(|r| r.parent() == Some(blob_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(children)
    }
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}
