//! Filesystem-backed checkpoint storage.
//!
//! Implements `CheckpointStorage` from `taskflow-core` with one JSON
//! document per checkpoint:
//!
//! ```text
//! {root}/
//!   {instance_id}/
//!     {checkpoint_id}.json
//! ```
//!
//! Writes go to a temporary file first and are renamed into place, so a
//! crash never leaves a half-written checkpoint behind.

use std::path::{Path, PathBuf};

use taskflow_core::rollback::CheckpointStorage;
use taskflow_types::error::StorageError;
use taskflow_types::rollback::Checkpoint;
use uuid::Uuid;

const EXTENSION: &str = "json";

/// Checkpoint storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStorage {
    root: PathBuf,
}

impl FileCheckpointStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn instance_dir(&self, instance_id: Uuid) -> PathBuf {
        self.root.join(instance_id.to_string())
    }

    fn checkpoint_path(&self, instance_id: Uuid, checkpoint_id: Uuid) -> PathBuf {
        self.instance_dir(instance_id)
            .join(format!("{checkpoint_id}.{EXTENSION}"))
    }

    /// Locate a checkpoint file without knowing its instance.
    async fn find(&self, checkpoint_id: Uuid) -> Result<Option<PathBuf>, StorageError> {
        let file_name = format!("{checkpoint_id}.{EXTENSION}");
        let mut instances = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = instances.next_entry().await? {
            let candidate = entry.path().join(&file_name);
            if tokio::fs::try_exists(&candidate).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn read(path: &Path) -> Result<Checkpoint, StorageError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every readable checkpoint of one instance, oldest first. Unparsable
    /// files are skipped with a warning.
    async fn load_instance(&self, instance_id: Uuid) -> Result<Vec<Checkpoint>, StorageError> {
        let mut entries = match tokio::fs::read_dir(self.instance_dir(instance_id)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match Self::read(&path).await {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable checkpoint");
                }
            }
        }
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(checkpoints)
    }
}

impl CheckpointStorage for FileCheckpointStorage {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let dir = self.instance_dir(checkpoint.instance_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.checkpoint_path(checkpoint.instance_id, checkpoint.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(
            checkpoint_id = %checkpoint.id,
            path = %path.display(),
            "checkpoint written"
        );
        Ok(())
    }

    async fn get(&self, checkpoint_id: Uuid) -> Result<Option<Checkpoint>, StorageError> {
        match self.find(checkpoint_id).await? {
            Some(path) => Ok(Some(Self::read(&path).await?)),
            None => Ok(None),
        }
    }

    async fn get_all_for_workflow(&self, instance_id: Uuid) -> Result<Vec<Checkpoint>, StorageError> {
        self.load_instance(instance_id).await
    }

    async fn delete(&self, checkpoint_id: Uuid) -> Result<bool, StorageError> {
        let Some(path) = self.find(checkpoint_id).await? else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_all_for_workflow(&self, instance_id: Uuid) -> Result<usize, StorageError> {
        let count = self.load_instance(instance_id).await?.len();
        match tokio::fs::remove_dir_all(self.instance_dir(instance_id)).await {
            Ok(()) => Ok(count),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_latest(&self, instance_id: Uuid) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self.load_instance(instance_id).await?.pop())
    }

    async fn count(&self, instance_id: Uuid) -> Result<usize, StorageError> {
        Ok(self.load_instance(instance_id).await?.len())
    }
}
