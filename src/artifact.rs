//! Filesystem persistence for model bundles and their timestamped backups.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::info;

use crate::model::{ModelError, ModelKind};

const BACKUP_DIR: &str = "backups";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, kind: ModelKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind.artifact_name()))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    pub fn exists(&self, kind: ModelKind) -> bool {
        self.path(kind).is_file()
    }

    /// Writes to a temp file in the same directory and renames it over the
    /// target, so readers never observe a partial bundle.
    pub fn save<T: Serialize>(&self, kind: ModelKind, bundle: &T) -> Result<PathBuf, ModelError> {
        let path = self.path(kind);
        fs::create_dir_all(&self.dir).map_err(|e| ModelError::persistence(&self.dir, e))?;

        let tmp = NamedTempFile::new_in(&self.dir).map_err(|e| ModelError::persistence(&path, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, bundle)
                .map_err(|e| ModelError::persistence(&path, e))?;
            writer.flush().map_err(|e| ModelError::persistence(&path, e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| ModelError::persistence(&path, e))?;
        tmp.persist(&path)
            .map_err(|e| ModelError::persistence(&path, e.error))?;

        info!(
            component = "artifact",
            event = "artifact.saved",
            model = kind.as_str(),
            path = %path.display()
        );
        Ok(path)
    }

    /// `NotFound` when nothing has been persisted for `kind`.
    pub fn load<T: DeserializeOwned>(&self, kind: ModelKind) -> Result<T, ModelError> {
        let path = self.path(kind);
        if !path.is_file() {
            return Err(ModelError::NotFound { kind, path });
        }
        let raw = fs::read(&path).map_err(|e| ModelError::persistence(&path, e))?;
        serde_json::from_slice(&raw)
            .map_err(|e| ModelError::persistence(&path, format!("corrupt bundle: {e}")))
    }

    /// Copies the current artifact to a timestamped backup. `Ok(None)` when
    /// there is nothing to back up.
    pub fn backup(&self, kind: ModelKind, at: DateTime<Utc>) -> Result<Option<PathBuf>, ModelError> {
        let current = self.path(kind);
        if !current.is_file() {
            return Ok(None);
        }
        let dir = self.backup_dir();
        fs::create_dir_all(&dir).map_err(|e| ModelError::persistence(&dir, e))?;
        let target = dir.join(format!(
            "{}_{}.json",
            kind.artifact_name(),
            at.format("%Y%m%d_%H%M%S_%3f")
        ));
        fs::copy(&current, &target).map_err(|e| ModelError::persistence(&target, e))?;
        info!(
            component = "artifact",
            event = "artifact.backup",
            model = kind.as_str(),
            path = %target.display()
        );
        Ok(Some(target))
    }

    /// Backups for `kind`, oldest first.
    pub fn list_backups(&self, kind: ModelKind) -> Result<Vec<PathBuf>, ModelError> {
        let dir = self.backup_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", kind.artifact_name());
        let mut backups: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| ModelError::persistence(&dir, e))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
            })
            .collect();
        backups.sort();
        Ok(backups)
    }

    /// Puts `backup` back in place of the current artifact.
    pub fn restore_backup(&self, kind: ModelKind, backup: &Path) -> Result<(), ModelError> {
        let path = self.path(kind);
        let bytes = fs::read(backup).map_err(|e| ModelError::persistence(backup, e))?;
        let mut tmp =
            NamedTempFile::new_in(&self.dir).map_err(|e| ModelError::persistence(&path, e))?;
        tmp.write_all(&bytes)
            .map_err(|e| ModelError::persistence(&path, e))?;
        tmp.persist(&path)
            .map_err(|e| ModelError::persistence(&path, e.error))?;

        info!(
            component = "artifact",
            event = "artifact.restored",
            model = kind.as_str(),
            from = %backup.display()
        );
        Ok(())
    }
}
