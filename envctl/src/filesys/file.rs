//! JSON document files

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::EnvError;

/// A file on disk addressed by path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: PathBuf,
}

impl File {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read and decode the file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, EnvError> {
        let contents = fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Encode `value` as pretty JSON and replace the file atomically through
    /// a synced sibling temp file
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), EnvError> {
        let contents = serde_json::to_vec_pretty(value)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Delete the file; a missing file is not an error
    pub async fn delete(&self) -> Result<(), EnvError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
