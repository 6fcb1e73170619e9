//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::EnvError;
use crate::filesys::file::File;
use crate::utils::generate_uuid;

/// A directory addressed by path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory and its parents
    pub async fn create(&self) -> Result<(), EnvError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and everything below it
    pub async fn delete(&self) -> Result<(), EnvError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Create a uniquely named directory under the system temp dir
    pub async fn create_temp_dir(prefix: &str) -> Result<Dir, EnvError> {
        let name = format!("{}-{}", prefix, generate_uuid());
        let dir = Dir::new(std::env::temp_dir().join(name));
        dir.create().await?;
        Ok(dir)
    }
}
