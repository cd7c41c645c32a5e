use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use strongbox_core::error::{Result, StrongboxError};
use tokio::sync::RwLock;
use tracing::debug;

use crate::provider::{RemoteEntry, SetupOutcome, StorageBackend};

const PARTIAL_SUFFIX: &str = ".partial";

/// Filesystem-backed storage, e.g. a folder on removable media or a synced drive.
///
/// The target folder is either fixed at construction or picked by the user during setup;
/// the credential handed to `complete_setup` is that folder's path.
pub struct LocalBackend {
    root: RwLock<Option<PathBuf>>,
    /// Folder came from configuration and survives `sign_out`.
    fixed: bool,
    name: String,
}

impl LocalBackend {
    /// A backend that still needs its folder chosen through setup.
    pub fn new(name: &str) -> Self {
        Self {
            root: RwLock::new(None),
            fixed: false,
            name: name.to_string(),
        }
    }

    pub fn with_root(root: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(map_io)?;
        Ok(Self {
            root: RwLock::new(Some(root.to_path_buf())),
            fixed: true,
            name: name.to_string(),
        })
    }

    async fn root(&self) -> Result<PathBuf> {
        let root = self
            .root
            .read()
            .await
            .clone()
            .ok_or_else(|| StrongboxError::StorageNotConfigured(self.name.clone()))?;
        // A folder that disappeared (unmounted, deleted) means access is gone.
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            return Err(StrongboxError::AuthRevoked);
        }
        Ok(root)
    }

    async fn resolve(&self, id: &str) -> Result<PathBuf> {
        Ok(self.root().await?.join(checked_relative(id)?))
    }
}

/// Reject ids and folders that would leave the backend root.
fn checked_relative(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(StrongboxError::StorageIo(format!(
                    "invalid storage path '{raw}'"
                )));
            }
        }
    }
    Ok(clean)
}

fn map_io(err: std::io::Error) -> StrongboxError {
    match err.kind() {
        ErrorKind::StorageFull => StrongboxError::QuotaExceeded,
        ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => StrongboxError::AuthRevoked,
        _ => StrongboxError::StorageIo(err.to_string()),
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn upload(&self, file: &Path, folder: &str) -> Result<String> {
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StrongboxError::StorageIo(format!("invalid file {}", file.display())))?;
        let folder_rel = checked_relative(folder)?;
        let dir = self.root().await?.join(&folder_rel);
        tokio::fs::create_dir_all(&dir).await.map_err(map_io)?;

        let target = dir.join(file_name);
        let partial = dir.join(format!("{file_name}{PARTIAL_SUFFIX}"));
        if let Err(e) = tokio::fs::copy(file, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(map_io(e));
        }
        tokio::fs::rename(&partial, &target).await.map_err(map_io)?;

        let id = folder_rel.join(file_name).to_string_lossy().replace('\\', "/");
        debug!(backend = %self.name, id = %id, "Uploaded to local storage");
        Ok(id)
    }

    async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
        let folder_rel = checked_relative(folder)?;
        let dir = self.root().await?.join(&folder_rel);
        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(map_io(e)),
        };
        while let Some(entry) = read_dir.next_entry().await.map_err(map_io)? {
            if !entry.file_type().await.map_err(map_io)?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.ends_with(PARTIAL_SUFFIX) {
                continue;
            }
            let id = folder_rel.join(&name).to_string_lossy().replace('\\', "/");
            entries.push(RemoteEntry { id, name });
        }
        Ok(entries)
    }

    async fn download(&self, id: &str, destination: &Path) -> Result<()> {
        let source = self.resolve(id).await?;
        tokio::fs::copy(&source, destination).await.map_err(map_io)?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.resolve(id).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(e)),
        }
    }

    async fn requires_interactive_setup(&self) -> bool {
        self.root.read().await.is_none()
    }

    async fn complete_setup(&self, outcome: SetupOutcome) -> Result<()> {
        let credential = outcome.into_credential()?;
        let root = PathBuf::from(credential.expose());
        let metadata = tokio::fs::metadata(&root)
            .await
            .map_err(|e| StrongboxError::SetupFailed(format!("{}: {e}", root.display())))?;
        if !metadata.is_dir() {
            return Err(StrongboxError::SetupFailed(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        *self.root.write().await = Some(root);
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        if !self.fixed {
            *self.root.write().await = None;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
