use async_trait::async_trait;
use std::path::Path;
use strongbox_core::error::{Result, StrongboxError};
use strongbox_core::types::StorageCredential;

/// An object stored by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Backend-specific identifier passed back to `download`/`delete`.
    pub id: String,
    /// File name without folder, as produced by the naming policy.
    pub name: String,
}

/// Result of an externally driven authorization flow.
#[derive(Debug, Clone)]
pub enum SetupOutcome {
    Granted(StorageCredential),
    Cancelled,
    Denied(String),
}

impl SetupOutcome {
    pub fn into_credential(self) -> Result<StorageCredential> {
        match self {
            SetupOutcome::Granted(credential) => Ok(credential),
            SetupOutcome::Cancelled => Err(StrongboxError::SetupCancelledByUser),
            SetupOutcome::Denied(reason) => Err(StrongboxError::SetupFailed(reason)),
        }
    }
}

/// Uniform contract over local and cloud backup storage.
///
/// Failures are reported with the shared taxonomy: `AuthRevoked`, `QuotaExceeded`,
/// `NetworkUnavailable`, `StorageNotConfigured` or `StorageIo`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Upload `file` into `folder`, keeping its file name. Returns the remote id.
    async fn upload(&self, file: &Path, folder: &str) -> Result<String>;

    /// Objects directly inside `folder`, in no particular order.
    async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>>;

    async fn download(&self, id: &str, destination: &Path) -> Result<()>;

    /// Delete an object. Deleting something already gone is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// True while the backend still needs an external authorization step.
    async fn requires_interactive_setup(&self) -> bool;

    /// Finish the authorization step with whatever the external flow produced.
    async fn complete_setup(&self, outcome: SetupOutcome) -> Result<()>;

    /// Forget any credential obtained through setup.
    async fn sign_out(&self) -> Result<()>;

    /// Backend name for display and logs.
    fn name(&self) -> &str;
}
