use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrongboxError {
    // IO
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Config
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found at {0}")]
    ConfigNotFound(String),

    #[error("TOML deserialization error: {0}")]
    TomlDe(String),

    #[error("TOML serialization error: {0}")]
    TomlSer(String),

    // Database
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // Crypto
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption failed: wrong password or corrupted backup")]
    DecryptionFailed,

    #[error("Backup password is not set")]
    PasswordNotSet,

    // Archive
    #[error("Backup archive is corrupt: {0}")]
    ArchiveCorrupt(String),

    // Storage
    #[error("Storage authorization was revoked")]
    AuthRevoked,

    #[error("Storage quota exceeded")]
    QuotaExceeded,

    #[error("Backup storage tampered: {0}")]
    StorageTampered(String),

    #[error("Storage error: {0}")]
    StorageIo(String),

    #[error("Storage is not configured: {0}")]
    StorageNotConfigured(String),

    #[error("Storage setup was cancelled by the user")]
    SetupCancelledByUser,

    #[error("Storage setup failed: {0}")]
    SetupFailed(String),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    // Recovery
    #[error("Connection to base node failed after {attempts} attempts")]
    ConnectionToBaseNodeFailed { attempts: u32 },

    #[error("Scanning round failed")]
    ScanningRoundFailed,

    #[error("Recovery internal error: {0}")]
    RecoveryInternalError(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, StrongboxError>;

/// What the user should do about a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendedAction {
    Retry,
    ReEnterPassword,
    CheckStorage,
    FreeSpace,
    ReauthorizeStorage,
    DeleteWalletAndRestart,
    FixConfiguration,
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RecommendedAction::Retry => "try again later",
            RecommendedAction::ReEnterPassword => "re-enter the backup password",
            RecommendedAction::CheckStorage => "check the backup storage",
            RecommendedAction::FreeSpace => "free up space in the backup storage",
            RecommendedAction::ReauthorizeStorage => "sign in to the backup storage again",
            RecommendedAction::DeleteWalletAndRestart => {
                "delete the partially restored wallet and start again"
            }
            RecommendedAction::FixConfiguration => "fix the backup configuration",
        };
        f.write_str(text)
    }
}

impl StrongboxError {
    pub fn recommended_action(&self) -> RecommendedAction {
        match self {
            StrongboxError::DecryptionFailed => RecommendedAction::ReEnterPassword,
            StrongboxError::QuotaExceeded => RecommendedAction::FreeSpace,
            StrongboxError::AuthRevoked
            | StrongboxError::StorageNotConfigured(_)
            | StrongboxError::SetupCancelledByUser
            | StrongboxError::SetupFailed(_) => RecommendedAction::ReauthorizeStorage,
            StrongboxError::StorageTampered(_)
            | StrongboxError::ArchiveCorrupt(_)
            | StrongboxError::StorageIo(_) => RecommendedAction::CheckStorage,
            StrongboxError::ConnectionToBaseNodeFailed { .. }
            | StrongboxError::RecoveryInternalError(_) => {
                RecommendedAction::DeleteWalletAndRestart
            }
            StrongboxError::Config(_)
            | StrongboxError::ConfigNotFound(_)
            | StrongboxError::TomlDe(_)
            | StrongboxError::TomlSer(_)
            | StrongboxError::PasswordNotSet => RecommendedAction::FixConfiguration,
            StrongboxError::Io(_)
            | StrongboxError::Database(_)
            | StrongboxError::Encryption(_)
            | StrongboxError::NetworkUnavailable(_)
            | StrongboxError::ScanningRoundFailed
            | StrongboxError::Cancelled => RecommendedAction::Retry,
        }
    }

    /// Failures that are retried locally instead of surfaced one by one.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StrongboxError::NetworkUnavailable(_) | StrongboxError::ScanningRoundFailed
        )
    }

    /// Failures that should switch the backup option off instead of retrying.
    pub fn disables_option(&self) -> bool {
        matches!(
            self,
            StrongboxError::AuthRevoked | StrongboxError::QuotaExceeded
        )
    }
}

/// Cloneable projection of a terminal failure, carried inside published states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub message: String,
    pub action: RecommendedAction,
}

impl FailureCause {
    pub fn new(message: impl Into<String>, action: RecommendedAction) -> Self {
        Self {
            message: message.into(),
            action,
        }
    }
}

impl From<&StrongboxError> for FailureCause {
    fn from(err: &StrongboxError) -> Self {
        Self {
            message: err.to_string(),
            action: err.recommended_action(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.action)
    }
}
