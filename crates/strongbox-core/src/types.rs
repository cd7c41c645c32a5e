use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{FailureCause, StrongboxError};

/// A storage destination the user can switch backups on for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupOption {
    Local,
    Cloud,
}

impl BackupOption {
    pub const ALL: [BackupOption; 2] = [BackupOption::Local, BackupOption::Cloud];
}

impl fmt::Display for BackupOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupOption::Local => write!(f, "local"),
            BackupOption::Cloud => write!(f, "cloud"),
        }
    }
}

impl std::str::FromStr for BackupOption {
    type Err = StrongboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(BackupOption::Local),
            "cloud" => Ok(BackupOption::Cloud),
            _ => Err(StrongboxError::Config(format!("Unknown backup option: {s}"))),
        }
    }
}

/// Concrete storage provider behind a backup option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
    /// S3-compatible: MinIO, Garage, Ceph RGW, etc.
    S3Compatible,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::S3 => write!(f, "s3"),
            BackendKind::S3Compatible => write!(f, "s3compatible"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = StrongboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "s3" => Ok(BackendKind::S3),
            "s3compatible" | "s3-compatible" | "minio" | "garage" => Ok(BackendKind::S3Compatible),
            _ => Err(StrongboxError::Config(format!("Unknown backend type: {s}"))),
        }
    }
}

/// Backup password. Zeroized on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BackupPassword(String);

impl BackupPassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for BackupPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackupPassword([REDACTED])")
    }
}

/// Opaque, backend-specific authorization handle.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StorageCredential(String);

impl StorageCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Only storage backends read the raw value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StorageCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageCredential([REDACTED])")
    }
}

/// A candidate base node used for chain rescans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BaseNodePeer {
    /// Hex-encoded public key.
    pub public_key: String,
    pub address: String,
}

impl BaseNodePeer {
    pub fn new(public_key: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            address: address.into(),
        }
    }

    pub fn public_key_bytes(&self) -> Result<Vec<u8>, StrongboxError> {
        hex::decode(&self.public_key).map_err(|e| {
            StrongboxError::Config(format!("Invalid peer public key {}: {e}", self.public_key))
        })
    }
}

impl fmt::Display for BaseNodePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.public_key.chars().take(16).collect();
        write!(f, "{short}::{}", self.address)
    }
}

/// Block scan progress within one recovery attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryProgress {
    pub current_block: u64,
    pub total_blocks: u64,
}

impl RecoveryProgress {
    pub fn new(current_block: u64, total_blocks: u64) -> Self {
        Self {
            current_block,
            total_blocks,
        }
    }

    /// Merge a newer engine report, never moving backwards.
    pub fn advance(self, current_block: u64, total_blocks: u64) -> Self {
        Self {
            current_block: self.current_block.max(current_block),
            total_blocks: self.total_blocks.max(total_blocks),
        }
    }

    pub fn percent(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        (self.current_block as f64 / self.total_blocks as f64 * 100.0).min(100.0)
    }
}

/// Connection attempts spent on the current peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub attempt_count: u32,
    pub max_attempts: u32,
}

impl RetryBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            max_attempts,
        }
    }

    /// Record a failed attempt. Returns true once the budget is spent.
    pub fn record_failure(&mut self) -> bool {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}

/// Lifecycle of one backup option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupState {
    Disabled,
    CheckingStorage,
    Scheduled,
    InProgress,
    UpToDate(DateTime<Utc>),
    StorageCheckFailed(FailureCause),
    Failed(FailureCause),
}

impl BackupState {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, BackupState::CheckingStorage | BackupState::InProgress)
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        match self {
            BackupState::UpToDate(at) => Some(*at),
            _ => None,
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupState::Disabled => write!(f, "disabled"),
            BackupState::CheckingStorage => write!(f, "checking_storage"),
            BackupState::Scheduled => write!(f, "scheduled"),
            BackupState::InProgress => write!(f, "in_progress"),
            BackupState::UpToDate(at) => write!(f, "up_to_date({})", at.to_rfc3339()),
            BackupState::StorageCheckFailed(cause) => write!(f, "storage_check_failed({cause})"),
            BackupState::Failed(cause) => write!(f, "failed({cause})"),
        }
    }
}

/// Published state of a wallet recovery scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    Idle,
    ConnectingToBaseNode(BaseNodePeer),
    ConnectedToBaseNode(BaseNodePeer),
    ScanningProgress(RecoveryProgress),
    ScanningRoundFailed { attempt: u32, limit: u32 },
    ConnectionFailed { attempt: u32, limit: u32 },
    Completed,
    RecoveryFailed(FailureCause),
    Cancelled,
}

impl RecoveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecoveryState::Completed | RecoveryState::RecoveryFailed(_) | RecoveryState::Cancelled
        )
    }
}
