use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::BaseNodePeer;

/// Events emitted by the engine while it rescans the chain against one base node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    ConnectingToBaseNode,
    ConnectedToBaseNode,
    ConnectionFailed,
    Progress { current: u64, total: u64 },
    ScanningRoundFailed,
    Completed,
    RecoveryFailed(String),
}

/// Wallet mutations that make the last backup stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletEvent {
    TransactionReceived,
    TransactionSent,
    TransactionMined,
    TransactionCancelled,
}

/// The native wallet engine, as seen by backup, restore and recovery.
#[async_trait]
pub trait WalletEngine: Send + Sync {
    /// Directory holding the engine's persisted state.
    fn data_directory(&self) -> PathBuf;

    /// Stop touching the data directory so its files can be swapped.
    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Begin a rescan against `peer`. `Ok(false)` means the engine refused to start.
    async fn start_recovery(&self, peer: &BaseNodePeer) -> Result<bool>;

    fn recovery_events(&self) -> broadcast::Receiver<ScanEvent>;

    fn wallet_events(&self) -> broadcast::Receiver<WalletEvent>;

    /// Remove a half-restored wallet.
    async fn delete_wallet_state(&self) -> Result<()>;
}
