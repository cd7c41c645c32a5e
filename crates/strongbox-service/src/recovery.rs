use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strongbox_core::config::StrongboxConfig;
use strongbox_core::engine::{ScanEvent, WalletEngine};
use strongbox_core::error::{FailureCause, Result, StrongboxError};
use strongbox_core::state::{StatePublisher, StateStream};
use strongbox_core::types::{BaseNodePeer, RecoveryProgress, RecoveryState, RetryBudget};

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub peers: Vec<BaseNodePeer>,
    pub max_attempts_per_peer: u32,
    pub connect_timeout: Duration,
    pub scan_stall_timeout: Duration,
}

impl RecoverySettings {
    pub fn from_config(config: &StrongboxConfig) -> Self {
        Self {
            peers: config.peers.clone(),
            max_attempts_per_peer: config.recovery.max_attempts_per_peer,
            connect_timeout: config.recovery.connect_timeout(),
            scan_stall_timeout: config.recovery.scan_stall_timeout(),
        }
    }
}

/// How one attempt against one peer ended.
enum AttemptOutcome {
    Completed,
    ConnectionFailed,
    ScanFailed,
}

/// Drives the engine's rescan across the configured peers, in list order.
pub struct RecoveryCoordinator {
    engine: Arc<dyn WalletEngine>,
    settings: RecoverySettings,
    state: StatePublisher<RecoveryState>,
    running: AtomicBool,
    attempts: AtomicU32,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RecoveryCoordinator {
    pub fn new(engine: Arc<dyn WalletEngine>, settings: RecoverySettings) -> Self {
        Self {
            engine,
            settings,
            state: StatePublisher::new(RecoveryState::Idle),
            running: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn from_config(config: &StrongboxConfig, engine: Arc<dyn WalletEngine>) -> Self {
        Self::new(engine, RecoverySettings::from_config(config))
    }

    pub fn state(&self) -> RecoveryState {
        self.state.current()
    }

    pub fn subscribe(&self) -> StateStream<RecoveryState> {
        self.state.subscribe()
    }

    /// Connection attempts made by the last (or current) run.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Scan the chain until one peer completes, every peer's budget is spent or `cancel` fires.
    ///
    /// Exhausting all peers leaves the wallet half-restored; the caller decides whether to
    /// `abandon` it.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StrongboxError::RecoveryInternalError(
                "recovery is already running".to_string(),
            ));
        }
        let _running = RunningGuard(&self.running);
        self.attempts.store(0, Ordering::SeqCst);

        let peers = &self.settings.peers;
        let limit = self.settings.max_attempts_per_peer.max(1);
        info!(peers = peers.len(), max_attempts_per_peer = limit, "Recovery started");

        let mut peer_index = 0usize;
        let mut budget = RetryBudget::new(limit);
        let mut progress = RecoveryProgress::default();

        while let Some(peer) = peers.get(peer_index) {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let attempt = budget.attempt_count + 1;

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled()),
                outcome = self.attempt(peer, &mut progress) => outcome,
            };

            match outcome {
                Ok(AttemptOutcome::Completed) => {
                    self.state.publish(RecoveryState::Completed);
                    info!(peer = %peer, attempts = self.attempts(), "Recovery completed");
                    return Ok(());
                }
                Ok(AttemptOutcome::ConnectionFailed) => {
                    debug!(peer = %peer, attempt, limit, "Connection to base node failed");
                    self.state
                        .publish(RecoveryState::ConnectionFailed { attempt, limit });
                }
                Ok(AttemptOutcome::ScanFailed) => {
                    debug!(peer = %peer, attempt, limit, "Scanning round failed");
                    self.state
                        .publish(RecoveryState::ScanningRoundFailed { attempt, limit });
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Recovery failed");
                    self.state
                        .publish(RecoveryState::RecoveryFailed(FailureCause::from(&e)));
                    return Err(e);
                }
            }

            if budget.record_failure() {
                info!(peer = %peer, attempts = budget.attempt_count, "Peer exhausted, moving to next");
                peer_index += 1;
                budget.reset();
                progress = RecoveryProgress::default();
            }
        }

        let err = StrongboxError::ConnectionToBaseNodeFailed {
            attempts: self.attempts(),
        };
        warn!(attempts = self.attempts(), "Every base node failed, recovery abandoned");
        self.state
            .publish(RecoveryState::RecoveryFailed(FailureCause::from(&err)));
        Err(err)
    }

    fn cancelled(&self) -> StrongboxError {
        info!(attempts = self.attempts(), "Recovery cancelled");
        self.state.publish(RecoveryState::Cancelled);
        StrongboxError::Cancelled
    }

    async fn attempt(
        &self,
        peer: &BaseNodePeer,
        progress: &mut RecoveryProgress,
    ) -> Result<AttemptOutcome> {
        // Subscribe before starting so no early event is missed.
        let mut events = self.engine.recovery_events();
        self.state
            .publish(RecoveryState::ConnectingToBaseNode(peer.clone()));

        let timeout = self.settings.connect_timeout;
        match time::timeout(timeout, self.engine.start_recovery(peer)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                debug!(peer = %peer, "Engine refused to start recovery");
                return Ok(AttemptOutcome::ConnectionFailed);
            }
            Ok(Err(e)) if e.is_transient() => {
                debug!(peer = %peer, error = %e, "Starting recovery failed");
                return Ok(AttemptOutcome::ConnectionFailed);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(peer = %peer, "Starting recovery timed out");
                return Ok(AttemptOutcome::ConnectionFailed);
            }
        }

        let mut connected = false;
        loop {
            let event = match time::timeout(self.settings.scan_stall_timeout, events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(skipped, "Recovery event stream lagged");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(StrongboxError::RecoveryInternalError(
                        "engine closed its recovery event stream".to_string(),
                    ));
                }
                Err(_) => {
                    debug!(peer = %peer, "Recovery stalled");
                    return Ok(if connected {
                        AttemptOutcome::ScanFailed
                    } else {
                        AttemptOutcome::ConnectionFailed
                    });
                }
            };

            match event {
                ScanEvent::ConnectingToBaseNode => {}
                ScanEvent::ConnectedToBaseNode => {
                    connected = true;
                    self.state
                        .publish(RecoveryState::ConnectedToBaseNode(peer.clone()));
                }
                ScanEvent::Progress { current, total } => {
                    connected = true;
                    *progress = progress.advance(current, total);
                    debug!(
                        peer = %peer,
                        block = progress.current_block,
                        percent = progress.percent(),
                        "Scanning"
                    );
                    self.state.publish(RecoveryState::ScanningProgress(*progress));
                }
                ScanEvent::ConnectionFailed => return Ok(AttemptOutcome::ConnectionFailed),
                ScanEvent::ScanningRoundFailed => return Ok(AttemptOutcome::ScanFailed),
                ScanEvent::Completed => return Ok(AttemptOutcome::Completed),
                ScanEvent::RecoveryFailed(reason) => {
                    return Err(StrongboxError::RecoveryInternalError(reason));
                }
            }
        }
    }

    /// Delete the half-restored wallet after a failed or cancelled run.
    pub async fn abandon(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(StrongboxError::RecoveryInternalError(
                "cannot abandon while recovery is running".to_string(),
            ));
        }
        self.engine.delete_wallet_state().await?;
        self.state.publish(RecoveryState::Idle);
        info!("Half-restored wallet deleted");
        Ok(())
    }
}
