use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strongbox_core::archive::ArchiveCodec;
use strongbox_core::bundler::BackupBundler;
use strongbox_core::config::{StrongboxConfig, StrongboxSettings};
use strongbox_core::crypto::CryptoCodec;
use strongbox_core::engine::{WalletEngine, WalletEvent};
use strongbox_core::error::{FailureCause, Result, StrongboxError};
use strongbox_core::prefs::PrefsStore;
use strongbox_core::state::{StatePublisher, StateStream};
use strongbox_core::types::{BackupOption, BackupPassword, BackupState};
use strongbox_storage::factory::create_backend;
use strongbox_storage::provider::{RemoteEntry, SetupOutcome, StorageBackend};

/// One pending trigger per option; anything beyond that is coalesced.
const TRIGGER_QUEUE_DEPTH: usize = 1;

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub remote_folder: String,
    pub schedule_interval: Duration,
    pub network_timeout: Duration,
    pub debounce: Duration,
    pub retain_backups: usize,
}

impl BackupSettings {
    pub fn from_config(settings: &StrongboxSettings) -> Self {
        Self {
            remote_folder: settings.remote_folder.clone(),
            schedule_interval: settings.schedule_interval(),
            network_timeout: settings.network_timeout(),
            debounce: settings.debounce(),
            retain_backups: settings.retain_backups,
        }
    }
}

/// Why a backup run was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    WalletChanged,
    UserRequest,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Queued,
    /// A run is already in progress or pending.
    Coalesced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(DateTime<Utc>),
    Coalesced,
    Disabled,
}

/// Failure of one attempt, tagged with the stage it happened in.
enum AttemptError {
    StorageCheck(StrongboxError),
    Backup(StrongboxError),
}

impl AttemptError {
    fn error(&self) -> &StrongboxError {
        match self {
            AttemptError::StorageCheck(e) | AttemptError::Backup(e) => e,
        }
    }

    fn into_error(self) -> StrongboxError {
        match self {
            AttemptError::StorageCheck(e) | AttemptError::Backup(e) => e,
        }
    }
}

/// Owns the backup state machine of every configured option.
pub struct BackupCoordinator {
    inner: Arc<CoordinatorInner>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct CoordinatorInner {
    slots: HashMap<BackupOption, Arc<OptionSlot>>,
    bundler: BackupBundler,
    prefs: Arc<PrefsStore>,
    engine: Arc<dyn WalletEngine>,
    settings: BackupSettings,
    password: RwLock<Option<BackupPassword>>,
}

struct OptionSlot {
    option: BackupOption,
    backend: Arc<dyn StorageBackend>,
    state: StatePublisher<BackupState>,
    /// Held for the whole of a backup, disable or restore.
    run_lock: Mutex<()>,
    in_progress: AtomicBool,
    current_cancel: std::sync::Mutex<Option<CancellationToken>>,
    triggers: mpsc::Sender<Trigger>,
}

impl OptionSlot {
    fn set_cancel(&self, token: Option<CancellationToken>) {
        *self
            .current_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    fn cancel_current(&self) -> bool {
        let guard = self
            .current_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl BackupCoordinator {
    /// Build everything from configuration: backends, preferences and bundler.
    pub async fn from_config(
        config: &StrongboxConfig,
        engine: Arc<dyn WalletEngine>,
    ) -> Result<Self> {
        let settings = &config.strongbox;
        let wallet_dir = if settings.wallet_dir.is_empty() {
            engine.data_directory()
        } else {
            PathBuf::from(&settings.wallet_dir)
        };
        let bundler = BackupBundler::new(
            wallet_dir,
            &settings.scratch_dir,
            ArchiveCodec::new(settings.compression_level),
            CryptoCodec::new(),
            settings.naming(),
        )
        .with_required_files(settings.required_files.clone());

        let prefs = Arc::new(PrefsStore::open(Path::new(&settings.db_path))?);

        let mut backends = Vec::with_capacity(config.backends.len());
        for backend_config in &config.backends {
            backends.push((backend_config.option, create_backend(backend_config).await?));
        }

        Self::start(
            engine,
            bundler,
            prefs,
            backends,
            BackupSettings::from_config(settings),
        )
    }

    /// Spawn one worker per option. Must be called inside a tokio runtime.
    pub fn start(
        engine: Arc<dyn WalletEngine>,
        bundler: BackupBundler,
        prefs: Arc<PrefsStore>,
        backends: Vec<(BackupOption, Arc<dyn StorageBackend>)>,
        settings: BackupSettings,
    ) -> Result<Self> {
        if settings.schedule_interval.is_zero() {
            return Err(StrongboxError::Config(
                "backup schedule interval must be non-zero".to_string(),
            ));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut slots = HashMap::new();
        let mut receivers = Vec::new();

        for (option, backend) in backends {
            let initial = prefs.load(option)?.initial_state();
            let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE_DEPTH);
            slots.insert(
                option,
                Arc::new(OptionSlot {
                    option,
                    backend,
                    state: StatePublisher::new(initial),
                    run_lock: Mutex::new(()),
                    in_progress: AtomicBool::new(false),
                    current_cancel: std::sync::Mutex::new(None),
                    triggers: trigger_tx,
                }),
            );
            receivers.push((option, trigger_rx));
        }

        let inner = Arc::new(CoordinatorInner {
            slots,
            bundler,
            prefs,
            engine,
            settings,
            password: RwLock::new(None),
        });

        let mut workers = Vec::with_capacity(receivers.len());
        for (option, trigger_rx) in receivers {
            let worker_inner = Arc::clone(&inner);
            let mut worker_shutdown = shutdown_rx.clone();
            workers.push(tokio::spawn(async move {
                run_worker(worker_inner, option, trigger_rx, &mut worker_shutdown).await;
            }));
        }

        info!(
            options = inner.slots.len(),
            schedule_secs = inner.settings.schedule_interval.as_secs(),
            retain = inner.settings.retain_backups,
            "Backup coordinator started"
        );

        Ok(Self {
            inner,
            shutdown: shutdown_tx,
            workers: Mutex::new(workers),
        })
    }

    fn slot(&self, option: BackupOption) -> Result<&Arc<OptionSlot>> {
        self.inner.slot(option)
    }

    pub async fn set_password(&self, password: BackupPassword) {
        *self.inner.password.write().await = Some(password);
    }

    pub async fn clear_password(&self) {
        *self.inner.password.write().await = None;
    }

    pub fn state(&self, option: BackupOption) -> Result<BackupState> {
        Ok(self.slot(option)?.state.current())
    }

    /// Ordered state transitions for `option`, starting from its current state.
    pub fn subscribe(&self, option: BackupOption) -> Result<StateStream<BackupState>> {
        Ok(self.slot(option)?.state.subscribe())
    }

    /// Last successful backup, kept across failures and restarts.
    pub fn last_success(&self, option: BackupOption) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.prefs.load(option)?.last_success)
    }

    pub fn is_enabled(&self, option: BackupOption) -> Result<bool> {
        Ok(self.inner.prefs.load(option)?.enabled)
    }

    /// Recorded `(level, message)` lines for `option`, newest first.
    pub fn recent_logs(&self, option: BackupOption, limit: u32) -> Result<Vec<(String, String)>> {
        self.slot(option)?;
        self.inner.prefs.recent_logs(option, limit)
    }

    /// Queue a backup without waiting for it.
    pub fn trigger(&self, option: BackupOption, trigger: Trigger) -> Result<TriggerOutcome> {
        self.inner.trigger(self.slot(option)?, trigger)
    }

    /// Run a backup now and wait for it. A run already in progress is not duplicated.
    pub async fn backup_now(&self, option: BackupOption) -> Result<RunOutcome> {
        let slot = Arc::clone(self.slot(option)?);
        self.inner.run_backup(&slot, Trigger::UserRequest).await
    }

    /// Feed the engine's wallet events into every enabled option.
    pub async fn attach_wallet_events(&self, mut events: broadcast::Receiver<WalletEvent>) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            debug!(?event, "Wallet changed");
                            for slot in inner.slots.values() {
                                if let Err(e) = inner.trigger(slot, Trigger::WalletChanged) {
                                    warn!(option = %slot.option, error = %e, "Failed to queue backup");
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Wallet event stream lagged");
                            for slot in inner.slots.values() {
                                let _ = inner.trigger(slot, Trigger::WalletChanged);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        self.workers.lock().await.push(handle);
    }

    /// Wait for the external authorization flow, hand its result to the backend and
    /// switch the option on. `cancel` abandons the wait.
    pub async fn setup_storage<F>(
        &self,
        option: BackupOption,
        outcome: F,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        F: Future<Output = SetupOutcome> + Send,
    {
        let slot = self.slot(option)?;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => SetupOutcome::Cancelled,
            outcome = outcome => outcome,
        };
        if let Err(e) = slot.backend.complete_setup(outcome).await {
            warn!(option = %option, error = %e, "Storage setup did not complete");
            return Err(e);
        }
        info!(option = %option, backend = slot.backend.name(), "Storage setup completed");
        self.enable(option).await
    }

    /// Turn backups on for `option` and queue a first run.
    pub async fn enable(&self, option: BackupOption) -> Result<()> {
        let slot = self.slot(option)?;
        if slot.backend.requires_interactive_setup().await {
            return Err(StrongboxError::StorageNotConfigured(
                slot.backend.name().to_string(),
            ));
        }
        self.inner.prefs.set_enabled(option, true)?;
        self.inner.log(option, "info", "Backups enabled");
        slot.state.publish(BackupState::Scheduled);
        self.inner.trigger(slot, Trigger::UserRequest)?;
        Ok(())
    }

    /// Turn backups off for `option` and delete every remote archive it owns.
    /// Deletion is best-effort: failures are logged, not returned.
    pub async fn disable(&self, option: BackupOption) -> Result<()> {
        let slot = Arc::clone(self.slot(option)?);
        slot.cancel_current();
        let _guard = slot.run_lock.lock().await;
        let inner = &self.inner;

        let folder = inner.settings.remote_folder.as_str();
        match inner.timed("list", slot.backend.list(folder)).await {
            Ok(entries) => {
                for entry in entries
                    .iter()
                    .filter(|e| inner.bundler.naming().is_backup_name(&e.name))
                {
                    match inner.timed("delete", slot.backend.delete(&entry.id)).await {
                        Ok(()) => debug!(option = %option, name = %entry.name, "Deleted remote backup"),
                        Err(e) => {
                            warn!(option = %option, name = %entry.name, error = %e, "Failed to delete remote backup")
                        }
                    }
                }
            }
            Err(e) => warn!(option = %option, error = %e, "Could not list remote backups to delete"),
        }

        if let Err(e) = slot.backend.sign_out().await {
            warn!(option = %option, error = %e, "Storage sign-out failed");
        }
        inner.prefs.set_enabled(option, false)?;
        inner.log(option, "info", "Backups disabled");
        slot.state.publish(BackupState::Disabled);
        info!(option = %option, "Backups disabled");
        Ok(())
    }

    /// Ask the running backup of `option` to stop at its next checkpoint.
    pub fn cancel_current(&self, option: BackupOption) -> Result<bool> {
        Ok(self.slot(option)?.cancel_current())
    }

    /// Download the newest archive of `option` and restore it into the wallet directory.
    /// Returns the name of the restored archive.
    pub async fn restore_latest(
        &self,
        option: BackupOption,
        password: &BackupPassword,
    ) -> Result<String> {
        let slot = Arc::clone(self.slot(option)?);
        let _guard = slot.run_lock.lock().await;
        let inner = &self.inner;

        let entries = inner
            .timed("list", slot.backend.list(&inner.settings.remote_folder))
            .await?;
        let newest = inner
            .bundler
            .naming()
            .newest_by(&entries, |e| e.name.as_str())
            .cloned()
            .ok_or_else(|| {
                StrongboxError::StorageTampered(format!("no backup found in {}", slot.backend.name()))
            })?;
        info!(option = %option, name = %newest.name, "Restoring newest backup");

        let scratch = inner.bundler.scratch_dir()?;
        let downloaded = scratch.path().join(&newest.name);
        inner
            .timed("download", slot.backend.download(&newest.id, &downloaded))
            .await?;

        inner.engine.pause().await?;
        let bundler = inner.bundler.clone();
        let password = password.clone();
        let restored = tokio::task::spawn_blocking(move || {
            bundler.restore_bundle(&downloaded, &password)
        })
        .await
        .map_err(|e| StrongboxError::RecoveryInternalError(format!("restore task failed: {e}")));
        if let Err(e) = inner.engine.resume().await {
            warn!(error = %e, "Wallet engine failed to resume after restore");
        }

        let stats = restored??;
        info!(option = %option, name = %newest.name, files = stats.files, "Restore complete");
        Ok(newest.name)
    }

    pub async fn shutdown(&self) {
        for slot in self.inner.slots.values() {
            slot.cancel_current();
        }
        if self.shutdown.send(true).is_ok() {
            let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
            for handle in handles {
                if let Err(err) = handle.await {
                    debug!(?err, "backup worker exited with error");
                }
            }
        }
    }
}

impl Drop for BackupCoordinator {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl CoordinatorInner {
    fn slot(&self, option: BackupOption) -> Result<&Arc<OptionSlot>> {
        self.slots
            .get(&option)
            .ok_or_else(|| StrongboxError::StorageNotConfigured(option.to_string()))
    }

    fn log(&self, option: BackupOption, level: &str, message: &str) {
        if let Err(e) = self.prefs.log(option, level, message) {
            debug!(option = %option, error = %e, "Failed to record backup log");
        }
    }

    fn trigger(&self, slot: &OptionSlot, trigger: Trigger) -> Result<TriggerOutcome> {
        if slot.in_progress.load(Ordering::SeqCst) {
            debug!(option = %slot.option, ?trigger, "Backup running, trigger coalesced");
            return Ok(TriggerOutcome::Coalesced);
        }
        match slot.triggers.try_send(trigger) {
            Ok(()) => Ok(TriggerOutcome::Queued),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(TriggerOutcome::Coalesced),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(StrongboxError::RecoveryInternalError(
                format!("backup worker for {} is not running", slot.option),
            )),
        }
    }

    /// Run `fut` under the network timeout.
    async fn timed<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match time::timeout(self.settings.network_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StrongboxError::NetworkUnavailable(format!(
                "{what} timed out after {:?}",
                self.settings.network_timeout
            ))),
        }
    }

    /// Like `timed`, but also gives up when `cancel` fires.
    async fn guarded<T>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = cancel.cancelled() => Err(StrongboxError::Cancelled),
            result = self.timed(what, fut) => result,
        }
    }

    async fn run_backup(&self, slot: &Arc<OptionSlot>, trigger: Trigger) -> Result<RunOutcome> {
        let Ok(_guard) = slot.run_lock.try_lock() else {
            debug!(option = %slot.option, ?trigger, "Backup already running, coalesced");
            return Ok(RunOutcome::Coalesced);
        };
        if !self.prefs.load(slot.option)?.enabled {
            debug!(option = %slot.option, ?trigger, "Backups disabled, skipping");
            return Ok(RunOutcome::Disabled);
        }

        let cancel = CancellationToken::new();
        slot.set_cancel(Some(cancel.clone()));
        slot.in_progress.store(true, Ordering::SeqCst);
        info!(option = %slot.option, ?trigger, "Backup started");

        let result = self.attempt(slot, &cancel).await;

        slot.in_progress.store(false, Ordering::SeqCst);
        slot.set_cancel(None);

        match result {
            Ok(at) => {
                if let Err(e) = self.prefs.record_success(slot.option, at) {
                    warn!(option = %slot.option, error = %e, "Backup uploaded but success was not persisted");
                }
                self.log(slot.option, "info", "Backup completed");
                slot.state.publish(BackupState::UpToDate(at));
                info!(option = %slot.option, at = %at, "Backup completed");
                Ok(RunOutcome::Completed(at))
            }
            Err(failure) => {
                self.record_failure(slot, &failure).await;
                Err(failure.into_error())
            }
        }
    }

    async fn attempt(
        &self,
        slot: &OptionSlot,
        cancel: &CancellationToken,
    ) -> std::result::Result<DateTime<Utc>, AttemptError> {
        let password = self
            .password
            .read()
            .await
            .clone()
            .ok_or(AttemptError::Backup(StrongboxError::PasswordNotSet))?;
        let folder = self.settings.remote_folder.as_str();

        slot.state.publish(BackupState::Scheduled);
        slot.state.publish(BackupState::CheckingStorage);
        let existing = self
            .guarded("list", cancel, slot.backend.list(folder))
            .await
            .map_err(|e| match e {
                StrongboxError::Cancelled => AttemptError::Backup(e),
                e => AttemptError::StorageCheck(e),
            })?;

        slot.state.publish(BackupState::InProgress);
        let bundler = self.bundler.clone();
        let bundle_cancel = cancel.clone();
        let bundle = tokio::task::spawn_blocking(move || {
            bundler.create_bundle(&password, &bundle_cancel)
        })
        .await
        .map_err(|e| {
            AttemptError::Backup(StrongboxError::RecoveryInternalError(format!(
                "bundle task failed: {e}"
            )))
        })?
        .map_err(AttemptError::Backup)?;

        let id = self
            .guarded("upload", cancel, slot.backend.upload(bundle.path(), folder))
            .await
            .map_err(AttemptError::Backup)?;
        debug!(option = %slot.option, id = %id, "Backup uploaded");

        self.prune(slot, &existing, &bundle.name).await;
        Ok(bundle.created_at)
    }

    /// Delete archives beyond the retention count, oldest first. Best-effort.
    async fn prune(&self, slot: &OptionSlot, existing: &[RemoteEntry], uploaded: &str) {
        let retain = self.settings.retain_backups;
        if retain == 0 {
            return;
        }
        let naming = self.bundler.naming();
        let mut older: Vec<(DateTime<Utc>, &RemoteEntry)> = existing
            .iter()
            .filter(|e| e.name != uploaded)
            .filter_map(|e| naming.parse(&e.name).map(|at| (at, e)))
            .collect();
        older.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, entry) in older.into_iter().skip(retain.saturating_sub(1)) {
            match self.timed("delete", slot.backend.delete(&entry.id)).await {
                Ok(()) => debug!(option = %slot.option, name = %entry.name, "Pruned old backup"),
                Err(e) => warn!(option = %slot.option, name = %entry.name, error = %e, "Failed to prune old backup"),
            }
        }
    }

    async fn record_failure(&self, slot: &OptionSlot, failure: &AttemptError) {
        let err = failure.error();
        let cause = FailureCause::from(err);
        warn!(option = %slot.option, error = %err, action = %cause.action, "Backup failed");

        if let Err(e) = self.prefs.record_failure(slot.option, Utc::now(), &cause) {
            warn!(option = %slot.option, error = %e, "Failed to persist backup failure");
        }
        self.log(slot.option, "error", &cause.message);

        if err.disables_option() {
            if let Err(e) = self.prefs.set_enabled(slot.option, false) {
                warn!(option = %slot.option, error = %e, "Failed to disable backup option");
            }
            if matches!(err, StrongboxError::AuthRevoked) {
                if let Err(e) = slot.backend.sign_out().await {
                    debug!(option = %slot.option, error = %e, "Storage sign-out failed");
                }
            }
            info!(option = %slot.option, "Backup option switched off after storage failure");
        }

        let state = match failure {
            AttemptError::StorageCheck(_) => BackupState::StorageCheckFailed(cause),
            AttemptError::Backup(_) => BackupState::Failed(cause),
        };
        slot.state.publish(state);
    }
}

async fn run_worker(
    inner: Arc<CoordinatorInner>,
    option: BackupOption,
    mut triggers: mpsc::Receiver<Trigger>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let Ok(slot) = inner.slot(option).cloned() else {
        return;
    };
    let interval = inner.settings.schedule_interval;
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            trigger = triggers.recv() => match trigger {
                Some(trigger) => trigger,
                None => break,
            },
            _ = ticker.tick() => Trigger::Scheduled,
        };

        if trigger == Trigger::WalletChanged && !inner.settings.debounce.is_zero() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = time::sleep(inner.settings.debounce) => {}
            }
            while triggers.try_recv().is_ok() {}
        }

        match inner.run_backup(&slot, trigger).await {
            Ok(outcome) => debug!(option = %option, ?trigger, ?outcome, "Backup run finished"),
            Err(e) => debug!(option = %option, ?trigger, error = %e, "Backup run failed"),
        }
    }

    debug!(option = %option, "backup worker exiting");
}
