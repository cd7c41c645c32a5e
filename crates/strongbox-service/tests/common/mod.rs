#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};

use strongbox_core::archive::ArchiveCodec;
use strongbox_core::bundler::BackupBundler;
use strongbox_core::crypto::{CryptoCodec, KdfParams};
use strongbox_core::engine::{ScanEvent, WalletEngine, WalletEvent};
use strongbox_core::error::{Result, StrongboxError};
use strongbox_core::naming::NamingPolicy;
use strongbox_core::types::BaseNodePeer;
use strongbox_service::BackupSettings;
use strongbox_storage::local::LocalBackend;
use strongbox_storage::provider::{RemoteEntry, SetupOutcome, StorageBackend};

pub const FOLDER: &str = "backups";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn naming() -> NamingPolicy {
    NamingPolicy::new("B", "tar.zst.enc")
}

pub fn bundler(wallet_dir: &Path, scratch: &Path) -> BackupBundler {
    let crypto = CryptoCodec::with_params(KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    })
    .unwrap();
    BackupBundler::new(wallet_dir, scratch, ArchiveCodec::default(), crypto, naming())
}

pub fn settings() -> BackupSettings {
    BackupSettings {
        remote_folder: FOLDER.to_string(),
        schedule_interval: Duration::from_secs(3600),
        network_timeout: Duration::from_secs(5),
        debounce: Duration::from_millis(50),
        retain_backups: 0,
    }
}

pub fn peer(n: u32) -> BaseNodePeer {
    BaseNodePeer::new(format!("{n:064x}"), format!("/ip4/10.0.0.{n}/tcp/18189"))
}

/// What the fake engine does when asked to recover against a peer.
#[derive(Debug, Clone)]
pub enum PeerScript {
    /// `start_recovery` returns false.
    Refuse,
    /// `start_recovery` succeeds, then these events are emitted.
    Events(Vec<ScanEvent>),
    /// `start_recovery` succeeds and nothing else happens.
    Silent,
    /// `start_recovery` returns this error.
    Fail(fn() -> StrongboxError),
}

pub struct FakeEngine {
    data_dir: PathBuf,
    scan_tx: broadcast::Sender<ScanEvent>,
    wallet_tx: broadcast::Sender<WalletEvent>,
    scripts: Mutex<HashMap<String, Vec<PeerScript>>>,
    started: Mutex<Vec<String>>,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    pub deleted: AtomicBool,
}

impl FakeEngine {
    pub fn new(data_dir: &Path) -> Arc<Self> {
        let (scan_tx, _) = broadcast::channel(256);
        let (wallet_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            data_dir: data_dir.to_path_buf(),
            scan_tx,
            wallet_tx,
            scripts: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
            deleted: AtomicBool::new(false),
        })
    }

    /// Scripts are consumed in order; the last one repeats.
    pub fn script(&self, peer: &BaseNodePeer, scripts: Vec<PeerScript>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(peer.address.clone(), scripts);
    }

    pub fn emit_wallet_event(&self, event: WalletEvent) {
        let _ = self.wallet_tx.send(event);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn next_script(&self, peer: &BaseNodePeer) -> PeerScript {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&peer.address) {
            Some(list) if list.len() > 1 => list.remove(0),
            Some(list) => list.first().cloned().unwrap_or(PeerScript::Refuse),
            None => PeerScript::Refuse,
        }
    }
}

#[async_trait]
impl WalletEngine for FakeEngine {
    fn data_directory(&self) -> PathBuf {
        self.data_dir.clone()
    }

    async fn pause(&self) -> Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_recovery(&self, peer: &BaseNodePeer) -> Result<bool> {
        self.started.lock().unwrap().push(peer.address.clone());
        match self.next_script(peer) {
            PeerScript::Refuse => Ok(false),
            PeerScript::Silent => Ok(true),
            PeerScript::Fail(err) => Err(err()),
            PeerScript::Events(events) => {
                for event in events {
                    let _ = self.scan_tx.send(event);
                }
                Ok(true)
            }
        }
    }

    fn recovery_events(&self) -> broadcast::Receiver<ScanEvent> {
        self.scan_tx.subscribe()
    }

    fn wallet_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.wallet_tx.subscribe()
    }

    async fn delete_wallet_state(&self) -> Result<()> {
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Local storage with switchable misbehavior.
pub struct TestBackend {
    inner: LocalBackend,
    pub root: PathBuf,
    pub hang_list: AtomicBool,
    pub upload_error: Mutex<Option<fn() -> StrongboxError>>,
    pub upload_gate: Mutex<Option<Arc<Notify>>>,
    pub uploads: AtomicUsize,
    active_uploads: AtomicUsize,
    pub max_active_uploads: AtomicUsize,
}

impl TestBackend {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalBackend::with_root(root, "test-local").unwrap(),
            root: root.to_path_buf(),
            hang_list: AtomicBool::new(false),
            upload_error: Mutex::new(None),
            upload_gate: Mutex::new(None),
            uploads: AtomicUsize::new(0),
            active_uploads: AtomicUsize::new(0),
            max_active_uploads: AtomicUsize::new(0),
        })
    }

    /// Hold every upload until the returned handle is notified.
    pub fn gate_uploads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.upload_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_uploads_with(&self, err: fn() -> StrongboxError) {
        *self.upload_error.lock().unwrap() = Some(err);
    }

    /// Drop a file straight into the backup folder.
    pub fn put(&self, name: &str, data: &[u8]) {
        let dir = self.root.join(FOLDER);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), data).unwrap();
    }

    /// Names currently stored, sorted.
    pub fn names(&self) -> Vec<String> {
        let dir = self.root.join(FOLDER);
        let mut names: Vec<String> = match std::fs::read_dir(&dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

struct ActiveUpload<'a>(&'a AtomicUsize);

impl Drop for ActiveUpload<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for TestBackend {
    async fn upload(&self, file: &Path, folder: &str) -> Result<String> {
        let active = self.active_uploads.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveUpload(&self.active_uploads);
        self.max_active_uploads.fetch_max(active, Ordering::SeqCst);

        let gate = self.upload_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let err = *self.upload_error.lock().unwrap();
        if let Some(err) = err {
            return Err(err());
        }
        let id = self.inner.upload(file, folder).await?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn list(&self, folder: &str) -> Result<Vec<RemoteEntry>> {
        if self.hang_list.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.list(folder).await
    }

    async fn download(&self, id: &str, destination: &Path) -> Result<()> {
        self.inner.download(id, destination).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn requires_interactive_setup(&self) -> bool {
        self.inner.requires_interactive_setup().await
    }

    async fn complete_setup(&self, outcome: SetupOutcome) -> Result<()> {
        self.inner.complete_setup(outcome).await
    }

    async fn sign_out(&self) -> Result<()> {
        self.inner.sign_out().await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
