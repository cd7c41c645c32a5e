use chrono::{DateTime, SubsecRound, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{ArchiveCodec, ArchiveStats};
use crate::crypto::CryptoCodec;
use crate::error::{Result, StrongboxError};
use crate::naming::NamingPolicy;
use crate::types::BackupPassword;

/// An encrypted archive ready for upload. Dropping it deletes every scratch file.
#[derive(Debug)]
pub struct BackupBundle {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub stats: ArchiveStats,
    path: PathBuf,
    _scratch: TempDir,
}

impl BackupBundle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Turns the wallet data directory into an encrypted bundle and back.
#[derive(Debug, Clone)]
pub struct BackupBundler {
    wallet_dir: PathBuf,
    scratch_root: PathBuf,
    archive: ArchiveCodec,
    crypto: CryptoCodec,
    naming: NamingPolicy,
    required_files: Vec<String>,
}

impl BackupBundler {
    pub fn new(
        wallet_dir: impl Into<PathBuf>,
        scratch_root: impl Into<PathBuf>,
        archive: ArchiveCodec,
        crypto: CryptoCodec,
        naming: NamingPolicy,
    ) -> Self {
        Self {
            wallet_dir: wallet_dir.into(),
            scratch_root: scratch_root.into(),
            archive,
            crypto,
            naming,
            required_files: vec![],
        }
    }

    /// Files that must be present in a bundle before it may replace wallet state.
    pub fn with_required_files(mut self, files: Vec<String>) -> Self {
        self.required_files = files;
        self
    }

    pub fn naming(&self) -> &NamingPolicy {
        &self.naming
    }

    pub fn wallet_dir(&self) -> &Path {
        &self.wallet_dir
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Fresh scratch directory, removed when the returned guard drops.
    pub fn scratch_dir(&self) -> Result<TempDir> {
        self.scratch("work-")
    }

    fn scratch(&self, prefix: &str) -> Result<TempDir> {
        fs::create_dir_all(&self.scratch_root)?;
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.scratch_root)?)
    }

    /// Snapshot, pack and encrypt the wallet directory. Checks `cancel` between stages.
    pub fn create_bundle(
        &self,
        password: &BackupPassword,
        cancel: &CancellationToken,
    ) -> Result<BackupBundle> {
        let scratch = self.scratch("bundle-")?;
        checkpoint(cancel)?;

        let snapshot = scratch.path().join("snapshot");
        copy_tree(&self.wallet_dir, &snapshot)?;
        checkpoint(cancel)?;

        let packed = scratch.path().join("bundle.tar.zst");
        let stats = self.archive.pack(&snapshot, &packed)?;
        fs::remove_dir_all(&snapshot)?;
        checkpoint(cancel)?;

        let created_at = Utc::now().trunc_subsecs(0);
        let name = self.naming.format(created_at);
        let path = scratch.path().join(&name);
        self.crypto.encrypt_file(password, &packed, &path)?;
        fs::remove_file(&packed)?;
        checkpoint(cancel)?;

        info!(name = %name, files = stats.files, bytes = stats.bytes, "Backup bundle created");
        Ok(BackupBundle {
            name,
            created_at,
            stats,
            path,
            _scratch: scratch,
        })
    }

    /// Decrypt and unpack `encrypted`, then move its files into the wallet directory.
    /// The wallet directory is left untouched unless every step succeeds.
    pub fn restore_bundle(&self, encrypted: &Path, password: &BackupPassword) -> Result<ArchiveStats> {
        let scratch = self.scratch("restore-")?;

        let packed = scratch.path().join("bundle.tar.zst");
        self.crypto.decrypt_file(password, encrypted, &packed)?;

        let unpacked = scratch.path().join("unpacked");
        let stats = self.archive.unpack(&packed, &unpacked)?;
        fs::remove_file(&packed)?;

        if stats.files == 0 {
            return Err(StrongboxError::StorageTampered(
                "backup archive contains no wallet files".to_string(),
            ));
        }
        for required in &self.required_files {
            if !unpacked.join(required).is_file() {
                return Err(StrongboxError::StorageTampered(format!(
                    "backup archive is missing {required}"
                )));
            }
        }

        let displaced = scratch.path().join("displaced");
        fs::create_dir_all(&displaced)?;
        swap_into(&unpacked, &self.wallet_dir, &displaced)?;

        info!(
            wallet_dir = %self.wallet_dir.display(),
            files = stats.files,
            "Backup restored into wallet directory"
        );
        Ok(stats)
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(StrongboxError::Cancelled);
    }
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn move_path(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            debug!(from = %from.display(), error = %rename_err, "Rename failed, copying instead");
            if from.is_dir() {
                copy_tree(from, to).map_err(std::io::Error::other)?;
                fs::remove_dir_all(from)
            } else {
                fs::copy(from, to)?;
                fs::remove_file(from)
            }
        }
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Move each top-level entry of `staged` into `wallet_dir`, parking what it replaces in
/// `displaced`. On any failure, already-moved entries are rolled back.
fn swap_into(staged: &Path, wallet_dir: &Path, displaced: &Path) -> Result<()> {
    fs::create_dir_all(wallet_dir)?;

    let mut names: Vec<_> = fs::read_dir(staged)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<std::io::Result<_>>()?;
    names.sort();

    let mut moved: Vec<(std::ffi::OsString, bool)> = Vec::with_capacity(names.len());
    for name in names {
        let target = wallet_dir.join(&name);
        let had_previous = target.exists();
        let step = (|| -> std::io::Result<()> {
            if had_previous {
                move_path(&target, &displaced.join(&name))?;
            }
            if let Err(e) = move_path(&staged.join(&name), &target) {
                if had_previous {
                    move_path(&displaced.join(&name), &target)?;
                }
                return Err(e);
            }
            Ok(())
        })();

        if let Err(e) = step {
            warn!(entry = ?name, error = %e, "Restore swap failed, rolling back");
            rollback(wallet_dir, displaced, &moved);
            return Err(StrongboxError::Io(e));
        }
        moved.push((name, had_previous));
    }
    Ok(())
}

fn rollback(wallet_dir: &Path, displaced: &Path, moved: &[(std::ffi::OsString, bool)]) {
    for (name, had_previous) in moved.iter().rev() {
        let target = wallet_dir.join(name);
        if let Err(e) = remove_path(&target) {
            warn!(entry = ?name, error = %e, "Failed to remove restored entry during rollback");
            continue;
        }
        if *had_previous {
            if let Err(e) = move_path(&displaced.join(name), &target) {
                warn!(entry = ?name, error = %e, "Failed to put back original entry");
            }
        }
    }
}
