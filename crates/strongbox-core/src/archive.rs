use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use tar::{Builder, EntryType, Header, HeaderMode};
use tracing::debug;

use crate::error::{Result, StrongboxError};

/// Default zstd level for archives (1-22).
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Packs a directory tree into a single tar+zstd file and back.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveCodec {
    level: i32,
}

/// Counts reported by pack/unpack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

impl ArchiveCodec {
    pub fn new(level: i32) -> Self {
        Self { level }
    }

    /// Pack every regular file and directory under `source` into `archive`.
    pub fn pack(&self, source: &Path, archive: &Path) -> Result<ArchiveStats> {
        let file = fs::File::create(archive)?;
        let stats = self.pack_to_writer(source, file)?;
        debug!(
            source = %source.display(),
            archive = %archive.display(),
            files = stats.files,
            bytes = stats.bytes,
            "Packed archive"
        );
        Ok(stats)
    }

    pub fn pack_to_writer<W: Write>(&self, source: &Path, writer: W) -> Result<ArchiveStats> {
        let (directories, files) = collect_tree(source)?;

        let encoder = zstd::Encoder::new(writer, self.level)?;
        let mut builder = Builder::new(encoder);
        builder.mode(HeaderMode::Deterministic);

        let mut stats = ArchiveStats::default();
        for dir in &directories {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Directory);
            header.set_mode(0o755);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_size(0);
            builder.append_data(&mut header, dir.as_str(), std::io::empty())?;
            stats.directories += 1;
        }

        for rel in &files {
            let full = source.join(rel);
            let data = fs::File::open(&full)?;
            let size = data.metadata()?.len();
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_size(size);
            builder.append_data(&mut header, rel.as_str(), data)?;
            stats.files += 1;
            stats.bytes += size;
        }

        let encoder = builder.into_inner()?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        Ok(stats)
    }

    /// Unpack `archive` into `destination`, rejecting any entry that would land outside it.
    pub fn unpack(&self, archive: &Path, destination: &Path) -> Result<ArchiveStats> {
        let file = fs::File::open(archive)?;
        let stats = self.unpack_from_reader(file, destination)?;
        debug!(
            archive = %archive.display(),
            destination = %destination.display(),
            files = stats.files,
            "Unpacked archive"
        );
        Ok(stats)
    }

    pub fn unpack_from_reader<R: Read>(&self, reader: R, destination: &Path) -> Result<ArchiveStats> {
        let decoder = zstd::Decoder::new(reader).map_err(corrupt)?;
        let mut archive = tar::Archive::new(decoder);
        fs::create_dir_all(destination)?;

        let mut stats = ArchiveStats::default();
        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let raw = entry.path().map_err(corrupt)?.into_owned();
            let relative = sanitize_entry_path(&raw)?;
            let target = destination.join(&relative);

            match entry.header().entry_type() {
                EntryType::Directory => {
                    fs::create_dir_all(&target)?;
                    stats.directories += 1;
                }
                EntryType::Regular => {
                    let mut buffer = Vec::new();
                    entry.read_to_end(&mut buffer).map_err(corrupt)?;
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&target, &buffer)?;
                    stats.files += 1;
                    stats.bytes += buffer.len() as u64;
                }
                other => {
                    return Err(StrongboxError::ArchiveCorrupt(format!(
                        "unsupported entry type {other:?} for '{}'",
                        raw.display()
                    )));
                }
            }
        }
        Ok(stats)
    }
}

impl Default for ArchiveCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_LEVEL)
    }
}

fn corrupt(err: std::io::Error) -> StrongboxError {
    StrongboxError::ArchiveCorrupt(err.to_string())
}

/// Entry paths must be plain relative paths; `..`, roots and drive prefixes are rejected.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StrongboxError::ArchiveCorrupt(format!(
                    "entry '{}' escapes the destination directory",
                    path.display()
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(StrongboxError::ArchiveCorrupt("entry with empty path".to_string()));
    }
    Ok(clean)
}

/// Sorted `/`-separated relative paths of directories and regular files under `root`.
fn collect_tree(root: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let mut directories = Vec::new();
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(rel_dir) = pending.pop() {
        for entry in fs::read_dir(root.join(&rel_dir))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let rel = rel_dir.join(entry.file_name());
            let name = rel
                .to_str()
                .ok_or_else(|| {
                    StrongboxError::Config(format!("non UTF-8 wallet file name: {}", rel.display()))
                })?
                .replace('\\', "/");

            if file_type.is_dir() {
                directories.push(name);
                pending.push(rel);
            } else if file_type.is_file() {
                files.push(name);
            }
        }
    }

    directories.sort();
    files.sort();
    Ok((directories, files))
}
