//! Artifact packager: snapshot directory to timestamped zip archive.
//!
//! The snapshot is copied (never moved) into a sibling directory named after
//! the release, and that directory is archived so the zip holds exactly one
//! top-level entry. The archive is written under a hidden `.partial` name and
//! renamed into place once complete.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use ontoship_core::{BaseName, Release, ReleaseTimestamp};

use crate::error::PackagingError;

/// Output of one `package()` call.
#[derive(Debug, Clone)]
pub struct PackagedRelease {
    pub release: Release,
    /// Final archive path, next to the snapshot root.
    pub archive: PathBuf,
    /// Copy of the snapshot the archive was built from.
    pub staged_dir: PathBuf,
}

/// Issues releases with strictly increasing timestamps per base name.
#[derive(Debug, Default)]
pub struct Packager {
    issued: Mutex<HashMap<BaseName, ReleaseTimestamp>>,
}

impl Packager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Package `snapshot_root` as a new release of `base_name`.
    pub async fn package(
        &self,
        snapshot_root: &Path,
        base_name: &BaseName,
    ) -> Result<PackagedRelease, PackagingError> {
        let snapshot = check_snapshot(snapshot_root)?;
        let parent = snapshot
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let release = {
            let mut issued = self.issued.lock();
            let last = issued
                .get(base_name)
                .copied()
                .max(newest_sibling(&parent, base_name));
            let timestamp = ReleaseTimestamp::next_after(Utc::now(), last);
            issued.insert(base_name.clone(), timestamp);
            Release::new(base_name.clone(), timestamp)
        };

        let staged_dir = parent.join(release.dir_name());
        let archive = parent.join(release.archive_name());
        let partial = parent.join(format!(".{}.partial", release.archive_name()));

        tracing::info!(
            base_name = %base_name,
            release = %release,
            snapshot = %snapshot.display(),
            "Packaging snapshot"
        );

        let task = {
            let (snapshot, staged_dir, archive, partial) =
                (snapshot.clone(), staged_dir.clone(), archive.clone(), partial.clone());
            let dir_name = release.dir_name();
            tokio::task::spawn_blocking(move || {
                build_archive(&snapshot, &staged_dir, &dir_name, &partial, &archive)
            })
        };

        let checksum = match task.await {
            Ok(Ok(checksum)) => checksum,
            Ok(Err(e)) => {
                discard(&staged_dir, &partial);
                return Err(e);
            }
            Err(e) => {
                discard(&staged_dir, &partial);
                return Err(PackagingError::Task(e.to_string()));
            }
        };

        tracing::info!(
            release = %release,
            archive = %archive.display(),
            checksum = %checksum,
            "Archive ready"
        );

        Ok(PackagedRelease {
            release: release.with_checksum(checksum),
            archive,
            staged_dir,
        })
    }
}

fn check_snapshot(root: &Path) -> Result<PathBuf, PackagingError> {
    let meta = fs::metadata(root).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => PackagingError::SnapshotMissing(root.to_path_buf()),
        _ => PackagingError::SnapshotUnreadable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        },
    })?;
    if !meta.is_dir() {
        return Err(PackagingError::SnapshotUnreadable {
            path: root.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }
    fs::read_dir(root).map_err(|e| PackagingError::SnapshotUnreadable {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::canonicalize(root).map_err(|e| PackagingError::SnapshotUnreadable {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Newest timestamp among existing release directories and archives in `dir`.
fn newest_sibling(dir: &Path, base_name: &BaseName) -> Option<ReleaseTimestamp> {
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            Release::from_archive_name(&name)
                .or_else(|_| Release::from_dir_name(&name))
                .ok()
        })
        .filter(|release| &release.base_name == base_name)
        .map(|release| release.timestamp)
        .max()
}

fn build_archive(
    snapshot: &Path,
    staged_dir: &Path,
    dir_name: &str,
    partial: &Path,
    archive: &Path,
) -> Result<String, PackagingError> {
    copy_tree(snapshot, staged_dir).map_err(|source| PackagingError::Copy {
        staged: staged_dir.to_path_buf(),
        source,
    })?;

    let archive_err = |reason: String| PackagingError::Archive {
        archive: archive.to_path_buf(),
        reason,
    };
    write_zip(staged_dir, dir_name, partial).map_err(|e| archive_err(e.to_string()))?;
    let checksum = archive_checksum(partial).map_err(|e| archive_err(e.to_string()))?;
    fs::rename(partial, archive).map_err(|e| archive_err(e.to_string()))?;
    Ok(checksum)
}

/// Recursive copy that preserves symlinks as symlinks.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst)?;
    }
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn write_zip(staged_dir: &Path, dir_name: &str, partial: &Path) -> zip::result::ZipResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut zip = ZipWriter::new(File::create(partial)?);
    let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(staged_dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(staged_dir)
            .map_err(io::Error::other)?;
        let mut name = dir_name.to_string();
        for component in rel.components() {
            name.push('/');
            name.push_str(&component.as_os_str().to_string_lossy());
        }

        let meta = entry.path().symlink_metadata()?;
        let options = base.unix_permissions(meta.permissions().mode() & 0o777);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            zip.add_symlink(name, link.to_string_lossy().into_owned(), options)?;
        } else {
            zip.start_file(name, options.large_file(meta.len() >= u64::from(u32::MAX)))?;
            io::copy(&mut File::open(entry.path())?, &mut zip)?;
        }
    }

    zip.finish()?;
    Ok(())
}

/// BLAKE3 hex digest of a file's bytes.
pub fn archive_checksum(path: &Path) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut File::open(path)?, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn discard(staged_dir: &Path, partial: &Path) {
    if let Err(e) = fs::remove_file(partial) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %partial.display(), error = %e, "Failed to remove partial archive");
        }
    }
    if let Err(e) = fs::remove_dir_all(staged_dir) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %staged_dir.display(), error = %e, "Failed to remove staged copy");
        }
    }
}
