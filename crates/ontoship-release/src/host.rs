//! Filesystem operations on a target's runtime root.
//!
//! The runtime root holds sibling release directories
//! (`<base_name>-graph-<ts>`) plus one symlink per base name, the published
//! alias. `LocalHost` works on this machine's filesystem; `RemoteHost` runs
//! the same operations as shell scripts over ssh.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ontoship_core::{BaseName, Release};

use crate::command::{shell_quote, Ssh};
use crate::error::CutoverError;
use crate::package::archive_checksum;

/// Unix file type bits for a symlink, as stored in zip external attributes.
const S_IFLNK: u32 = 0o120000;
const S_IFMT: u32 = 0o170000;

/// Distinguishes lock claims made by concurrent tasks of this process.
static CLAIMS: AtomicU64 = AtomicU64::new(0);

#[async_trait]
pub trait ReleaseHost: Send + Sync {
    /// "local" or the ssh host name.
    fn label(&self) -> &str;

    /// Take the host-level advisory lock for `base`.
    async fn lock(&self, base: &BaseName) -> Result<(), CutoverError>;

    /// Release the host-level lock. Failures are logged, not returned.
    async fn unlock(&self, base: &BaseName);

    /// Directory name the alias currently resolves to, if it exists.
    async fn published(&self, base: &BaseName) -> Result<Option<String>, CutoverError>;

    /// Unpack `archive` into the release's own directory.
    async fn extract(
        &self,
        archive: &Path,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<(), CutoverError>;

    /// Check the unpacked release directory is in place.
    async fn verify(&self, release: &Release) -> Result<(), CutoverError>;

    /// Atomically point the alias for `base` at `dir_name`.
    async fn repoint(&self, base: &BaseName, dir_name: &str) -> Result<(), CutoverError>;

    /// Remove a release directory and any half-unpacked leftovers.
    async fn remove_release(&self, dir_name: &str) -> Result<(), CutoverError>;

    /// Unpacked releases of `base`, oldest first.
    async fn releases(&self, base: &BaseName) -> Result<Vec<Release>, CutoverError>;
}

fn lock_name(base: &BaseName) -> String {
    format!(".{base}.lock")
}

fn unpacking_name(dir_name: &str) -> String {
    format!(".{dir_name}.unpacking")
}

fn tmp_link_name(base: &BaseName) -> String {
    format!(".{base}.tmp-link")
}

fn releases_from_names(names: impl IntoIterator<Item = String>, base: &BaseName) -> Vec<Release> {
    let mut releases: Vec<Release> = names
        .into_iter()
        .filter_map(|name| Release::from_dir_name(&name).ok())
        .filter(|release| &release.base_name == base)
        .collect();
    releases.sort_by_key(|release| release.timestamp);
    releases
}

fn host_err(e: impl std::fmt::Display) -> CutoverError {
    CutoverError::Host(e.to_string())
}

// ── Local ─────────────────────────────────────────────────────────

/// Release directories on this machine.
pub struct LocalHost {
    root: PathBuf,
}

impl LocalHost {
    pub fn new(runtime_root: impl Into<PathBuf>) -> Self {
        Self {
            root: runtime_root.into(),
        }
    }

    pub fn runtime_root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ReleaseHost for LocalHost {
    fn label(&self) -> &str {
        "local"
    }

    async fn lock(&self, base: &BaseName) -> Result<(), CutoverError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(host_err)?;
        let path = self.root.join(lock_name(base));

        let claim = self.root.join(format!(
            "{}.{}-{}",
            lock_name(base),
            std::process::id(),
            CLAIMS.fetch_add(1, Ordering::Relaxed)
        ));
        let owner = format!("pid {} at {}\n", std::process::id(), chrono::Utc::now().to_rfc3339());

        match claim_lock(&claim, &path, &owner).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = tokio::fs::read_to_string(&path).await.unwrap_or_default();
                Err(CutoverError::Locked {
                    host: "local".to_string(),
                    base_name: base.to_string(),
                    detail: format!("{} held by {}", path.display(), holder.trim()),
                })
            }
            Err(e) => Err(host_err(e)),
        }
    }

    async fn unlock(&self, base: &BaseName) {
        let path = self.root.join(lock_name(base));
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(lock = %path.display(), error = %e, "Failed to remove host lock");
        }
    }

    async fn published(&self, base: &BaseName) -> Result<Option<String>, CutoverError> {
        let alias = self.root.join(base.as_str());
        match tokio::fs::symlink_metadata(&alias).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(host_err(e)),
            Ok(meta) if !meta.file_type().is_symlink() => {
                return Err(CutoverError::AliasNotSymlink {
                    path: alias.display().to_string(),
                })
            }
            Ok(_) => {}
        }
        let target = tokio::fs::read_link(&alias).await.map_err(host_err)?;
        Ok(target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()))
    }

    async fn extract(
        &self,
        archive: &Path,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<(), CutoverError> {
        let (root, archive, release, cancel) = (
            self.root.clone(),
            archive.to_path_buf(),
            release.clone(),
            cancel.clone(),
        );
        tokio::task::spawn_blocking(move || extract_local(&root, &archive, &release, &cancel))
            .await
            .map_err(host_err)?
    }

    async fn verify(&self, release: &Release) -> Result<(), CutoverError> {
        let dir = self.root.join(release.dir_name());
        match tokio::fs::symlink_metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(CutoverError::VerifyFailed {
                release: release.dir_name(),
                reason: format!("{} is not a directory", dir.display()),
            }),
            Err(e) => Err(CutoverError::VerifyFailed {
                release: release.dir_name(),
                reason: format!("{}: {e}", dir.display()),
            }),
        }
    }

    async fn repoint(&self, base: &BaseName, dir_name: &str) -> Result<(), CutoverError> {
        let alias = self.root.join(base.as_str());
        let repoint_failed = |reason: String| CutoverError::RepointFailed {
            alias: alias.display().to_string(),
            release: dir_name.to_string(),
            reason,
        };

        if let Ok(meta) = tokio::fs::symlink_metadata(&alias).await {
            if !meta.file_type().is_symlink() {
                return Err(CutoverError::AliasNotSymlink {
                    path: alias.display().to_string(),
                });
            }
        }

        let tmp = self.root.join(tmp_link_name(base));
        match tokio::fs::remove_file(&tmp).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(repoint_failed(e.to_string())),
            _ => {}
        }
        tokio::fs::symlink(dir_name, &tmp)
            .await
            .map_err(|e| repoint_failed(e.to_string()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &alias).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(repoint_failed(e.to_string()));
        }
        Ok(())
    }

    async fn remove_release(&self, dir_name: &str) -> Result<(), CutoverError> {
        for name in [dir_name.to_string(), unpacking_name(dir_name)] {
            match tokio::fs::remove_dir_all(self.root.join(&name)).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(host_err(e)),
                _ => {}
            }
        }
        Ok(())
    }

    async fn releases(&self, base: &BaseName) -> Result<Vec<Release>, CutoverError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(host_err(e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(host_err)? {
            if entry.file_type().await.map_err(host_err)?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(releases_from_names(names, base))
    }
}

/// Write `owner` to `claim`, then hard-link it to `lock`. The lock is never
/// visible half-written, and the claim is removed either way.
async fn claim_lock(claim: &Path, lock: &Path, owner: &str) -> io::Result<()> {
    let linked = match tokio::fs::write(claim, owner).await {
        Ok(()) => tokio::fs::hard_link(claim, lock).await,
        Err(e) => Err(e),
    };
    match tokio::fs::remove_file(claim).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            tracing::warn!(claim = %claim.display(), error = %e, "Failed to remove lock claim")
        }
        _ => {}
    }
    linked
}

fn extract_local(
    root: &Path,
    archive: &Path,
    release: &Release,
    cancel: &CancellationToken,
) -> Result<(), CutoverError> {
    let unpacking = root.join(unpacking_name(&release.dir_name()));
    let result = unpack(root, &unpacking, archive, release, cancel);
    if result.is_err() {
        match fs::remove_dir_all(&unpacking) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                tracing::warn!(path = %unpacking.display(), error = %e, "Failed to remove half-unpacked release")
            }
            _ => {}
        }
    }
    result
}

/// Unpack into `unpacking`, then rename it to the release directory.
///
/// Symlinks are created after every regular entry is written, and a link
/// is refused when it would sit below another link or resolve outside the
/// release directory.
fn unpack(
    root: &Path,
    unpacking: &Path,
    archive: &Path,
    release: &Release,
    cancel: &CancellationToken,
) -> Result<(), CutoverError> {
    let dir_name = release.dir_name();
    let failed = |reason: String| CutoverError::ExtractFailed {
        release: dir_name.clone(),
        reason,
    };
    let refused = |reason: String| CutoverError::VerifyFailed {
        release: dir_name.clone(),
        reason,
    };
    let cancelled = || CutoverError::Cancelled {
        release: dir_name.clone(),
    };

    if let Some(expected) = &release.checksum {
        let actual = archive_checksum(archive).map_err(|e| failed(e.to_string()))?;
        if &actual != expected {
            return Err(refused(format!(
                "archive checksum {actual} does not match {expected}"
            )));
        }
    }

    fs::create_dir_all(root).map_err(|e| failed(e.to_string()))?;
    if unpacking.exists() {
        fs::remove_dir_all(unpacking).map_err(|e| failed(e.to_string()))?;
    }
    fs::create_dir(unpacking).map_err(|e| failed(e.to_string()))?;

    let file = File::open(archive).map_err(|e| failed(e.to_string()))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| failed(e.to_string()))?;
    let mut saw_top_level = false;
    let mut links: Vec<(PathBuf, String)> = Vec::new();

    for i in 0..zip.len() {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let mut entry = zip.by_index(i).map_err(|e| failed(e.to_string()))?;
        let path = entry
            .enclosed_name()
            .ok_or_else(|| failed(format!("unsafe entry name {:?}", entry.name())))?;

        let mut components = path.components();
        let top = components.next().map(|c| c.as_os_str().to_string_lossy().into_owned());
        if top.as_deref() != Some(dir_name.as_str()) {
            return Err(refused(format!("unexpected top-level entry {:?}", entry.name())));
        }
        saw_top_level = true;
        let rel = components.as_path().to_path_buf();
        if rel.as_os_str().is_empty() {
            if entry.is_dir() {
                continue;
            }
            return Err(refused(format!("top-level entry {:?} is not a directory", entry.name())));
        }
        let out = unpacking.join(&rel);
        let mode = entry.unix_mode();

        if entry.is_dir() {
            fs::create_dir_all(&out).map_err(|e| failed(e.to_string()))?;
            continue;
        }
        if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            let mut target = String::new();
            io::Read::read_to_string(&mut entry, &mut target).map_err(|e| failed(e.to_string()))?;
            if link_escapes(&rel, Path::new(&target)) {
                return Err(refused(format!(
                    "link {} -> {target} leaves the release directory",
                    rel.display()
                )));
            }
            links.push((rel, target));
            continue;
        }

        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;
        }
        let mut dest = File::create(&out).map_err(|e| failed(e.to_string()))?;
        io::copy(&mut entry, &mut dest).map_err(|e| failed(e.to_string()))?;
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out, fs::Permissions::from_mode(mode & 0o777))
                .map_err(|e| failed(e.to_string()))?;
        }
    }

    if !saw_top_level {
        return Err(refused("archive is empty".to_string()));
    }

    for (rel, target) in links {
        if passes_through_link(unpacking, &rel).map_err(|e| failed(e.to_string()))? {
            return Err(refused(format!("link {} sits below another link", rel.display())));
        }
        let out = unpacking.join(&rel);
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;
        }
        std::os::unix::fs::symlink(&target, &out).map_err(|e| failed(e.to_string()))?;
    }

    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    fs::rename(unpacking, root.join(&dir_name)).map_err(|e| failed(e.to_string()))?;
    Ok(())
}

/// Whether `target`, read from the directory holding the link at `rel`,
/// resolves outside the release directory.
fn link_escapes(rel: &Path, target: &Path) -> bool {
    let mut depth = rel.components().count().saturating_sub(1);
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(up) => depth = up,
                None => return true,
            },
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}

/// Whether an existing ancestor of `rel` below `base` is a symlink.
fn passes_through_link(base: &Path, rel: &Path) -> io::Result<bool> {
    let mut current = base.to_path_buf();
    let Some(parent) = rel.parent() else {
        return Ok(false);
    };
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(true),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

// ── Remote ────────────────────────────────────────────────────────

/// Script exit codes used to signal specific conditions back over ssh.
const EXIT_CONFLICT: i32 = 3;
const EXIT_UNPACK: i32 = 4;
const EXIT_LAYOUT: i32 = 5;

/// Release directories on a host reached over ssh.
pub struct RemoteHost {
    ssh: Ssh,
    root: String,
    service_user: Option<String>,
    step_timeout: Duration,
    extract_timeout: Duration,
}

impl RemoteHost {
    pub fn new(
        ssh: Ssh,
        runtime_root: &Path,
        service_user: Option<String>,
        step_timeout: Duration,
        extract_timeout: Duration,
    ) -> Self {
        Self {
            ssh,
            root: runtime_root.to_string_lossy().into_owned(),
            service_user,
            step_timeout,
            extract_timeout,
        }
    }

    fn path(&self, name: &str) -> String {
        shell_quote(&format!("{}/{name}", self.root))
    }

    /// Run `script` as the service user when one is configured.
    async fn exec(
        &self,
        script: &str,
        limit: Duration,
    ) -> Result<crate::command::CommandOutput, CutoverError> {
        let wrapped = match &self.service_user {
            Some(user) => format!("sudo -n -u {} sh -c {}", shell_quote(user), shell_quote(script)),
            None => script.to_string(),
        };
        self.ssh
            .run(&wrapped, limit)
            .await
            .map_err(|e| CutoverError::Host(e.to_string()))
    }
}

#[async_trait]
impl ReleaseHost for RemoteHost {
    fn label(&self) -> &str {
        self.ssh.host()
    }

    async fn lock(&self, base: &BaseName) -> Result<(), CutoverError> {
        let script = format!(
            "mkdir -p {root} || exit 1; mkdir {lock} 2>/dev/null || exit {EXIT_CONFLICT}",
            root = shell_quote(&self.root),
            lock = self.path(&lock_name(base)),
        );
        let output = self.exec(&script, self.step_timeout).await?;
        match output.code {
            Some(0) => Ok(()),
            Some(EXIT_CONFLICT) => Err(CutoverError::Locked {
                host: self.ssh.host().to_string(),
                base_name: base.to_string(),
                detail: format!("{}/{} exists", self.root, lock_name(base)),
            }),
            _ => Err(CutoverError::Host(output.reason())),
        }
    }

    async fn unlock(&self, base: &BaseName) {
        let script = format!("rmdir {}", self.path(&lock_name(base)));
        match self.exec(&script, self.step_timeout).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::warn!(host = %self.ssh.host(), error = %output.reason(), "Failed to remove host lock")
            }
            Err(e) => tracing::warn!(host = %self.ssh.host(), error = %e, "Failed to remove host lock"),
        }
    }

    async fn published(&self, base: &BaseName) -> Result<Option<String>, CutoverError> {
        let alias = self.path(base.as_str());
        let script = format!(
            "if [ -L {alias} ]; then basename \"$(readlink {alias})\"; \
             elif [ -e {alias} ]; then exit {EXIT_CONFLICT}; fi"
        );
        let output = self.exec(&script, self.step_timeout).await?;
        match output.code {
            Some(0) => {
                let name = output.stdout.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Some(EXIT_CONFLICT) => Err(CutoverError::AliasNotSymlink {
                path: format!("{}:{}/{base}", self.ssh.host(), self.root),
            }),
            _ => Err(CutoverError::Host(output.reason())),
        }
    }

    async fn extract(
        &self,
        archive: &Path,
        release: &Release,
        cancel: &CancellationToken,
    ) -> Result<(), CutoverError> {
        let dir_name = release.dir_name();
        let script = format!(
            "set -u; T={tmp}; rm -rf \"$T\" && mkdir -p \"$T\" || exit 1; \
             unzip -q {archive} -d \"$T\" || exit {EXIT_UNPACK}; \
             [ -d \"$T\"/{dir} ] || exit {EXIT_LAYOUT}; \
             mv -T \"$T\"/{dir} {dest} && rm -rf \"$T\"",
            tmp = self.path(&unpacking_name(&dir_name)),
            archive = shell_quote(&archive.to_string_lossy()),
            dir = shell_quote(&dir_name),
            dest = self.path(&dir_name),
        );

        let output = tokio::select! {
            output = self.exec(&script, self.extract_timeout) => output?,
            _ = cancel.cancelled() => {
                return Err(CutoverError::Cancelled { release: dir_name });
            }
        };

        match output.code {
            Some(0) => Ok(()),
            Some(EXIT_LAYOUT) => Err(CutoverError::VerifyFailed {
                release: dir_name.clone(),
                reason: format!("archive has no top-level directory {dir_name}"),
            }),
            _ => Err(CutoverError::ExtractFailed {
                release: dir_name,
                reason: output.reason(),
            }),
        }
    }

    async fn verify(&self, release: &Release) -> Result<(), CutoverError> {
        let dir_name = release.dir_name();
        let script = format!("[ -d {} ] && [ ! -L {0} ]", self.path(&dir_name));
        let output = self.exec(&script, self.step_timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(CutoverError::VerifyFailed {
                release: dir_name,
                reason: "release directory missing on host".to_string(),
            })
        }
    }

    async fn repoint(&self, base: &BaseName, dir_name: &str) -> Result<(), CutoverError> {
        let alias = self.path(base.as_str());
        let tmp = self.path(&tmp_link_name(base));
        let script = format!(
            "if [ -e {alias} ] && [ ! -L {alias} ]; then exit {EXIT_CONFLICT}; fi; \
             ln -sfn {dir} {tmp} && mv -Tf {tmp} {alias}",
            dir = shell_quote(dir_name),
        );
        let output = self.exec(&script, self.step_timeout).await?;
        match output.code {
            Some(0) => Ok(()),
            Some(EXIT_CONFLICT) => Err(CutoverError::AliasNotSymlink {
                path: format!("{}:{}/{base}", self.ssh.host(), self.root),
            }),
            _ => Err(CutoverError::RepointFailed {
                alias: format!("{}/{base}", self.root),
                release: dir_name.to_string(),
                reason: output.reason(),
            }),
        }
    }

    async fn remove_release(&self, dir_name: &str) -> Result<(), CutoverError> {
        let script = format!(
            "rm -rf {} {}",
            self.path(dir_name),
            self.path(&unpacking_name(dir_name))
        );
        let output = self.exec(&script, self.step_timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(CutoverError::Host(output.reason()))
        }
    }

    async fn releases(&self, base: &BaseName) -> Result<Vec<Release>, CutoverError> {
        let root = shell_quote(&self.root);
        let script = format!(
            "[ -d {root} ] || exit 0; find {root} -mindepth 1 -maxdepth 1 -type d -printf '%f\\n'"
        );
        let output = self.exec(&script, self.step_timeout).await?;
        if !output.success() {
            return Err(CutoverError::Host(output.reason()));
        }
        Ok(releases_from_names(
            output.stdout.lines().map(str::to_string),
            base,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Packager;

    async fn packaged(dir: &Path, base: &BaseName) -> crate::package::PackagedRelease {
        let graph = dir.join("build/graph");
        fs::create_dir_all(&graph).unwrap();
        fs::write(graph.join("graph.db"), b"nodes").unwrap();
        Packager::new().package(&graph, base).await.unwrap()
    }

    #[tokio::test]
    async fn test_extract_verify_repoint() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseName::new("sparc-data").unwrap();
        let pkg = packaged(dir.path(), &base).await;
        let host = LocalHost::new(dir.path().join("runtime"));
        let cancel = CancellationToken::new();

        assert_eq!(host.published(&base).await.unwrap(), None);
        host.extract(&pkg.archive, &pkg.release, &cancel).await.unwrap();
        host.verify(&pkg.release).await.unwrap();
        host.repoint(&base, &pkg.release.dir_name()).await.unwrap();

        assert_eq!(host.published(&base).await.unwrap(), Some(pkg.release.dir_name()));
        let alias = host.runtime_root().join("sparc-data");
        assert_eq!(fs::read(alias.join("graph.db")).unwrap(), b"nodes");
        let listed: Vec<String> = host
            .releases(&base)
            .await
            .unwrap()
            .iter()
            .map(Release::dir_name)
            .collect();
        assert_eq!(listed, vec![pkg.release.dir_name()]);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_verify_failure() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseName::new("sparc-data").unwrap();
        let pkg = packaged(dir.path(), &base).await;
        let host = LocalHost::new(dir.path().join("runtime"));

        let tampered = pkg.release.clone().with_checksum("00".repeat(32));
        let err = host
            .extract(&pkg.archive, &tampered, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CutoverError::VerifyFailed { .. }));
        assert!(!host.runtime_root().join(pkg.release.dir_name()).exists());
    }

    #[tokio::test]
    async fn test_corrupt_archive_fails_extract() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseName::new("sparc-data").unwrap();
        let release = Release::from_dir_name("sparc-data-graph-20240115T093000Z").unwrap();
        let archive = dir.path().join(release.archive_name());
        fs::write(&archive, b"definitely not a zip").unwrap();
        let host = LocalHost::new(dir.path().join("runtime"));

        let err = host
            .extract(&archive, &release, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CutoverError::ExtractFailed { .. }));
        assert!(host.releases(&base).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_extract() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseName::new("sparc-data").unwrap();
        let pkg = packaged(dir.path(), &base).await;
        let host = LocalHost::new(dir.path().join("runtime"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = host.extract(&pkg.archive, &pkg.release, &cancel).await.unwrap_err();
        assert!(matches!(err, CutoverError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_alias_not_symlink_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseName::new("sparc-data").unwrap();
        let host = LocalHost::new(dir.path());
        fs::create_dir(dir.path().join("sparc-data")).unwrap();

        assert!(matches!(
            host.published(&base).await,
            Err(CutoverError::AliasNotSymlink { .. })
        ));
        assert!(matches!(
            host.repoint(&base, "sparc-data-graph-20240115T093000Z").await,
            Err(CutoverError::AliasNotSymlink { .. })
        ));
        assert!(dir.path().join("sparc-data").is_dir());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseName::new("sparc-data").unwrap();
        let host = LocalHost::new(dir.path());

        host.lock(&base).await.unwrap();
        assert!(matches!(host.lock(&base).await, Err(CutoverError::Locked { .. })));
        host.unlock(&base).await;
        host.lock(&base).await.unwrap();
    }

    /// Archive for `release` holding the given entries, in order. `Some`
    /// makes a symlink to that target, `None` a small regular file.
    fn crafted_archive(dir: &Path, release: &Release, entries: &[(&str, Option<&str>)]) -> PathBuf {
        let path = dir.join(release.archive_name());
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        zip.add_directory(format!("{}/", release.dir_name()), options).unwrap();
        for (name, link) in entries {
            let name = format!("{}/{name}", release.dir_name());
            match link {
                Some(target) => zip.add_symlink(name, *target, options).unwrap(),
                None => {
                    zip.start_file(name, options).unwrap();
                    io::Write::write_all(&mut zip, b"written").unwrap();
                }
            }
        }
        zip.finish().unwrap();
        path
    }

    #[tokio::test]
    async fn test_extract_never_writes_through_archive_links() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir(&outside).unwrap();
        let release = Release::from_dir_name("sparc-data-graph-20240115T093000Z").unwrap();
        let outside_str = outside.to_string_lossy().into_owned();
        let archive = crafted_archive(
            dir.path(),
            &release,
            &[("l", Some(outside_str.as_str())), ("l/escaped", None)],
        );
        let host = LocalHost::new(dir.path().join("runtime"));

        let err = host
            .extract(&archive, &release, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CutoverError::VerifyFailed { .. }));
        assert!(!outside.join("escaped").exists());
        assert_eq!(fs::read_dir(&outside).unwrap().count(), 0);
        assert!(!host.runtime_root().join(release.dir_name()).exists());
        assert!(!host.runtime_root().join(unpacking_name(&release.dir_name())).exists());
    }

    #[tokio::test]
    async fn test_extract_refuses_escaping_and_nested_links() {
        let dir = tempfile::tempdir().unwrap();
        let release = Release::from_dir_name("sparc-data-graph-20240115T093000Z").unwrap();
        let host = LocalHost::new(dir.path().join("runtime"));
        let cancel = CancellationToken::new();

        let escaping = crafted_archive(dir.path(), &release, &[("data/up", Some("../../outside"))]);
        let err = host.extract(&escaping, &release, &cancel).await.unwrap_err();
        assert!(matches!(err, CutoverError::VerifyFailed { .. }));

        let nested = crafted_archive(dir.path(), &release, &[("l", Some("data")), ("l/x", Some("y"))]);
        let err = host.extract(&nested, &release, &cancel).await.unwrap_err();
        assert!(matches!(err, CutoverError::VerifyFailed { .. }));
        assert!(!host.runtime_root().join(release.dir_name()).exists());
    }

    #[tokio::test]
    async fn test_extract_keeps_links_inside_release() {
        let dir = tempfile::tempdir().unwrap();
        let release = Release::from_dir_name("sparc-data-graph-20240115T093000Z").unwrap();
        let archive = crafted_archive(
            dir.path(),
            &release,
            &[("current", Some("data")), ("data/f", None), ("data/up", Some(".."))],
        );
        let host = LocalHost::new(dir.path().join("runtime"));

        host.extract(&archive, &release, &CancellationToken::new())
            .await
            .unwrap();
        let unpacked = host.runtime_root().join(release.dir_name());
        assert_eq!(fs::read(unpacked.join("current/f")).unwrap(), b"written");
        assert!(fs::symlink_metadata(unpacked.join("data/up")).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_link_escapes() {
        assert!(!link_escapes(Path::new("current"), Path::new("data")));
        assert!(!link_escapes(Path::new("data/up"), Path::new("..")));
        assert!(link_escapes(Path::new("current"), Path::new("..")));
        assert!(link_escapes(Path::new("data/l"), Path::new("../../x")));
        assert!(link_escapes(Path::new("l"), Path::new("/etc")));
    }

    #[tokio::test]
    async fn test_failed_lock_claim_leaves_no_lock() {
        let dir = tempfile::tempdir().unwrap();
        let claim = dir.path().join(".sparc-data.lock.claim");
        let lock = dir.path().join(".sparc-data.lock");
        fs::create_dir(&claim).unwrap();

        assert!(claim_lock(&claim, &lock, "pid 1\n").await.is_err());
        assert!(!lock.exists());

        fs::remove_dir(&claim).unwrap();
        claim_lock(&claim, &lock, "pid 1\n").await.unwrap();
        assert_eq!(fs::read_to_string(&lock).unwrap(), "pid 1\n");
        assert!(!claim.exists());
        assert!(claim_lock(&claim, &lock, "pid 2\n").await.is_err());
        assert_eq!(fs::read_to_string(&lock).unwrap(), "pid 1\n");
    }

    #[tokio::test]
    async fn test_lock_leaves_no_claim_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseName::new("sparc-data").unwrap();
        let host = LocalHost::new(dir.path());

        host.lock(&base).await.unwrap();
        assert!(host.lock(&base).await.is_err());
        host.unlock(&base).await;
        let left: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn test_releases_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let base = BaseName::new("sparc-data").unwrap();
        for name in [
            "sparc-data-graph-20240301T000000Z",
            "sparc-data-graph-20240101T000000Z",
            "other-graph-20240201T000000Z",
            ".sparc-data-graph-20240401T000000Z.unpacking",
        ] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::os::unix::fs::symlink("sparc-data-graph-20240301T000000Z", dir.path().join("sparc-data"))
            .unwrap();

        let host = LocalHost::new(dir.path());
        let names: Vec<String> = host
            .releases(&base)
            .await
            .unwrap()
            .iter()
            .map(Release::dir_name)
            .collect();
        assert_eq!(
            names,
            vec![
                "sparc-data-graph-20240101T000000Z".to_string(),
                "sparc-data-graph-20240301T000000Z".to_string(),
            ]
        );
    }
}
