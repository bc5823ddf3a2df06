//! KL-013: File/directory/link resource.
//!
//! Every sub-convergence (existence, ownership, mode, content, link target)
//! reads current state, acts only on mismatch, then re-reads and fails with
//! a convergence error if the change did not stick.

use super::content;
use super::identity::{Identity, IdentityResolver};
use super::{ApplyContext, Resource};
use crate::core::error::{Error, Result};
use crate::core::types::{ContentSpec, Ensure, FileSpec, Metadata};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::{self, DirBuilder, OpenOptions, Permissions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use tracing::debug;

const DEFAULT_MODE: &str = "0600";
const NEW_DIR_MODE: u32 = 0o700;
const NEW_FILE_MODE: u32 = 0o600;

/// A `kind: file` catalog entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    #[serde(default)]
    pub api: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub metadata: Metadata,
    pub spec: FileSpec,
}

fn default_kind() -> String {
    "file".to_string()
}

impl File {
    pub fn new(name: &str, spec: FileSpec) -> Self {
        Self {
            api: String::new(),
            kind: default_kind(),
            metadata: Metadata {
                name: name.to_string(),
                ..Metadata::default()
            },
            spec,
        }
    }
}

#[async_trait]
impl Resource for File {
    fn api(&self) -> &str {
        &self.api
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    async fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        let spec = self.spec.clone();
        let identities = ctx.identities.clone();
        tokio::task::spawn_blocking(move || converge(&spec, &identities))
            .await
            .map_err(|e| Error::Convergence(format!("file task aborted: {}", e)))?
    }
}

/// Converge one path to its spec. Blocking; runs on the blocking pool from `apply`.
pub fn converge(spec: &FileSpec, identities: &IdentityResolver) -> Result<()> {
    let path = spec.path.as_path();
    debug!(path = %path.display(), ensure = %spec.ensure, "converging file");

    match spec.ensure {
        Ensure::Absent => ensure_absent(path),
        Ensure::Directory => {
            let mode = parse_mode(spec.mode.as_deref())?;
            let owner = identities.resolve(&spec.user_id)?;
            ensure_directory(path)?;
            ensure_owner(path, owner)?;
            ensure_mode(path, mode)
        }
        Ensure::Present => {
            let mode = parse_mode(spec.mode.as_deref())?;
            let owner = identities.resolve(&spec.user_id)?;
            ensure_file(path)?;
            ensure_owner(path, owner)?;
            ensure_mode(path, mode)?;
            match &spec.content {
                Some(c) => ensure_content(path, c),
                None => Ok(()),
            }
        }
        Ensure::Link => {
            let target = spec.target.as_deref().ok_or_else(|| {
                Error::InvalidSpec(format!("link {} has no target", path.display()))
            })?;
            let owner = identities.resolve(&spec.user_id)?;
            ensure_link(path, target)?;
            ensure_owner(path, owner)
        }
    }
}

/// Parse an octal permission string, defaulting to 0600.
pub fn parse_mode(mode: Option<&str>) -> Result<u32> {
    let raw = match mode {
        Some(m) if !m.trim().is_empty() => m.trim(),
        _ => DEFAULT_MODE,
    };
    let bits = u32::from_str_radix(raw, 8)
        .map_err(|_| Error::InvalidSpec(format!("mode '{}' is not an octal number", raw)))?;
    if bits > 0o7777 {
        return Err(Error::InvalidSpec(format!("mode '{}' out of range", raw)));
    }
    Ok(bits)
}

fn lstat(path: &Path, purpose: &str) -> Result<fs::Metadata> {
    fs::symlink_metadata(path)
        .map_err(|e| Error::io(format!("unable to lstat {} for {}", path.display(), purpose), e))
}

// ============================================================================
// Existence
// ============================================================================

/// Remove whatever is at `path`. A missing path is already converged.
fn ensure_absent(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "already absent");
            return Ok(());
        }
        Err(e) => return Err(Error::io(format!("unable to lstat {}", path.display()), e)),
    };

    let removed = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(
            format!("unable to remove {} to ensure absent", path.display()),
            e,
        )),
    }
}

/// Create the directory (0700, parents included) if nothing is at `path`.
fn ensure_directory(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "creating directory");
            DirBuilder::new()
                .recursive(true)
                .mode(NEW_DIR_MODE)
                .create(path)
                .map_err(|e| Error::io(format!("unable to mkdir {}", path.display()), e))
        }
        Err(e) => Err(Error::io(
            format!("unable to lstat {} to ensure directory", path.display()),
            e,
        )),
    }
}

/// Create an empty file if nothing is at `path`.
fn ensure_file(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "creating empty file");
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(NEW_FILE_MODE)
                .open(path)
                .map(drop)
                .map_err(|e| Error::io(format!("unable to create {}", path.display()), e))
        }
        Err(e) => Err(Error::io(
            format!("unable to lstat {} to ensure present", path.display()),
            e,
        )),
    }
}

// ============================================================================
// Ownership & mode
// ============================================================================

fn ensure_owner(path: &Path, owner: Identity) -> Result<()> {
    if owner.uid.is_none() && owner.gid.is_none() {
        debug!(path = %path.display(), "ownership not managed");
        return Ok(());
    }

    let meta = lstat(path, "ownership")?;
    let (uid, gid) = (meta.uid(), meta.gid());
    let want_uid = owner.uid.unwrap_or(uid);
    let want_gid = owner.gid.unwrap_or(gid);
    if uid == want_uid && gid == want_gid {
        debug!(path = %path.display(), "ownership matches");
        return Ok(());
    }

    debug!(path = %path.display(), uid, want_uid, gid, want_gid, "setting ownership");
    std::os::unix::fs::lchown(path, owner.uid, owner.gid).map_err(|e| {
        Error::io(
            format!(
                "unable to chown {} to {}:{}",
                path.display(),
                want_uid,
                want_gid
            ),
            e,
        )
    })?;

    let meta = lstat(path, "ownership")?;
    if meta.uid() != want_uid || meta.gid() != want_gid {
        return Err(Error::Convergence(format!(
            "ownership of {} is {}:{} after setting {}:{}",
            path.display(),
            meta.uid(),
            meta.gid(),
            want_uid,
            want_gid
        )));
    }
    Ok(())
}

fn ensure_mode(path: &Path, mode: u32) -> Result<()> {
    let current = lstat(path, "permissions")?.mode() & 0o7777;
    if current == mode {
        debug!(path = %path.display(), "mode matches");
        return Ok(());
    }

    debug!(
        path = %path.display(),
        from = %format!("{:04o}", current),
        to = %format!("{:04o}", mode),
        "setting mode"
    );
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|e| {
        Error::io(
            format!("unable to set mode of {} to {:04o}", path.display(), mode),
            e,
        )
    })?;

    let after = lstat(path, "permissions")?.mode() & 0o7777;
    if after != mode {
        return Err(Error::Convergence(format!(
            "mode of {} is {:04o} after setting {:04o}",
            path.display(),
            after,
            mode
        )));
    }
    Ok(())
}

// ============================================================================
// Content
// ============================================================================

fn read_current(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::io(format!("unable to read {}", path.display()), e))
}

fn ensure_content(path: &Path, spec: &ContentSpec) -> Result<()> {
    let desired = content::resolve(spec)?;
    let current = read_current(path)?;
    if current == desired {
        debug!(path = %path.display(), "content matches");
        return Ok(());
    }

    debug!(
        path = %path.display(),
        current = %content::digest(&current),
        desired = %content::digest(&desired),
        "writing content"
    );
    // The file exists by now, so the creation mode is only a fallback;
    // permissions were converged separately.
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .mode(0o000)
        .open(path)
        .map_err(|e| Error::io(format!("unable to open {} for writing", path.display()), e))?;
    file.write_all(&desired)
        .and_then(|()| file.sync_all())
        .map_err(|e| Error::io(format!("unable to write {}", path.display()), e))?;

    if read_current(path)? != desired {
        return Err(Error::Convergence(format!(
            "content of {} did not persist",
            path.display()
        )));
    }
    Ok(())
}

// ============================================================================
// Links
// ============================================================================

fn ensure_link(path: &Path, target: &Path) -> Result<()> {
    match fs::read_link(path) {
        Ok(current) if current.as_path() == target => {
            debug!(path = %path.display(), "link target matches");
            return Ok(());
        }
        Ok(current) => {
            debug!(path = %path.display(), from = %current.display(), "replacing link");
            fs::remove_file(path).map_err(|e| {
                Error::io(format!("unable to remove stale link {}", path.display()), e)
            })?;
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::io(
                format!("unable to read link {}", path.display()),
                e,
            ))
        }
    }

    debug!(path = %path.display(), target = %target.display(), "creating link");
    std::os::unix::fs::symlink(target, path)
        .map_err(|e| Error::io(format!("unable to create link {}", path.display()), e))?;

    let after = fs::read_link(path).map_err(|e| {
        Error::io(format!("unable to read link {} after create", path.display()), e)
    })?;
    if after.as_path() != target {
        return Err(Error::Convergence(format!(
            "link {} points to {} after setting {}",
            path.display(),
            after.display(),
            target.display()
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
