//! Atomic, symlink-resistant storage writes under the configured root.
//!
//! The write protocol:
//!
//! 1. Re-validate that the target resolves under the storage root (the
//!    path policy already did this once; the storage layer does not trust
//!    its callers).
//! 2. Walk every path component between the root and the target's parent
//!    and reject any component that is a symlink.
//! 3. Create missing parent directories (never outside the root).
//! 4. Write the bytes to a temp file in the destination directory,
//!    optionally fsync, and apply the configured mode via the open handle
//!    (not by path, which would race with the rename).
//! 5. Atomically rename onto the target, then best-effort fsync the
//!    directory.
//!
//! Crash at any point leaves either the old complete file or the new
//! complete file, never a partial write. The symlink walk precedes the
//! write, so a hostile concurrent mutator of the filesystem can still
//! introduce a symlink between check and use; that residual race is
//! mitigated at the platform level (temp files are created `O_EXCL` with
//! unpredictable names, and the rename replaces the directory entry rather
//! than following it).

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::error::{ErrorCode, JobError};
use crate::path_policy::{self, PathPolicyError};

/// Options for a storage write.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// fsync the file (and best-effort the directory) before returning.
    pub fsync: bool,
    /// File mode applied via the open handle.
    pub mode: u32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            fsync: true,
            mode: 0o640,
        }
    }
}

/// Mode for directories created under the root.
const DIR_MODE: u32 = 0o750;

/// Errors from storage writes.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The target violates the path policy (root escape).
    #[error("storage path policy violation: {0}")]
    Policy(#[from] PathPolicyError),

    /// A component between the root and the target is a symlink.
    #[error("refusing to traverse symlink at {}", path.display())]
    SymlinkRefused {
        /// The offending component.
        path: PathBuf,
    },

    /// An I/O failure during the write.
    #[error("storage I/O error during {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<StorageError> for JobError {
    fn from(err: StorageError) -> Self {
        match &err {
            StorageError::Policy(_) | StorageError::SymlinkRefused { .. } => {
                Self::permanent(ErrorCode::PathPolicy, err.to_string())
            },
            StorageError::Io { .. } => Self::transient(ErrorCode::Storage, err.to_string()),
        }
    }
}

/// Validates the target and prepares its parent directory: containment
/// check, symlink walk, directory creation. Returns the resolved root.
fn prepare_target(root: &Path, target: &Path) -> Result<PathBuf, StorageError> {
    path_policy::ensure_within_root(root, target)?;

    let root_resolved = fs::canonicalize(root)
        .map_err(|err| StorageError::io(format!("resolve storage root {}", root.display()), err))?;

    let parent = target
        .parent()
        .ok_or_else(|| StorageError::Policy(PathPolicyError("target has no parent".into())))?;

    // Walk existing components below the root; any symlink is refused
    // before a single directory is created.
    let relative = parent.strip_prefix(root).map_or_else(
        |_| {
            parent
                .strip_prefix(&root_resolved)
                .map(Path::to_path_buf)
                .map_err(|_| StorageError::Policy(PathPolicyError("target path escapes root".into())))
        },
        |rel| Ok(rel.to_path_buf()),
    )?;

    let mut current = root_resolved.clone();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(StorageError::SymlinkRefused { path: current });
            },
            Ok(_) => {},
            // Missing components are created below.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
            Err(err) => {
                return Err(StorageError::io(
                    format!("stat path component {}", current.display()),
                    err,
                ));
            },
        }
    }

    let parent_resolved = root_resolved.join(&relative);
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&parent_resolved)
            .map_err(|err| {
                StorageError::io(
                    format!("create directory {}", parent_resolved.display()),
                    err,
                )
            })?;
    }

    Ok(root_resolved)
}

fn apply_mode(file: &File, mode: u32) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|err| StorageError::io("set file mode", err))
}

fn fsync_dir_best_effort(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        if let Err(err) = handle.sync_all() {
            tracing::debug!(dir = %dir.display(), error = %err, "directory fsync failed");
        }
    }
}

/// Writes `data` to `target` atomically (temp file + fsync + rename).
///
/// Returns the absolute path written.
///
/// # Errors
///
/// [`StorageError::Policy`]/[`StorageError::SymlinkRefused`] for boundary
/// violations (permanent), [`StorageError::Io`] for I/O failures
/// (transient). The temp file is removed on any failure before the rename.
pub fn write_atomic(
    root: &Path,
    target: &Path,
    data: &[u8],
    options: &WriteOptions,
) -> Result<PathBuf, StorageError> {
    let root_resolved = prepare_target(root, target)?;
    let file_name = target
        .file_name()
        .ok_or_else(|| StorageError::Policy(PathPolicyError("target has no file name".into())))?;
    let parent = target
        .parent()
        .map(|parent| rebase(parent, root, &root_resolved))
        .ok_or_else(|| StorageError::Policy(PathPolicyError("target has no parent".into())))?;
    let final_path = parent.join(file_name);

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(&parent)
        .map_err(|err| StorageError::io("create temp file", err))?;

    tmp.write_all(data)
        .map_err(|err| StorageError::io("write temp file", err))?;
    tmp.flush()
        .map_err(|err| StorageError::io("flush temp file", err))?;
    if options.fsync {
        tmp.as_file()
            .sync_all()
            .map_err(|err| StorageError::io("fsync temp file", err))?;
    }
    apply_mode(tmp.as_file(), options.mode)?;

    tmp.persist(&final_path)
        .map_err(|err| StorageError::io("rename temp file onto target", err.error))?;

    if options.fsync {
        fsync_dir_best_effort(&parent);
    }
    Ok(final_path)
}

/// Non-atomic write for tests and explicit opt-out. Same validation, same
/// mode enforcement, no temp file.
///
/// # Errors
///
/// Same taxonomy as [`write_atomic`].
pub fn write_direct(
    root: &Path,
    target: &Path,
    data: &[u8],
    options: &WriteOptions,
) -> Result<PathBuf, StorageError> {
    use std::os::unix::fs::OpenOptionsExt;

    let root_resolved = prepare_target(root, target)?;
    let final_path = rebase(target, root, &root_resolved);

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(options.mode)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&final_path)
        .map_err(|err| {
            if err.raw_os_error() == Some(libc::ELOOP) {
                StorageError::SymlinkRefused {
                    path: final_path.clone(),
                }
            } else {
                StorageError::io(format!("open {}", final_path.display()), err)
            }
        })?;

    file.write_all(data)
        .map_err(|err| StorageError::io("write file", err))?;
    file.flush()
        .map_err(|err| StorageError::io("flush file", err))?;
    // The open mode only applies on create; overwrites need it re-applied.
    apply_mode(&file, options.mode)?;
    if options.fsync {
        file.sync_all()
            .map_err(|err| StorageError::io("fsync file", err))?;
        if let Some(parent) = final_path.parent() {
            fsync_dir_best_effort(parent);
        }
    }
    Ok(final_path)
}

/// Rewrites `path` from the configured root onto the resolved root.
fn rebase(path: &Path, root: &Path, root_resolved: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map_or_else(|_| path.to_path_buf(), |rel| root_resolved.join(rel))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn options() -> WriteOptions {
        WriteOptions::default()
    }

    #[test]
    fn atomic_write_creates_file_with_content_and_mode() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("user/Customers/ACME/Ticket-1.pdf");

        let written = write_atomic(root.path(), &target, b"%PDF-1.7", &options()).unwrap();

        assert_eq!(fs::read(&written).unwrap(), b"%PDF-1.7");
        let mode = fs::metadata(&written).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640, "mode was {mode:o}");
    }

    #[test]
    fn atomic_write_overwrites_existing_file() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("a/file.pdf");

        write_atomic(root.path(), &target, b"first", &options()).unwrap();
        let written = write_atomic(root.path(), &target, b"second", &options()).unwrap();
        assert_eq!(fs::read(written).unwrap(), b"second");
    }

    #[test]
    fn created_directories_use_restrictive_mode() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("newdir/file.pdf");
        write_atomic(root.path(), &target, b"x", &options()).unwrap();

        let mode = fs::metadata(root.path().join("newdir"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o750, "dir mode was {mode:o}");
    }

    #[test]
    fn rejects_target_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let target = elsewhere.path().join("escape.pdf");

        let err = write_atomic(root.path(), &target, b"x", &options()).unwrap_err();
        assert!(matches!(err, StorageError::Policy(_)));
        assert!(!target.exists());
    }

    #[test]
    fn rejects_traversal_inside_root() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("a/../../escape.pdf");
        let err = write_atomic(root.path(), &target, b"x", &options()).unwrap_err();
        assert!(matches!(err, StorageError::Policy(_)));
    }

    #[test]
    fn rejects_symlink_component() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();

        let target = root.path().join("link/file.pdf");
        let err = write_atomic(root.path(), &target, b"x", &options()).unwrap_err();
        assert!(
            matches!(err, StorageError::SymlinkRefused { .. }),
            "got {err:?}"
        );
        assert!(!outside.path().join("file.pdf").exists());
    }

    #[test]
    fn symlink_violation_maps_to_permanent_path_policy() {
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/etc", root.path().join("link")).unwrap();

        let err = write_atomic(
            root.path(),
            &root.path().join("link/file.pdf"),
            b"x",
            &options(),
        )
        .unwrap_err();
        let job = JobError::from(err);
        assert_eq!(job.code(), Some(ErrorCode::PathPolicy));
        assert!(!job.keep_trigger());
    }

    #[test]
    fn io_failures_map_to_transient_storage() {
        let root = tempfile::tempdir().unwrap();
        let missing_root = root.path().join("does-not-exist");
        let err = write_atomic(
            &missing_root,
            &missing_root.join("file.pdf"),
            b"x",
            &options(),
        )
        .unwrap_err();
        let job = JobError::from(err);
        assert_eq!(job.code(), Some(ErrorCode::Storage));
        assert!(job.keep_trigger());
    }

    #[test]
    fn no_temp_file_remains_after_success() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("dir/file.pdf");
        write_atomic(root.path(), &target, b"x", &options()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(root.path().join("dir"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn direct_write_refuses_symlink_target() {
        let root = tempfile::tempdir().unwrap();
        let real = root.path().join("real.txt");
        fs::write(&real, b"original").unwrap();
        std::os::unix::fs::symlink(&real, root.path().join("alias.pdf")).unwrap();

        let err = write_direct(
            root.path(),
            &root.path().join("alias.pdf"),
            b"x",
            &options(),
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::SymlinkRefused { .. }));
        assert_eq!(fs::read(&real).unwrap(), b"original");
    }

    #[test]
    fn atomic_write_replaces_symlink_entry_without_following_it() {
        let root = tempfile::tempdir().unwrap();
        let sensitive = root.path().join("sensitive.txt");
        fs::write(&sensitive, b"sensitive").unwrap();
        std::os::unix::fs::symlink(&sensitive, root.path().join("state.pdf")).unwrap();

        write_atomic(root.path(), &root.path().join("state.pdf"), b"new", &options()).unwrap();

        assert_eq!(fs::read(&sensitive).unwrap(), b"sensitive");
        let meta = fs::symlink_metadata(root.path().join("state.pdf")).unwrap();
        assert!(!meta.file_type().is_symlink());
    }

    #[test]
    fn writes_through_resolved_root_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real_root = dir.path().join("real");
        fs::create_dir(&real_root).unwrap();
        let link_root = dir.path().join("link");
        std::os::unix::fs::symlink(&real_root, &link_root).unwrap();

        let target = link_root.join("a/file.pdf");
        let written = write_atomic(&link_root, &target, b"x", &options()).unwrap();
        assert!(written.starts_with(&real_root) || written.starts_with(&link_root));
        assert_eq!(fs::read(real_root.join("a/file.pdf")).unwrap(), b"x");
    }
}
