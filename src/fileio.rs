//! C1: safe, symlink-resistant, atomic file I/O.
//!
//! Every later component that touches the filesystem goes through here.
//! Opens refuse to follow a symlink in the leaf component (`O_NOFOLLOW`);
//! writes land via a sibling temp file + rename + directory fsync so a
//! reader never observes a partial write.

use std::fs::{File, Permissions};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rustix::fs::{Mode, OFlags};

use crate::error::{CommandRunnerError, Result};

fn map_rustix_err(err: rustix::io::Errno, path: &Path) -> CommandRunnerError {
    match err {
        rustix::io::Errno::NOENT => {
            CommandRunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("not found: {}", path.display()),
            ))
        }
        rustix::io::Errno::LOOP | rustix::io::Errno::MLINK => {
            CommandRunnerError::PathUnsafe(format!("symlink encountered: {}", path.display()))
        }
        rustix::io::Errno::ACCESS | rustix::io::Errno::PERM => {
            CommandRunnerError::PermissionDenied(path.display().to_string())
        }
        rustix::io::Errno::EXIST => CommandRunnerError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("already exists: {}", path.display()),
        )),
        other => CommandRunnerError::Io(other.into()),
    }
}

fn require_absolute(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(CommandRunnerError::PathUnsafe(format!(
            "path is not absolute: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Open `path` for reading, refusing to traverse through a symlink at the
/// leaf component.
pub fn open_read(path: &Path) -> Result<File> {
    require_absolute(path)?;
    let fd = rustix::fs::open(
        path,
        OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| map_rustix_err(e, path))?;
    Ok(File::from(fd))
}

/// Read the full contents of `path`.
pub fn read_all(path: &Path) -> Result<Vec<u8>> {
    let mut file = open_read(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Metadata of `path`, without following a symlink in the leaf component.
pub fn stat(path: &Path) -> Result<std::fs::Metadata> {
    require_absolute(path)?;
    std::fs::symlink_metadata(path).map_err(|e| map_rustix_err_io(e, path))
}

fn map_rustix_err_io(err: std::io::Error, path: &Path) -> CommandRunnerError {
    match err.kind() {
        std::io::ErrorKind::NotFound => CommandRunnerError::Io(err),
        std::io::ErrorKind::PermissionDenied => {
            CommandRunnerError::PermissionDenied(path.display().to_string())
        }
        _ => CommandRunnerError::Io(err),
    }
}

/// Write `contents` to `path` atomically: write to a sibling temp file in
/// the same directory, set exactly `mode`, rename over the target, then
/// fsync the directory so the rename itself is durable.
///
/// Refuses to widen an existing file's mode: if `path` already exists with
/// a stricter mode than requested, the write still proceeds but the
/// final mode is the intersection (never wider than either the existing
/// mode or the requested one).
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    require_absolute(path)?;
    let parent = path.parent().ok_or_else(|| {
        CommandRunnerError::PathUnsafe(format!("path has no parent: {}", path.display()))
    })?;

    let effective_mode = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.permissions().mode() & mode,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => mode,
        Err(e) => return Err(map_rustix_err_io(e, path)),
    };

    let tmp_path = sibling_temp_path(parent, path);
    {
        let fd = rustix::fs::openat(
            rustix::fs::CWD,
            &tmp_path,
            OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::from_raw_mode(0o600),
        )
        .map_err(|e| map_rustix_err(e, &tmp_path))?;
        let mut file = File::from(fd);
        std::io::Write::write_all(&mut file, contents)?;
        file.sync_all()?;
        std::fs::set_permissions(&tmp_path, Permissions::from_mode(effective_mode))?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(map_rustix_err_io(e, path));
    }

    fsync_dir(parent)?;
    Ok(())
}

/// Exclusive atomic write: fails with `AlreadyExists` if `path` is already
/// present (no temp-file dance needed since there is nothing to replace).
pub fn write_atomic_exclusive(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    require_absolute(path)?;
    let parent = path.parent().ok_or_else(|| {
        CommandRunnerError::PathUnsafe(format!("path has no parent: {}", path.display()))
    })?;
    let fd = rustix::fs::openat(
        rustix::fs::CWD,
        path,
        OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::from_raw_mode(mode),
    )
    .map_err(|e| map_rustix_err(e, path))?;
    let mut file = File::from(fd);
    std::io::Write::write_all(&mut file, contents)?;
    file.sync_all()?;
    fsync_dir(parent)?;
    Ok(())
}

fn sibling_temp_path(parent: &Path, target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmp".to_string());
    parent.join(format!(".{file_name}.{}.tmp", std::process::id()))
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let dir_file = File::open(dir)?;
    dir_file.sync_all()?;
    Ok(())
}
