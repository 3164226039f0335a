//! Shared fixtures and process-driving helpers for the integration suite.
//!
//! Every test here drives the real `record`/`verify`/`runner` binaries as
//! subprocesses (via `assert_cmd`) rather than calling library functions
//! directly, so these tests exercise the same CLI surface an operator
//! would.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;

/// A self-cleaning sandbox: a hash-store directory plus a scratch directory
/// for files to be recorded/verified/run.
pub struct Sandbox {
    pub hash_dir: TempDir,
    pub work_dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            hash_dir: TempDir::new().unwrap(),
            work_dir: TempDir::new().unwrap(),
        }
    }

    pub fn hash_dir_path(&self) -> &Path {
        self.hash_dir.path()
    }

    pub fn work_path(&self, name: &str) -> PathBuf {
        self.work_dir.path().join(name)
    }

    /// Write `contents` to `name` under the scratch directory with `mode`,
    /// returning the absolute path.
    pub fn write_file(&self, name: &str, contents: &str, mode: u32) -> PathBuf {
        let path = self.work_path(name);
        fs::write(&path, contents).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    /// Record the given path into this sandbox's hash store via the real
    /// `record` binary.
    pub fn record(&self, path: &Path) {
        record_cmd()
            .arg("--hash-dir")
            .arg(self.hash_dir_path())
            .arg(path)
            .assert()
            .success();
    }
}

pub fn record_cmd() -> Command {
    Command::cargo_bin("record").unwrap()
}

pub fn verify_cmd() -> Command {
    Command::cargo_bin("verify").unwrap()
}

pub fn runner_cmd() -> Command {
    Command::cargo_bin("runner").unwrap()
}

/// A minimal, valid single-group, single-command TOML config body. Callers
/// interpolate in a `cmd` line (already resolved to a trusted binary, e.g.
/// `/usr/bin/echo`) and any extra per-test fields.
pub fn minimal_config(cmd: &str, args: &str) -> String {
    format!(
        r#"
version = "1.0"

[global]
timeout = 5

[[groups]]
name = "main"

[[groups.commands]]
name = "step"
cmd = "{cmd}"
args = [{args}]
"#
    )
}
