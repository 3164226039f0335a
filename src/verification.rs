//! C3: verification manager.
//!
//! Orchestrates C2 hash checks before any command runs: the config file
//! itself, every declared `verify_files` path, and every resolved command
//! binary. Deduplicates across a run so the same path is never rehashed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hashstore::HashStore;

#[derive(Debug, Clone, Default)]
pub struct VerificationResult {
    pub verified: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl VerificationResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn merge(&mut self, other: Self) {
        self.verified.extend(other.verified);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}

/// Binaries excluded from per-invocation hashing when they match the
/// configured `skip_standard_paths` policy. Exclusions are logged by the
/// caller but never required.
#[derive(Debug, Clone, Default)]
pub struct SkipPolicy {
    paths: HashSet<PathBuf>,
}

impl SkipPolicy {
    #[must_use]
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }

    /// Conservative default: a handful of well-known, effectively
    /// immutable OS binaries. Platform-dependent by design (spec Open
    /// Question 1) — callers may override wholesale.
    #[must_use]
    pub fn conservative_default() -> Self {
        Self::new([
            PathBuf::from("/usr/bin/true"),
            PathBuf::from("/usr/bin/false"),
            PathBuf::from("/usr/bin/echo"),
            PathBuf::from("/usr/bin/cat"),
            PathBuf::from("/usr/bin/test"),
        ])
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }
}

pub struct VerificationManager {
    store: HashStore,
    skip_policy: SkipPolicy,
    verified_this_run: HashSet<PathBuf>,
}

impl VerificationManager {
    #[must_use]
    pub fn new(store: HashStore, skip_policy: SkipPolicy) -> Self {
        Self {
            store,
            skip_policy,
            verified_this_run: HashSet::new(),
        }
    }

    /// Replace the skip policy once the config carrying
    /// `global.skip_standard_paths` has been parsed. The manager is
    /// constructed before the config is trusted enough to read, so the
    /// caller starts with a conservative default and swaps it in here.
    pub fn set_skip_policy(&mut self, skip_policy: SkipPolicy) {
        self.skip_policy = skip_policy;
    }

    fn verify_one(&mut self, path: &Path, result: &mut VerificationResult) {
        if self.verified_this_run.contains(path) {
            return;
        }
        match self.store.verify(path) {
            Ok(()) => {
                result.verified.push(path.to_path_buf());
                self.verified_this_run.insert(path.to_path_buf());
            }
            Err(e) => result.failed.push((path.to_path_buf(), e.to_string())),
        }
    }

    /// Verify the config file itself and return its bytes on success.
    pub fn verify_config(&mut self, path: &Path) -> Result<Vec<u8>> {
        self.store.verify_and_read(path)
    }

    /// Verify a batch of declared `verify_files` paths (global or group
    /// level — the caller expands them to `ResolvedPath`s first).
    #[must_use]
    pub fn verify_files(&mut self, paths: &[PathBuf]) -> VerificationResult {
        let mut result = VerificationResult::default();
        for path in paths {
            self.verify_one(path, &mut result);
        }
        result
    }

    /// Verify a resolved command binary, honoring the skip policy.
    #[must_use]
    pub fn verify_command_binary(&mut self, path: &Path) -> VerificationResult {
        let mut result = VerificationResult::default();
        if self.skip_policy.contains(path) {
            result.skipped.push(path.to_path_buf());
            return result;
        }
        self.verify_one(path, &mut result);
        result
    }

    /// Convenience: verify several binaries, merging results.
    #[must_use]
    pub fn verify_command_binaries(&mut self, paths: &[PathBuf]) -> VerificationResult {
        let mut result = VerificationResult::default();
        for path in paths {
            result.merge(self.verify_command_binary(path));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashstore::HashStore;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, VerificationManager) {
        let hash_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let store = HashStore::open(hash_dir.path()).unwrap();
        let mgr = VerificationManager::new(store, SkipPolicy::default());
        (hash_dir, target_dir, mgr)
    }

    #[test]
    fn verify_files_reports_success_for_recorded_file() {
        let (_hash_dir, target_dir, mut mgr) = setup();
        let target = target_dir.path().join("file.txt");
        std::fs::write(&target, b"data").unwrap();
        mgr.store.record(&target, false).unwrap();

        let result = mgr.verify_files(&[target]);
        assert!(result.is_success());
        assert_eq!(result.verified.len(), 1);
    }

    #[test]
    fn verify_files_reports_failure_for_missing_record() {
        let (_hash_dir, target_dir, mut mgr) = setup();
        let target = target_dir.path().join("file.txt");
        std::fs::write(&target, b"data").unwrap();

        let result = mgr.verify_files(&[target]);
        assert!(!result.is_success());
        assert_eq!(result.failed.len(), 1);
    }

    #[test]
    fn dedup_skips_rehashing_same_path_twice() {
        let (_hash_dir, target_dir, mut mgr) = setup();
        let target = target_dir.path().join("file.txt");
        std::fs::write(&target, b"data").unwrap();
        mgr.store.record(&target, false).unwrap();

        let r1 = mgr.verify_files(&[target.clone()]);
        assert_eq!(r1.verified.len(), 1);
        let r2 = mgr.verify_files(&[target]);
        assert!(r2.verified.is_empty());
        assert!(r2.is_success());
    }

    #[test]
    fn skip_policy_excludes_binary_from_hashing() {
        let (_hash_dir, _target_dir, mut mgr) = setup();
        let skip = PathBuf::from("/usr/bin/true");
        mgr.skip_policy = SkipPolicy::new([skip.clone()]);

        let result = mgr.verify_command_binary(&skip);
        assert!(result.is_success());
        assert_eq!(result.skipped, vec![skip]);
    }
}
