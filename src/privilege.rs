//! C6: scoped privilege elevation and drop.
//!
//! Real `seteuid`/`setegid` transitions, not a `sudo` re-exec — the process
//! itself must already hold root (typically via a setuid-root install or an
//! already-privileged parent) for any of this to succeed. Every transition
//! is audited by reading the credentials back immediately afterwards; a
//! mismatch is treated as a security incident and aborts the process rather
//! than limping on with an unverified identity.

use std::ffi::CString;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::{CommandRunnerError, Result};

/// The real (not effective) uid of the process owner — the only non-root
/// identity the privilege manager is allowed to reach (spec §1).
#[must_use]
pub fn current_real_uid() -> u32 {
    rustix::process::getuid().as_raw()
}

#[must_use]
pub fn current_real_gid() -> u32 {
    rustix::process::getgid().as_raw()
}

/// Resolve a username to a uid via the system's passwd database.
/// `"0"` and numeric strings are accepted directly without a lookup.
pub fn resolve_user_to_uid(name: &str) -> Result<u32> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    let cname = CString::new(name).map_err(|_| {
        CommandRunnerError::PrivilegeEscalationDenied(format!("invalid user name '{name}'"))
    })?;
    let passwd = unsafe { libc::getpwnam(cname.as_ptr()) };
    if passwd.is_null() {
        return Err(CommandRunnerError::PrivilegeEscalationDenied(format!(
            "no such user: '{name}'"
        )));
    }
    Ok(unsafe { (*passwd).pw_uid })
}

/// Resolve a group name to a gid via the system's group database.
pub fn resolve_group_to_gid(name: &str) -> Result<u32> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    let cname = CString::new(name).map_err(|_| {
        CommandRunnerError::PrivilegeEscalationDenied(format!("invalid group name '{name}'"))
    })?;
    let group = unsafe { libc::getgrnam(cname.as_ptr()) };
    if group.is_null() {
        return Err(CommandRunnerError::PrivilegeEscalationDenied(format!(
            "no such group: '{name}'"
        )));
    }
    Ok(unsafe { (*group).gr_gid })
}

/// Resolve a command's declared `run_as_user`/`run_as_group` to a concrete
/// `(uid, gid)` pair, defaulting each side to the process's own real
/// credentials when unset.
pub fn resolve_run_as(run_as_user: Option<&str>, run_as_group: Option<&str>) -> Result<(u32, u32)> {
    let uid = run_as_user
        .map(resolve_user_to_uid)
        .transpose()?
        .unwrap_or_else(current_real_uid);
    let gid = run_as_group
        .map(resolve_group_to_gid)
        .transpose()?
        .unwrap_or_else(current_real_gid);
    Ok((uid, gid))
}

/// Thin seam over the raw syscalls so tests can exercise the state machine
/// without actually holding root.
pub trait PrivilegeOps: Send + Sync {
    fn geteuid(&self) -> u32;
    fn getegid(&self) -> u32;
    fn seteuid(&self, uid: u32) -> std::io::Result<()>;
    fn setegid(&self, gid: u32) -> std::io::Result<()>;
}

#[derive(Debug, Default)]
pub struct SystemPrivilegeOps;

impl PrivilegeOps for SystemPrivilegeOps {
    fn geteuid(&self) -> u32 {
        rustix::process::geteuid().as_raw()
    }

    fn getegid(&self) -> u32 {
        rustix::process::getegid().as_raw()
    }

    fn seteuid(&self, uid: u32) -> std::io::Result<()> {
        let ret = unsafe { libc::seteuid(uid) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn setegid(&self, gid: u32) -> std::io::Result<()> {
        let ret = unsafe { libc::setegid(gid) };
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Guards the process-wide privilege state. There is exactly one real
/// euid/egid per process, so every caller must serialize through the same
/// manager; the lock is held only across the syscalls and the (short) body
/// of the elevated closure, never across a blocking wait on a child.
pub struct PrivilegeManager<O: PrivilegeOps = SystemPrivilegeOps> {
    ops: O,
    lock: parking_lot::Mutex<()>,
}

impl PrivilegeManager<SystemPrivilegeOps> {
    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemPrivilegeOps)
    }
}

impl<O: PrivilegeOps> PrivilegeManager<O> {
    pub fn new(ops: O) -> Self {
        Self {
            ops,
            lock: parking_lot::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn current_euid(&self) -> u32 {
        self.ops.geteuid()
    }

    #[must_use]
    pub fn current_egid(&self) -> u32 {
        self.ops.getegid()
    }

    fn audited_set(&self, uid: u32, gid: u32) -> Result<()> {
        self.ops.setegid(gid).map_err(|e| {
            CommandRunnerError::PrivilegeEscalationDenied(format!("setegid({gid}) failed: {e}"))
        })?;
        self.ops.seteuid(uid).map_err(|e| {
            CommandRunnerError::PrivilegeEscalationDenied(format!("seteuid({uid}) failed: {e}"))
        })?;
        if self.ops.geteuid() != uid || self.ops.getegid() != gid {
            // The syscalls reported success but the read-back disagrees.
            // This is exactly the situation scoped privilege transitions
            // exist to catch; there is no safe way to continue.
            tracing::error!(
                event = "priv.audit_fail",
                target_uid = uid,
                target_gid = gid,
                observed_uid = self.ops.geteuid(),
                observed_gid = self.ops.getegid(),
                "privilege post-condition audit failed, aborting"
            );
            std::process::abort();
        }
        Ok(())
    }

    /// Temporarily set euid/egid to `uid`/`gid`, run `f`, then restore the
    /// prior credentials — even if `f` panics. Intended for short-lived
    /// transitions (e.g. dropping to `run_as_user` only across a fork+exec).
    pub fn with_elevated<T>(
        &self,
        uid: u32,
        gid: u32,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let _guard = self.lock.lock();
        let prev_euid = self.ops.geteuid();
        let prev_egid = self.ops.getegid();

        self.audited_set(uid, gid)?;

        let result = catch_unwind(AssertUnwindSafe(f));

        self.audited_set(prev_euid, prev_egid)?;

        match result {
            Ok(inner) => inner,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Permanently drop to `uid`/`gid` for the remainder of the process
    /// lifetime. After dropping, attempts to regain root and treats success
    /// as a fatal security violation: a "permanent" drop that can be
    /// silently undone is worse than no drop at all.
    pub fn drop_to(&self, uid: u32, gid: u32) -> Result<()> {
        let _guard = self.lock.lock();
        self.audited_set(uid, gid)?;

        if uid != 0 && self.ops.seteuid(0).is_ok() {
            std::process::abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeOps {
        euid: AtomicU32,
        egid: AtomicU32,
        deny_seteuid_zero: bool,
    }

    impl FakeOps {
        fn rooted() -> Self {
            Self {
                euid: AtomicU32::new(0),
                egid: AtomicU32::new(0),
                deny_seteuid_zero: true,
            }
        }
    }

    impl PrivilegeOps for FakeOps {
        fn geteuid(&self) -> u32 {
            self.euid.load(Ordering::SeqCst)
        }
        fn getegid(&self) -> u32 {
            self.egid.load(Ordering::SeqCst)
        }
        fn seteuid(&self, uid: u32) -> std::io::Result<()> {
            if uid == 0 && self.deny_seteuid_zero && self.euid.load(Ordering::SeqCst) != 0 {
                return Err(std::io::Error::from_raw_os_error(libc::EPERM));
            }
            self.euid.store(uid, Ordering::SeqCst);
            Ok(())
        }
        fn setegid(&self, gid: u32) -> std::io::Result<()> {
            self.egid.store(gid, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn with_elevated_restores_prior_identity_on_success() {
        let mgr = PrivilegeManager::new(FakeOps::rooted());
        let seen_uid = mgr
            .with_elevated(1000, 1000, || Ok(mgr.current_euid()))
            .unwrap();
        assert_eq!(seen_uid, 1000);
        assert_eq!(mgr.current_euid(), 0);
        assert_eq!(mgr.current_egid(), 0);
    }

    #[test]
    fn with_elevated_restores_prior_identity_on_error() {
        let mgr = PrivilegeManager::new(FakeOps::rooted());
        let result: Result<()> = mgr.with_elevated(1000, 1000, || {
            Err(CommandRunnerError::Cancelled)
        });
        assert!(result.is_err());
        assert_eq!(mgr.current_euid(), 0);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn with_elevated_restores_then_repropagates_panic() {
        let mgr = PrivilegeManager::new(FakeOps::rooted());
        let _: Result<()> = mgr.with_elevated(1000, 1000, || -> Result<()> {
            panic!("boom");
        });
    }

    #[test]
    fn drop_to_nonzero_uid_succeeds_when_reescalation_is_denied() {
        let mgr = PrivilegeManager::new(FakeOps::rooted());
        mgr.drop_to(1000, 1000).unwrap();
        assert_eq!(mgr.current_euid(), 1000);
    }

    #[test]
    fn drop_to_root_is_a_no_op_identity_change() {
        let mgr = PrivilegeManager::new(FakeOps::rooted());
        mgr.drop_to(0, 0).unwrap();
        assert_eq!(mgr.current_euid(), 0);
    }

    #[test]
    fn resolve_user_to_uid_accepts_root_by_name_and_by_number() {
        assert_eq!(resolve_user_to_uid("root").unwrap(), 0);
        assert_eq!(resolve_user_to_uid("0").unwrap(), 0);
    }

    #[test]
    fn resolve_user_to_uid_rejects_unknown_name() {
        assert!(resolve_user_to_uid("definitely-not-a-real-user-xyz").is_err());
    }

    #[test]
    fn resolve_run_as_defaults_to_current_credentials() {
        let (uid, gid) = resolve_run_as(None, None).unwrap();
        assert_eq!(uid, current_real_uid());
        assert_eq!(gid, current_real_gid());
    }
}
