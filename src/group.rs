//! C8: group/resource orchestration.
//!
//! Walks a [`RuntimeConfig`]'s groups in the ascending-priority order C4
//! already sorted them into, classifying (C5), elevating (C6) and executing
//! (C7) each command in turn, emitting audit events (C9) around every step.
//! A `temp_dir` group gets a freshly created, mode-0700 workspace that
//! outlives every command in the group and is removed once the group is
//! done, on every exit path.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use crate::audit::{AuditEvent, AuditSink};
use crate::cancel;
use crate::config::expand::{RuntimeCommand, RuntimeConfig};
use crate::error::{CommandRunnerError, Result};
use crate::executor::{self, ExecutionResult};
use crate::privilege::PrivilegeManager;
use crate::risk::{self, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Normal,
    DryRun,
}

/// Whether a failing command should stop the whole run, or just leave that
/// group's remaining commands unrun while later groups still get a chance.
/// A command failure always aborts *its own* group; this only controls
/// whether later groups are attempted.
#[derive(Debug, Clone, Copy)]
pub struct RunPolicy {
    pub abort_on_group_failure: bool,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            abort_on_group_failure: true,
        }
    }
}

/// Caller-supplied decision for whether a high/critical-risk command may
/// proceed. The interactive (`dialoguer`) implementation lives in the
/// `runner` binary; this boundary exists so `group::run` stays testable
/// without a terminal.
pub trait Confirmer: Send + Sync {
    fn confirm(&self, command_name: &str, level: RiskLevel) -> bool;
}

/// Never prompts, always proceeds. Appropriate for `--yes` and for dry runs,
/// where nothing is actually executed.
pub struct AlwaysConfirm;

impl Confirmer for AlwaysConfirm {
    fn confirm(&self, _command_name: &str, _level: RiskLevel) -> bool {
        true
    }
}

/// Never proceeds past `high`. Useful for non-interactive callers that want
/// risky commands to fail closed rather than hang on a prompt.
pub struct NeverConfirm;

impl Confirmer for NeverConfirm {
    fn confirm(&self, _command_name: &str, _level: RiskLevel) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct CommandOutcome {
    pub group: String,
    pub command: String,
    pub risk: RiskLevel,
    pub execution: Option<ExecutionResult>,
    pub error_message: Option<String>,
    pub error_exit_code: Option<i32>,
}

impl CommandOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error_message.is_none()
            && self
                .execution
                .as_ref()
                .is_some_and(|e| !e.timed_out && e.exit_code == 0)
    }
}

#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub name: String,
    pub commands: Vec<CommandOutcome>,
    pub aborted: bool,
}

impl GroupOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.commands.iter().all(CommandOutcome::succeeded)
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub groups: Vec<GroupOutcome>,
}

impl RunSummary {
    /// First non-zero exit code found, in group/command order; `0` if every
    /// command in every attempted group succeeded.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        for group in &self.groups {
            for command in &group.commands {
                if let Some(code) = command.error_exit_code {
                    return code;
                }
                if let Some(exec) = &command.execution {
                    if exec.timed_out || exec.exit_code != 0 {
                        return 1;
                    }
                }
            }
        }
        0
    }
}

fn outcome_from_error(group: &str, command: &str, err: &CommandRunnerError) -> CommandOutcome {
    CommandOutcome {
        group: group.to_string(),
        command: command.to_string(),
        risk: RiskLevel::Low,
        execution: None,
        error_message: Some(err.to_string()),
        error_exit_code: Some(err.exit_code()),
    }
}

/// Run every group of `config` in order, per `mode` and `policy`.
pub fn run(
    config: &mut RuntimeConfig,
    mode: RunMode,
    policy: &RunPolicy,
    privilege: &PrivilegeManager,
    confirmer: &dyn Confirmer,
    audit: &dyn AuditSink,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();

    for (group, commands) in &mut config.groups {
        if cancel::is_cancelled() {
            break;
        }

        let temp_guard = if group.spec.temp_dir {
            Some(make_temp_workspace(&group.spec.name)?)
        } else {
            None
        };

        if let Some(guard) = &temp_guard {
            apply_temp_workdir(commands.as_mut_slice(), guard.path());
        }

        let outcome = run_group(
            &group.spec.name,
            commands.as_slice(),
            mode,
            privilege,
            confirmer,
            audit,
        );

        if let Some(guard) = temp_guard {
            let path = guard.path().display().to_string();
            drop(guard);
            audit.emit(&AuditEvent::Cleanup {
                hook: format!("temp_dir:{path}"),
                error: None,
            });
        }

        let group_failed = !outcome.succeeded();
        summary.groups.push(outcome);

        if group_failed && policy.abort_on_group_failure {
            break;
        }
    }

    Ok(summary)
}

fn make_temp_workspace(group_name: &str) -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix(&format!("cmdrunner-{group_name}-"))
        .permissions(std::fs::Permissions::from_mode(0o700))
        .tempdir_in(std::env::temp_dir())
        .map_err(CommandRunnerError::Io)
}

/// Point every command that did not itself specify a `workdir` (directly or
/// via its group) at the group's freshly created temp directory, rewriting
/// any relative `output_file` alongside it so it still lands under the new
/// workdir rather than the one resolved at expansion time.
fn apply_temp_workdir(commands: &mut [RuntimeCommand], temp_dir: &std::path::Path) {
    for command in commands {
        let command_pinned = command.spec.workdir.is_some();
        let group_pinned = command.parent.spec.workdir.is_some();
        if command_pinned || group_pinned {
            continue;
        }

        let old_workdir = PathBuf::from(&command.effective_workdir);
        if let Some(output) = &command.effective_output_file {
            if let Ok(rel) = output.strip_prefix(&old_workdir) {
                command.effective_output_file = Some(temp_dir.join(rel));
            }
        }
        command.effective_workdir = temp_dir.to_string_lossy().into_owned();
    }
}

fn run_group(
    group_name: &str,
    commands: &[RuntimeCommand],
    mode: RunMode,
    privilege: &PrivilegeManager,
    confirmer: &dyn Confirmer,
    audit: &dyn AuditSink,
) -> GroupOutcome {
    let mut outcome = GroupOutcome {
        name: group_name.to_string(),
        commands: Vec::new(),
        aborted: false,
    };

    for command in commands {
        if cancel::is_cancelled() {
            outcome.aborted = true;
            break;
        }

        let command_outcome = run_command(group_name, command, mode, privilege, confirmer, audit);
        let failed = !command_outcome.succeeded();
        outcome.commands.push(command_outcome);
        if failed {
            outcome.aborted = true;
            break;
        }
    }

    outcome
}

fn run_command(
    group_name: &str,
    command: &RuntimeCommand,
    mode: RunMode,
    privilege: &PrivilegeManager,
    confirmer: &dyn Confirmer,
    audit: &dyn AuditSink,
) -> CommandOutcome {
    let level = match risk::validate_command(command) {
        Ok(level) => level,
        Err(e) => return outcome_from_error(group_name, &command.spec.name, &e),
    };
    audit.emit(&AuditEvent::Risk {
        command: command.spec.name.clone(),
        level: level.to_string(),
    });

    if mode == RunMode::Normal
        && risk::requires_confirmation(level)
        && !confirmer.confirm(&command.spec.name, level)
    {
        let err = CommandRunnerError::RiskRejected {
            command: command.spec.name.clone(),
            reason: format!("operator declined confirmation at {level} risk"),
        };
        return outcome_from_error(group_name, &command.spec.name, &err);
    }

    audit.emit(&AuditEvent::ExecStart {
        command: command.spec.name.clone(),
        group: group_name.to_string(),
    });

    let execution = match mode {
        RunMode::DryRun => simulate(command, privilege),
        RunMode::Normal => executor::execute(command, privilege, audit),
    };

    match execution {
        Ok(result) => {
            audit.emit(&AuditEvent::ExecEnd {
                command: command.spec.name.clone(),
                exit_code: result.exit_code,
                duration_ms: result.duration.as_millis(),
            });
            if result.timed_out {
                audit.emit(&AuditEvent::ExecTimeout {
                    command: command.spec.name.clone(),
                    timeout_secs: command.effective_timeout,
                });
            }
            if result.truncated {
                audit.emit(&AuditEvent::OutputTruncate {
                    command: command.spec.name.clone(),
                    cap_bytes: command.effective_max_output_size,
                });
            }
            if let Some(path) = &command.effective_output_file {
                audit.emit(&AuditEvent::OutputWrite {
                    command: command.spec.name.clone(),
                    path: path.display().to_string(),
                });
            }
            CommandOutcome {
                group: group_name.to_string(),
                command: command.spec.name.clone(),
                risk: level,
                execution: Some(result),
                error_message: None,
                error_exit_code: None,
            }
        }
        Err(e) => {
            let mut outcome = outcome_from_error(group_name, &command.spec.name, &e);
            outcome.risk = level;
            outcome
        }
    }
}

/// Dry-run execution: no elevation, no spawn, no I/O — just a report of
/// what would have happened, for operators auditing a config before it ever
/// touches a live system.
fn simulate(command: &RuntimeCommand, privilege: &PrivilegeManager) -> Result<ExecutionResult> {
    let resolved = risk::resolve_trusted(&command.expanded_cmd)?;
    let (uid, gid) = if command.spec.run_as_user.is_some() || command.spec.run_as_group.is_some() {
        crate::privilege::resolve_run_as(
            command.spec.run_as_user.as_deref(),
            command.spec.run_as_group.as_deref(),
        )?
    } else {
        (privilege.current_euid(), privilege.current_egid())
    };

    tracing::info!(
        event = "dry_run.plan",
        command = %resolved.display(),
        args = ?command.expanded_args,
        workdir = %command.effective_workdir,
        uid = uid,
        gid = gid,
        "would execute"
    );

    Ok(ExecutionResult {
        exit_code: 0,
        stdout: Vec::new(),
        stderr: Vec::new(),
        duration: Duration::ZERO,
        timed_out: false,
        truncated: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::CapturingAuditSink;
    use crate::config::ConfigSpec;

    fn build(toml: &str) -> RuntimeConfig {
        let spec = ConfigSpec::from_toml_str(toml).unwrap();
        crate::config::expand::expand(&spec).unwrap()
    }

    #[test]
    fn dry_run_never_spawns_and_reports_zero() {
        cancel::reset_for_test();
        let mut config = build(
            r#"
            version = "1.0"
            [global]
            timeout = 5
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "/bin/echo"
            args = ["hi"]
        "#,
        );
        let privilege = PrivilegeManager::system();
        let audit = CapturingAuditSink::new();
        let summary = run(
            &mut config,
            RunMode::DryRun,
            &RunPolicy::default(),
            &privilege,
            &AlwaysConfirm,
            &audit,
        )
        .unwrap();
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.groups[0].commands[0].execution.as_ref().unwrap().stdout, Vec::<u8>::new());
    }

    #[test]
    fn failing_command_aborts_its_group() {
        cancel::reset_for_test();
        let mut config = build(
            r#"
            version = "1.0"
            [global]
            timeout = 5
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "fails"
            cmd = "/bin/false"
            [[groups.commands]]
            name = "never_runs"
            cmd = "/bin/echo"
        "#,
        );
        let privilege = PrivilegeManager::system();
        let audit = CapturingAuditSink::new();
        let summary = run(
            &mut config,
            RunMode::Normal,
            &RunPolicy::default(),
            &privilege,
            &AlwaysConfirm,
            &audit,
        )
        .unwrap();
        assert_eq!(summary.groups[0].commands.len(), 1);
        assert!(summary.groups[0].aborted);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn abort_on_group_failure_false_still_runs_later_groups() {
        cancel::reset_for_test();
        let mut config = build(
            r#"
            version = "1.0"
            [global]
            timeout = 5
            [[groups]]
            name = "a"
            priority = 0
            [[groups.commands]]
            name = "fails"
            cmd = "/bin/false"
            [[groups]]
            name = "b"
            priority = 1
            [[groups.commands]]
            name = "ok"
            cmd = "/bin/echo"
        "#,
        );
        let privilege = PrivilegeManager::system();
        let audit = CapturingAuditSink::new();
        let policy = RunPolicy {
            abort_on_group_failure: false,
        };
        let summary = run(
            &mut config,
            RunMode::Normal,
            &policy,
            &privilege,
            &AlwaysConfirm,
            &audit,
        )
        .unwrap();
        assert_eq!(summary.groups.len(), 2);
        assert_eq!(summary.groups[1].name, "b");
        assert!(summary.groups[1].succeeded());
    }

    #[test]
    fn high_risk_command_rejected_without_confirmation() {
        cancel::reset_for_test();
        let mut config = build(
            r#"
            version = "1.0"
            [global]
            timeout = 5
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "/bin/echo"
            run_as_user = "root"
        "#,
        );
        let privilege = PrivilegeManager::system();
        let audit = CapturingAuditSink::new();
        let summary = run(
            &mut config,
            RunMode::Normal,
            &RunPolicy::default(),
            &privilege,
            &NeverConfirm,
            &audit,
        )
        .unwrap();
        assert_eq!(summary.exit_code(), 3);
    }

    #[test]
    fn temp_dir_group_gives_unpinned_commands_a_scratch_workdir() {
        cancel::reset_for_test();
        let mut config = build(
            r#"
            version = "1.0"
            [global]
            timeout = 5
            [[groups]]
            name = "g"
            temp_dir = true
            [[groups.commands]]
            name = "c"
            cmd = "/bin/echo"
            output_file = "out.txt"
        "#,
        );
        // Before the group runs, expansion resolved workdir to the process
        // cwd (nothing pinned a workdir); `run` must override it.
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            config.groups[0].1[0].effective_workdir,
            cwd.display().to_string()
        );

        let privilege = PrivilegeManager::system();
        let audit = CapturingAuditSink::new();
        let summary = run(
            &mut config,
            RunMode::Normal,
            &RunPolicy::default(),
            &privilege,
            &AlwaysConfirm,
            &audit,
        )
        .unwrap();
        assert!(summary.groups[0].succeeded());
        // The command's declared output never landed in the process cwd;
        // it was redirected into the (now-removed) temp workspace instead.
        assert!(!cwd.join("out.txt").exists());
    }
}
