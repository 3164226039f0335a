//! C7: executor & output capture.
//!
//! Resolves the command's binary under the trusted PATH (C5), launches it
//! with an environment built *only* from the already-expanded runtime
//! environment (the parent process's own environment is never inherited),
//! captures stdout/stderr under a hard byte cap, enforces the per-command
//! timeout with a SIGTERM→SIGKILL escalation, and — if the command declares
//! an `output_file` — writes the captured stdout atomically through C1.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::audit::{AuditEvent, AuditSink};
use crate::cancel;
use crate::config::expand::RuntimeCommand;
use crate::error::{CommandRunnerError, Result};
use crate::fileio;
use crate::privilege::{self, PrivilegeManager};
use crate::risk;

/// Grace period between SIGTERM and SIGKILL on timeout or cancellation
/// (spec §4.7 step 6).
pub const TERM_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How often the waiter wakes up to check the deadline and the
/// cancellation flag while the child is still running.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
    pub timed_out: bool,
    pub truncated: bool,
}

struct CapturedStream {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Read `stream` into a buffer capped at `cap` bytes, draining (and
/// discarding) anything past the cap so the child never blocks writing to a
/// full pipe once truncation has begun.
fn spawn_capped_reader(
    mut stream: impl Read + Send + 'static,
    cap: usize,
) -> std::thread::JoinHandle<CapturedStream> {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 64 * 1024];
        let mut out = Vec::new();
        let mut truncated = false;
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if truncated {
                continue;
            }
            let room = cap.saturating_sub(out.len());
            if n <= room {
                out.extend_from_slice(&chunk[..n]);
            } else {
                out.extend_from_slice(&chunk[..room]);
                truncated = true;
            }
        }
        CapturedStream {
            bytes: out,
            truncated,
        }
    })
}

fn send_signal(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

/// Execute `command`, elevating through `privilege` first if `run_as_user`
/// or `run_as_group` is set. Writes the captured stdout to
/// `effective_output_file` on success, if one is declared.
pub fn execute(
    command: &RuntimeCommand,
    privilege: &PrivilegeManager,
    audit: &dyn AuditSink,
) -> Result<ExecutionResult> {
    let resolved = risk::resolve_trusted(&command.expanded_cmd)?;
    let needs_elevation =
        command.spec.run_as_user.is_some() || command.spec.run_as_group.is_some();

    let result = if needs_elevation {
        let (uid, gid) = privilege::resolve_run_as(
            command.spec.run_as_user.as_deref(),
            command.spec.run_as_group.as_deref(),
        )?;
        audit.emit(&AuditEvent::PrivElevate { uid, gid });
        let outcome = privilege.with_elevated(uid, gid, || run_child(&resolved, command))?;
        audit.emit(&AuditEvent::PrivDrop {
            uid: privilege.current_euid(),
            gid: privilege.current_egid(),
        });
        outcome
    } else {
        run_child(&resolved, command)?
    };

    if let Some(output_path) = &command.effective_output_file {
        fileio::write_atomic_exclusive(output_path, &result.stdout, 0o600)?;
    }

    Ok(result)
}

fn run_child(resolved: &Path, command: &RuntimeCommand) -> Result<ExecutionResult> {
    let start = Instant::now();

    let mut cmd = Command::new(resolved);
    cmd.args(&command.expanded_args);
    cmd.current_dir(&command.effective_workdir);
    cmd.env_clear();
    cmd.envs(&command.expanded_env);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| CommandRunnerError::ExecSpawn {
        command: command.expanded_cmd.clone(),
        source: e,
    })?;

    let cap = usize::try_from(command.effective_max_output_size).unwrap_or(usize::MAX);
    let stdout_reader = spawn_capped_reader(child.stdout.take().expect("piped stdout"), cap);
    let stderr_reader = spawn_capped_reader(child.stderr.take().expect("piped stderr"), cap);

    let timeout = Duration::from_secs(command.effective_timeout);
    let (status, timed_out) = wait_with_deadline(&mut child, timeout)?;

    let stdout = stdout_reader.join().unwrap_or(CapturedStream {
        bytes: Vec::new(),
        truncated: false,
    });
    let stderr = stderr_reader.join().unwrap_or(CapturedStream {
        bytes: Vec::new(),
        truncated: false,
    });

    Ok(ExecutionResult {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout.bytes,
        stderr: stderr.bytes,
        duration: start.elapsed(),
        timed_out,
        truncated: stdout.truncated || stderr.truncated,
    })
}

/// Wait for `child`, polling in small slices so both the deadline and an
/// operator SIGINT can be observed promptly. Escalates SIGTERM→SIGKILL on
/// either condition; a SIGINT during the wait surfaces as `Cancelled`
/// rather than as a timeout, so the caller's cleanup path can distinguish
/// the two.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    let start = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        let slice = POLL_INTERVAL.min(remaining.max(Duration::from_millis(1)));
        if let Some(status) = child.wait_timeout(slice).map_err(CommandRunnerError::Io)? {
            return Ok((status, false));
        }
        if cancel::is_cancelled() {
            escalate_and_wait(child)?;
            return Err(CommandRunnerError::Cancelled);
        }
        if start.elapsed() >= timeout {
            let status = escalate_and_wait(child)?;
            return Ok((status, true));
        }
    }
}

/// SIGTERM, wait a grace period, SIGKILL if still alive.
fn escalate_and_wait(child: &mut Child) -> Result<ExitStatus> {
    send_signal(child.id(), libc::SIGTERM);
    if let Some(status) = child
        .wait_timeout(TERM_GRACE_PERIOD)
        .map_err(CommandRunnerError::Io)?
    {
        return Ok(status);
    }
    send_signal(child.id(), libc::SIGKILL);
    child.wait().map_err(CommandRunnerError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::expand::expand;
    use crate::config::ConfigSpec;

    fn expand_one(toml: &str) -> RuntimeCommand {
        let spec = ConfigSpec::from_toml_str(toml).unwrap();
        let rt = expand(&spec).unwrap();
        let (_, mut commands) = rt.groups.into_iter().next().unwrap();
        commands.remove(0)
    }

    #[test]
    fn echo_captures_stdout_and_exits_zero() {
        let command = expand_one(
            r#"
            version = "1.0"
            [global]
            timeout = 5
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "/bin/echo"
            args = ["hello"]
        "#,
        );
        let privilege = PrivilegeManager::system();
        let audit = crate::audit::CapturingAuditSink::new();
        let result = execute(&command, &privilege, &audit).unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"hello\n");
        assert!(!result.timed_out);
        assert!(!result.truncated);
    }

    #[test]
    fn nonzero_exit_is_reported_without_erroring() {
        let command = expand_one(
            r#"
            version = "1.0"
            [global]
            timeout = 5
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "/bin/false"
        "#,
        );
        let privilege = PrivilegeManager::system();
        let audit = crate::audit::CapturingAuditSink::new();
        let result = execute(&command, &privilege, &audit).unwrap();
        assert_ne!(result.exit_code, 0);
    }

    #[test]
    fn output_exceeding_cap_is_truncated() {
        let command = expand_one(
            r#"
            version = "1.0"
            [global]
            timeout = 5
            max_output_size = 8
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "/bin/echo"
            args = ["0123456789abcdef"]
        "#,
        );
        let privilege = PrivilegeManager::system();
        let audit = crate::audit::CapturingAuditSink::new();
        let result = execute(&command, &privilege, &audit).unwrap();
        assert!(result.truncated);
        assert_eq!(result.stdout.len(), 8);
    }

    #[test]
    fn timeout_escalates_and_marks_timed_out() {
        let command = expand_one(
            r#"
            version = "1.0"
            [global]
            timeout = 1
            [[groups]]
            name = "g"
            [[groups.commands]]
            name = "c"
            cmd = "/bin/sleep"
            args = ["30"]
        "#,
        );
        let privilege = PrivilegeManager::system();
        let audit = crate::audit::CapturingAuditSink::new();
        let start = Instant::now();
        let result = execute(&command, &privilege, &audit).unwrap();
        assert!(result.timed_out);
        // TERM_GRACE_PERIOD bound: sleep 30 ignores nothing special, so it
        // dies on SIGTERM well inside the grace window.
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn output_file_is_written_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
            version = "1.0"
            [global]
            timeout = 5
            [[groups]]
            name = "g"
            workdir = "{workdir}"
            [[groups.commands]]
            name = "c"
            cmd = "/bin/echo"
            args = ["captured"]
            output_file = "out.txt"
        "#,
            workdir = tmp.path().display()
        );
        let command = expand_one(&toml);
        let privilege = PrivilegeManager::system();
        let audit = crate::audit::CapturingAuditSink::new();
        execute(&command, &privilege, &audit).unwrap();
        let contents = std::fs::read(tmp.path().join("out.txt")).unwrap();
        assert_eq!(contents, b"captured\n");
    }
}
