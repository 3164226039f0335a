//! `runner`: the end-to-end command execution pipeline.
//!
//! Verifies the config file and every declared artifact and command binary,
//! expands the config into a concrete plan, classifies every command's
//! risk, and executes group by group — prompting interactively for
//! high/critical-risk commands unless `--yes` or `--dry-run` is given.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use cmdrunner::audit::{AuditEvent, AuditSink, TracingAuditSink};
use cmdrunner::config::expand::expand_with_env_overlay;
use cmdrunner::config::{self, ConfigSpec};
use cmdrunner::error::{CommandRunnerError, Result};
use cmdrunner::group::{AlwaysConfirm, Confirmer, RunMode, RunPolicy};
use cmdrunner::hashstore::HashStore;
use cmdrunner::paths::ResolvedPath;
use cmdrunner::privilege::PrivilegeManager;
use cmdrunner::redact::ValueRedactor;
use cmdrunner::risk::{self, RiskLevel};
use cmdrunner::verification::{SkipPolicy, VerificationManager};

#[derive(Parser)]
#[command(
    name = "runner",
    version,
    about = "Run a verified, risk-classified command configuration"
)]
struct Cli {
    /// Path to the TOML command configuration.
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Directory holding recorded file-hash records.
    #[arg(long, short = 'd', env = "CMDRUNNER_HASH_DIR")]
    hash_dir: PathBuf,

    /// Classify and log every command without spawning or elevating.
    #[arg(long)]
    dry_run: bool,

    /// Proceed past high/critical-risk confirmation prompts automatically.
    #[arg(long)]
    yes: bool,

    /// Let a failing group's later groups still run instead of aborting
    /// the whole invocation.
    #[arg(long)]
    continue_on_group_failure: bool,

    /// Emit structured JSON log lines instead of the default text format.
    #[arg(long)]
    json_logs: bool,

    /// Tracing log level filter (e.g. info, debug, cmdrunner=trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append structured log lines to this file in addition to stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

struct InteractiveConfirm;

impl Confirmer for InteractiveConfirm {
    fn confirm(&self, command_name: &str, level: RiskLevel) -> bool {
        dialoguer::Confirm::new()
            .with_prompt(format!(
                "command '{command_name}' classified as {level} risk — proceed?"
            ))
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cmdrunner::telemetry::init_with_log_file(cli.json_logs, &cli.log_level, cli.log_file.as_deref());
    cmdrunner::cancel::install_sigint_handler();

    match run(&cli) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(255)),
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn resolve_absolute(path: &PathBuf) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.clone())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let config_path = resolve_absolute(&cli.config).map_err(CommandRunnerError::Io)?;
    let resolved_config = ResolvedPath::new(&config_path)?;

    let store = HashStore::open(&cli.hash_dir)?;
    // Nothing is trusted yet, so start out verifying everything; once the
    // config is parsed below we know the operator's actual
    // `skip_standard_paths` intent and swap the policy in before any
    // command binary is checked.
    let mut verification = VerificationManager::new(store, SkipPolicy::default());

    let bootstrap_audit = TracingAuditSink::new(ValueRedactor::new());
    let config_bytes = verify_config_file(&bootstrap_audit, &mut verification, resolved_config.as_path())?;

    let config_text = String::from_utf8(config_bytes)
        .map_err(|e| CommandRunnerError::ConfigInvalid(format!("config is not UTF-8: {e}")))?;
    let spec = match ConfigSpec::from_toml_str(&config_text) {
        Ok(spec) => spec,
        Err(e) => {
            bootstrap_audit.emit(&AuditEvent::ExpandFail {
                reason: e.to_string(),
            });
            return Err(e);
        }
    };

    if spec.global.skip_standard_paths {
        verification.set_skip_policy(SkipPolicy::conservative_default());
    }

    let env_overlay = load_env_file_overlay(&bootstrap_audit, &mut verification, &spec, &config_path)?;

    let mut runtime = match expand_with_env_overlay(&spec, &env_overlay) {
        Ok(rt) => rt,
        Err(e) => {
            bootstrap_audit.emit(&AuditEvent::ExpandFail {
                reason: e.to_string(),
            });
            return Err(e);
        }
    };

    let mut redactor = ValueRedactor::new();
    redactor.register_env(&runtime.global.expanded_env);
    for (group, commands) in &runtime.groups {
        redactor.register_env(&group.expanded_env);
        for command in commands {
            redactor.register_env(&command.expanded_env);
        }
    }
    let audit: Box<dyn AuditSink> = Box::new(TracingAuditSink::new(redactor));

    verify_declared_artifacts(&audit, &mut verification, &runtime)?;
    verify_command_binaries(&audit, &mut verification, &runtime)?;

    let privilege = PrivilegeManager::system();
    let policy = RunPolicy {
        abort_on_group_failure: !cli.continue_on_group_failure,
    };
    let mode = if cli.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Normal
    };

    let confirmer: Box<dyn Confirmer> = if cli.yes || cli.dry_run {
        Box::new(AlwaysConfirm)
    } else {
        Box::new(InteractiveConfirm)
    };

    let summary = cmdrunner::group::run(
        &mut runtime,
        mode,
        &policy,
        &privilege,
        confirmer.as_ref(),
        audit.as_ref(),
    )?;

    Ok(summary.exit_code())
}

/// Load and verify the optional `global.env_file` (spec §6): mode must be
/// `<= 0600`, contents must hash-verify against the same store as every
/// other trusted input, and only then is it parsed as `KEY=value` lines.
/// Returns an empty overlay when no `env_file` is declared.
fn load_env_file_overlay(
    audit: &dyn AuditSink,
    verification: &mut VerificationManager,
    spec: &ConfigSpec,
    config_path: &std::path::Path,
) -> Result<std::collections::HashMap<String, String>> {
    let Some(env_file) = &spec.global.env_file else {
        return Ok(std::collections::HashMap::new());
    };

    let resolved = if env_file.is_absolute() {
        env_file.clone()
    } else {
        config_path
            .parent()
            .map(|dir| dir.join(env_file))
            .unwrap_or_else(|| env_file.clone())
    };
    let resolved_path = ResolvedPath::new(&resolved)?;

    let metadata = cmdrunner::fileio::stat(resolved_path.as_path())?;
    use std::os::unix::fs::PermissionsExt;
    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 != 0 {
        return Err(CommandRunnerError::PermissionDenied(format!(
            "env_file {} must not be group/world accessible (mode {mode:o})",
            resolved_path.as_path().display()
        )));
    }

    let bytes = match verification.verify_config(resolved_path.as_path()) {
        Ok(bytes) => {
            audit.emit(&AuditEvent::VerifyOk {
                path: resolved_path.as_path().display().to_string(),
            });
            bytes
        }
        Err(e) => {
            if let CommandRunnerError::HashMismatch {
                path,
                expected,
                actual,
            } = &e
            {
                audit.emit(&AuditEvent::VerifyFail {
                    path: path.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
            return Err(e);
        }
    };

    let text = String::from_utf8(bytes)
        .map_err(|e| CommandRunnerError::ConfigInvalid(format!("env_file is not UTF-8: {e}")))?;
    config::parse_env_file(&text)
}

fn verify_config_file(
    audit: &dyn AuditSink,
    verification: &mut VerificationManager,
    path: &std::path::Path,
) -> Result<Vec<u8>> {
    match verification.verify_config(path) {
        Ok(bytes) => {
            audit.emit(&AuditEvent::VerifyOk {
                path: path.display().to_string(),
            });
            Ok(bytes)
        }
        Err(e) => {
            if let CommandRunnerError::HashMismatch {
                path,
                expected,
                actual,
            } = &e
            {
                audit.emit(&AuditEvent::VerifyFail {
                    path: path.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
            Err(e)
        }
    }
}

fn verify_declared_artifacts(
    audit: &dyn AuditSink,
    verification: &mut VerificationManager,
    runtime: &cmdrunner::config::expand::RuntimeConfig,
) -> Result<()> {
    let mut paths = runtime.global.expanded_verify_files.clone();
    for (group, _) in &runtime.groups {
        paths.extend(group.expanded_verify_files.clone());
    }

    let result = verification.verify_files(&paths);
    for path in &result.verified {
        audit.emit(&AuditEvent::VerifyOk {
            path: path.display().to_string(),
        });
    }
    report_failures(audit, &result)
}

fn verify_command_binaries(
    audit: &dyn AuditSink,
    verification: &mut VerificationManager,
    runtime: &cmdrunner::config::expand::RuntimeConfig,
) -> Result<()> {
    let mut binaries = Vec::new();
    for (_, commands) in &runtime.groups {
        for command in commands {
            binaries.push(risk::resolve_trusted(&command.expanded_cmd)?);
        }
    }

    let result = verification.verify_command_binaries(&binaries);
    for path in &result.verified {
        audit.emit(&AuditEvent::VerifyOk {
            path: path.display().to_string(),
        });
    }
    report_failures(audit, &result)
}

fn report_failures(
    audit: &dyn AuditSink,
    result: &cmdrunner::verification::VerificationResult,
) -> Result<()> {
    if result.is_success() {
        return Ok(());
    }
    for (path, reason) in &result.failed {
        audit.emit(&AuditEvent::VerifyFail {
            path: path.display().to_string(),
            expected: String::new(),
            actual: reason.clone(),
        });
    }
    let (path, reason) = &result.failed[0];
    Err(CommandRunnerError::ManifestInvalid(format!(
        "verification failed for {}: {reason}",
        path.display()
    )))
}
