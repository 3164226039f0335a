//! `verify`: check one or more files against their recorded hash.
//!
//! Read-only counterpart to `record`. Exits 0 only if every file verifies;
//! any mismatch or missing record exits 1.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use cmdrunner::hashstore::HashStore;
use cmdrunner::paths::ResolvedPath;
use cmdrunner::verification::{SkipPolicy, VerificationManager};

#[derive(Parser)]
#[command(
    name = "verify",
    version,
    about = "Verify one or more files against their recorded content hash"
)]
struct Cli {
    /// Directory holding recorded file-hash records.
    #[arg(long, short = 'd', env = "CMDRUNNER_HASH_DIR")]
    hash_dir: PathBuf,

    /// Emit structured JSON log lines instead of the default text format.
    #[arg(long)]
    json_logs: bool,

    /// Tracing log level filter.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Absolute paths of the files to verify.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cmdrunner::telemetry::init(cli.json_logs, &cli.log_level);

    let store = match HashStore::open(&cli.hash_dir) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to open hash store");
            return ExitCode::from(e.exit_code() as u8);
        }
    };
    let mut manager = VerificationManager::new(store, SkipPolicy::default());

    let mut resolved_paths = Vec::with_capacity(cli.files.len());
    for file in &cli.files {
        match ResolvedPath::new(file) {
            Ok(resolved) => resolved_paths.push(resolved.into_path_buf()),
            Err(e) => {
                tracing::error!(error = %e, path = %file.display(), "invalid path");
                return ExitCode::FAILURE;
            }
        }
    }

    let result = manager.verify_files(&resolved_paths);
    for path in &result.verified {
        tracing::info!(event = "verify.ok", path = %path.display(), "verified");
    }
    for (path, reason) in &result.failed {
        tracing::error!(event = "verify.fail", path = %path.display(), reason = %reason, "verification failed");
    }

    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
