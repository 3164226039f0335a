//! `record`: compute and store a file's content hash.
//!
//! Every path passed on the command line is hashed and written as a
//! [`cmdrunner::hashstore::HashRecord`] under `--hash-dir`. This is the only
//! one of the three binaries that writes into the trust store; `verify` and
//! `runner` only ever read from it.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use cmdrunner::hashstore::HashStore;
use cmdrunner::paths::ResolvedPath;

#[derive(Parser)]
#[command(
    name = "record",
    version,
    about = "Record the content hash of one or more files"
)]
struct Cli {
    /// Directory holding recorded file-hash records.
    #[arg(long, short = 'd', env = "CMDRUNNER_HASH_DIR")]
    hash_dir: PathBuf,

    /// Overwrite an existing record instead of refusing.
    #[arg(long)]
    force: bool,

    /// Emit structured JSON log lines instead of the default text format.
    #[arg(long)]
    json_logs: bool,

    /// Tracing log level filter.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Absolute paths of the files to hash.
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

    let mut had_error = false;
    for file in &cli.files {
        match ResolvedPath::new(file) {
            Ok(resolved) => match store.record(resolved.as_path(), cli.force) {
                Ok((record_path, hash)) => {
                    tracing::info!(
                        event = "verify.ok",
                        path = %resolved,
                        hash = %hash,
                        record = %record_path.display(),
                        "recorded"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, path = %resolved, "failed to record hash");
                    had_error = true;
                }
            },
            Err(e) => {
                tracing::error!(error = %e, path = %file.display(), "invalid path");
                had_error = true;
            }
        }
    }

    if had_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
