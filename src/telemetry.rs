//! Process-wide `tracing` initialization shared by all three binaries.

use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber. `level` is an `EnvFilter`
/// directive string (`"info"`, `"cmdrunner=debug"`, ...); `json` switches
/// the formatter from human-readable text to structured JSON lines, for
/// callers that ship logs to a collector rather than a terminal.
pub fn init(json: bool, level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Like [`init`], but additionally (or instead) appends log lines to
/// `log_file`. Audit-relevant events (spec §6) must survive the terminal
/// scrolling away, so `runner` opens this in append mode at startup and
/// keeps writing to it for the life of the process.
pub fn init_with_log_file(json: bool, level: &str, log_file: Option<&Path>) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(log_file) = log_file else {
        return init(json, level);
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(f) => f,
        Err(e) => {
            eprintln!(
                "warning: failed to open log file {}: {e}, logging to stderr only",
                log_file.display()
            );
            return init(json, level);
        }
    };

    let writer = std::io::stderr.and(std::sync::Mutex::new(file));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
