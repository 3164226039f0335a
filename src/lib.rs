//! A command execution framework built around one idea: nothing runs until
//! it has been verified, classified, and — if it crosses a privilege or risk
//! boundary — explicitly allowed to proceed.
//!
//! The pipeline, in order: content-addressed integrity checks ([`hashstore`],
//! [`verification`]) gate every config file, declared artifact, and resolved
//! command binary; declarative TOML ([`config`]) expands through a single
//! bottom-up pass into a fully-resolved plan; each command is classified by
//! [`risk`] before [`privilege`] or [`executor`] ever touch it; [`group`]
//! orchestrates groups of commands in priority order, and [`audit`] records
//! every step of that path. [`redact`] keeps secrets observed along the way
//! out of logs without ever touching a command's own declared output.

pub mod audit;
pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod fileio;
pub mod group;
pub mod hashstore;
pub mod paths;
pub mod privilege;
pub mod redact;
pub mod risk;
pub mod telemetry;
pub mod verification;

pub use error::{CommandRunnerError, Result};
