//! `loadstorm` CLI subcommands.
//!
//! Provides `run` (execute a load test) and `init` (generate a starter plan).

pub mod init;
pub mod run;

/// Exit status for an invalid plan or any other setup failure.
pub const EXIT_INVALID: u8 = 1;

/// Exit status when the run's error rate exceeds `--max-error-rate`.
pub const EXIT_THRESHOLD: u8 = 2;
