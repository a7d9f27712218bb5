//! Per-node execution: deciding whether a node is out of date (§4.7) and
//! running the commands that bring it up to date (§4.10).

pub mod oracle;
pub mod runner;

pub use oracle::is_oodate;
pub use runner::{Job, JobResult, JobRunner, Token, TokenPool};

use thiserror::Error;

/// Errors surfaced while preparing a node for dispatch, as opposed to a
/// command's own exit status (which is reported through [`JobResult`]
/// instead of this type — the original engine never treats a failing
/// recipe as a Rust-level error, only as a build failure).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no shell available to run commands for `{target}`")]
    NoShell { target: String },
}
