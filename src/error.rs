//! Error taxonomy for the bridge.
//!
//! [`LaunchError`] covers everything that can go wrong while driving the
//! child process itself; [`BridgeError`] wraps it together with the failures
//! detected before a child is spawned or after it has exited. Every variant
//! maps to the integer result code reported across the C boundary via
//! [`BridgeError::code`].

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result code for a failed launch (pipe setup, spawn, stream I/O, wait).
pub const CODE_LAUNCH: i32 = -1;
/// Result code for missing or empty caller input.
pub const CODE_VALIDATION: i32 = -2;
/// Result code when the generator executable cannot be found.
pub const CODE_RESOLUTION: i32 = -3;
/// Result code when the child exited with `0` but produced nothing usable.
pub const CODE_POSTCONDITION: i32 = -4;
/// Result code when the output buffer could not be allocated.
pub const CODE_ALLOCATION: i32 = -5;
/// Result code when the child was killed after exceeding the timeout.
pub const CODE_TIMEOUT: i32 = -6;
/// Result code for a panic caught at the boundary.
pub const CODE_INTERNAL: i32 = -7;

/// Which standard stream a failed read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl std::fmt::Display for StdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StdStream::Stdin => "stdin",
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        })
    }
}

/// Failure while launching or driving a child process.
///
/// No variant leaves a pipe or process handle behind: by the time one of
/// these is returned the runner has closed every pipe end and reaped the
/// child if it was started.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A standard channel was requested as piped but no handle was produced.
    #[error("could not establish {0} pipe for child process")]
    PipeUnavailable(StdStream),

    #[error("failed to start '{}': {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing the input payload failed. `stdin_closed_early` is set when the
    /// child closed its end of the pipe before consuming the whole payload.
    #[error("failed to write input to child stdin ({written} of {total} bytes written{}): {source}",
        early_close_note(.stdin_closed_early))]
    StdinWrite {
        written: usize,
        total: usize,
        stdin_closed_early: bool,
        #[source]
        source: io::Error,
    },

    /// A thread servicing one of the pipes could not be started.
    #[error("failed to start {stream} worker thread: {source}")]
    Worker {
        stream: StdStream,
        #[source]
        source: io::Error,
    },

    #[error("failed to read child {stream}: {source}")]
    StreamRead {
        stream: StdStream,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for child process: {0}")]
    Wait(#[source] io::Error),

    #[error("child process did not exit within {0:?} and was killed")]
    Timeout(Duration),
}

impl LaunchError {
    pub fn code(&self) -> i32 {
        match self {
            LaunchError::Timeout(_) => CODE_TIMEOUT,
            _ => CODE_LAUNCH,
        }
    }
}

/// Every way a bridge operation can end in a *Failure* outcome.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing or empty required input; detected before any process is spawned.
    #[error("{0}")]
    Validation(String),

    /// The generator executable was not found in any probed location.
    #[error("generator not found: {name} (searched {})", display_paths(.searched))]
    Resolution { name: String, searched: Vec<PathBuf> },

    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The child exited with a non-zero code; `code` is propagated verbatim.
    #[error("PDF generation failed: {message}")]
    ChildFailure { code: i32, message: String },

    /// The child reported success but its output is missing or empty.
    #[error("{0}")]
    Postcondition(String),

    #[error("cannot allocate {0} bytes for the output buffer")]
    Allocation(usize),

    /// A panic raised while orchestrating the call.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// The result code reported to C callers: negative for local failures,
    /// the child's own exit code for [`BridgeError::ChildFailure`].
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::Validation(_) => CODE_VALIDATION,
            BridgeError::Resolution { .. } => CODE_RESOLUTION,
            BridgeError::Launch(e) => e.code(),
            BridgeError::ChildFailure { code, .. } => *code,
            BridgeError::Postcondition(_) => CODE_POSTCONDITION,
            BridgeError::Allocation(_) => CODE_ALLOCATION,
            BridgeError::Internal(_) => CODE_INTERNAL,
        }
    }
}

fn early_close_note(closed_early: &bool) -> &'static str {
    if *closed_early {
        ", child closed stdin early"
    } else {
        ""
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
