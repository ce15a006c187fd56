// External tool resolution and invocation.
//
// The estimator shells out to `bsdiff` (the byte-level diff) and `bzip2`
// (bsdiff's payload codec). Their locations are resolved once into a
// `ToolPaths` value that is handed to the pipeline; nothing is cached
// process-wide, so tests can inject fake tools by path.

use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::debug;
use thiserror::Error;

/// Binary-diff tool name looked up on `PATH`.
pub const BSDIFF: &str = "bsdiff";
/// bzip2 codec tool name looked up on `PATH`.
pub const BZIP2: &str = "bzip2";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A required external tool could not be resolved.
#[derive(Debug, Error)]
pub enum ToolNotFoundError {
    #[error("No \"{tool}\" on PATH, please install or fix PATH.")]
    NotOnPath {
        tool: String,
        #[source]
        source: which::Error,
    },

    /// An explicitly configured path does not name a file.
    #[error("{tool}: configured path is not a file: {}", .path.display())]
    BadPath { tool: String, path: PathBuf },
}

impl ToolNotFoundError {
    pub fn tool(&self) -> &str {
        match self {
            Self::NotOnPath { tool, .. } | Self::BadPath { tool, .. } => tool,
        }
    }
}

// ---------------------------------------------------------------------------
// ToolPaths
// ---------------------------------------------------------------------------

/// Resolved locations of every external executable the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub bsdiff: PathBuf,
    pub bzip2: PathBuf,
}

/// Explicit tool locations that take precedence over `PATH` lookup.
#[derive(Debug, Clone, Default)]
pub struct ToolOverrides {
    pub bsdiff: Option<PathBuf>,
    pub bzip2: Option<PathBuf>,
}

impl ToolPaths {
    /// Resolve every tool on `PATH`, failing on the first one missing.
    pub fn locate() -> Result<Self, ToolNotFoundError> {
        Self::locate_with(&ToolOverrides::default())
    }

    /// Resolve every tool, preferring the explicit paths in `overrides`.
    pub fn locate_with(overrides: &ToolOverrides) -> Result<Self, ToolNotFoundError> {
        Ok(Self {
            bsdiff: resolve(BSDIFF, overrides.bsdiff.as_deref())?,
            bzip2: resolve(BZIP2, overrides.bzip2.as_deref())?,
        })
    }
}

fn resolve(tool: &str, explicit: Option<&Path>) -> Result<PathBuf, ToolNotFoundError> {
    match explicit {
        Some(path) if path.is_file() => Ok(path.to_path_buf()),
        Some(path) => Err(ToolNotFoundError::BadPath {
            tool: tool.to_string(),
            path: path.to_path_buf(),
        }),
        None => find_binary(tool),
    }
}

/// Find the absolute path of `name` on `PATH`.
pub fn find_binary(name: &str) -> Result<PathBuf, ToolNotFoundError> {
    let path = which::which(name).map_err(|source| ToolNotFoundError::NotOnPath {
        tool: name.to_string(),
        source,
    })?;
    debug!("resolved {name} -> {}", path.display());
    Ok(path)
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Outcome of running an external tool to completion.
///
/// A non-zero exit is an ordinary value here; callers decide which error
/// it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Succeeded,
    Failed {
        /// Exit code, or `None` if the process was killed by a signal.
        status: Option<i32>,
        stderr: String,
    },
}

impl Invocation {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Run `program` with `args`, blocking until it exits.
///
/// Stdin is closed. When `stdout_to` is given, the tool's stdout is written
/// to that file (created or truncated); otherwise it is discarded. Stderr is
/// captured for diagnostics. Only a failure to start the process is an
/// `io::Error`.
pub fn run_tool<I, S>(program: &Path, args: I, stdout_to: Option<&Path>) -> io::Result<Invocation>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).stderr(Stdio::piped());
    match stdout_to {
        Some(path) => {
            cmd.stdout(Stdio::from(File::create(path)?));
        }
        None => {
            cmd.stdout(Stdio::null());
        }
    }

    debug!("running {cmd:?}");
    let output = cmd.output()?;
    if output.status.success() {
        return Ok(Invocation::Succeeded);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    debug!(
        "{} exited unsuccessfully ({:?}): {stderr}",
        program.display(),
        output.status.code()
    );
    Ok(Invocation::Failed {
        status: output.status.code(),
        stderr,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
