// Error taxonomy for the estimator.
//
// Each component owns its error type; the pipeline wraps them in
// `EstimateError` together with the step that failed so callers can tell
// what went wrong without re-running with more logging.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;
use crate::extract::ExtractionError;
use crate::tools::ToolNotFoundError;

/// A stage of the transcoding pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// Running the binary-diff tool on (old, new).
    Diff,
    /// Separating the fixed bsdiff header from the compressed payload.
    Split,
    /// Stripping bsdiff's built-in compression from the payload.
    Decode,
    /// Concatenating header and decompressed payload.
    Rebuild,
    /// Compressing the rebuilt patch with the output codec.
    CompressPatch,
    /// Compressing the new file with the output codec.
    CompressNewFile,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Diff => "diff",
            Self::Split => "split",
            Self::Decode => "decode",
            Self::Rebuild => "rebuild",
            Self::CompressPatch => "compress-patch",
            Self::CompressNewFile => "compress-new-file",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for `estimate()`.
#[derive(Debug, Error)]
pub enum EstimateError {
    /// A required external tool could not be resolved.
    #[error(transparent)]
    ToolNotFound(#[from] ToolNotFoundError),

    /// An external tool ran but exited unsuccessfully.
    #[error("Problem at the {step} step, {}", describe_status(&.status))]
    ExternalTool {
        step: Step,
        /// Exit code, or `None` when the process was killed by a signal.
        status: Option<i32>,
        stderr: String,
    },

    #[error("{step} step failed: {source}")]
    Extraction {
        step: Step,
        #[source]
        source: ExtractionError,
    },

    #[error("{step} step failed: {source}")]
    Codec {
        step: Step,
        #[source]
        source: CodecError,
    },

    /// Invalid inputs, detected before any process is started.
    #[error("{0}")]
    Precondition(String),

    #[error("{step} step: {}: {source}", .path.display())]
    Io {
        step: Step,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl EstimateError {
    /// The pipeline step this error was raised in, if any.
    pub fn step(&self) -> Option<Step> {
        match self {
            Self::ExternalTool { step, .. }
            | Self::Extraction { step, .. }
            | Self::Codec { step, .. }
            | Self::Io { step, .. } => Some(*step),
            Self::ToolNotFound(_) | Self::Precondition(_) => None,
        }
    }
}

/// Render an exit status the way the failure messages expect it.
pub(crate) fn describe_status(status: &Option<i32>) -> String {
    match *status {
        Some(code) => format!("returned code: {code}"),
        None => "terminated by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, EstimateError>;
