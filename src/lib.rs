//! Patchsize: estimate incremental-update download sizes between two
//! versions of an archive.
//!
//! Given an old and a new file, the crate estimates:
//! - the size of a bsdiff patch between them, re-compressed under a standard
//!   codec (gzip by default) instead of bsdiff's built-in bzip2, and
//! - the size of the new file alone under that same codec.
//!
//! These are estimates for characterizing the impact of changes, not a
//! reproduction of any particular distribution service's patch selection.
//! Exact byte counts vary with tool and codec versions; expect roughly ±10%.
//!
//! The crate provides:
//! - External tool resolution and invocation (`tools`)
//! - Byte-range split/concatenate on files (`extract`)
//! - File-to-file codecs (`codec`)
//! - The transcoding pipeline (`pipeline`)
//! - Report formatting (`report`)
//! - An optional CLI (`cli` feature)
//!
//! # Quick Start
//!
//! ```no_run
//! use patchsize::pipeline::{self, EstimateRequest};
//! use patchsize::tools::ToolPaths;
//!
//! let tools = ToolPaths::locate().unwrap();
//! let request = EstimateRequest::new("old.apk", "new.apk", std::env::temp_dir());
//! let estimate = pipeline::estimate(&tools, &request).unwrap();
//! println!("patch: {} bytes", estimate.patch_size);
//! ```

pub mod codec;
pub mod error;
pub mod extract;
pub mod pipeline;
pub mod report;
pub mod tools;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{EstimateError, Step};
pub use pipeline::{Estimate, EstimateRequest, estimate};
