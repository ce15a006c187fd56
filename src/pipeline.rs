// Patch transcoding pipeline.
//
// bsdiff forces bzip2 onto everything after its 32-byte header. bzip2 is
// not necessarily what a distribution service would ship, so the payload is
// unpacked and the whole patch re-compressed under the output codec. The new
// file alone is compressed under the same codec for comparison:
//
//   bsdiff old new -> raw
//   raw[..32]      -> header
//   raw[32..]      -> payload.bz2 -> bunzip2 -> payload
//   header+payload -> rebuilt     -> compress_max -> patch size
//   new            -> compress_max                -> new file size
//
// Every intermediate file lives in a `WorkArea` that is cleared before use
// and removed on drop, whether the run succeeds or not.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::codec::{Codec, CodecAdapter};
use crate::error::{EstimateError, Result, Step};
use crate::extract;
use crate::tools::{Invocation, ToolPaths, run_tool};

/// Length of the bsdiff 4.x header ("BSDIFF40" magic plus three 8-byte
/// lengths) that precedes the compressed payload.
pub const BSDIFF_HEADER_LEN: u64 = 32;

/// The codec bsdiff hardwires for its payload.
pub const BSDIFF_PAYLOAD_CODEC: Codec = Codec::Bzip2;

/// File name prefix of every work-area artifact inside the work directory.
pub const WORK_PREFIX: &str = "patch.tmp";

// ---------------------------------------------------------------------------
// Request / result
// ---------------------------------------------------------------------------

/// Inputs to `estimate()`.
#[derive(Debug, Clone)]
pub struct EstimateRequest {
    pub old_file: PathBuf,
    pub new_file: PathBuf,
    /// Where to keep the rebuilt patch. The compressed form is kept as
    /// `<save_patch>.<codec ext>`.
    pub save_patch: Option<PathBuf>,
    /// Directory holding the work area. Concurrent runs must use distinct
    /// directories: work-area paths are fixed and not locked.
    pub work_dir: PathBuf,
    /// Output codec both sizes are measured under.
    pub codec: Codec,
}

impl EstimateRequest {
    pub fn new(
        old_file: impl Into<PathBuf>,
        new_file: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            old_file: old_file.into(),
            new_file: new_file.into(),
            save_patch: None,
            work_dir: work_dir.into(),
            codec: Codec::default(),
        }
    }

    pub fn save_patch(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_patch = Some(path.into());
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }
}

/// Sizes produced by `estimate()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Estimate {
    /// Size of the rebuilt bsdiff patch compressed under the output codec.
    pub patch_size: u64,
    /// Size of the new file compressed under the output codec.
    pub new_file_compressed_size: u64,
    /// Size of the new file on disk.
    pub new_file_size: u64,
    /// Size of bsdiff's own (bzip2) output.
    pub raw_diff_size: u64,
    /// Codec both compressed sizes were measured under.
    pub codec: Codec,
    /// The compressed patch kept on disk, if one was requested.
    pub saved_patch: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------------------

/// Validate a request before any file is touched or process started.
///
/// Besides existence and writability, this rejects requests where a
/// work-area path (which `estimate()` removes and overwrites) resolves to one
/// of the input files.
pub fn check_preconditions(request: &EstimateRequest) -> Result<()> {
    for file in [&request.old_file, &request.new_file] {
        if !file.is_file() {
            return Err(EstimateError::Precondition(format!(
                "File does not exist: {}",
                file.display()
            )));
        }
    }

    if !request.work_dir.is_dir() {
        return Err(EstimateError::Precondition(format!(
            "Temp directory does not exist: {}",
            request.work_dir.display()
        )));
    }
    if !is_writable_dir(&request.work_dir) {
        return Err(EstimateError::Precondition(format!(
            "Temp directory is not writable: {}",
            request.work_dir.display()
        )));
    }

    if let Some(save) = &request.save_patch {
        if save.is_dir() {
            return Err(EstimateError::Precondition(format!(
                "Please include the filename in the path: {}",
                save.display()
            )));
        }
        if !is_writable_dir(parent_dir(save)) {
            return Err(EstimateError::Precondition(format!(
                "The save patch path is not writable: {}",
                save.display()
            )));
        }
    }

    let inputs = [
        resolve_path(&request.old_file),
        resolve_path(&request.new_file),
    ];
    let work = WorkArea::layout(
        &request.work_dir,
        request.save_patch.as_deref(),
        request.codec,
    );
    for path in work.paths() {
        let resolved = resolve_path(path);
        if let Some(input) = inputs.iter().find(|input| **input == resolved) {
            let reason = match &request.save_patch {
                Some(save) if path == save.as_path() || path == work.rebuilt_compressed => {
                    "The save patch path would overwrite an input file"
                }
                _ => "Input file collides with a temporary file in the temp directory",
            };
            return Err(EstimateError::Precondition(format!(
                "{reason}: {}",
                input.display()
            )));
        }
    }

    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Whether the current user may create files in `dir`.
#[cfg(unix)]
fn is_writable_dir(dir: &Path) -> bool {
    dir.is_dir() && rustix::fs::access(dir, rustix::fs::Access::WRITE_OK).is_ok()
}

#[cfg(not(unix))]
fn is_writable_dir(dir: &Path) -> bool {
    fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

/// Canonical form of `path`, resolving symlinks. Paths that do not exist yet
/// are resolved through their parent directory.
fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(p) = fs::canonicalize(path) {
        return p;
    }
    match (fs::canonicalize(parent_dir(path)), path.file_name()) {
        (Ok(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// WorkArea
// ---------------------------------------------------------------------------

/// Temporary paths scoped to one `estimate()` call.
///
/// Every path is removed by `clear()` and again on drop, except the saved
/// patch once `keep_saved_patch()` has been called.
#[derive(Debug)]
pub struct WorkArea {
    /// Raw bsdiff output.
    pub raw_diff: PathBuf,
    /// First `BSDIFF_HEADER_LEN` bytes of the raw diff.
    pub header: PathBuf,
    /// Everything after the header, still bzip2-compressed.
    pub payload_compressed: PathBuf,
    /// The payload with bzip2 removed.
    pub payload: PathBuf,
    /// Header + payload. The save path, when one was requested.
    pub rebuilt: PathBuf,
    /// `rebuilt` under the output codec.
    pub rebuilt_compressed: PathBuf,
    /// The new file under the output codec.
    pub new_compressed: PathBuf,
    saved: bool,
    keep: Option<PathBuf>,
    /// Whether drop removes the paths. Off for a layout-only value.
    owned: bool,
}

impl WorkArea {
    pub fn new(work_dir: &Path, save_patch: Option<&Path>, codec: Codec) -> Self {
        let mut work = Self::layout(work_dir, save_patch, codec);
        work.owned = true;
        work
    }

    /// The same paths as `new()`, without removing anything on drop.
    fn layout(work_dir: &Path, save_patch: Option<&Path>, codec: Codec) -> Self {
        let base = work_dir.join(WORK_PREFIX);
        let with_suffix = |suffix: &str| {
            let mut name = base.as_os_str().to_owned();
            name.push(suffix);
            PathBuf::from(name)
        };

        let rebuilt = match save_patch {
            Some(path) => path.to_path_buf(),
            None => with_suffix(".rebuilt"),
        };
        Self {
            header: with_suffix(".header"),
            payload_compressed: BSDIFF_PAYLOAD_CODEC.compressed_path(&with_suffix(".payload")),
            payload: with_suffix(".payload"),
            rebuilt_compressed: codec.compressed_path(&rebuilt),
            rebuilt,
            new_compressed: codec.compressed_path(&with_suffix(".new")),
            raw_diff: base,
            saved: save_patch.is_some(),
            keep: None,
            owned: false,
        }
    }

    /// Every path this work area may create.
    pub fn paths(&self) -> [&Path; 7] {
        [
            &self.raw_diff,
            &self.header,
            &self.payload_compressed,
            &self.payload,
            &self.rebuilt,
            &self.rebuilt_compressed,
            &self.new_compressed,
        ]
    }

    /// Remove anything left at the work-area paths by an earlier run.
    pub fn clear(&self) -> io::Result<()> {
        for path in self.paths() {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    /// Remove one artifact now rather than at drop.
    pub fn discard(&self, path: &Path) {
        if let Err(e) = remove_if_exists(path) {
            warn!("could not remove {}: {e}", path.display());
        }
    }

    /// Exempt the compressed saved patch from cleanup. Returns its path,
    /// or `None` if no save path was requested.
    pub fn keep_saved_patch(&mut self) -> Option<PathBuf> {
        if !self.saved {
            return None;
        }
        self.keep = Some(self.rebuilt_compressed.clone());
        self.keep.clone()
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        for path in self.paths() {
            if self.keep.as_deref() == Some(path) {
                continue;
            }
            if let Err(e) = remove_if_exists(path) {
                warn!("could not remove {}: {e}", path.display());
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// estimate
// ---------------------------------------------------------------------------

/// Estimate the compressed bsdiff patch size between `old_file` and
/// `new_file`, and the compressed size of `new_file` alone.
///
/// Runs synchronously; each step consumes the previous step's output. No
/// error is retried, and no partial sizes are returned on failure.
pub fn estimate(tools: &ToolPaths, request: &EstimateRequest) -> Result<Estimate> {
    check_preconditions(request)?;

    let codecs = CodecAdapter::new(tools);
    let mut work = WorkArea::new(
        &request.work_dir,
        request.save_patch.as_deref(),
        request.codec,
    );
    work.clear().map_err(|source| EstimateError::Io {
        step: Step::Diff,
        path: work.raw_diff.clone(),
        source,
    })?;

    // Diff.
    debug!(
        "bsdiff {} {} -> {}",
        request.old_file.display(),
        request.new_file.display(),
        work.raw_diff.display()
    );
    let outcome = run_tool(
        &tools.bsdiff,
        [
            request.old_file.as_os_str(),
            request.new_file.as_os_str(),
            work.raw_diff.as_os_str(),
        ],
        None,
    )
    .map_err(|source| EstimateError::Io {
        step: Step::Diff,
        path: tools.bsdiff.clone(),
        source,
    })?;
    if let Invocation::Failed { status, stderr } = outcome {
        return Err(EstimateError::ExternalTool {
            step: Step::Diff,
            status,
            stderr,
        });
    }
    let raw_diff_size = file_len(&work.raw_diff, Step::Diff)?;

    // Split off the header.
    let split = extract::split_at(
        &work.raw_diff,
        BSDIFF_HEADER_LEN,
        &work.header,
        &work.payload_compressed,
    )
    .map_err(|source| EstimateError::Extraction {
        step: Step::Split,
        source,
    })?;
    debug!(
        "split {raw_diff_size} byte diff into {} byte header, {} byte payload",
        split.prefix_len, split.suffix_len
    );

    // Undo bsdiff's payload codec.
    codecs
        .decompress(BSDIFF_PAYLOAD_CODEC, &work.payload_compressed, &work.payload)
        .map_err(|source| EstimateError::Codec {
            step: Step::Decode,
            source,
        })?;

    // Header back in front of the plain payload.
    let rebuilt_size = extract::concat_files(&[&work.header, &work.payload], &work.rebuilt)
        .map_err(|source| EstimateError::Extraction {
            step: Step::Rebuild,
            source,
        })?;
    debug!(
        "rebuilt patch {} ({rebuilt_size} bytes)",
        work.rebuilt.display()
    );

    let patch_size = codecs
        .compress_max(request.codec, &work.rebuilt, &work.rebuilt_compressed)
        .map_err(|source| EstimateError::Codec {
            step: Step::CompressPatch,
            source,
        })?;
    work.discard(&work.rebuilt);

    let new_file_compressed_size = codecs
        .compress_max(request.codec, &request.new_file, &work.new_compressed)
        .map_err(|source| EstimateError::Codec {
            step: Step::CompressNewFile,
            source,
        })?;
    let new_file_size = file_len(&request.new_file, Step::CompressNewFile)?;

    let saved_patch = work.keep_saved_patch();
    info!(
        "{}: patch {patch_size} bytes (bsdiff raw {raw_diff_size}), new file {new_file_compressed_size} bytes",
        request.codec
    );

    Ok(Estimate {
        patch_size,
        new_file_compressed_size,
        new_file_size,
        raw_diff_size,
        codec: request.codec,
        saved_patch,
    })
}

fn file_len(path: &Path, step: Step) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|source| EstimateError::Io {
            step,
            path: path.to_path_buf(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
