// File-to-file compression codecs.
//
// Two codecs are involved in every estimate and they are never assumed to
// be interchangeable: bsdiff's built-in payload codec (bzip2, which we can
// only undo) and the output codec the final sizes are measured under
// (gzip by default). Each codec sits behind the `CodecBackend` trait:
//
//   - Gzip  (via flate2, in-process)
//   - Lzma  (via lzma-rs, in-process)
//   - Bzip2 (via the external `bzip2` tool resolved in `ToolPaths`)

use std::ffi::OsStr;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::error::describe_status;
use crate::tools::{Invocation, ToolPaths, run_tool};

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

// ---------------------------------------------------------------------------
// Codec identity
// ---------------------------------------------------------------------------

/// A compression algorithm, independent of how it is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Codec {
    /// gzip container around deflate. The standard output codec.
    #[default]
    Gzip,
    /// bzip2. The codec bsdiff hardwires for its payload.
    Bzip2,
    /// Legacy `.lzma` (LZMA-alone) container.
    Lzma,
}

impl Codec {
    pub fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Lzma => "lzma",
        }
    }

    /// Conventional file extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => "gz",
            Self::Bzip2 => "bz2",
            Self::Lzma => "lzma",
        }
    }

    /// `path` with this codec's extension appended (`patch` -> `patch.gz`).
    pub fn compressed_path(self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(self.extension());
        PathBuf::from(name)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{codec}: {}: {source}", .path.display())]
    Io {
        codec: Codec,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The input is not valid data for the codec (truncated, wrong format, empty).
    #[error("{codec}: corrupt input {}: {reason}", .path.display())]
    Corrupt {
        codec: Codec,
        path: PathBuf,
        reason: String,
    },

    /// The external codec tool exited unsuccessfully.
    #[error("{codec} tool failed, {}: {stderr}", describe_status(&.status))]
    Tool {
        codec: Codec,
        status: Option<i32>,
        stderr: String,
    },
}

pub type Result<T> = std::result::Result<T, CodecError>;

// ---------------------------------------------------------------------------
// CodecBackend trait
// ---------------------------------------------------------------------------

/// A file-to-file implementation of one codec.
///
/// Both operations create or truncate `output`, never touch `input`, and
/// return the number of bytes written to `output`.
pub trait CodecBackend {
    /// Which codec this backend speaks.
    fn codec(&self) -> Codec;

    /// Reverse the codec's compression of `input`.
    fn decompress(&self, input: &Path, output: &Path) -> Result<u64>;

    /// Compress `input` at the codec's maximum effort setting.
    fn compress_max(&self, input: &Path, output: &Path) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Gzip backend
// ---------------------------------------------------------------------------

/// gzip at level 9 via flate2.
///
/// Decoding accepts multi-member files, like `gzip -d` does.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipBackend;

impl CodecBackend for GzipBackend {
    fn codec(&self) -> Codec {
        Codec::Gzip
    }

    fn decompress(&self, input: &Path, output: &Path) -> Result<u64> {
        let reader = open_compressed(Codec::Gzip, input)?;
        let mut decoder = flate2::bufread::MultiGzDecoder::new(reader);
        write_stream(Codec::Gzip, &mut decoder, input, output)
    }

    fn compress_max(&self, input: &Path, output: &Path) -> Result<u64> {
        let mut reader = open_plain(Codec::Gzip, input)?;
        let out = create_output(Codec::Gzip, output)?;
        let mut encoder = flate2::write::GzEncoder::new(
            BufWriter::with_capacity(BUF_SIZE, out),
            flate2::Compression::best(),
        );
        io::copy(&mut reader, &mut encoder).map_err(io_err(Codec::Gzip, input))?;
        let mut writer = encoder.finish().map_err(io_err(Codec::Gzip, output))?;
        writer.flush().map_err(io_err(Codec::Gzip, output))?;
        output_len(Codec::Gzip, output)
    }
}

// ---------------------------------------------------------------------------
// LZMA backend
// ---------------------------------------------------------------------------

/// LZMA via lzma-rs.
///
/// The lzma-rs encoder emits literals only (no match finding), so its output
/// is a range-coded literal stream and far larger than `xz -9` would produce.
/// Sizes measured under this backend are not comparable with gzip sizes and
/// overstate what a real LZMA encoder would ship.
#[derive(Debug, Clone, Copy, Default)]
pub struct LzmaBackend;

impl CodecBackend for LzmaBackend {
    fn codec(&self) -> Codec {
        Codec::Lzma
    }

    fn decompress(&self, input: &Path, output: &Path) -> Result<u64> {
        let mut reader = open_compressed(Codec::Lzma, input)?;
        let out = create_output(Codec::Lzma, output)?;
        let mut writer = BufWriter::with_capacity(BUF_SIZE, out);
        lzma_rs::lzma_decompress(&mut reader, &mut writer).map_err(|e| match e {
            lzma_rs::error::Error::IoError(source) => CodecError::Io {
                codec: Codec::Lzma,
                path: input.to_path_buf(),
                source,
            },
            other => CodecError::Corrupt {
                codec: Codec::Lzma,
                path: input.to_path_buf(),
                reason: other.to_string(),
            },
        })?;
        writer.flush().map_err(io_err(Codec::Lzma, output))?;
        output_len(Codec::Lzma, output)
    }

    fn compress_max(&self, input: &Path, output: &Path) -> Result<u64> {
        let mut reader = open_plain(Codec::Lzma, input)?;
        let out = create_output(Codec::Lzma, output)?;
        let mut writer = BufWriter::with_capacity(BUF_SIZE, out);
        lzma_rs::lzma_compress(&mut reader, &mut writer).map_err(io_err(Codec::Lzma, input))?;
        writer.flush().map_err(io_err(Codec::Lzma, output))?;
        output_len(Codec::Lzma, output)
    }
}

// ---------------------------------------------------------------------------
// bzip2 tool backend
// ---------------------------------------------------------------------------

/// bzip2 through the external `bzip2` executable.
///
/// `bzip2 -d` decodes concatenated streams as one, which bsdiff's payload
/// (three back-to-back bzip2 streams) depends on.
#[derive(Debug, Clone)]
pub struct Bzip2Tool {
    program: PathBuf,
}

impl Bzip2Tool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, flags: &[&str], input: &Path, output: &Path) -> Result<u64> {
        let args = flags
            .iter()
            .map(OsStr::new)
            .chain(std::iter::once(input.as_os_str()));
        let outcome = run_tool(&self.program, args, Some(output)).map_err(|source| {
            CodecError::Io {
                codec: Codec::Bzip2,
                path: self.program.clone(),
                source,
            }
        })?;
        match outcome {
            Invocation::Succeeded => output_len(Codec::Bzip2, output),
            Invocation::Failed { status, stderr } => Err(CodecError::Tool {
                codec: Codec::Bzip2,
                status,
                stderr,
            }),
        }
    }
}

impl CodecBackend for Bzip2Tool {
    fn codec(&self) -> Codec {
        Codec::Bzip2
    }

    fn decompress(&self, input: &Path, output: &Path) -> Result<u64> {
        // Checked up front so an empty payload is reported as corrupt
        // rather than as an empty decode.
        open_compressed(Codec::Bzip2, input)?;
        self.run(&["-d", "-c", "-q"], input, output)
    }

    fn compress_max(&self, input: &Path, output: &Path) -> Result<u64> {
        open_plain(Codec::Bzip2, input)?;
        self.run(&["-9", "-c", "-q"], input, output)
    }
}

// ---------------------------------------------------------------------------
// CodecAdapter
// ---------------------------------------------------------------------------

/// Dispatches codec operations to the backend for each `Codec`.
#[derive(Debug, Clone)]
pub struct CodecAdapter {
    gzip: GzipBackend,
    lzma: LzmaBackend,
    bzip2: Bzip2Tool,
}

impl CodecAdapter {
    pub fn new(tools: &ToolPaths) -> Self {
        Self {
            gzip: GzipBackend,
            lzma: LzmaBackend,
            bzip2: Bzip2Tool::new(&tools.bzip2),
        }
    }

    pub fn backend(&self, codec: Codec) -> &dyn CodecBackend {
        match codec {
            Codec::Gzip => &self.gzip,
            Codec::Bzip2 => &self.bzip2,
            Codec::Lzma => &self.lzma,
        }
    }

    /// Decode `input` (encoded under `codec`) into `output`.
    pub fn decompress(&self, codec: Codec, input: &Path, output: &Path) -> Result<u64> {
        let n = self.backend(codec).decompress(input, output)?;
        debug!(
            "{codec}: decompressed {} -> {} ({n} bytes)",
            input.display(),
            output.display()
        );
        Ok(n)
    }

    /// Encode `input` under `codec` at maximum effort into `output`.
    pub fn compress_max(&self, codec: Codec, input: &Path, output: &Path) -> Result<u64> {
        let n = self.backend(codec).compress_max(input, output)?;
        debug!(
            "{codec}: compressed {} -> {} ({n} bytes)",
            input.display(),
            output.display()
        );
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn io_err(codec: Codec, path: &Path) -> impl FnOnce(io::Error) -> CodecError + '_ {
    move |source| CodecError::Io {
        codec,
        path: path.to_path_buf(),
        source,
    }
}

fn open_plain(codec: Codec, input: &Path) -> Result<BufReader<File>> {
    let file = File::open(input).map_err(io_err(codec, input))?;
    Ok(BufReader::with_capacity(BUF_SIZE, file))
}

/// Open a compressed input, rejecting empty files.
fn open_compressed(codec: Codec, input: &Path) -> Result<BufReader<File>> {
    let file = File::open(input).map_err(io_err(codec, input))?;
    let len = file.metadata().map_err(io_err(codec, input))?.len();
    if len == 0 {
        return Err(CodecError::Corrupt {
            codec,
            path: input.to_path_buf(),
            reason: "empty input".into(),
        });
    }
    Ok(BufReader::with_capacity(BUF_SIZE, file))
}

fn create_output(codec: Codec, output: &Path) -> Result<File> {
    File::create(output).map_err(io_err(codec, output))
}

fn output_len(codec: Codec, output: &Path) -> Result<u64> {
    Ok(std::fs::metadata(output)
        .map_err(io_err(codec, output))?
        .len())
}

/// Drain a decoding reader into `output`.
///
/// Read-side errors of kind InvalidData/InvalidInput/UnexpectedEof come from
/// the decoder rejecting the stream, so they are reported as corruption.
fn write_stream<R: Read>(codec: Codec, decoder: &mut R, input: &Path, output: &Path) -> Result<u64> {
    let out = create_output(codec, output)?;
    let mut writer = BufWriter::with_capacity(BUF_SIZE, out);
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::InvalidData
                        | io::ErrorKind::InvalidInput
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                return Err(CodecError::Corrupt {
                    codec,
                    path: input.to_path_buf(),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(io_err(codec, input)(e)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(io_err(codec, output))?;
    }
    writer.flush().map_err(io_err(codec, output))?;
    output_len(codec, output)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
