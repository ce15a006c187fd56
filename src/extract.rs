// Byte-range surgery on whole files.
//
// `split_at()` cuts a file into a prefix and a suffix at a byte offset;
// `concat_files()` joins files back together in order. Both stream through
// buffered I/O, so the inputs never need to fit in memory.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

const BUF_SIZE: usize = 64 * 1024; // 64 KiB

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("offset {offset} is beyond the end of {} ({len} bytes)", .path.display())]
    OffsetOutOfRange { path: PathBuf, offset: u64, len: u64 },

    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ExtractionError {
    fn read(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Read {
            path: path.to_path_buf(),
            source,
        }
    }

    fn write(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Write {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// split_at
// ---------------------------------------------------------------------------

/// Sizes of the two halves written by `split_at()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub prefix_len: u64,
    pub suffix_len: u64,
}

/// Write the first `offset` bytes of `source` to `prefix_path` and the rest
/// to `suffix_path`.
///
/// `offset` may equal the file length, in which case the suffix is empty.
/// The source file is left untouched. Both outputs are created or truncated.
pub fn split_at(
    source: &Path,
    offset: u64,
    prefix_path: &Path,
    suffix_path: &Path,
) -> Result<Split, ExtractionError> {
    let file = File::open(source).map_err(ExtractionError::read(source))?;
    let len = file
        .metadata()
        .map_err(ExtractionError::read(source))?
        .len();
    if offset > len {
        return Err(ExtractionError::OffsetOutOfRange {
            path: source.to_path_buf(),
            offset,
            len,
        });
    }

    let mut reader = BufReader::with_capacity(BUF_SIZE, file);
    let prefix_len = copy_into(&mut (&mut reader).take(offset), source, prefix_path)?;
    let suffix_len = copy_into(&mut reader, source, suffix_path)?;

    // The file may have changed between the length check and the copy.
    if prefix_len != offset {
        return Err(ExtractionError::OffsetOutOfRange {
            path: source.to_path_buf(),
            offset,
            len: prefix_len,
        });
    }

    Ok(Split {
        prefix_len,
        suffix_len,
    })
}

// ---------------------------------------------------------------------------
// concat_files
// ---------------------------------------------------------------------------

/// Write `parts` back-to-back into `output`, returning the bytes written.
pub fn concat_files<P: AsRef<Path>>(parts: &[P], output: &Path) -> Result<u64, ExtractionError> {
    let out = File::create(output).map_err(ExtractionError::write(output))?;
    let mut writer = BufWriter::with_capacity(BUF_SIZE, out);
    let mut total = 0u64;

    for part in parts {
        let part = part.as_ref();
        let file = File::open(part).map_err(ExtractionError::read(part))?;
        let mut reader = BufReader::with_capacity(BUF_SIZE, file);
        total += copy_stream(&mut reader, &mut writer, part, output)?;
    }

    writer.flush().map_err(ExtractionError::write(output))?;
    Ok(total)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn copy_into<R: Read>(reader: &mut R, from: &Path, to: &Path) -> Result<u64, ExtractionError> {
    let out = File::create(to).map_err(ExtractionError::write(to))?;
    let mut writer = BufWriter::with_capacity(BUF_SIZE, out);
    let n = copy_stream(reader, &mut writer, from, to)?;
    writer.flush().map_err(ExtractionError::write(to))?;
    Ok(n)
}

/// `io::copy` that attributes failures to the side that caused them.
fn copy_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    from: &Path,
    to: &Path,
) -> Result<u64, ExtractionError> {
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExtractionError::read(from)(e)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(ExtractionError::write(to))?;
        total += n as u64;
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
