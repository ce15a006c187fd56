#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use patchsize::codec::{Bzip2Tool, Codec, CodecBackend, GzipBackend};
use patchsize::error::{EstimateError, Step};
use patchsize::extract;
use patchsize::pipeline::{self, BSDIFF_HEADER_LEN, EstimateRequest, WorkArea};
use patchsize::tools::{self, ToolPaths};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::{TempDir, tempdir};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Archive-like bytes: incompressible blocks interleaved with text.
fn archive_bytes(seed: u64, blocks: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::new();
    for i in 0..blocks {
        let mut random = vec![0u8; 4096];
        rng.fill(&mut random[..]);
        out.extend_from_slice(&random);
        for _ in 0..64 {
            out.extend_from_slice(format!("entry-{i:05} resources/values/strings.xml\n").as_bytes());
        }
    }
    out
}

/// `base` with a few scattered edits and an appended tail.
fn next_version(base: &[u8]) -> Vec<u8> {
    let mut out = base.to_vec();
    for i in (0..out.len()).step_by(8191) {
        out[i] = out[i].wrapping_add(1);
    }
    out.extend_from_slice(b"appended classes.dex payload");
    out
}

/// Text-heavy manifest lines; deterministic without an RNG.
fn manifest_bytes(entries: u64, revision: u64) -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..entries {
        let crc = (i * 2654435761 + revision) % (1 << 32);
        out.extend_from_slice(
            format!(
                "entry-{i:05} res/drawable/icon_{}.png crc={crc:08x} size={}\n",
                i % 97,
                (i * 37) % 10007
            )
            .as_bytes(),
        );
    }
    out
}

fn assert_within_10_percent(what: &str, actual: u64, recorded: u64) {
    let low = recorded - recorded / 10;
    let high = recorded + recorded / 10;
    assert!(
        (low..=high).contains(&actual),
        "{what}: {actual} bytes, recorded {recorded} (allowed {low}..={high})"
    );
}

struct Fixture {
    _inputs: TempDir,
    work: TempDir,
    old: PathBuf,
    new: PathBuf,
}

fn fixture(old: &[u8], new: &[u8]) -> Fixture {
    let inputs = tempdir().unwrap();
    let work = tempdir().unwrap();
    let old_path = inputs.path().join("1.zip");
    let new_path = inputs.path().join("2.zip");
    std::fs::write(&old_path, old).unwrap();
    std::fs::write(&new_path, new).unwrap();
    Fixture {
        _inputs: inputs,
        work,
        old: old_path,
        new: new_path,
    }
}

fn bzip2_or_skip() -> Option<PathBuf> {
    match tools::find_binary(tools::BZIP2) {
        Ok(p) => Some(p),
        Err(_) => {
            eprintln!("skipping: bzip2 not on PATH");
            None
        }
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A stand-in for bsdiff: 32-byte header followed by `bzip2 -c new`.
fn fake_bsdiff(dir: &Path, bzip2: &Path) -> PathBuf {
    write_script(
        dir,
        "fake-bsdiff",
        &format!(
            "printf 'BSDIFF40' > \"$3\" && head -c 24 /dev/zero >> \"$3\" && {} -9 -c \"$2\" >> \"$3\"",
            bzip2.display()
        ),
    )
}

fn fake_header() -> Vec<u8> {
    let mut h = b"BSDIFF40".to_vec();
    h.resize(BSDIFF_HEADER_LEN as usize, 0);
    h
}

fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    let mut v: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    v.sort();
    v
}

// ---------------------------------------------------------------------------
// Fake diff tool
// ---------------------------------------------------------------------------

#[test]
fn transcoded_patch_is_header_plus_plain_payload() {
    let Some(bzip2) = bzip2_or_skip() else { return };
    let old = archive_bytes(1, 16);
    let new = next_version(&old);
    let fx = fixture(&old, &new);
    let bin = tempdir().unwrap();
    let tools = ToolPaths {
        bsdiff: fake_bsdiff(bin.path(), &bzip2),
        bzip2,
    };

    let out = tempdir().unwrap();
    let save = out.path().join("mypatch");
    let req = EstimateRequest::new(&fx.old, &fx.new, fx.work.path()).save_patch(&save);
    let estimate = pipeline::estimate(&tools, &req).unwrap();

    let saved = estimate.saved_patch.clone().unwrap();
    assert_eq!(saved, out.path().join("mypatch.gz"));
    assert_eq!(estimate.patch_size, std::fs::metadata(&saved).unwrap().len());

    // Only the compressed patch survives; the uncompressed one is gone.
    assert_eq!(dir_entries(out.path()), vec![saved.clone()]);
    assert!(dir_entries(fx.work.path()).is_empty());

    let rebuilt = out.path().join("rebuilt");
    GzipBackend.decompress(&saved, &rebuilt).unwrap();
    let mut expected = fake_header();
    expected.extend_from_slice(&new);
    assert_eq!(std::fs::read(&rebuilt).unwrap(), expected);
}

#[test]
fn new_file_size_matches_direct_compression() {
    let Some(bzip2) = bzip2_or_skip() else { return };
    let old = archive_bytes(2, 8);
    let new = next_version(&old);
    let fx = fixture(&old, &new);
    let bin = tempdir().unwrap();
    let tools = ToolPaths {
        bsdiff: fake_bsdiff(bin.path(), &bzip2),
        bzip2,
    };

    let estimate =
        pipeline::estimate(&tools, &EstimateRequest::new(&fx.old, &fx.new, fx.work.path()))
            .unwrap();

    let scratch = tempdir().unwrap();
    let direct = GzipBackend
        .compress_max(&fx.new, &scratch.path().join("direct.gz"))
        .unwrap();
    assert_eq!(estimate.new_file_compressed_size, direct);
    assert_eq!(estimate.new_file_size, new.len() as u64);
    assert_eq!(estimate.codec, Codec::Gzip);
    assert!(estimate.saved_patch.is_none());
}

#[test]
fn repeated_runs_are_deterministic() {
    let Some(bzip2) = bzip2_or_skip() else { return };
    let old = archive_bytes(3, 8);
    let new = next_version(&old);
    let fx = fixture(&old, &new);
    let bin = tempdir().unwrap();
    let tools = ToolPaths {
        bsdiff: fake_bsdiff(bin.path(), &bzip2),
        bzip2,
    };
    let req = EstimateRequest::new(&fx.old, &fx.new, fx.work.path());

    let a = pipeline::estimate(&tools, &req).unwrap();
    let b = pipeline::estimate(&tools, &req).unwrap();
    assert_eq!(a, b);
}

#[test]
fn stale_work_area_files_are_not_reused() {
    let Some(bzip2) = bzip2_or_skip() else { return };
    let old = archive_bytes(4, 4);
    let new = next_version(&old);
    let fx = fixture(&old, &new);
    let bin = tempdir().unwrap();
    let tools = ToolPaths {
        bsdiff: fake_bsdiff(bin.path(), &bzip2),
        bzip2,
    };
    let req = EstimateRequest::new(&fx.old, &fx.new, fx.work.path());
    let clean = pipeline::estimate(&tools, &req).unwrap();

    {
        let stale = WorkArea::new(fx.work.path(), None, Codec::Gzip);
        for path in stale.paths() {
            std::fs::write(path, b"left over from a crashed run").unwrap();
        }
        std::mem::forget(stale);
    }

    let again = pipeline::estimate(&tools, &req).unwrap();
    assert_eq!(again, clean);
    assert!(dir_entries(fx.work.path()).is_empty());
}

#[test]
fn output_codec_is_a_parameter() {
    let Some(bzip2) = bzip2_or_skip() else { return };
    let old = archive_bytes(5, 8);
    let new = next_version(&old);
    let fx = fixture(&old, &new);
    let bin = tempdir().unwrap();
    let tools = ToolPaths {
        bsdiff: fake_bsdiff(bin.path(), &bzip2),
        bzip2,
    };

    let out = tempdir().unwrap();
    let req = EstimateRequest::new(&fx.old, &fx.new, fx.work.path())
        .codec(Codec::Lzma)
        .save_patch(out.path().join("p"));
    let estimate = pipeline::estimate(&tools, &req).unwrap();
    assert_eq!(estimate.codec, Codec::Lzma);
    assert_eq!(estimate.saved_patch, Some(out.path().join("p.lzma")));
    assert!(estimate.new_file_compressed_size < new.len() as u64);
}

#[test]
fn manifest_pair_matches_recorded_sizes() {
    let Some(bzip2) = bzip2_or_skip() else { return };
    let old = manifest_bytes(4000, 1);
    let new = manifest_bytes(4000, 2);
    assert_eq!(new.len(), 239_130);
    let fx = fixture(&old, &new);
    let bin = tempdir().unwrap();
    let tools = ToolPaths {
        bsdiff: fake_bsdiff(bin.path(), &bzip2),
        bzip2,
    };

    let estimate =
        pipeline::estimate(&tools, &EstimateRequest::new(&fx.old, &fx.new, fx.work.path()))
            .unwrap();

    assert_eq!(estimate.new_file_size, 239_130);
    assert_within_10_percent("patch_size", estimate.patch_size, 55_083);
    assert_within_10_percent(
        "new_file_compressed_size",
        estimate.new_file_compressed_size,
        55_057,
    );
    assert_within_10_percent("raw_diff_size", estimate.raw_diff_size, 38_077);

    // Transcoding changes the size: gzip over the plain payload is not the
    // bzip2 payload bsdiff wrote.
    let raw = estimate.raw_diff_size as f64;
    let patch = estimate.patch_size as f64;
    assert!(
        (patch - raw).abs() / raw > 0.2,
        "patch_size {} too close to raw_diff_size {}",
        estimate.patch_size,
        estimate.raw_diff_size
    );
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[test]
fn save_path_naming_an_input_is_rejected_and_input_survives() {
    let old = archive_bytes(13, 2);
    let new = next_version(&old);
    let fx = fixture(&old, &new);
    let bin = tempdir().unwrap();
    let marker = bin.path().join("ran");
    let tool = write_script(bin.path(), "bsdiff", &format!("touch {}", marker.display()));
    let tools = ToolPaths {
        bsdiff: tool.clone(),
        bzip2: tool,
    };

    for save in [fx.old.clone(), fx.new.clone()] {
        let req = EstimateRequest::new(&fx.old, &fx.new, fx.work.path()).save_patch(&save);
        let err = pipeline::estimate(&tools, &req).unwrap_err();
        assert!(matches!(err, EstimateError::Precondition(_)), "{err:?}");
    }
    assert_eq!(std::fs::read(&fx.old).unwrap(), old);
    assert_eq!(std::fs::read(&fx.new).unwrap(), new);
    assert!(!marker.exists());
}

#[test]
fn input_inside_work_area_is_rejected_and_survives() {
    let old = archive_bytes(14, 2);
    let work = tempdir().unwrap();
    let inside = work.path().join("patch.tmp.header");
    std::fs::write(&inside, &old).unwrap();
    let bin = tempdir().unwrap();
    let tool = write_script(bin.path(), "bsdiff", "exit 0");
    let tools = ToolPaths {
        bsdiff: tool.clone(),
        bzip2: tool,
    };

    let err = pipeline::estimate(&tools, &EstimateRequest::new(&inside, &inside, work.path()))
        .unwrap_err();
    assert!(matches!(err, EstimateError::Precondition(_)), "{err:?}");
    assert_eq!(std::fs::read(&inside).unwrap(), old);
}

#[test]
fn failing_diff_tool_aborts_and_leaves_nothing() {
    let old = archive_bytes(6, 2);
    let fx = fixture(&old, &old);
    let bin = tempdir().unwrap();
    let failing = write_script(bin.path(), "bsdiff", "echo 'bsdiff: out of memory' >&2; exit 1");
    let tools = ToolPaths {
        bsdiff: failing.clone(),
        bzip2: failing,
    };

    let err = pipeline::estimate(&tools, &EstimateRequest::new(&fx.old, &fx.new, fx.work.path()))
        .unwrap_err();
    match &err {
        EstimateError::ExternalTool {
            step,
            status,
            stderr,
        } => {
            assert_eq!(*step, Step::Diff);
            assert_eq!(*status, Some(1));
            assert!(stderr.contains("out of memory"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.to_string(), "Problem at the diff step, returned code: 1");
    assert!(dir_entries(fx.work.path()).is_empty());
}

#[test]
fn partial_diff_output_is_cleaned_up() {
    let old = archive_bytes(7, 2);
    let fx = fixture(&old, &old);
    let bin = tempdir().unwrap();
    let failing = write_script(bin.path(), "bsdiff", "printf 'BSDIFF40partial' > \"$3\"; exit 2");
    let tools = ToolPaths {
        bsdiff: failing.clone(),
        bzip2: failing,
    };

    let err = pipeline::estimate(&tools, &EstimateRequest::new(&fx.old, &fx.new, fx.work.path()))
        .unwrap_err();
    assert_eq!(err.step(), Some(Step::Diff));
    assert!(dir_entries(fx.work.path()).is_empty());
}

#[test]
fn short_diff_fails_at_split() {
    let old = archive_bytes(8, 2);
    let fx = fixture(&old, &old);
    let bin = tempdir().unwrap();
    let short = write_script(bin.path(), "bsdiff", "printf 'BSDIFF40' > \"$3\"");
    let tools = ToolPaths {
        bsdiff: short.clone(),
        bzip2: short,
    };

    let err = pipeline::estimate(&tools, &EstimateRequest::new(&fx.old, &fx.new, fx.work.path()))
        .unwrap_err();
    assert!(
        matches!(
            err,
            EstimateError::Extraction {
                step: Step::Split,
                source: extract::ExtractionError::OffsetOutOfRange { .. }
            }
        ),
        "{err:?}"
    );
    assert!(dir_entries(fx.work.path()).is_empty());
}

#[test]
fn corrupt_payload_fails_at_decode() {
    let Some(bzip2) = bzip2_or_skip() else { return };
    let old = archive_bytes(9, 2);
    let fx = fixture(&old, &old);
    let bin = tempdir().unwrap();
    let garbage = write_script(
        bin.path(),
        "bsdiff",
        "printf 'BSDIFF40' > \"$3\" && head -c 24 /dev/zero >> \"$3\" && printf 'not bzip2 data' >> \"$3\"",
    );
    let tools = ToolPaths {
        bsdiff: garbage,
        bzip2,
    };

    let out = tempdir().unwrap();
    let req = EstimateRequest::new(&fx.old, &fx.new, fx.work.path()).save_patch(out.path().join("p"));
    let err = pipeline::estimate(&tools, &req).unwrap_err();
    assert!(
        matches!(err, EstimateError::Codec { step: Step::Decode, .. }),
        "{err:?}"
    );
    assert!(dir_entries(fx.work.path()).is_empty());
    assert!(dir_entries(out.path()).is_empty());
}

#[test]
fn missing_input_fails_before_running_anything() {
    let work = tempdir().unwrap();
    let bin = tempdir().unwrap();
    let marker = bin.path().join("ran");
    let tool = write_script(bin.path(), "bsdiff", &format!("touch {}", marker.display()));
    let tools = ToolPaths {
        bsdiff: tool.clone(),
        bzip2: tool,
    };

    let req = EstimateRequest::new(
        work.path().join("missing-old"),
        work.path().join("missing-new"),
        work.path(),
    );
    let err = pipeline::estimate(&tools, &req).unwrap_err();
    assert!(matches!(err, EstimateError::Precondition(_)));
    assert!(!marker.exists());
}

// ---------------------------------------------------------------------------
// Real bsdiff (skipped when not installed)
// ---------------------------------------------------------------------------

fn real_tools_or_skip() -> Option<ToolPaths> {
    match ToolPaths::locate() {
        Ok(tools) => Some(tools),
        Err(e) => {
            eprintln!("skipping: {e}");
            None
        }
    }
}

#[test]
fn real_bsdiff_round_trip_fidelity() {
    let Some(tools) = real_tools_or_skip() else { return };
    let old = archive_bytes(10, 32);
    let new = next_version(&old);
    let fx = fixture(&old, &new);

    let out = tempdir().unwrap();
    let save = out.path().join("mypatch");
    let req = EstimateRequest::new(&fx.old, &fx.new, fx.work.path()).save_patch(&save);
    let estimate = pipeline::estimate(&tools, &req).unwrap();

    // Independently: bsdiff, then header ++ bunzip2(rest).
    let scratch = tempdir().unwrap();
    let raw = scratch.path().join("raw");
    let status = std::process::Command::new(&tools.bsdiff)
        .arg(&fx.old)
        .arg(&fx.new)
        .arg(&raw)
        .status()
        .unwrap();
    assert!(status.success());
    let head = scratch.path().join("head");
    let body = scratch.path().join("body.bz2");
    extract::split_at(&raw, BSDIFF_HEADER_LEN, &head, &body).unwrap();
    let plain = scratch.path().join("body");
    Bzip2Tool::new(&tools.bzip2).decompress(&body, &plain).unwrap();
    let mut expected = std::fs::read(&head).unwrap();
    expected.extend_from_slice(&std::fs::read(&plain).unwrap());

    let rebuilt = scratch.path().join("rebuilt");
    GzipBackend
        .decompress(estimate.saved_patch.as_ref().unwrap(), &rebuilt)
        .unwrap();
    assert_eq!(std::fs::read(&rebuilt).unwrap(), expected);
    assert_eq!(
        estimate.raw_diff_size,
        std::fs::metadata(&raw).unwrap().len()
    );
    assert!(dir_entries(fx.work.path()).is_empty());
}

#[test]
fn real_bsdiff_identical_files_give_tiny_patch() {
    let Some(tools) = real_tools_or_skip() else { return };
    let data = archive_bytes(11, 16);
    let fx = fixture(&data, &data);

    let estimate =
        pipeline::estimate(&tools, &EstimateRequest::new(&fx.old, &fx.new, fx.work.path()))
            .unwrap();
    assert!(
        estimate.patch_size < 1024,
        "patch_size={} for identical {} byte files",
        estimate.patch_size,
        data.len()
    );
    assert!(estimate.patch_size < estimate.new_file_compressed_size);
}

#[test]
fn real_bsdiff_patch_beats_full_download() {
    let Some(tools) = real_tools_or_skip() else { return };
    let old = archive_bytes(12, 64);
    let new = next_version(&old);
    let fx = fixture(&old, &new);

    let estimate =
        pipeline::estimate(&tools, &EstimateRequest::new(&fx.old, &fx.new, fx.work.path()))
            .unwrap();
    assert!(estimate.patch_size > 0);
    assert!(
        estimate.patch_size < estimate.new_file_compressed_size / 4,
        "patch={} new={}",
        estimate.patch_size,
        estimate.new_file_compressed_size
    );
}
