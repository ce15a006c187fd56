#![no_main]
use libfuzzer_sys::fuzz_target;
use patchsize::codec::{CodecBackend, GzipBackend};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode or fail with an error, never panic.
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.gz");
    std::fs::write(&input, data).unwrap();
    let _ = GzipBackend.decompress(&input, &dir.path().join("out"));
});
