#![no_main]
use libfuzzer_sys::fuzz_target;
use patchsize::extract;

fuzz_target!(|data: &[u8]| {
    let Some((&cut, rest)) = data.split_first() else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::write(&src, rest).unwrap();
    let head = dir.path().join("head");
    let tail = dir.path().join("tail");

    match extract::split_at(&src, u64::from(cut), &head, &tail) {
        Ok(_) => {
            let joined = dir.path().join("joined");
            extract::concat_files(&[&head, &tail], &joined).unwrap();
            assert_eq!(std::fs::read(&joined).unwrap(), rest);
        }
        Err(_) => assert!(usize::from(cut) > rest.len()),
    }
});
