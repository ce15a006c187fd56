fn main() {
    #[cfg(feature = "cli")]
    patchsize::cli::run();

    #[cfg(not(feature = "cli"))]
    {
        eprintln!("patchsize: CLI not enabled. Rebuild with `--features cli`.");
        std::process::exit(1);
    }
}
