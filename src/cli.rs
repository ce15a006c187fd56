// Command-line front end for the estimator.
//
// Parses flags, resolves the external tools, runs one estimate and prints
// the result as text or JSON. Any error is printed to stderr and the
// process exits non-zero without printing sizes.

use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser, ValueEnum, ValueHint};

use crate::codec::Codec;
use crate::error::EstimateError;
use crate::pipeline::{self, Estimate, EstimateRequest};
use crate::report;
use crate::tools::{ToolOverrides, ToolPaths};

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Estimate the download size of a bsdiff update between two archives.
#[derive(Parser, Debug)]
#[command(
    name = "patchsize",
    version,
    about = "Estimate the size of an update patch and of the compressed new file",
    arg_required_else_help = true
)]
struct Cli {
    /// The "old" file to generate a patch from.
    #[arg(long = "old-file", value_hint = ValueHint::FilePath)]
    old_file: PathBuf,

    /// The "new" file to generate a patch from.
    #[arg(long = "new-file", value_hint = ValueHint::FilePath)]
    new_file: PathBuf,

    /// Keep the generated patch at this path (the compressed form gets the
    /// codec's extension appended).
    #[arg(long = "save-patch", value_hint = ValueHint::FilePath)]
    save_patch: Option<PathBuf>,

    /// Directory for intermediate files (default: the system temp dir).
    #[arg(long = "temp-dir", value_hint = ValueHint::DirPath)]
    temp_dir: Option<PathBuf>,

    /// Codec the patch and new file sizes are measured under.
    ///
    /// `lzma` uses a literal-only encoder: its sizes are an upper bound and
    /// not comparable with `gzip`.
    #[arg(long, value_enum, default_value_t = CodecArg::Gzip)]
    codec: CodecArg,

    /// Path to the bsdiff executable (default: looked up on PATH).
    #[arg(long, value_hint = ValueHint::ExecutablePath)]
    bsdiff: Option<PathBuf>,

    /// Path to the bzip2 executable (default: looked up on PATH).
    #[arg(long, value_hint = ValueHint::ExecutablePath)]
    bzip2: Option<PathBuf>,

    /// Print the estimate as JSON.
    #[arg(long = "json")]
    json_output: bool,

    /// Quiet mode (only errors are logged).
    #[arg(short = 'q', long, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CodecArg {
    Gzip,
    Bzip2,
    /// Literal-only LZMA; sizes overstate a real LZMA encoder
    Lzma,
}

impl From<CodecArg> for Codec {
    fn from(arg: CodecArg) -> Self {
        match arg {
            CodecArg::Gzip => Codec::Gzip,
            CodecArg::Bzip2 => Codec::Bzip2,
            CodecArg::Lzma => Codec::Lzma,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved options
// ---------------------------------------------------------------------------

struct Options {
    request: EstimateRequest,
    overrides: ToolOverrides,
    json_output: bool,
    quiet: bool,
    verbose: u8,
}

fn resolve_options(cli: Cli) -> Options {
    let work_dir = cli.temp_dir.unwrap_or_else(std::env::temp_dir);
    let mut request =
        EstimateRequest::new(cli.old_file, cli.new_file, work_dir).codec(cli.codec.into());
    request.save_patch = cli.save_patch;

    Options {
        request,
        overrides: ToolOverrides {
            bsdiff: cli.bsdiff,
            bzip2: cli.bzip2,
        },
        json_output: cli.json_output,
        quiet: cli.quiet,
        verbose: cli.verbose.min(2),
    }
}

fn log_filter(opts: &Options) -> &'static str {
    match (opts.quiet, opts.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        _ => "debug",
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn estimate_json(estimate: &Estimate) -> serde_json::Value {
    serde_json::json!({
        "codec": estimate.codec.name(),
        "new_file_size": estimate.new_file_size,
        "new_file_compressed_size": estimate.new_file_compressed_size,
        "patch_size": estimate.patch_size,
        "raw_bsdiff_size": estimate.raw_diff_size,
        "saved_patch": estimate.saved_patch.as_ref().map(|p| p.display().to_string()),
    })
}

fn cmd_estimate(opts: &Options) -> Result<Estimate, EstimateError> {
    // Bad arguments are reported ahead of missing tools.
    pipeline::check_preconditions(&opts.request)?;
    let tools = ToolPaths::locate_with(&opts.overrides)?;
    pipeline::estimate(&tools, &opts.request)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Main CLI entry point. Parses arguments via clap and runs one estimate.
pub fn run() -> ! {
    let cli = Cli::parse();
    let opts = resolve_options(cli);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_filter(&opts)))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let estimate = match cmd_estimate(&opts) {
        Ok(estimate) => estimate,
        Err(e) => {
            eprintln!("patchsize: {e}");
            process::exit(1);
        }
    };

    if opts.json_output {
        match serde_json::to_string_pretty(&estimate_json(&estimate)) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("patchsize: json: {e}");
                process::exit(1);
            }
        }
    } else {
        print!("{}", report::render_text(&estimate));
    }

    process::exit(0);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
