use clap::Parser;
use color_eyre::eyre::WrapErr;

mod progress;

/// Upload every matching file under a local folder to S3-compatible object storage
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_CARGO_TARGET_TRIPLE"),
    ", opt-level ",
    env!("VERGEN_CARGO_OPT_LEVEL"),
    ")"
))]
struct Args {
    #[clap(flatten)]
    config: bulkload::Config,

    #[clap(flatten)]
    globals: Globals,
}

/// Arguments that control the CLI itself rather than the upload
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet")]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Settings can also come from a `.env` file, which has to be loaded before the args are
    // parsed so the env fallbacks see it
    if let Err(e) = dotenv::dotenv() {
        if !e.not_found() {
            return Err(e).wrap_err("Error loading .env file");
        }
    }

    color_eyre::install()?;

    let args = Args::parse();

    init_logging(&args.globals);

    let summary = progress::run_upload_job(&args.globals, args.config).await?;

    if args.globals.quiet && !summary.succeeded() {
        eprintln!("{summary}");
    }

    std::process::exit(summary.exit_code());
}

/// Log to stderr.  `RUST_LOG` takes precedence over the verbosity flags.
fn init_logging(globals: &Globals) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let default_filter = if globals.verbose {
        "bulkload=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        // Progress lines are rendered by the progress bar, so only problems are logged
        "warn"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(globals.verbose),
        )
        .init();
}
