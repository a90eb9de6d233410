use anyhow::{Context, Result};
use clap::Parser;
use memprof::cli::{Cli, OutputFormat};
use memprof::{decode, report::Report};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_report(report: &Report, format: OutputFormat, leak_only: bool) -> Result<()> {
    match (format, leak_only) {
        (OutputFormat::Text, false) => print!("{}", report.render_text()),
        (OutputFormat::Text, true) => print!("{}", report.render_leaks()),
        (OutputFormat::Json, false) => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        (OutputFormat::Json, true) => {
            println!("{}", serde_json::to_string_pretty(&report.leaks)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let data = std::fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let stream = decode::parse(&data)
        .with_context(|| format!("{} is not a memprof stream", args.file.display()))?;
    tracing::debug!(
        symbols = stream.symbols.len(),
        events = stream.event_count(),
        complete = stream.complete,
        "stream decoded"
    );
    if !stream.complete {
        tracing::warn!("stream has no epilogue");
    }

    let report = Report::build(&stream);
    print_report(&report, args.format, args.leak_only)?;

    Ok(())
}
