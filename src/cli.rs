//! CLI argument parsing for the stream reader

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for the allocation report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "memprof")]
#[command(version)]
#[command(about = "Report on allocation streams recorded by the memprof profiler", long_about = None)]
pub struct Cli {
    /// Stream file written by a profiling session
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Only report memory still allocated at the end of the stream
    #[arg(long = "leak-only")]
    pub leak_only: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_file() {
        let cli = Cli::parse_from(["memprof", "memprof.bin"]);
        assert_eq!(cli.file, PathBuf::from("memprof.bin"));
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn test_cli_requires_file() {
        assert!(Cli::try_parse_from(["memprof"]).is_err());
    }

    #[test]
    fn test_cli_format_json() {
        let cli = Cli::parse_from(["memprof", "--format", "json", "out.bin"]);
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["memprof", "--format", "csv", "out.bin"]).is_err());
    }

    #[test]
    fn test_cli_leak_only_flag() {
        let cli = Cli::parse_from(["memprof", "--leak-only", "out.bin"]);
        assert!(cli.leak_only);
    }

    #[test]
    fn test_cli_leak_only_default_false() {
        let cli = Cli::parse_from(["memprof", "out.bin"]);
        assert!(!cli.leak_only);
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_debug_flag() {
        let cli = Cli::parse_from(["memprof", "--debug", "out.bin"]);
        assert!(cli.debug);
    }
}
