//! Framerelay CLI - Command-line interface
//!
//! Runs the supervised relay, prints session descriptors and drives test
//! streams.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use framerelay_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "framerelay")]
#[command(about = "Supervised frame relay between external transcoders")]
struct Cli {
    /// Console log level; RUST_LOG takes precedence
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info, global = true)]
    log_level: CliLogLevel,

    /// Directory for the full trace of the last run
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())
        .context("Failed to initialize tracing")?;

    commands::handle_command(cli.command).await
}

#[cfg(test)]
mod tests {
    use framerelay_core::TransformKind;

    use super::*;
    use crate::commands::Commands;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "framerelay",
            "--log-level",
            "debug",
            "run",
            "--transform",
            "grayscale",
        ])
        .unwrap();

        assert_eq!(cli.log_level, CliLogLevel::Debug);
        assert!(matches!(
            cli.command,
            Commands::Run {
                config: None,
                transform: TransformKind::Grayscale
            }
        ));
    }

    #[test]
    fn test_parse_test_stream_defaults() {
        let cli = Cli::try_parse_from(["framerelay", "test-stream", "--port", "6002"]).unwrap();

        match cli.command {
            Commands::TestStream {
                port,
                codec,
                payload_type,
                ..
            } => {
                assert_eq!(port, Some(6002));
                assert_eq!(codec, "libvpx-vp9");
                assert_eq!(payload_type, None);
            }
            _ => panic!("expected test-stream"),
        }
    }

    #[test]
    fn test_unknown_transform_rejected() {
        assert!(Cli::try_parse_from(["framerelay", "run", "--transform", "sepia"]).is_err());
    }
}
