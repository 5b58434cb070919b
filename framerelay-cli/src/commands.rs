//! CLI command implementations

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Subcommand;
use framerelay_core::config::RelayConfig;
use framerelay_core::supervisor::shutdown_channel;
use framerelay_core::test_pattern::TestPatternSource;
use framerelay_core::{
    ProcessLauncher, SessionDescriptor, ShutdownTrigger, Supervisor, SupervisorContext,
    TransformKind,
};
use tracing::{info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the supervised relay pipeline
    Run {
        /// JSON configuration document
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Transform applied to every frame
        #[arg(short, long, value_enum, default_value_t = TransformKind::Identity)]
        transform: TransformKind,
    },
    /// Print the session descriptor the pipeline would write
    Describe {
        /// JSON configuration document
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stream a synthetic test pattern to the relay's session address
    TestStream {
        /// JSON configuration document
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Destination port, defaults to the session port
        #[arg(short, long)]
        port: Option<u16>,
        /// Encoder passed to the transcoder
        #[arg(long, default_value = "libvpx-vp9")]
        codec: String,
        /// RTP payload type, defaults to the session payload type
        #[arg(long)]
        payload_type: Option<u8>,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns an error when configuration cannot be loaded or the command
/// cannot start
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run { config, transform } => run_pipeline(config.as_deref(), transform).await,
        Commands::Describe { config } => describe(config.as_deref()),
        Commands::TestStream {
            config,
            port,
            codec,
            payload_type,
        } => run_test_stream(config.as_deref(), port, codec, payload_type).await,
    }
}

/// Loads the configuration file (or defaults), applies environment
/// overrides and validates the result.
fn load_config(path: Option<&Path>) -> anyhow::Result<RelayConfig> {
    let mut config = match path {
        Some(path) => RelayConfig::from_json_file(path)?,
        None => RelayConfig::default(),
    };
    config.apply_env_overrides();
    config.validate().context("Configuration rejected")?;
    Ok(config)
}

/// Run the relay until Ctrl-C or SIGTERM
async fn run_pipeline(config: Option<&Path>, transform: TransformKind) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let (trigger, listener) = shutdown_channel();
    spawn_signal_listener(trigger);

    let mut supervisor = Supervisor::new(
        config,
        ProcessLauncher::new(),
        transform.build(),
        SupervisorContext::new(listener),
    );
    let attempts = supervisor.run().await;

    info!(attempts, "Relay stopped");
    Ok(())
}

/// Print the session descriptor for the loaded configuration
fn describe(config: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let descriptor = SessionDescriptor::new(&config.session, &config.frame);

    eprintln!(
        "# written to {} before each input spawn",
        config.session.descriptor_path.display()
    );
    print!("{}", descriptor.render());
    Ok(())
}

/// Stream a test pattern until Ctrl-C
async fn run_test_stream(
    config: Option<&Path>,
    port: Option<u16>,
    codec: String,
    payload_type: Option<u8>,
) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let mut source = TestPatternSource::for_session(&config);
    source.codec = codec;
    if let Some(port) = port {
        source.port = port;
    }
    if let Some(payload_type) = payload_type {
        source.payload_type = payload_type;
    }

    let (trigger, listener) = shutdown_channel();
    spawn_signal_listener(trigger);

    let (end, report) = source
        .run(&ProcessLauncher::new(), listener, &config.supervisor)
        .await
        .with_context(|| format!("Test stream to {} failed", source.destination()))?;

    info!(?end, error_lines = report.map(|r| r.error_lines), "Test stream finished");
    Ok(())
}

fn spawn_signal_listener(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining");
        trigger.trigger();
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(
            &path,
            r#"{
                "frame": { "width": 640, "height": 480 },
                "session": { "port": 6002, "payload_type": 45, "codec_name": "AV1" },
                "output": null,
                "supervisor": { "restart_delay": 500 }
            }"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();

        assert_eq!(config.frame.frame_size(), 640 * 480 * 3);
        assert_eq!(config.session.port, 6002);
        assert_eq!(config.session.codec_name, "AV1");
        assert!(config.output.is_none());
        assert_eq!(
            config.supervisor.restart_delay,
            std::time::Duration::from_millis(500)
        );
    }

    #[test]
    fn test_load_config_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{ "frame": { "frame_rate": 0 } }"#).unwrap();

        assert!(load_config(Some(&path)).is_err());
        assert!(load_config(Some(&dir.path().join("missing.json"))).is_err());
    }
}
