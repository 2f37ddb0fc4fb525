use std::sync::Arc;

use clap::{Parser, Subcommand};

use parley_core::backend::Backends;
use parley_core::config::{Config, LoggingConfig};
use parley_gateway::GatewayState;
use parley_media::{EnergyClassifier, HttpSynthesizer, HttpTranscriber};
use parley_providers::OpenAiGenerator;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Full-duplex voice gateway with barge-in: speak, listen, and get interrupted",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice gateway
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration summary and whether a gateway is running
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check configuration for errors and missing keys
    Validate,
    /// Write a default config file if none exists
    Init,
}

/// Filter directives from the logging config, e.g. `info,parley_session=debug`.
fn log_directives(logging: Option<&LoggingConfig>, verbose: bool) -> String {
    let level = match (verbose, logging.and_then(|l| l.level.as_deref())) {
        (true, _) => "debug",
        (false, Some(level)) => level,
        (false, None) => "info",
    };
    let mut directives = level.to_string();
    for filter in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        directives.push(',');
        directives.push_str(filter);
    }
    directives
}

fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.as_ref();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_directives(logging, verbose)));

    let json = logging.is_some_and(|l| l.format == "json");
    let stdout = logging.is_some_and(|l| l.output == "stdout");
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (json, stdout) {
        (true, true) => builder.json().with_writer(std::io::stdout).init(),
        (true, false) => builder.json().with_writer(std::io::stderr).init(),
        (false, true) => builder.with_writer(std::io::stdout).init(),
        (false, false) => builder.with_writer(std::io::stderr).init(),
    }
}

/// Wire the configured engines.
fn build_backends(config: &Config) -> Backends {
    Backends {
        classifier: Arc::new(EnergyClassifier::new(config.vad_metric())),
        transcriber: Arc::new(HttpTranscriber::new(
            config.transcription.clone().unwrap_or_default(),
        )),
        generator: Arc::new(OpenAiGenerator::new(
            &config.generation.clone().unwrap_or_default(),
        )),
        synthesizer: Arc::new(HttpSynthesizer::new(
            config.synthesis.clone().unwrap_or_default(),
            config.synthesis_chunk_bytes(),
        )),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config
    let config_path = cli
        .config
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::config_path);

    let config = Config::load(&config_path)?;

    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Serve { port } => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("{error}");
                }
                anyhow::bail!("Invalid configuration in {}", config_path.display());
            }

            let port = port.unwrap_or_else(|| config.gateway_port());
            let backends = build_backends(&config);
            tracing::info!(?backends, "Starting Parley voice gateway on port {port}");

            let state = Arc::new(GatewayState::new(Arc::new(config), backends));
            parley_gateway::start_gateway(state, port).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} configuration error(s)", errors.len());
                }
                println!("Config OK: {}", config_path.display());
            }
            ConfigAction::Init => {
                if config_path.exists() {
                    anyhow::bail!("Config already exists: {}", config_path.display());
                }
                if let Some(parent) = config_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Config::template().save(&config_path)?;
                println!("Wrote default config to {}", config_path.display());
            }
        },
        Commands::Status => {
            let port = config.gateway_port();
            let settings = config.session_settings();
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway port: {port}");
            println!(
                "Audio: {} Hz {:?}, VAD threshold {}",
                settings.format.sample_rate, settings.format.encoding, settings.vad_threshold
            );
            println!(
                "Turn-taking: barge-in after {} speech frames, phrases up to {} chars",
                settings.barge_in_frames, settings.phrase_max_chars
            );

            let health = reqwest::get(format!("http://127.0.0.1:{port}/health")).await;
            match health {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await.unwrap_or_default();
                    println!("Status: running ({} active sessions)", body["sessions"]);
                }
                _ => println!("Status: not running"),
            }
        }
    }

    Ok(())
}
