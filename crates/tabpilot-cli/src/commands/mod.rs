use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tabpilot_config::{ConfigLoader, TabpilotConfig};
use tabpilot_core::PilotError;

mod agent;
mod run;
mod runner;
mod send;
mod serve;

/// Polling step driver for browser tabs, with a chunked WebSocket relay
#[derive(Parser)]
#[command(name = "tabpilot", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to tabpilot.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the relay and run flows as commands arrive
    Agent,
    /// Run one flow once against the tab matching its URL pattern
    Run {
        /// Flow name
        flow: String,
        /// Text handed to steps reading `from = "text"`
        #[arg(short, long)]
        text: Option<String>,
        /// Image file handed to steps reading `from = "image"`
        #[arg(long)]
        image_file: Option<PathBuf>,
    },
    /// Relay a file through the chunked transport and wait for the receiver
    Send {
        /// File to send
        file: PathBuf,
        /// Logical key (usually the page URL) the transfer id derives from
        #[arg(short, long)]
        key: Option<String>,
        /// Document type routed by the receiver (e.g. product)
        #[arg(short, long)]
        doc_type: Option<String>,
        /// Seconds to wait for the receiver's verdict
        #[arg(long, default_value = "60")]
        timeout: u64,
    },
    /// Run the relay hub: reassemble documents and broadcast commands typed on stdin
    Serve {
        /// Address to listen on (default: receiver.listen)
        #[arg(short = 'L', long)]
        listen: Option<String>,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> tabpilot_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level
                .as_deref()
                .unwrap_or(config.logging.level.as_str())
        };
        let log_format = self
            .log_format
            .as_deref()
            .unwrap_or(config.logging.format.as_str());
        init_tracing(log_level, log_format);

        match self.command {
            Commands::Agent => agent::cmd_agent(config_loader).await,
            Commands::Run {
                flow,
                text,
                image_file,
            } => run::cmd_run(config, flow, text, image_file).await,
            Commands::Send {
                file,
                key,
                doc_type,
                timeout,
            } => send::cmd_send(config, file, key, doc_type, timeout).await,
            Commands::Serve { listen } => serve::cmd_serve(config, listen).await,
            Commands::Config { json } => Self::cmd_config(config, json),
        }
    }

    fn cmd_config(config: TabpilotConfig, json: bool) -> tabpilot_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(&config).map_err(|e| PilotError::Config(e.to_string()))?
            );
        }
        Ok(())
    }
}

/// `RUST_LOG` wins over the resolved level when set.
fn init_tracing(level: &str, format: &str) {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
    };
    match format {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_target(true)
            .init(),
        "compact" => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .compact()
            .with_target(false)
            .init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init(),
    }
}
