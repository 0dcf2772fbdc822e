//! Terremark CLI - provision vApps on Terremark vCloud.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use terremark::bootstrap::KnifeBootstrap;
use terremark::config::{CreateOptions, Settings, StoredConfig};
use terremark::output::{ProgressSink, TerminalSink};
use terremark::provision::terminal_state;
use terremark::{Provisioner, Terremark, TerminalState};

/// Terremark CLI - provision servers on Terremark vCloud.
#[derive(Parser)]
#[command(name = "terremark")]
#[command(about = "Provision servers on Terremark vCloud and bootstrap them with knife")]
struct Cli {
    /// Config file (or set `TERREMARK_CONFIG` env var).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(long, global = true, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage servers.
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Create a vApp, wait for SSH, and bootstrap it.
    Create(CreateOptions),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so progress output on stdout stays readable
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let sink = TerminalSink;
    match cli.command {
        Commands::Server {
            command: ServerCommands::Create(options),
        } => create(cli.config.as_deref(), &options, &sink).await,
    }
}

/// Build the provider client from resolved settings.
fn provider(settings: &Settings) -> Result<Terremark> {
    let provider = Terremark::new(
        &settings.credentials.username,
        &settings.credentials.password,
    )
    .context("Failed to create Terremark provider")?;

    Ok(match &settings.api_url {
        Some(url) => provider.with_base_url(url),
        None => provider,
    })
}

async fn create(config: Option<&Path>, options: &CreateOptions, sink: &TerminalSink) -> ExitCode {
    let settings =
        match StoredConfig::load(config).and_then(|stored| Settings::resolve(options, &stored)) {
            Ok(settings) => settings,
            Err(e) => {
                sink.error(&e.to_string());
                return ExitCode::FAILURE;
            }
        };

    let provider = match provider(&settings) {
        Ok(provider) => provider,
        Err(e) => {
            sink.error(&format!("{e:#}"));
            return ExitCode::FAILURE;
        }
    };
    let knife = KnifeBootstrap::new().with_program(&settings.bootstrap_command);

    let result = Provisioner::new(&provider, &knife, sink)
        .with_timing(settings.timing.clone())
        .run(&settings.request)
        .await;

    let state = terminal_state(&result);
    match result {
        Ok(provisioned) => {
            info!(
                server_id = %provisioned.server.id,
                node_name = %provisioned.bootstrap.node_name,
                "Server created and bootstrapped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            sink.error(&e.to_string());
            if let (TerminalState::FailedMidFlight, Some(id)) = (state, e.server_id()) {
                sink.warn(&format!(
                    "vApp {id} was left in place and must be deleted manually"
                ));
            }
            ExitCode::FAILURE
        }
    }
}
