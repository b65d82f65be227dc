//! ObfusQ CLI
//!
//! Runs the web server or obfuscates a single file through the external
//! obfuscator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use obfusq_core::{ObfuscationRequest, ObfusqConfig, Preset, PresetSelection};
use obfusq_server::{run_server, AppState, ServerConfig};

#[derive(Parser)]
#[command(name = "obfusq")]
#[command(about = "Web front-end and command-line driver for an external Luau obfuscator")]
#[command(version)]
struct Cli {
    /// Config file (default: ./obfusq.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides for the `[obfuscator]` config section
#[derive(Args, Default)]
struct ObfuscatorArgs {
    /// Obfuscator executable (e.g. lua)
    #[arg(long)]
    obfuscator: Option<PathBuf>,

    /// Script passed before the per-request arguments (e.g. src/cli.lua)
    #[arg(long)]
    script: Option<String>,

    /// Seconds before an obfuscator run is killed
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web server
    Serve {
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        #[command(flatten)]
        obfuscator: ObfuscatorArgs,
    },

    /// Obfuscate a single file without starting the server
    Obfuscate {
        /// Script to obfuscate
        input: PathBuf,

        /// Preset to use
        #[arg(short, long)]
        preset: Option<Preset>,

        /// Obfuscator config file to use instead of a preset
        #[arg(long, conflicts_with = "preset")]
        preset_config: Option<PathBuf>,

        /// Output path (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        obfuscator: ObfuscatorArgs,
    },

    /// Check whether a server is running
    Status {
        /// Server base URL
        #[arg(long, default_value = "http://localhost:3000")]
        url: String,
    },

    /// List available presets
    Presets,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("obfusq=info".parse()?)
                .add_directive("obfusq_core=info".parse()?)
                .add_directive("obfusq_server=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            obfuscator,
        } => {
            let mut config = load_config(cli.config.as_deref(), &obfuscator)?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            cmd_serve(config).await?;
        }
        Commands::Obfuscate {
            input,
            preset,
            preset_config,
            out,
            obfuscator,
        } => {
            let config = load_config(cli.config.as_deref(), &obfuscator)?;
            let selection = match (preset, preset_config) {
                (_, Some(path)) => PresetSelection::ConfigFile(path),
                (Some(preset), None) => PresetSelection::Named(preset),
                (None, None) => config.obfuscator.default_selection(),
            };
            cmd_obfuscate(&config, &input, selection, out.as_deref()).await?;
        }
        Commands::Status { url } => {
            cmd_status(&url).await?;
        }
        Commands::Presets => {
            let config = load_config(cli.config.as_deref(), &ObfuscatorArgs::default())?;
            cmd_presets(&config);
        }
    }

    Ok(())
}

/// Load config file, then environment, then command-line overrides
fn load_config(path: Option<&Path>, args: &ObfuscatorArgs) -> Result<ObfusqConfig> {
    let mut config = match path {
        Some(path) => ObfusqConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            ObfusqConfig::find_and_load(&cwd).context("Failed to load obfusq.toml")?
        }
    };

    config
        .apply_env()
        .context("Invalid environment override")?;

    if let Some(executable) = &args.obfuscator {
        config.obfuscator.executable = executable.clone();
    }
    if let Some(script) = &args.script {
        config.obfuscator.leading_args = vec![script.clone()];
    }
    if let Some(timeout) = args.timeout {
        config.obfuscator.timeout_secs = timeout;
    }

    Ok(config)
}

/// Start the web server
async fn cmd_serve(config: ObfusqConfig) -> Result<()> {
    println!(
        "Starting ObfusQ server on http://{}:{}...",
        config.server.host, config.server.port
    );
    println!(
        "Obfuscator: {} {}",
        config.obfuscator.executable.display(),
        config.obfuscator.leading_args.join(" ")
    );
    println!("Stop with Ctrl-C");

    let state = AppState::from_config(&config);
    run_server(ServerConfig::from(&config.server), state).await
}

/// Obfuscate one file
async fn cmd_obfuscate(
    config: &ObfusqConfig,
    input: &Path,
    selection: PresetSelection,
    out: Option<&Path>,
) -> Result<()> {
    let source = tokio::fs::read_to_string(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;

    tracing::info!("Obfuscating {} with {}", input.display(), selection);

    let pipeline = config.build_pipeline();
    let output = pipeline
        .run(ObfuscationRequest::new(source, selection))
        .await
        .with_context(|| format!("Failed to obfuscate {}", input.display()))?;

    for line in output.log.lines() {
        tracing::info!("obfuscator: {}", line);
    }

    match out {
        Some(path) => {
            tokio::fs::write(path, &output.obfuscated)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {} bytes to {}", output.obfuscated.len(), path.display());
        }
        None => print!("{}", output.obfuscated),
    }

    Ok(())
}

/// Show server status
async fn cmd_status(url: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let base = url.trim_end_matches('/');

    match client.get(format!("{}/health", base)).send().await {
        Ok(response) => {
            let health: serde_json::Value = response
                .json()
                .await
                .context("Server returned an invalid health response")?;
            println!("Server status: {}", serde_json::to_string_pretty(&health)?);
        }
        Err(_) => {
            println!("Server is not running at {}.", base);
            println!("Start it with: obfusq serve");
        }
    }

    Ok(())
}

/// List presets, marking the configured default
fn cmd_presets(config: &ObfusqConfig) {
    let default = config.obfuscator.default_selection();
    for preset in Preset::ALL {
        let marker = if default == PresetSelection::Named(preset) {
            " (default)"
        } else {
            ""
        };
        println!("{}{}", preset, marker);
    }
    if let PresetSelection::ConfigFile(path) = default {
        println!("\nDefault: config file {}", path.display());
    }
}
