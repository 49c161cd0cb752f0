//! CLI entry point for the mesh federation node.
//!
//! Supports identity key management, configuration files and running a
//! mesh node.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};
use mesh_federation::{
    crypto::{signing::pem_from_b64url, ServerIdentity, ServerKeyPair, DEFAULT_KEY_BITS},
    utils::{IntroducerConfig, MeshConfig, DEFAULT_CONFIG_FILE},
    App,
};
use std::path::PathBuf;
use tokio::signal;
use uuid::Uuid;

/// Mesh federation node - signed server-to-server routing for encrypted chat
#[derive(Parser)]
#[command(name = "meshd")]
#[command(about = "Federation mesh node for a multi-server encrypted chat network")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for the server identity
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and inspect the server identity
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Run the mesh node
    Run {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Introducer to join through, as URL or URL#PUBKEY_B64URL
        #[arg(short, long)]
        introducer: Vec<String>,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new server identity
    Generate {
        /// RSA modulus size
        #[arg(short, long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,
        /// Force overwrite existing keys
        #[arg(short, long)]
        force: bool,
    },
    /// Display the server public key
    Show {
        /// Output format (b64url, pem, fingerprint)
        #[arg(short, long, default_value = "b64url")]
        format: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet)?;

    let mut config = MeshConfig::load(cli.config.as_deref())?;

    if let Some(data_dir) = cli.data_dir {
        config.storage.keys_dir = data_dir.join("keys");
        config.storage.data_dir = data_dir;
    }

    config.ensure_directories()?;

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Run { port, introducer } => handle_run_command(port, introducer, config).await,
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

fn handle_key_commands(action: KeyCommands, config: &MeshConfig) -> Result<()> {
    match action {
        KeyCommands::Generate { bits, force } => {
            let keys_dir = &config.storage.keys_dir;
            if ServerIdentity::load(keys_dir)?.is_some() && !force {
                return Err(anyhow::anyhow!(
                    "Identity already exists. Use --force to overwrite."
                ));
            }

            info!("Generating a {bits}-bit RSA server identity");
            let mut identity = ServerIdentity::generate(bits)?;
            if let Some(server_id) = config.identity.server_id {
                identity.server_id = server_id;
            }
            identity.save(keys_dir)?;

            println!("✓ Identity generated successfully");
            println!("  Server ID: {}", identity.server_id);
            println!("  Fingerprint: {}", identity.keypair.fingerprint());
            println!("  Saved to: {}", keys_dir.display());
        }
        KeyCommands::Show { format } => {
            let identity = load_identity(config)?;
            let public = identity.public_b64url();

            match format.as_str() {
                "b64url" => println!("{public}"),
                "pem" => print!("{}", pem_from_b64url(public)?),
                "fingerprint" => println!("{}", identity.keypair.fingerprint()),
                _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
            }
        }
    }
    Ok(())
}

fn load_identity(config: &MeshConfig) -> Result<ServerIdentity> {
    if let Some(private) = &config.identity.private_key_b64url {
        let keypair = ServerKeyPair::from_private_b64url(private)?;
        let server_id = config.identity.server_id.unwrap_or_else(Uuid::new_v4);
        return Ok(ServerIdentity::new(server_id, keypair));
    }
    ServerIdentity::load(&config.storage.keys_dir)?
        .ok_or_else(|| anyhow::anyhow!("No identity found. Run `meshd keys generate` first."))
}

/// `URL` or `URL#PUBKEY_B64URL`
fn parse_introducer(arg: &str) -> IntroducerConfig {
    match arg.split_once('#') {
        Some((url, key)) if !key.is_empty() => IntroducerConfig {
            url: url.to_string(),
            pubkey_b64url: Some(key.to_string()),
        },
        Some((url, _)) => IntroducerConfig {
            url: url.to_string(),
            pubkey_b64url: None,
        },
        None => IntroducerConfig {
            url: arg.to_string(),
            pubkey_b64url: None,
        },
    }
}

async fn handle_run_command(
    port: Option<u16>,
    introducers: Vec<String>,
    mut config: MeshConfig,
) -> Result<()> {
    if let Some(port) = port {
        config.network.listen_port = port;
    }
    if !introducers.is_empty() {
        config.network.introducers = introducers.iter().map(|s| parse_introducer(s)).collect();
    }
    config.validate()?;

    info!("Starting mesh node...");
    info!("Listen: {}", config.network.bind_address());
    info!("Advertised URL: {}", config.network.self_url());

    let mut app = App::new(config).await?;

    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = app.run() => {
            if let Err(e) = result {
                error!("Node error: {}", e);
                return Err(e.into());
            }
        }
        () = shutdown_signal => {
            info!("Shutting down gracefully...");
        }
    }

    let stats = app.stats().await;
    info!(
        "Uptime {}s, {} linked peer(s), {} known user(s)",
        stats.uptime.num_seconds(),
        stats.linked_peers,
        stats.local_users + stats.remote_users
    );
    app.shutdown().await?;
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &MeshConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = MeshConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                MeshConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let config_str = config.to_toml_string()?;

            if let Some(section_name) = section {
                let table: toml::Table = toml::from_str(&config_str)?;
                let Some(value) = table.get(&section_name) else {
                    return Err(anyhow::anyhow!("No section named '{}'", section_name));
                };
                let mut only = toml::Table::new();
                only.insert(section_name, value.clone());
                println!("{}", toml::to_string_pretty(&only)?);
            } else {
                println!("{config_str}");
            }
        }
    }
    Ok(())
}
