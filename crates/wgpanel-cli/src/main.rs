use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::info;
use wgpanel_cli::commands::{self, ExportArgs, ReapplyArgs};
use wgpanel_cli::settings;
use wgpanel_core::export::ExportField;
use wgpanel_core::{ConfigStore, QrPngEncoder, X25519Provider};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    #[cfg(distribute)]
    {
        fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }

    #[cfg(not(distribute))]
    {
        fmt()
            .pretty()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    }
}

#[derive(Debug, Parser)]
#[command(name = "wgpanel")]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "Manage a WireGuard server configuration and its peers")]
struct Args {
    /// Path to the settings file
    #[arg(
        short,
        long,
        global = true,
        env = "WGPANEL_CONFIG",
        default_value = "/etc/wgpanel/wgpanel.toml"
    )]
    config: PathBuf,

    /// Server configuration file, overriding `document` from the settings
    #[arg(short, long, global = true)]
    document: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the server configuration
    Show,

    /// Create the server configuration with a fresh key pair
    Generate {
        /// Replace an existing configuration, dropping all peers
        #[arg(long)]
        force: bool,
    },

    /// List managed peers
    Peers {
        #[arg(long)]
        json: bool,
    },

    /// Add a peer with the next free address
    AddPeer,

    /// Remove a peer by public key or label (Peer1, Peer2, ...)
    RemovePeer { peer: String },

    /// Print the client configuration for a peer
    Export {
        /// Public key or label
        peer: String,
        #[arg(long)]
        dns: Option<String>,
        #[arg(long)]
        endpoint: Option<String>,
        /// Also write the QR code as a PNG file
        #[arg(long)]
        png: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        /// Print a QR code after the text
        #[arg(long, conflicts_with = "json")]
        qr: bool,
    },

    /// Change DNS or Endpoint in exported client text
    Reapply {
        /// dns or endpoint
        field: ExportField,
        value: String,
        /// Export text to edit, stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(long)]
        png: Option<PathBuf>,
        #[arg(long)]
        json: bool,
        #[arg(long, conflicts_with = "json")]
        qr: bool,
    },
}

async fn read_input(input: Option<PathBuf>) -> std::io::Result<String> {
    match input {
        Some(path) => tokio::fs::read_to_string(path).await,
        None => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            Ok(text)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let mut settings = settings::load(&args.config).await?;
    if let Some(document) = args.document {
        settings.document = document;
    }
    info!(
        config = %args.config.display(),
        document = %settings.document.display(),
        "starting wgpanel"
    );

    let mut out = std::io::stdout().lock();
    let encoder = QrPngEncoder::default();

    let open_store = || ConfigStore::open(&settings.document);

    match args.command {
        Command::Show => commands::show(&open_store().await?, &mut out)?,
        Command::Generate { force } => {
            let store = open_store().await?;
            commands::generate(&store, &settings, &X25519Provider, force, &mut out).await?
        }
        Command::Peers { json } => commands::peers(&open_store().await?, json, &mut out)?,
        Command::AddPeer => {
            let store = open_store().await?;
            commands::add_peer(&store, &X25519Provider, &mut out).await?
        }
        Command::RemovePeer { peer } => {
            let store = open_store().await?;
            commands::remove_peer(&store, &peer, &mut out).await?
        }
        Command::Export { peer, dns, endpoint, png, json, qr } => {
            let store = open_store().await?;
            let export = ExportArgs {
                peer: &peer,
                dns,
                endpoint,
                png: png.as_deref(),
                json,
                qr,
            };
            commands::export(&store, &settings, &encoder, export, &mut out).await?
        }
        Command::Reapply { field, value, input, png, json, qr } => {
            let text = read_input(input).await?;
            let reapply = ReapplyArgs {
                text: &text,
                field,
                value: &value,
                png: png.as_deref(),
                json,
                qr,
            };
            commands::reapply(&encoder, reapply, &mut out).await?
        }
    }
    Ok(())
}
