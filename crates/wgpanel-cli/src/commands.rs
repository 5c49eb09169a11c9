//! Subcommand bodies. Each writes its human or JSON output to `out` so the
//! binary can hand them stdout and tests can hand them a buffer.

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use wgpanel_core::encode::{self, EncodeError};
use wgpanel_core::export::{self, ExportError, ExportField, RenderedExport};
use wgpanel_core::registry::{self, RegistryError};
use wgpanel_core::store::{ConfigStore, Regenerate, StoreError};
use wgpanel_core::{Document, Encoder, KeyPairProvider};

use crate::settings::{Settings, SettingsError};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("no configuration at {0}, run `wgpanel generate` first")]
    NotGenerated(String),

    #[error("no peer named {0}")]
    UnknownPeer(String),

    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Serialize)]
struct PeerListing<'a> {
    name: &'a str,
    public_key: &'a str,
    allowed_ips: Option<String>,
}

#[derive(Debug, Serialize)]
struct ExportListing<'a> {
    peer_config: &'a str,
    qr_code: String,
}

fn current(store: &ConfigStore) -> Result<std::sync::Arc<Document>> {
    store
        .snapshot()
        .ok_or_else(|| CommandError::NotGenerated(store.path().display().to_string()))
}

async fn write_png(path: Option<&Path>, rendered: &RenderedExport) -> Result<()> {
    if let Some(path) = path {
        tokio::fs::write(path, rendered.visual.png()).await?;
        info!(path = %path.display(), bytes = rendered.visual.png().len(), "wrote QR code");
    }
    Ok(())
}

/// Plain output is the export text alone so it can be fed back to
/// `reapply`; the terminal QR code is only appended on request.
fn print_export(out: &mut impl Write, rendered: &RenderedExport, json: bool, qr: bool) -> Result<()> {
    if json {
        let listing = ExportListing {
            peer_config: &rendered.text,
            qr_code: rendered.visual.to_base64(),
        };
        serde_json::to_writer_pretty(&mut *out, &listing)?;
        writeln!(out)?;
    } else {
        write!(out, "{}", rendered.text)?;
        if qr {
            writeln!(out)?;
            writeln!(out, "{}", encode::render_terminal(&rendered.text)?)?;
        }
    }
    Ok(())
}

/// Print the server document as it would be written to disk.
pub fn show(store: &ConfigStore, out: &mut impl Write) -> Result<()> {
    let doc = current(store)?;
    write!(out, "{doc}")?;
    Ok(())
}

pub async fn generate<P: KeyPairProvider + ?Sized>(
    store: &ConfigStore,
    settings: &Settings,
    provider: &P,
    force: bool,
    out: &mut impl Write,
) -> Result<()> {
    let template = settings.template()?;
    let regenerate = if force { Regenerate::Yes } else { Regenerate::No };
    let doc = store.generate(provider, &template, regenerate).await?;
    let summary = doc.interface_summary().map_err(ExportError::from)?;

    writeln!(out, "Generated {}", store.path().display())?;
    writeln!(out, "Address: {}", summary.address)?;
    writeln!(out, "ListenPort: {}", summary.listen_port)?;
    writeln!(out, "PublicKey: {}", summary.public_key)?;
    Ok(())
}

pub fn peers(store: &ConfigStore, json: bool, out: &mut impl Write) -> Result<()> {
    let doc = current(store)?;
    let listed = registry::list_peers(&doc);

    if json {
        let listing: Vec<_> = listed
            .iter()
            .map(|(name, peer)| PeerListing {
                name,
                public_key: &peer.public_key,
                allowed_ips: peer.allowed_ips.map(|ip| ip.to_string()),
            })
            .collect();
        serde_json::to_writer_pretty(&mut *out, &listing)?;
        writeln!(out)?;
        return Ok(());
    }

    if listed.is_empty() {
        writeln!(out, "No peers")?;
    }
    for (name, peer) in &listed {
        let address = peer
            .allowed_ips
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(out, "{name}\t{address}\t{}", peer.public_key)?;
    }
    Ok(())
}

pub async fn add_peer<P: KeyPairProvider + ?Sized>(
    store: &ConfigStore,
    provider: &P,
    out: &mut impl Write,
) -> Result<()> {
    let peer = store.add_peer(provider).await?;
    let doc = current(store)?;
    let label = registry::list_peers(&doc)
        .into_iter()
        .find(|(_, p)| p.public_key == peer.public_key)
        .map(|(name, _)| name)
        .unwrap_or_default();

    let address = peer.allowed_ips.map(|ip| ip.to_string()).unwrap_or_default();
    writeln!(out, "Added {label} {address} {}", peer.public_key)?;
    Ok(())
}

/// Remove by public key or `PeerN` label. The label is resolved inside the
/// mutation so it refers to the document being edited.
pub async fn remove_peer(store: &ConfigStore, identity: &str, out: &mut impl Write) -> Result<()> {
    let result = store
        .mutate(|doc| {
            let public_key = registry::resolve(doc, identity)
                .map(|peer| peer.public_key.clone())
                .ok_or_else(|| RegistryError::NotFound(identity.to_string()))?;
            Ok(registry::remove_peer(doc, &public_key)?)
        })
        .await;

    let (_, peer) = match result {
        Err(StoreError::Registry(RegistryError::NotFound(_))) => {
            warn!(identity, "remove requested for unknown peer");
            return Err(CommandError::UnknownPeer(identity.to_string()));
        }
        other => other?,
    };
    writeln!(out, "Removed {}", peer.public_key)?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct ExportArgs<'a> {
    pub peer: &'a str,
    pub dns: Option<String>,
    pub endpoint: Option<String>,
    pub png: Option<&'a Path>,
    pub json: bool,
    pub qr: bool,
}

pub async fn export<E: Encoder + ?Sized>(
    store: &ConfigStore,
    settings: &Settings,
    encoder: &E,
    args: ExportArgs<'_>,
    out: &mut impl Write,
) -> Result<()> {
    let doc = current(store)?;
    let public_key = registry::resolve(&doc, args.peer)
        .map(|peer| peer.public_key.clone())
        .ok_or_else(|| CommandError::UnknownPeer(args.peer.to_string()))?;

    let overrides = settings.overrides(args.dns, args.endpoint);
    let (_, rendered) = export::build_rendered(&doc, &public_key, &overrides, encoder)?;

    write_png(args.png, &rendered).await?;
    print_export(out, &rendered, args.json, args.qr)
}

#[derive(Debug)]
pub struct ReapplyArgs<'a> {
    pub text: &'a str,
    pub field: ExportField,
    pub value: &'a str,
    pub png: Option<&'a Path>,
    pub json: bool,
    pub qr: bool,
}

/// Rewrite one field of previously exported text. The server document is
/// not consulted.
pub async fn reapply<E: Encoder + ?Sized>(
    encoder: &E,
    args: ReapplyArgs<'_>,
    out: &mut impl Write,
) -> Result<()> {
    let rendered = export::reapply_rendered(args.text, args.field, args.value, encoder)?;
    write_png(args.png, &rendered).await?;
    print_export(out, &rendered, args.json, args.qr)
}
