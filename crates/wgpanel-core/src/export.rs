// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Client-side configuration for a single peer.
//!
//! Exports are derived on demand and never stored. DNS and Endpoint edits are
//! applied to export text handed back by the caller, not to the document.

use std::fmt;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use tracing::{debug, warn};

use crate::document::{Document, DocumentError};
use crate::encode::{EncodeError, EncodedVisual, Encoder};

pub const DEFAULT_DNS: &str = "1.1.1.1";
pub const CLIENT_ALLOWED_IPS: &str = "0.0.0.0/0";
pub const PERSISTENT_KEEPALIVE: u16 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportField {
    Dns,
    Endpoint,
}

impl ExportField {
    pub fn key(self) -> &'static str {
        match self {
            Self::Dns => "DNS",
            Self::Endpoint => "Endpoint",
        }
    }
}

impl fmt::Display for ExportField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ExportField {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        [Self::Dns, Self::Endpoint]
            .into_iter()
            .find(|field| field.key().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ExportError::UnknownField(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("no managed peer with public key {0}")]
    PeerNotFound(String),

    #[error("peer {0} has no AllowedIPs address")]
    PeerWithoutAddress(String),

    #[error("interface is incomplete: {0}")]
    IncompleteInterface(#[from] DocumentError),

    #[error("export has no {0} line")]
    FieldNotPresent(ExportField),

    #[error("unknown export field {0:?}, expected DNS or Endpoint")]
    UnknownField(String),

    #[error("invalid {field} value {value:?}")]
    InvalidValue { field: ExportField, value: String },

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

type Result<T> = std::result::Result<T, ExportError>;

/// User-editable values; `None` means the default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub dns: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ClientExport {
    pub private_key: String,
    pub address: Ipv4Network,
    pub dns: String,
    pub server_public_key: String,
    pub endpoint: String,
    pub allowed_ips: String,
    pub persistent_keepalive: u16,
}

impl fmt::Debug for ClientExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientExport")
            .field("private_key", &"<redacted>")
            .field("address", &self.address)
            .field("dns", &self.dns)
            .field("server_public_key", &self.server_public_key)
            .field("endpoint", &self.endpoint)
            .field("allowed_ips", &self.allowed_ips)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .finish()
    }
}

impl fmt::Display for ClientExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", self.private_key)?;
        writeln!(f, "Address = {}", self.address)?;
        writeln!(f, "{} = {}", ExportField::Dns, self.dns)?;
        writeln!(f)?;
        writeln!(f, "[Peer]")?;
        writeln!(f, "PublicKey = {}", self.server_public_key)?;
        writeln!(f, "{} = {}", ExportField::Endpoint, self.endpoint)?;
        writeln!(f, "AllowedIPs = {}", self.allowed_ips)?;
        writeln!(f, "PersistentKeepalive = {}", self.persistent_keepalive)?;
        Ok(())
    }
}

/// Export text together with its encoded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedExport {
    pub text: String,
    pub visual: EncodedVisual,
}

fn validate_value(field: ExportField, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || value.contains(['\n', '\r']) {
        return Err(ExportError::InvalidValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(trimmed.to_string())
}

pub fn build_export(doc: &Document, public_key: &str, overrides: &Overrides) -> Result<ClientExport> {
    let Some(peer) = doc.peer(public_key) else {
        warn!(public_key, "export requested for unknown peer");
        return Err(ExportError::PeerNotFound(public_key.to_string()));
    };
    let allowed = peer
        .allowed_ips
        .ok_or_else(|| ExportError::PeerWithoutAddress(public_key.to_string()))?;
    let summary = doc.interface_summary()?;

    let dns = match &overrides.dns {
        Some(dns) => validate_value(ExportField::Dns, dns)?,
        None => DEFAULT_DNS.to_string(),
    };
    let endpoint = match &overrides.endpoint {
        Some(endpoint) => validate_value(ExportField::Endpoint, endpoint)?,
        None => summary.endpoint(),
    };

    debug!(public_key, %dns, %endpoint, "built client export");
    Ok(ClientExport {
        private_key: peer.private_key.clone(),
        address: Ipv4Network::from(allowed.ip()),
        dns,
        server_public_key: summary.public_key,
        endpoint,
        allowed_ips: CLIENT_ALLOWED_IPS.to_string(),
        persistent_keepalive: PERSISTENT_KEEPALIVE,
    })
}

pub fn render<E: Encoder + ?Sized>(export: &ClientExport, encoder: &E) -> Result<RenderedExport> {
    let text = export.to_string();
    let visual = encoder.encode(&text)?;
    Ok(RenderedExport { text, visual })
}

/// Build an export for a peer and encode it in one go.
pub fn build_rendered<E: Encoder + ?Sized>(
    doc: &Document,
    public_key: &str,
    overrides: &Overrides,
    encoder: &E,
) -> Result<(ClientExport, RenderedExport)> {
    let export = build_export(doc, public_key, overrides)?;
    let rendered = render(&export, encoder)?;
    Ok((export, rendered))
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Replace the value of every `field = ...` line in previously rendered
/// export text. All other lines come back byte for byte.
pub fn reapply_field(text: &str, field: ExportField, value: &str) -> Result<String> {
    let value = validate_value(field, value)?;
    let mut out = String::with_capacity(text.len() + value.len());
    let mut replaced = 0usize;

    for line in text.split_inclusive('\n') {
        let (body, ending) = split_line_ending(line);
        let is_comment = body.trim_start().starts_with('#');
        match body.split_once('=') {
            Some((key, _)) if !is_comment && key.trim().eq_ignore_ascii_case(field.key()) => {
                out.push_str(key.trim_end());
                out.push_str(" = ");
                out.push_str(&value);
                out.push_str(ending);
                replaced += 1;
            }
            _ => out.push_str(line),
        }
    }

    if replaced == 0 {
        warn!(%field, "field not present in export text");
        return Err(ExportError::FieldNotPresent(field));
    }
    debug!(%field, %value, replaced, "reapplied export field");
    Ok(out)
}

pub fn reapply_rendered<E: Encoder + ?Sized>(
    text: &str,
    field: ExportField,
    value: &str,
    encoder: &E,
) -> Result<RenderedExport> {
    let text = reapply_field(text, field, value)?;
    let visual = encoder.encode(&text)?;
    Ok(RenderedExport { text, visual })
}
