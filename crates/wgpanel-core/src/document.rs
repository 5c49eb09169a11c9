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

//! The wg-quick style server document: one `[Interface]` section followed by
//! any number of `[Peer]` sections.
//!
//! Managed peers carry their key pair twice: once as `# PrivateKey = ...` /
//! `# PublicKey = ...` annotation lines and once as the operational lines the
//! WireGuard tooling reads. Peer sections without both annotations are kept
//! verbatim as [`RawSection`]s and never touched by registry operations.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network};
use tracing::debug;

use crate::keys::KeyPair;

pub const PRIVATE_KEY: &str = "PrivateKey";
pub const PUBLIC_KEY: &str = "PublicKey";
pub const ADDRESS: &str = "Address";
pub const LISTEN_PORT: &str = "ListenPort";
pub const ALLOWED_IPS: &str = "AllowedIPs";
pub const POST_UP: &str = "PostUp";
pub const POST_DOWN: &str = "PostDown";

const INTERFACE_HEADER: &str = "Interface";
const PEER_HEADER: &str = "Peer";

pub const DEFAULT_ADDRESS: Ipv4Addr = Ipv4Addr::new(11, 0, 0, 1);
pub const DEFAULT_PREFIX: u8 = 24;
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("line {line}: malformed line: {text}")]
    MalformedLine { line: usize, text: String },

    #[error("line {line}: unknown section [{name}]")]
    UnknownSection { line: usize, name: String },

    #[error("line {line}: field outside of any section")]
    FieldOutsideSection { line: usize },

    #[error("line {line}: more than one [Interface] section")]
    DuplicateInterface { line: usize },

    #[error("line {line}: {key} given more than once")]
    DuplicateField { line: usize, key: String },

    #[error("line {line}: invalid {key} value {value:?}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },

    #[error("line {line}: {key} does not match its annotation")]
    KeyMismatch { line: usize, key: String },

    #[error("line {line}: peer public key {public_key} already used by another peer")]
    DuplicatePeer { line: usize, public_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("document is missing {0}")]
    MissingField(&'static str),
}

// ---------------------------------------------------------------------------
// Model types
// ---------------------------------------------------------------------------

/// A line kept as-is inside a managed section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Field { key: String, value: String },
    Comment(String),
}

impl Entry {
    pub fn field(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Field {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field { key, value } => write!(f, "{key} = {value}"),
            Self::Comment(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    pub address: Option<Ipv4Network>,
    pub listen_port: Option<u16>,
    /// PostUp/PostDown and anything else, in document order.
    pub extra: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub private_key: String,
    pub public_key: String,
    /// The peer's own host address: the first IPv4 /32 of `AllowedIPs`.
    pub allowed_ips: Option<Ipv4Network>,
    /// Remaining `AllowedIPs` entries, such as routed subnets, as written.
    pub routes: Vec<String>,
    pub extra: Vec<Entry>,
}

impl PeerRecord {
    pub fn new(keys: KeyPair, allowed_ips: Ipv4Network) -> Self {
        Self {
            private_key: keys.private_key,
            public_key: keys.public_key,
            allowed_ips: Some(allowed_ips),
            routes: Vec::new(),
            extra: Vec::new(),
        }
    }
}

/// A peer section the registry does not manage, stored line for line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSection {
    header: String,
    lines: Vec<String>,
}

impl RawSection {
    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|l| {
            let l = l.trim();
            if l.starts_with('#') {
                return None;
            }
            l.split_once('=').map(|(k, v)| (k.trim(), v.trim()))
        })
    }

    pub fn public_key(&self) -> Option<&str> {
        self.fields()
            .find(|(k, _)| k.eq_ignore_ascii_case(PUBLIC_KEY))
            .map(|(_, v)| v)
    }

    /// Single-host entries of every `AllowedIPs` line.
    pub fn host_addresses(&self) -> Vec<Ipv4Addr> {
        self.fields()
            .filter(|(k, _)| k.eq_ignore_ascii_case(ALLOWED_IPS))
            .flat_map(|(_, v)| v.split(','))
            .filter_map(|ip| ip.trim().parse::<Ipv4Network>().ok())
            .filter(|net| net.prefix() == 32)
            .map(|net| net.ip())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSection {
    Managed(PeerRecord),
    Unmanaged(RawSection),
}

impl PeerSection {
    pub fn as_managed(&self) -> Option<&PeerRecord> {
        match self {
            Self::Managed(peer) => Some(peer),
            Self::Unmanaged(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub address: Ipv4Network,
    pub listen_port: u16,
    pub public_key: String,
}

impl InterfaceSummary {
    /// `address:port` with the prefix dropped.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address.ip(), self.listen_port)
    }
}

/// Parameters for a freshly generated interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceTemplate {
    pub address: Ipv4Network,
    pub listen_port: u16,
    /// WireGuard device name used by the forwarding rules.
    pub device: String,
    /// Uplink device traffic is masqueraded through.
    pub uplink: String,
}

impl Default for InterfaceTemplate {
    fn default() -> Self {
        Self {
            address: Ipv4Network::new(DEFAULT_ADDRESS, DEFAULT_PREFIX)
                .unwrap_or_else(|_| Ipv4Network::from(DEFAULT_ADDRESS)),
            listen_port: DEFAULT_LISTEN_PORT,
            device: "wg0".to_string(),
            uplink: "eth0".to_string(),
        }
    }
}

impl InterfaceTemplate {
    pub fn post_up(&self) -> String {
        format!(
            "iptables -A FORWARD -i {dev} -j ACCEPT; iptables -t nat -A POSTROUTING -o {up} -j MASQUERADE",
            dev = self.device,
            up = self.uplink,
        )
    }

    pub fn post_down(&self) -> String {
        format!(
            "iptables -D FORWARD -i {dev} -j ACCEPT; iptables -t nat -D POSTROUTING -o {up} -j MASQUERADE",
            dev = self.device,
            up = self.uplink,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub(crate) preamble: Vec<String>,
    pub(crate) interface: Option<InterfaceRecord>,
    pub(crate) peers: Vec<PeerSection>,
}

// ---------------------------------------------------------------------------
// Construction and queries
// ---------------------------------------------------------------------------

impl Document {
    pub fn generate(keys: &KeyPair) -> Self {
        Self::generate_with(&InterfaceTemplate::default(), keys)
    }

    pub fn generate_with(template: &InterfaceTemplate, keys: &KeyPair) -> Self {
        let interface = InterfaceRecord {
            private_key: Some(keys.private_key.clone()),
            public_key: Some(keys.public_key.clone()),
            address: Some(template.address),
            listen_port: Some(template.listen_port),
            extra: vec![
                Entry::field(POST_UP, template.post_up()),
                Entry::field(POST_DOWN, template.post_down()),
            ],
        };
        Self {
            preamble: Vec::new(),
            interface: Some(interface),
            peers: Vec::new(),
        }
    }

    pub fn interface(&self) -> Option<&InterfaceRecord> {
        self.interface.as_ref()
    }

    /// Every peer section in document order, managed or not.
    pub fn sections(&self) -> &[PeerSection] {
        &self.peers
    }

    pub fn managed_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter().filter_map(PeerSection::as_managed)
    }

    pub fn peer(&self, public_key: &str) -> Option<&PeerRecord> {
        self.managed_peers().find(|p| p.public_key == public_key)
    }

    pub fn interface_summary(&self) -> Result<InterfaceSummary, DocumentError> {
        let interface = self
            .interface
            .as_ref()
            .ok_or(DocumentError::MissingField("[Interface]"))?;
        Ok(InterfaceSummary {
            address: interface
                .address
                .ok_or(DocumentError::MissingField(ADDRESS))?,
            listen_port: interface
                .listen_port
                .ok_or(DocumentError::MissingField(LISTEN_PORT))?,
            public_key: interface
                .public_key
                .clone()
                .ok_or(DocumentError::MissingField(PUBLIC_KEY))?,
        })
    }

    /// Host addresses already taken by the interface or any peer section.
    pub(crate) fn used_addresses(&self) -> HashSet<Ipv4Addr> {
        let mut used: HashSet<Ipv4Addr> = self
            .interface
            .as_ref()
            .and_then(|i| i.address)
            .map(|a| a.ip())
            .into_iter()
            .collect();
        for section in &self.peers {
            match section {
                PeerSection::Managed(peer) => used.extend(peer.allowed_ips.map(|a| a.ip())),
                PeerSection::Unmanaged(raw) => used.extend(raw.host_addresses()),
            }
        }
        used
    }

    pub(crate) fn public_key_in_use(&self, public_key: &str) -> bool {
        self.peers.iter().any(|section| match section {
            PeerSection::Managed(peer) => peer.public_key == public_key,
            PeerSection::Unmanaged(raw) => raw.public_key() == Some(public_key),
        })
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

enum Line<'a> {
    Blank,
    Header(&'a str),
    Annotation { key: &'a str, value: &'a str },
    Comment(&'a str),
    Field { key: &'a str, value: &'a str },
}

struct BodyLine<'a> {
    line: usize,
    raw: &'a str,
    kind: Line<'a>,
}

enum SectionKind {
    Interface,
    Peer,
}

struct Block<'a> {
    kind: SectionKind,
    line: usize,
    header: &'a str,
    body: Vec<BodyLine<'a>>,
}

fn key_is(key: &str, name: &str) -> bool {
    key.eq_ignore_ascii_case(name)
}

fn classify(raw: &str, line: usize) -> Result<Line<'_>, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Line::Blank);
    }

    if let Some(rest) = trimmed.strip_prefix('#') {
        if let Some((key, value)) = rest.split_once('=') {
            let (key, value) = (key.trim(), value.trim());
            if !value.is_empty() && (key_is(key, PRIVATE_KEY) || key_is(key, PUBLIC_KEY)) {
                return Ok(Line::Annotation { key, value });
            }
        }
        return Ok(Line::Comment(trimmed));
    }

    if trimmed.starts_with('[') {
        return trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .map(|name| Line::Header(name.trim()))
            .ok_or_else(|| ParseError::MalformedLine {
                line,
                text: trimmed.to_string(),
            });
    }

    match trimmed.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok(Line::Field {
            key: key.trim(),
            value: value.trim(),
        }),
        _ => Err(ParseError::MalformedLine {
            line,
            text: trimmed.to_string(),
        }),
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, line: usize, key: &str) -> Result<(), ParseError> {
    if slot.is_some() {
        return Err(ParseError::DuplicateField {
            line,
            key: key.to_string(),
        });
    }
    *slot = Some(value);
    Ok(())
}

fn parse_value<T: FromStr>(line: usize, key: &str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidValue {
        line,
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn trim_blank_edges(lines: &mut Vec<String>) {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    let leading = lines.iter().take_while(|l| l.trim().is_empty()).count();
    lines.drain(..leading);
}

fn build_interface(block: &Block<'_>) -> Result<InterfaceRecord, ParseError> {
    let mut record = InterfaceRecord::default();
    let mut annotated_private: Option<&str> = None;
    let mut operational_private: Option<(usize, &str)> = None;

    for body in &block.body {
        let line = body.line;
        match body.kind {
            Line::Blank | Line::Header(_) => {}
            Line::Comment(text) => record.extra.push(Entry::Comment(text.to_string())),
            Line::Annotation { key, value } if key_is(key, PRIVATE_KEY) => {
                set_once(&mut annotated_private, value, line, "# PrivateKey")?;
            }
            Line::Annotation { value, .. } => {
                set_once(&mut record.public_key, value.to_string(), line, "# PublicKey")?;
            }
            Line::Field { key, value } if key_is(key, ADDRESS) => {
                set_once(&mut record.address, parse_value(line, ADDRESS, value)?, line, ADDRESS)?;
            }
            Line::Field { key, value } if key_is(key, LISTEN_PORT) => {
                let port = parse_value(line, LISTEN_PORT, value)?;
                set_once(&mut record.listen_port, port, line, LISTEN_PORT)?;
            }
            Line::Field { key, value } if key_is(key, PRIVATE_KEY) => {
                set_once(&mut operational_private, (line, value), line, PRIVATE_KEY)?;
            }
            Line::Field { key, value } => record.extra.push(Entry::field(key, value)),
        }
    }

    record.private_key = match (annotated_private, operational_private) {
        (Some(annotated), Some((line, operational))) if annotated != operational => {
            return Err(ParseError::KeyMismatch {
                line,
                key: PRIVATE_KEY.to_string(),
            });
        }
        (Some(key), _) | (None, Some((_, key))) => Some(key.to_string()),
        (None, None) => None,
    };

    Ok(record)
}

/// Split `AllowedIPs` into the host address and the other entries. Every
/// entry must still be a valid network.
fn split_allowed_ips(
    line: usize,
    value: &str,
) -> Result<(Option<Ipv4Network>, Vec<String>), ParseError> {
    let mut host = None;
    let mut routes = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match parse_value::<IpNetwork>(line, ALLOWED_IPS, entry)? {
            IpNetwork::V4(net) if host.is_none() && net.prefix() == 32 => host = Some(net),
            _ => routes.push(entry.to_string()),
        }
    }
    Ok((host, routes))
}

fn is_managed(block: &Block<'_>) -> bool {
    let mut private = false;
    let mut public = false;
    for body in &block.body {
        if let Line::Annotation { key, .. } = body.kind {
            if key_is(key, PRIVATE_KEY) {
                private = true;
            } else {
                public = true;
            }
        }
    }
    private && public
}

fn build_peer(block: &Block<'_>) -> Result<PeerSection, ParseError> {
    if !is_managed(block) {
        let mut lines: Vec<String> = block.body.iter().map(|b| b.raw.trim_end().to_string()).collect();
        trim_blank_edges(&mut lines);
        debug!(line = block.line, "keeping unmanaged peer section verbatim");
        return Ok(PeerSection::Unmanaged(RawSection {
            header: block.header.to_string(),
            lines,
        }));
    }

    let mut private_key: Option<&str> = None;
    let mut public_key: Option<&str> = None;
    let mut operational_public: Option<(usize, &str)> = None;
    let mut allowed_line: Option<(usize, &str)> = None;
    let mut extra = Vec::new();

    for body in &block.body {
        let line = body.line;
        match body.kind {
            Line::Blank | Line::Header(_) => {}
            Line::Comment(text) => extra.push(Entry::Comment(text.to_string())),
            Line::Annotation { key, value } if key_is(key, PRIVATE_KEY) => {
                set_once(&mut private_key, value, line, "# PrivateKey")?;
            }
            Line::Annotation { value, .. } => {
                set_once(&mut public_key, value, line, "# PublicKey")?;
            }
            Line::Field { key, value } if key_is(key, PUBLIC_KEY) => {
                set_once(&mut operational_public, (line, value), line, PUBLIC_KEY)?;
            }
            Line::Field { key, value } if key_is(key, ALLOWED_IPS) => {
                set_once(&mut allowed_line, (line, value), line, ALLOWED_IPS)?;
            }
            Line::Field { key, value } => extra.push(Entry::field(key, value)),
        }
    }

    // is_managed guarantees both annotations are present.
    let (Some(private_key), Some(public_key)) = (private_key, public_key) else {
        return Err(ParseError::MalformedLine {
            line: block.line,
            text: block.header.to_string(),
        });
    };

    if let Some((line, operational)) = operational_public {
        if operational != public_key {
            return Err(ParseError::KeyMismatch {
                line,
                key: PUBLIC_KEY.to_string(),
            });
        }
    }

    let (allowed_ips, routes) = match allowed_line {
        Some((line, value)) => split_allowed_ips(line, value)?,
        None => (None, Vec::new()),
    };

    Ok(PeerSection::Managed(PeerRecord {
        private_key: private_key.to_string(),
        public_key: public_key.to_string(),
        allowed_ips,
        routes,
        extra,
    }))
}

impl Document {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut preamble = Vec::new();
        let mut blocks: Vec<Block<'_>> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            match classify(raw, line)? {
                Line::Header(name) => {
                    let kind = if key_is(name, INTERFACE_HEADER) {
                        SectionKind::Interface
                    } else if key_is(name, PEER_HEADER) {
                        SectionKind::Peer
                    } else {
                        return Err(ParseError::UnknownSection {
                            line,
                            name: name.to_string(),
                        });
                    };
                    blocks.push(Block {
                        kind,
                        line,
                        header: raw.trim(),
                        body: Vec::new(),
                    });
                }
                kind => match blocks.last_mut() {
                    Some(block) => block.body.push(BodyLine { line, raw, kind }),
                    None if matches!(kind, Line::Field { .. }) => {
                        return Err(ParseError::FieldOutsideSection { line });
                    }
                    None => preamble.push(raw.trim_end().to_string()),
                },
            }
        }
        trim_blank_edges(&mut preamble);

        let mut doc = Document {
            preamble,
            ..Document::default()
        };
        let mut seen = HashSet::new();

        for block in &blocks {
            match block.kind {
                SectionKind::Interface => {
                    if doc.interface.is_some() {
                        return Err(ParseError::DuplicateInterface { line: block.line });
                    }
                    doc.interface = Some(build_interface(block)?);
                }
                SectionKind::Peer => {
                    let section = build_peer(block)?;
                    if let PeerSection::Managed(peer) = &section {
                        if !seen.insert(peer.public_key.clone()) {
                            return Err(ParseError::DuplicatePeer {
                                line: block.line,
                                public_key: peer.public_key.clone(),
                            });
                        }
                    }
                    doc.peers.push(section);
                }
            }
        }

        debug!(
            has_interface = doc.interface.is_some(),
            managed = doc.managed_peers().count(),
            sections = doc.peers.len(),
            "parsed document"
        );
        Ok(doc)
    }
}

impl FromStr for Document {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

impl fmt::Display for InterfaceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{INTERFACE_HEADER}]")?;
        if let Some(key) = &self.private_key {
            writeln!(f, "# {PRIVATE_KEY} = {key}")?;
        }
        if let Some(key) = &self.public_key {
            writeln!(f, "# {PUBLIC_KEY} = {key}")?;
        }
        if let Some(address) = &self.address {
            writeln!(f, "{ADDRESS} = {address}")?;
        }
        for entry in &self.extra {
            writeln!(f, "{entry}")?;
        }
        if let Some(key) = &self.private_key {
            writeln!(f, "{PRIVATE_KEY} = {key}")?;
        }
        if let Some(port) = self.listen_port {
            writeln!(f, "{LISTEN_PORT} = {port}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{PEER_HEADER}]")?;
        writeln!(f, "# {PRIVATE_KEY} = {}", self.private_key)?;
        writeln!(f, "# {PUBLIC_KEY} = {}", self.public_key)?;
        writeln!(f, "{PUBLIC_KEY} = {}", self.public_key)?;
        let allowed: Vec<String> = self
            .allowed_ips
            .iter()
            .map(ToString::to_string)
            .chain(self.routes.iter().cloned())
            .collect();
        if !allowed.is_empty() {
            writeln!(f, "{ALLOWED_IPS} = {}", allowed.join(", "))?;
        }
        for entry in &self.extra {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

impl fmt::Display for RawSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header)?;
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PeerSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Managed(peer) => peer.fmt(f),
            Self::Unmanaged(raw) => raw.fmt(f),
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.preamble {
            writeln!(f, "{line}")?;
        }
        // The preamble sits directly above the first section.
        let mut wrote = false;
        if let Some(interface) = &self.interface {
            interface.fmt(f)?;
            wrote = true;
        }
        for section in &self.peers {
            if wrote {
                writeln!(f)?;
            }
            section.fmt(f)?;
            wrote = true;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
