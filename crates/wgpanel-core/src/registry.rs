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

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tracing::{debug, info, warn};

use crate::document::{ADDRESS, Document, DocumentError, PeerRecord, PeerSection};
use crate::keys::KeyPair;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no managed peer with public key {0}")]
    NotFound(String),

    #[error("no free host address left in {0}")]
    SubnetExhausted(Ipv4Network),

    #[error("public key {0} is already used by another peer")]
    DuplicatePeer(String),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

type Result<T> = std::result::Result<T, RegistryError>;

const LABEL_PREFIX: &str = "Peer";

fn interface_subnet(doc: &Document) -> Result<Ipv4Network> {
    let interface = doc
        .interface()
        .ok_or(DocumentError::MissingField("[Interface]"))?;
    Ok(interface.address.ok_or(DocumentError::MissingField(ADDRESS))?)
}

/// Next host address for a new peer.
///
/// Starts at host `managed peer count + 2` of the interface subnet (`.1` is
/// the interface) and moves forward past addresses any section already holds.
pub fn next_address(doc: &Document) -> Result<Ipv4Addr> {
    let subnet = interface_subnet(doc)?;
    let used = doc.used_addresses();

    let base = u32::from(subnet.network());
    let last_usable = u32::from(subnet.broadcast()).saturating_sub(1);
    let count = doc.managed_peers().count() as u32;

    let mut candidate = base.saturating_add(count).saturating_add(2);
    while candidate <= last_usable {
        let addr = Ipv4Addr::from(candidate);
        if !used.contains(&addr) {
            return Ok(addr);
        }
        debug!(%addr, "address taken, trying next");
        candidate += 1;
    }

    warn!(%subnet, peer_count = count, "subnet exhausted");
    Err(RegistryError::SubnetExhausted(subnet))
}

pub fn add_peer(doc: &mut Document, keys: KeyPair) -> Result<PeerRecord> {
    let address = next_address(doc)?;

    if doc.public_key_in_use(&keys.public_key) {
        warn!(public_key = %keys.public_key, "public key already registered");
        return Err(RegistryError::DuplicatePeer(keys.public_key));
    }

    let peer = PeerRecord::new(keys, Ipv4Network::from(address));
    doc.peers.push(PeerSection::Managed(peer.clone()));

    info!(
        public_key = %peer.public_key,
        %address,
        peer_count = doc.managed_peers().count(),
        "added peer"
    );
    Ok(peer)
}

/// Remove the managed peer with this public key. Unmanaged sections are never
/// matched, even when they carry the same key.
pub fn remove_peer(doc: &mut Document, public_key: &str) -> Result<PeerRecord> {
    let mut removed = None;
    let mut kept = Vec::with_capacity(doc.peers.len());

    for section in doc.peers.drain(..) {
        match section {
            PeerSection::Managed(peer) if removed.is_none() && peer.public_key == public_key => {
                removed = Some(peer);
            }
            other => kept.push(other),
        }
    }
    doc.peers = kept;

    match removed {
        Some(peer) => {
            info!(
                public_key,
                peer_count = doc.managed_peers().count(),
                "removed peer"
            );
            Ok(peer)
        }
        None => {
            warn!(public_key, "no managed peer with this public key");
            Err(RegistryError::NotFound(public_key.to_string()))
        }
    }
}

/// Label (`Peer1`, `Peer2`, ...) each managed peer by its current position.
pub fn list_peers(doc: &Document) -> Vec<(String, &PeerRecord)> {
    doc.managed_peers()
        .enumerate()
        .map(|(i, peer)| (format!("{LABEL_PREFIX}{}", i + 1), peer))
        .collect()
}

pub fn find_by_label<'a>(doc: &'a Document, label: &str) -> Option<&'a PeerRecord> {
    let position: usize = label.strip_prefix(LABEL_PREFIX)?.parse().ok()?;
    doc.managed_peers().nth(position.checked_sub(1)?)
}

/// Resolve either a positional label or a public key.
pub fn resolve<'a>(doc: &'a Document, identity: &str) -> Option<&'a PeerRecord> {
    doc.peer(identity).or_else(|| find_by_label(doc, identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn keys(n: u8) -> KeyPair {
        KeyPair::from_secret_bytes([n; 32])
    }

    fn fresh() -> Document {
        Document::generate(&keys(0))
    }

    fn allowed(peer: &PeerRecord) -> String {
        peer.allowed_ips.unwrap().to_string()
    }

    #[test]
    fn addresses_follow_peer_count() {
        let mut doc = fresh();
        for i in 1..=5u8 {
            let peer = add_peer(&mut doc, keys(i)).unwrap();
            assert_eq!(allowed(&peer), format!("11.0.0.{}/32", i + 1));
        }
    }

    #[test]
    fn remove_by_identity_keeps_order() {
        let mut doc = fresh();
        let a = add_peer(&mut doc, keys(1)).unwrap();
        let b = add_peer(&mut doc, keys(2)).unwrap();
        let c = add_peer(&mut doc, keys(3)).unwrap();

        let removed = remove_peer(&mut doc, &b.public_key).unwrap();
        assert_eq!(removed, b);

        let remaining: Vec<_> = doc.managed_peers().cloned().collect();
        assert_eq!(remaining, vec![a, c]);

        let err = remove_peer(&mut doc, &b.public_key).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(k) if k == b.public_key));
    }

    #[test]
    fn labels_are_positional() {
        let mut doc = fresh();
        let first = add_peer(&mut doc, keys(1)).unwrap();
        let second = add_peer(&mut doc, keys(2)).unwrap();
        remove_peer(&mut doc, &first.public_key).unwrap();

        let listed = list_peers(&doc);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "Peer1");
        assert_eq!(listed[0].1, &second);
        assert_eq!(allowed(listed[0].1), "11.0.0.3/32");
    }

    #[test]
    fn allocation_skips_taken_addresses_after_removal() {
        let mut doc = fresh();
        let a = add_peer(&mut doc, keys(1)).unwrap();
        add_peer(&mut doc, keys(2)).unwrap();
        add_peer(&mut doc, keys(3)).unwrap();
        remove_peer(&mut doc, &a.public_key).unwrap();

        // two managed peers left (.3 and .4), so .4 is tried first and skipped
        let next = add_peer(&mut doc, keys(4)).unwrap();
        assert_eq!(allowed(&next), "11.0.0.5/32");
    }

    #[test]
    fn allocation_avoids_unmanaged_hosts() {
        let text = format!(
            "{}\n[Peer]\nPublicKey = aGFuZA==\nAllowedIPs = 11.0.0.2/32\n",
            fresh()
        );
        let mut doc = Document::parse(&text).unwrap();
        let peer = add_peer(&mut doc, keys(1)).unwrap();
        assert_eq!(allowed(&peer), "11.0.0.3/32");
    }

    #[test]
    fn unmanaged_sections_are_invisible_to_registry() {
        let text = format!(
            "{}\n[Peer]\nPublicKey = aGFuZA==\nAllowedIPs = 11.0.0.200/32\n",
            fresh()
        );
        let mut doc = Document::parse(&text).unwrap();
        add_peer(&mut doc, keys(1)).unwrap();

        assert_eq!(list_peers(&doc).len(), 1);
        assert!(matches!(
            remove_peer(&mut doc, "aGFuZA=="),
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(doc.sections().len(), 2);
        assert!(doc.to_string().contains("AllowedIPs = 11.0.0.200/32"));
    }

    #[test]
    fn unmanaged_public_key_cannot_be_reused() {
        let pair = keys(9);
        let text = format!(
            "{}\n[Peer]\nPublicKey = {}\nAllowedIPs = 11.0.0.50/32\n",
            fresh(),
            pair.public_key
        );
        let mut doc = Document::parse(&text).unwrap();
        assert!(matches!(
            add_peer(&mut doc, pair),
            Err(RegistryError::DuplicatePeer(_))
        ));
    }

    #[test]
    fn duplicate_key_rejected_without_change() {
        let mut doc = fresh();
        add_peer(&mut doc, keys(1)).unwrap();
        let before = doc.clone();
        assert!(matches!(
            add_peer(&mut doc, keys(1)),
            Err(RegistryError::DuplicatePeer(_))
        ));
        assert_eq!(doc, before);
    }

    #[test]
    fn slash_24_holds_253_peers() {
        let mut doc = fresh();
        for i in 0..253u32 {
            let mut secret = [0u8; 32];
            secret[1..5].copy_from_slice(&(i + 1).to_le_bytes());
            add_peer(&mut doc, KeyPair::from_secret_bytes(secret)).unwrap();
        }
        let last = doc.managed_peers().last().unwrap();
        assert_eq!(allowed(last), "11.0.0.254/32");

        let err = add_peer(&mut doc, keys(255)).unwrap_err();
        assert!(matches!(err, RegistryError::SubnetExhausted(net) if net.to_string() == "11.0.0.1/24"));
        assert_eq!(doc.managed_peers().count(), 253);
    }

    #[test]
    fn add_requires_interface() {
        let mut doc = Document::default();
        let err = add_peer(&mut doc, keys(1)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Document(DocumentError::MissingField("[Interface]"))
        ));
    }

    #[test_case("Peer1", Some(1) ; "first")]
    #[test_case("Peer2", Some(2) ; "second")]
    #[test_case("Peer3", None ; "past the end")]
    #[test_case("Peer0", None ; "zero")]
    #[test_case("peer1", None ; "wrong case")]
    #[test_case("Server1", None ; "wrong prefix")]
    fn label_lookup(label: &str, expected: Option<u8>) {
        let mut doc = fresh();
        add_peer(&mut doc, keys(1)).unwrap();
        add_peer(&mut doc, keys(2)).unwrap();
        let found = find_by_label(&doc, label).map(|p| p.public_key.clone());
        assert_eq!(found, expected.map(|n| keys(n).public_key));
    }

    #[test]
    fn resolve_accepts_key_or_label() {
        let mut doc = fresh();
        let peer = add_peer(&mut doc, keys(1)).unwrap();
        assert_eq!(resolve(&doc, &peer.public_key), Some(&peer));
        assert_eq!(resolve(&doc, "Peer1"), Some(&peer));
        assert_eq!(resolve(&doc, "nobody"), None);
    }
}
