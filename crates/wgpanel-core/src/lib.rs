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

//! wgpanel-core: management of a WireGuard server configuration file.
//!
//! - [`document`]: parsing and serializing the `[Interface]`/`[Peer]` file.
//! - [`registry`]: adding, removing and listing managed peers.
//! - [`store`]: the single-writer persistence boundary.
//! - [`export`]: client configurations derived from the document.
//! - [`keys`] and [`encode`]: key pair generation and QR encoding.

pub mod document;
pub mod encode;
pub mod export;
pub mod keys;
pub mod registry;
pub mod store;

pub use document::{Document, InterfaceSummary, InterfaceTemplate, PeerRecord, PeerSection};
pub use encode::{EncodedVisual, Encoder, QrPngEncoder};
pub use export::{ClientExport, ExportField, Overrides, RenderedExport};
pub use keys::{KeyPair, KeyPairProvider, X25519Provider};
pub use store::{ConfigStore, Regenerate, StoreError};
