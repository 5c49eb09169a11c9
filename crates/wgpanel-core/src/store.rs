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

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::document::{Document, InterfaceTemplate, ParseError, PeerRecord};
use crate::keys::{self, KeyError, KeyPairProvider};
use crate::registry::{self, RegistryError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] io::Error),

    #[error("failed to parse document: {0}")]
    Parse(#[from] ParseError),

    #[error("no configuration has been generated yet")]
    NotGenerated,

    #[error("configuration already exists at {0}")]
    AlreadyGenerated(PathBuf),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Provider(#[from] KeyError),
}

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regenerate {
    No,
    Yes,
}

/// Owner of the on-disk document.
///
/// Mutations run load, edit and persist under one lock and write through a
/// temporary file plus rename. Readers use [`ConfigStore::snapshot`], the
/// last document that was successfully persisted or loaded.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    snapshot: ArcSwapOption<Document>,
}

async fn read_document(path: &Path) -> Result<Option<Document>> {
    debug!(path = %path.display(), "reading document");

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(Document::parse(&contents)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "document not found");
            Ok(None)
        }
        Err(e) => Err(StoreError::Storage(e)),
    }
}

fn temp_path(path: &Path) -> io::Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })?;
    let mut temp = std::ffi::OsString::from(".");
    temp.push(name);
    temp.push(".tmp");
    Ok(path.with_file_name(temp))
}

async fn write_temp(temp: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(temp).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

async fn write_document(path: &Path, doc: &Document) -> Result<()> {
    let temp = temp_path(path)?;
    let contents = doc.to_string();

    let written = match write_temp(&temp, contents.as_bytes()).await {
        Ok(()) => tokio::fs::rename(&temp, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temp).await;
        warn!(path = %path.display(), error = %e, "failed to persist document");
        return Err(StoreError::Storage(e));
    }

    info!(
        path = %path.display(),
        peer_count = doc.managed_peers().count(),
        "saved document"
    );
    Ok(())
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            snapshot: ArcSwapOption::empty(),
        }
    }

    /// Create a store and load whatever is on disk.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(path);
        store.load().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Option<Arc<Document>> {
        self.snapshot.load_full()
    }

    /// Read the document from disk. `Ok(None)` means nothing was generated yet.
    #[tracing::instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<Option<Arc<Document>>> {
        let _guard = self.write_lock.lock().await;
        let doc = read_document(&self.path).await?.map(Arc::new);
        self.snapshot.store(doc.clone());
        Ok(doc)
    }

    #[tracing::instrument(skip(self, provider, template), fields(path = %self.path.display()))]
    pub async fn generate<P: KeyPairProvider + ?Sized>(
        &self,
        provider: &P,
        template: &InterfaceTemplate,
        regenerate: Regenerate,
    ) -> Result<Arc<Document>> {
        let keys = keys::generate_verified(provider)?;

        let _guard = self.write_lock.lock().await;
        if regenerate == Regenerate::No && tokio::fs::try_exists(&self.path).await? {
            warn!("refusing to overwrite existing configuration");
            return Err(StoreError::AlreadyGenerated(self.path.clone()));
        }

        let doc = Document::generate_with(template, &keys);
        write_document(&self.path, &doc).await?;

        let doc = Arc::new(doc);
        self.snapshot.store(Some(doc.clone()));
        info!(
            address = %template.address,
            listen_port = template.listen_port,
            public_key = %keys.public_key,
            "generated configuration"
        );
        Ok(doc)
    }

    /// Load, apply `f` and persist while holding the write lock. Nothing is
    /// written when `f` fails.
    #[tracing::instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn mutate<T, F>(&self, f: F) -> Result<(Arc<Document>, T)>
    where
        F: FnOnce(&mut Document) -> Result<T>,
    {
        let _guard = self.write_lock.lock().await;

        let Some(mut doc) = read_document(&self.path).await? else {
            warn!("mutation attempted before generation");
            return Err(StoreError::NotGenerated);
        };

        let output = f(&mut doc)?;
        write_document(&self.path, &doc).await?;

        let doc = Arc::new(doc);
        self.snapshot.store(Some(doc.clone()));
        Ok((doc, output))
    }

    pub async fn add_peer<P: KeyPairProvider + ?Sized>(&self, provider: &P) -> Result<PeerRecord> {
        let keys = keys::generate_verified(provider)?;
        let (_, peer) = self
            .mutate(|doc| Ok(registry::add_peer(doc, keys)?))
            .await?;
        Ok(peer)
    }

    pub async fn remove_peer(&self, public_key: &str) -> Result<PeerRecord> {
        let (_, peer) = self
            .mutate(|doc| Ok(registry::remove_peer(doc, public_key)?))
            .await?;
        Ok(peer)
    }
}
