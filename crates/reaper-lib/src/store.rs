//! Policy/ledger document persistence
//!
//! The document is re-read at the start of every cycle so operators can edit
//! policy without restarting. Missing or empty files are created with defaults;
//! a corrupt file is left alone and the cycle runs on in-memory defaults.

use crate::models::ReaperDocument;
use crate::observability::error_chain;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid document {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize document")]
    Serialize(#[from] serde_json::Error),
}

/// How the current document was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Read from disk
    Loaded,
    /// File was missing or empty and has been written with defaults
    Created,
    /// File could not be used; running on in-memory defaults
    Fallback,
}

impl LoadOutcome {
    /// Saves are suppressed for fallback documents so a broken file stays
    /// available for the operator to repair.
    pub fn is_writable(&self) -> bool {
        !matches!(self, LoadOutcome::Fallback)
    }
}

/// JSON file holding the reaper document
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, never failing
    pub fn load(&self) -> (ReaperDocument, LoadOutcome) {
        match self.try_load() {
            Ok(Some(document)) => (document, LoadOutcome::Loaded),
            Ok(None) => {
                let document = ReaperDocument::default();
                match self.save(&document) {
                    Ok(()) => {
                        info!(path = %self.path.display(), "Created default config file");
                        (document, LoadOutcome::Created)
                    }
                    Err(e) => {
                        error!(error = %error_chain(&e), "Could not create default config file");
                        (document, LoadOutcome::Fallback)
                    }
                }
            }
            Err(e) => {
                error!(error = %error_chain(&e), "Error handling config file, using default configuration");
                (ReaperDocument::default(), LoadOutcome::Fallback)
            }
        }
    }

    /// `Ok(None)` when the file is absent or blank
    pub fn try_load(&self) -> Result<Option<ReaperDocument>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    pub fn save(&self, document: &ReaperDocument) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(document)?;
        fs::write(&self.path, content).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }
}

/// Per-cycle view of the document, threaded through every component
#[derive(Debug)]
pub struct CycleContext {
    store: ConfigStore,
    pub document: ReaperDocument,
    outcome: LoadOutcome,
}

impl CycleContext {
    /// Take a fresh snapshot from disk
    pub fn load(store: &ConfigStore) -> Self {
        let (document, outcome) = store.load();
        Self {
            store: store.clone(),
            document,
            outcome,
        }
    }

    pub fn outcome(&self) -> LoadOutcome {
        self.outcome
    }

    /// Write the document through to disk
    pub fn persist(&self) -> Result<(), StoreError> {
        if !self.outcome.is_writable() {
            warn!(
                path = %self.store.path().display(),
                "Document loaded from fallback, not persisting ledger change"
            );
            return Ok(());
        }
        self.store.save(&self.document)
    }
}
