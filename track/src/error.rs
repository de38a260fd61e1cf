use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::registry::HeapHandle;

/// Errors surfaced by the tracker.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot serialize report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot open report file {path}: {source}")]
    ReportFile { path: PathBuf, source: io::Error },

    #[error("cannot change protection of import slot at {address:#x}: {source}")]
    Protect { address: usize, source: io::Error },

    #[error("block {address:#x} freed through heap {freed:#x} but allocated from heap {owner:#x}")]
    HeapMismatch {
        address: usize,
        freed: usize,
        owner: usize,
    },

    #[error("no loaded module contains {0:#x}")]
    ModuleNotFound(usize),

    #[error("symbol engine failed: {0}")]
    SymbolEngine(String),

    #[error("a tracker is already installed")]
    AlreadyInstalled,
}

impl Error {
    pub(crate) fn heap_mismatch(address: usize, freed: HeapHandle, owner: HeapHandle) -> Self {
        Error::HeapMismatch {
            address,
            freed: freed.0,
            owner: owner.0,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
