use std::path::PathBuf;
use thiserror::Error;

use crate::models::types::{Arch, Os};

/// Typed failures that callers match on. Everything else travels as plain
/// `anyhow` context chains.
#[derive(Debug, Error)]
pub enum PiError {
    #[error("no recipe matches package '{0}'")]
    NoRecipe(String),

    #[error("ambiguous package '{id}': candidates {}", candidates.join(", "))]
    Ambiguous { id: String, candidates: Vec<String> },

    #[error("no build of {name}={version} for {os}/{arch}")]
    NoMatch {
        name: String,
        version: String,
        os: Os,
        arch: Arch,
    },

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("recipe '{recipe}' failed:\n{backtrace}")]
    RecipeEval { recipe: String, backtrace: String },

    #[error("no pi.cave.json found in {} or its ancestors", start.display())]
    NotAWorkspace { start: PathBuf },

    #[error("already inside cave '{0}'; leave it before starting another session")]
    AlreadyInCave(String),

    #[error("invalid {what}: {detail}")]
    Validation { what: String, detail: String },
}

impl PiError {
    pub fn validation(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Validation {
            what: what.into(),
            detail: detail.into(),
        }
    }
}

/// Failure kinds of the lazy JSON store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
