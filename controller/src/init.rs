//! Renders the bootstrap config inside the pod, before Envoy starts.
//!
//! The config map holds the bootstrap document with the raw node and cluster templates. Each
//! string in the document is rendered on its own, so substituted values are escaped when the
//! document is written back out.

use crate::downward::{self, Values};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is not a JSON document: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid template in {}: {source}", path.display())]
    Template {
        path: PathBuf,
        source: downward::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Renders the JSON document at `input` with `values` and writes it to `output`.
pub fn render_file(input: &Path, output: &Path, values: &Values) -> Result<(), Error> {
    let source = std::fs::read_to_string(input).map_err(|source| Error::Read {
        path: input.to_path_buf(),
        source,
    })?;
    let mut doc = serde_json::from_str(&source).map_err(|source| Error::Parse {
        path: input.to_path_buf(),
        source,
    })?;
    downward::render_json(&mut doc, values).map_err(|source| Error::Template {
        path: input.to_path_buf(),
        source,
    })?;

    let rendered = serde_json::to_vec_pretty(&doc).map_err(|source| Error::Parse {
        path: output.to_path_buf(),
        source,
    })?;
    std::fs::write(output, rendered).map_err(|source| Error::Write {
        path: output.to_path_buf(),
        source,
    })?;

    tracing::debug!(input = %input.display(), output = %output.display(), "rendered config");
    Ok(())
}
