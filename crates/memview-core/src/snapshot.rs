//! Registry snapshots on disk.
//!
//! A snapshot is a versioned JSON envelope around the registry's descriptors:
//!
//! ```json
//! {"version": 1, "documents": [ ... ]}
//! ```
//!
//! Writes go to a temp file first and are renamed into place.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::descriptor::DocumentDescriptor;
use crate::error::{MemviewError, MemviewResult};
use crate::registry::DocumentRegistry;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub documents: Vec<DocumentDescriptor>,
}

impl Snapshot {
    pub fn new(documents: Vec<DocumentDescriptor>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            documents,
        }
    }

    /// Descriptor flagged current, else the last one.
    pub fn current(&self) -> Option<&DocumentDescriptor> {
        self.documents
            .iter()
            .find(|d| d.is_current_doc)
            .or_else(|| self.documents.last())
    }

    pub fn find(&self, doc_id: &str) -> Option<&DocumentDescriptor> {
        self.documents.iter().find(|d| d.doc_id == doc_id)
    }
}

async fn write_atomic(path: &Path, content: &str) -> MemviewResult<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, content)
        .await
        .map_err(|e| MemviewError::Snapshot {
            message: format!("failed to write temp file: {}", e),
        })?;

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| MemviewError::Snapshot {
            message: format!("failed to rename temp file: {}", e),
        })?;

    Ok(())
}

/// Write `snapshot` to `path`, creating parent directories.
pub async fn write(path: &Path, snapshot: &Snapshot) -> MemviewResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| MemviewError::Snapshot {
                message: format!("failed to create snapshot dir: {}", e),
            })?;
    }
    let content = serde_json::to_string_pretty(snapshot)?;
    write_atomic(path, &content).await?;
    debug!(path = %path.display(), documents = snapshot.documents.len(), "snapshot written");
    Ok(())
}

/// Save every document in `registry`.
pub async fn save(
    path: &Path,
    registry: &DocumentRegistry,
    include_memory: bool,
) -> MemviewResult<()> {
    let snapshot = Snapshot::new(registry.store_all(include_memory));
    write(path, &snapshot).await?;
    info!(path = %path.display(), documents = snapshot.documents.len(), include_memory, "saved snapshot");
    Ok(())
}

/// Read and validate a snapshot.
pub async fn load(path: &Path) -> MemviewResult<Snapshot> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| MemviewError::Snapshot {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
    let snapshot: Snapshot = serde_json::from_str(&content)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(MemviewError::Snapshot {
            message: format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            ),
        });
    }
    for descriptor in &snapshot.documents {
        descriptor.validate()?;
    }
    Ok(snapshot)
}

/// Load a snapshot into `registry`. Returns the number of documents.
pub async fn restore(path: &Path, registry: &mut DocumentRegistry) -> MemviewResult<usize> {
    let snapshot = load(path).await?;
    registry.restore_all(&snapshot.documents)?;
    info!(path = %path.display(), documents = registry.len(), "restored snapshot");
    Ok(registry.len())
}
