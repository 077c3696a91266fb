//! Paged, staleness-aware memory cache for debugger memory views.
//!
//! This crate provides:
//!
//! - A page cache per view with stale tracking, change shadows and fetch coalescing
//! - Documents that merge cached bytes with a sparse overlay of pending edits
//! - A registry that tracks the current view and follows debugger session lifecycle
//! - Transfer descriptors and versioned snapshot files
//! - Binary and hex-listing export
//!
//! Remote access goes through the [`MemorySource`] trait; the debug-adapter
//! transport is not part of this crate.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use memview_core::{
//!     BufferSource, DocStatus, DocumentDescriptor, DocumentRegistry, MemviewConfig,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let source = Arc::new(BufferSource::new(0x1000, vec![0u8; 4096]));
//! let config = MemviewConfig::from_env();
//! let mut registry = DocumentRegistry::new(source, config.clone());
//!
//! let descriptor = DocumentDescriptor::new_view("&buffer", &config)
//!     .with_session("session-1", "app", "/work")
//!     .with_window(0x1000, 4096);
//! let doc = registry.open(&descriptor, DocStatus::Stopped, true)?;
//!
//! let value = doc.get_byte(0x1010).await;
//! println!("{:?} changed={}", value.current, value.changed());
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `MEMVIEW_DEFAULT_SIZE_EXPR` | Size expression for new views (default: `4 * 1024 * 1024`) |
//! | `MEMVIEW_DEFAULT_MAX_BYTES` | Window size before the size expression resolves (default: 4194304) |
//! | `MEMVIEW_DEFAULT_FORMAT` | Cell format, `1-byte` to `8-byte` (default: `4-byte`) |
//! | `MEMVIEW_DEFAULT_COLUMNS` | Columns per row (default: 4) |
//! | `MEMVIEW_STRICT` | Report writes into unloaded pages as errors |

pub mod config;
pub mod descriptor;
pub mod document;
pub mod error;
pub mod export;
pub mod page_cache;
pub mod registry;
pub mod snapshot;
pub mod source;
pub mod types;
mod util;

// Re-export main types
pub use config::MemviewConfig;
pub use descriptor::{DocumentDescriptor, MemorySnapshot};
pub use document::{CommitReport, Document, DocumentSummary};
pub use error::{MemviewError, MemviewResult};
pub use export::{dump_binary, dump_text, render_cell};
pub use page_cache::{PageCache, PageFetch};
pub use registry::{DocumentRegistry, EventKind, RegistryEvent};
pub use snapshot::{Snapshot, SNAPSHOT_VERSION};
pub use source::{BufferSource, DetachedSource, MemorySource, SourceError, SourceResult};
pub use types::{
    bytes_per_row, hex_addr, parse_address, Address, ByteVal, CellFormat, DocId, DocStatus,
    DocumentSettings, Endian, MemValue, SessionEvent, SessionStatus, ROWS_PER_PAGE, UNKNOWN_ID,
};
