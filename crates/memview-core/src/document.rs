//! One memory view.
//!
//! A [`Document`] is a cloneable handle to a window `[start, start + max_bytes)`
//! onto a debugger's address space. It owns the [`PageCache`] for that window
//! and a sparse overlay of edits that have not been written back yet. Reads
//! merge the two: the overlay wins for display, the cache supplies the
//! committed value and the shadow used for change highlighting.
//!
//! The window itself comes from two expressions (start and size) that are only
//! evaluated while the bound session is stopped. Resolution happens lazily,
//! inside the first page fetch after the window was marked stale, and a moved
//! window replaces the cache under a new generation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::descriptor::{DocumentDescriptor, MemorySnapshot};
use crate::error::{MemviewError, MemviewResult};
use crate::page_cache::{PageCache, PageFetch};
use crate::source::MemorySource;
use crate::types::{
    bytes_per_row, parse_address, Address, ByteVal, CellFormat, DocId, DocStatus,
    DocumentSettings, Endian, MemValue, SessionEvent, SessionStatus, ROWS_PER_PAGE,
};
use crate::util::lock;

/// Outcome of [`Document::commit_edits`].
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Addresses written and dropped from the overlay.
    pub written: Vec<Address>,
    /// Addresses whose write failed. Their overlay entries are kept.
    pub failed: Vec<(Address, MemviewError)>,
}

impl CommitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Listing entry for a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub doc_id: DocId,
    pub display_name: String,
    pub session_id: String,
    pub status: DocStatus,
    pub start_address: Address,
    pub max_bytes: u64,
    pub is_modified: bool,
    pub is_current: bool,
}

/// Handle to one memory view. Clones share the same state.
#[derive(Clone)]
pub struct Document {
    core: Arc<DocumentCore>,
}

struct DocumentCore {
    id: DocId,
    source: Arc<dyn MemorySource>,
    strict: bool,
    live_generation: Arc<AtomicU64>,
    state: Mutex<DocState>,
    /// Serializes window resolution so concurrent misses resolve once.
    window_lock: tokio::sync::Mutex<()>,
}

struct DocState {
    start_address: Address,
    max_bytes: u64,
    display_name: String,
    expr: String,
    size: String,
    endian: Endian,
    format: CellFormat,
    column: u32,
    ws_folder: String,
    session_id: String,
    session_name: String,
    readonly: bool,
    status: DocStatus,
    /// Bound session has been seen stopped.
    ready: bool,
    start_address_stale: bool,
    max_bytes_stale: bool,
    overlay: BTreeMap<Address, u8>,
    client_state: serde_json::Map<String, serde_json::Value>,
    memory: Arc<PageCache>,
    window_moved: bool,
}

impl DocState {
    fn end_address(&self) -> Address {
        self.start_address.saturating_add(self.max_bytes)
    }

    fn in_range(&self, addr: Address) -> bool {
        addr >= self.start_address && addr < self.end_address()
    }

    fn row_width(&self) -> usize {
        bytes_per_row(self.format, self.column)
    }

    fn page_size(&self) -> usize {
        ROWS_PER_PAGE * self.row_width()
    }

    fn mark_stale(&mut self) {
        self.start_address_stale = true;
        self.max_bytes_stale = true;
        self.memory.mark_all_stale();
    }
}

fn is_valid_folder(folder: &str) -> bool {
    !folder.is_empty() && folder != "."
}

fn merge(val: ByteVal, pending: Option<u8>, stale: bool) -> MemValue {
    MemValue {
        current: pending.or(val.current),
        original: val.current,
        stale,
        remote_changed: val.current != val.previous,
        locally_edited: pending.is_some_and(|p| Some(p) != val.current),
        in_range: true,
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.core.state);
        f.debug_struct("Document")
            .field("id", &self.core.id)
            .field("start_address", &state.start_address)
            .field("max_bytes", &state.max_bytes)
            .field("session_id", &state.session_id)
            .field("status", &state.status)
            .field("overlay", &state.overlay.len())
            .finish()
    }
}

impl DocumentCore {
    fn next_generation(&self) -> u64 {
        self.live_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn fresh_cache(&self, base: Address, page_size: usize) -> Arc<PageCache> {
        let generation = self.next_generation();
        Arc::new(PageCache::new(
            base,
            page_size,
            generation,
            self.live_generation.clone(),
        ))
    }

    async fn resolve_window(&self) {
        let _guard = self.window_lock.lock().await;
        self.resolve_start_address_locked().await;
        self.resolve_max_bytes_locked().await;
    }

    async fn resolve_start_address_locked(&self) {
        let (session_id, expr, fallback) = {
            let state = lock(&self.state);
            if !state.start_address_stale || state.status != DocStatus::Stopped {
                return;
            }
            (
                state.session_id.clone(),
                state.expr.clone(),
                state.start_address.to_string(),
            )
        };

        match self
            .source
            .resolve_start_address(&session_id, &expr, &fallback)
            .await
        {
            Ok(text) => match parse_address(&text) {
                Some(addr) => {
                    let mut state = lock(&self.state);
                    if addr != state.start_address {
                        info!(
                            doc_id = %self.id,
                            from = format_args!("{:#x}", state.start_address),
                            to = format_args!("{:#x}", addr),
                            "start address moved"
                        );
                        state.start_address = addr;
                        state.memory = self.fresh_cache(addr, state.page_size());
                        state.window_moved = true;
                    }
                }
                None => warn!(doc_id = %self.id, %expr, value = %text, "start address is not a number"),
            },
            Err(e) => warn!(doc_id = %self.id, %expr, error = %e, "start address resolution failed"),
        }
        lock(&self.state).start_address_stale = false;
    }

    async fn resolve_max_bytes_locked(&self) {
        let (session_id, expr, fallback) = {
            let state = lock(&self.state);
            if !state.max_bytes_stale || state.status != DocStatus::Stopped {
                return;
            }
            (
                state.session_id.clone(),
                state.size.clone(),
                state.max_bytes.to_string(),
            )
        };

        match self.source.resolve_size(&session_id, &expr, &fallback).await {
            Ok(text) => match parse_address(&text) {
                Some(size) => {
                    let mut state = lock(&self.state);
                    if size != state.max_bytes {
                        info!(doc_id = %self.id, from = state.max_bytes, to = size, "window size changed");
                        state.max_bytes = size;
                        let base = state.start_address;
                        state.memory = self.fresh_cache(base, state.page_size());
                        state.window_moved = true;
                    }
                }
                None => warn!(doc_id = %self.id, %expr, value = %text, "size is not a number"),
            },
            Err(e) => warn!(doc_id = %self.id, %expr, error = %e, "size resolution failed"),
        }
        lock(&self.state).max_bytes_stale = false;
    }

    /// Read one page from the source, clamped to the window.
    async fn fetch_page(&self, addr: Address, count: usize) -> Vec<u8> {
        self.resolve_window().await;

        let (end, session_id) = {
            let state = lock(&self.state);
            (state.end_address(), state.session_id.clone())
        };
        let count = (count as u64).min(end.saturating_sub(addr)) as usize;
        if count == 0 {
            return Vec::new();
        }

        match self.source.read_memory(&session_id, addr, count).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let e = MemviewError::FetchFailed {
                    addr,
                    message: e.to_string(),
                };
                warn!(doc_id = %self.id, provider = self.source.provider_name(), error = %e, "page fetch failed");
                Vec::new()
            }
        }
    }
}

impl Document {
    /// Build a document from its transfer form.
    ///
    /// Persisted pages are restored stale, and only when they were captured at
    /// the descriptor's start address.
    pub fn from_descriptor(
        descriptor: &DocumentDescriptor,
        source: Arc<dyn MemorySource>,
        strict: bool,
    ) -> MemviewResult<Self> {
        descriptor.validate()?;
        let start_address = descriptor.start_address_value()?;
        let max_bytes = descriptor.max_bytes_value()?;
        let overlay = descriptor.modified_entries()?;

        let live_generation = Arc::new(AtomicU64::new(1));
        let page_size = ROWS_PER_PAGE * bytes_per_row(descriptor.format, descriptor.column);
        let memory = match restorable_pages(descriptor, start_address) {
            Some(pages) => PageCache::restore(
                start_address,
                page_size,
                1,
                live_generation.clone(),
                pages,
            ),
            None => PageCache::new(start_address, page_size, 1, live_generation.clone()),
        };

        debug!(doc_id = %descriptor.doc_id, start = format_args!("{:#x}", start_address), max_bytes, "document created");
        Ok(Self {
            core: Arc::new(DocumentCore {
                id: descriptor.doc_id.clone(),
                source,
                strict,
                live_generation,
                state: Mutex::new(DocState {
                    start_address,
                    max_bytes,
                    display_name: descriptor.display_name.clone(),
                    expr: descriptor.expr.clone(),
                    size: descriptor.size.clone(),
                    endian: descriptor.endian,
                    format: descriptor.format,
                    column: descriptor.column,
                    ws_folder: descriptor.ws_folder.clone(),
                    session_id: descriptor.session_id.clone(),
                    session_name: descriptor.session_name.clone(),
                    readonly: descriptor.is_read_only,
                    status: DocStatus::Default,
                    ready: false,
                    start_address_stale: descriptor.base_address_stale,
                    max_bytes_stale: descriptor.max_bytes_stale,
                    overlay,
                    client_state: descriptor.client_state.clone(),
                    memory: Arc::new(memory),
                    window_moved: false,
                }),
                window_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Transfer form of this document.
    pub fn to_descriptor(&self, is_current: bool, include_memory: bool) -> DocumentDescriptor {
        let state = lock(&self.core.state);
        DocumentDescriptor {
            doc_id: self.core.id.clone(),
            session_id: state.session_id.clone(),
            session_name: state.session_name.clone(),
            display_name: state.display_name.clone(),
            expr: state.expr.clone(),
            size: state.size.clone(),
            endian: state.endian,
            format: state.format,
            column: state.column,
            ws_folder: state.ws_folder.clone(),
            start_address: state.start_address.to_string(),
            max_bytes: state.max_bytes.to_string(),
            base_address_stale: state.start_address_stale,
            max_bytes_stale: state.max_bytes_stale,
            is_current_doc: is_current,
            modified_map: state
                .overlay
                .iter()
                .map(|(addr, value)| (addr.to_string(), *value))
                .collect(),
            client_state: state.client_state.clone(),
            is_read_only: state.readonly,
            memory: include_memory.then(|| MemorySnapshot {
                base_address: state.memory.base().to_string(),
                pages: state.memory.snapshot(),
            }),
        }
    }

    /// Apply a descriptor for this document's id.
    ///
    /// A moved start address or a new page size starts a fresh cache; a stale
    /// window only marks the existing one stale. The overlay is replaced.
    pub fn update_from_descriptor(&self, descriptor: &DocumentDescriptor) -> MemviewResult<()> {
        descriptor.validate()?;
        let start_address = descriptor.start_address_value()?;
        let max_bytes = descriptor.max_bytes_value()?;
        let overlay = descriptor.modified_entries()?;

        let mut state = lock(&self.core.state);
        let old_start = state.start_address;
        let old_max = state.max_bytes;
        let old_page_size = state.page_size();

        state.start_address = start_address;
        state.max_bytes = max_bytes;
        state.display_name = descriptor.display_name.clone();
        state.expr = descriptor.expr.clone();
        state.size = descriptor.size.clone();
        state.endian = descriptor.endian;
        state.format = descriptor.format;
        state.column = descriptor.column;
        state.ws_folder = descriptor.ws_folder.clone();
        state.session_id = descriptor.session_id.clone();
        state.session_name = descriptor.session_name.clone();
        state.readonly = descriptor.is_read_only;
        state.start_address_stale = descriptor.base_address_stale;
        state.max_bytes_stale = descriptor.max_bytes_stale;
        state.client_state = descriptor.client_state.clone();
        state.overlay = overlay;

        let page_size = state.page_size();
        if let Some(pages) = restorable_pages(descriptor, start_address) {
            let generation = self.core.next_generation();
            state.memory = Arc::new(PageCache::restore(
                start_address,
                page_size,
                generation,
                self.core.live_generation.clone(),
                pages,
            ));
        } else if start_address != old_start || max_bytes != old_max || page_size != old_page_size
        {
            state.memory = self.core.fresh_cache(start_address, page_size);
        } else if state.start_address_stale || state.max_bytes_stale {
            state.memory.mark_all_stale();
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn display_name(&self) -> String {
        lock(&self.core.state).display_name.clone()
    }

    pub fn expr(&self) -> String {
        lock(&self.core.state).expr.clone()
    }

    pub fn size_expr(&self) -> String {
        lock(&self.core.state).size.clone()
    }

    pub fn session_id(&self) -> String {
        lock(&self.core.state).session_id.clone()
    }

    pub fn session_name(&self) -> String {
        lock(&self.core.state).session_name.clone()
    }

    pub fn ws_folder(&self) -> String {
        lock(&self.core.state).ws_folder.clone()
    }

    pub fn status(&self) -> DocStatus {
        lock(&self.core.state).status
    }

    /// Whether the bound session has been seen stopped since binding.
    pub fn is_ready(&self) -> bool {
        lock(&self.core.state).ready
    }

    pub fn is_readonly(&self) -> bool {
        lock(&self.core.state).readonly
    }

    /// Start address currently in use, without resolving.
    pub fn start_address(&self) -> Address {
        lock(&self.core.state).start_address
    }

    /// Window size currently in use, without resolving.
    pub fn max_bytes(&self) -> u64 {
        lock(&self.core.state).max_bytes
    }

    /// Exclusive end of the window. Saturates at `u64::MAX`.
    pub fn end_address(&self) -> Address {
        lock(&self.core.state).end_address()
    }

    pub fn in_range(&self, addr: Address) -> bool {
        lock(&self.core.state).in_range(addr)
    }

    pub fn format(&self) -> CellFormat {
        lock(&self.core.state).format
    }

    pub fn endian(&self) -> Endian {
        lock(&self.core.state).endian
    }

    pub fn columns(&self) -> u32 {
        lock(&self.core.state).column
    }

    pub fn bytes_per_row(&self) -> usize {
        lock(&self.core.state).row_width()
    }

    pub fn settings(&self) -> DocumentSettings {
        let state = lock(&self.core.state);
        DocumentSettings {
            display_name: state.display_name.clone(),
            expr: state.expr.clone(),
            size: state.size.clone(),
            endian: state.endian,
            format: state.format,
            column: state.column,
        }
    }

    /// The live page cache.
    pub fn memory(&self) -> Arc<PageCache> {
        lock(&self.core.state).memory.clone()
    }

    /// Whether the start address needs resolving.
    pub fn is_start_address_stale(&self) -> bool {
        lock(&self.core.state).start_address_stale
    }

    pub fn is_max_bytes_stale(&self) -> bool {
        lock(&self.core.state).max_bytes_stale
    }

    /// Resolve the start address if stale and stopped, and return it.
    pub async fn resolve_start_address(&self) -> Address {
        {
            let _guard = self.core.window_lock.lock().await;
            self.core.resolve_start_address_locked().await;
        }
        self.start_address()
    }

    /// Resolve the window size if stale and stopped, and return it.
    pub async fn resolve_max_bytes(&self) -> u64 {
        {
            let _guard = self.core.window_lock.lock().await;
            self.core.resolve_max_bytes_locked().await;
        }
        self.max_bytes()
    }

    fn fetcher(&self) -> impl Fn(Address, usize) -> PageFetch {
        let core = self.core.clone();
        move |addr, count| {
            let core = core.clone();
            async move { core.fetch_page(addr, count).await }.boxed()
        }
    }

    /// Byte at `addr` merged with any pending edit.
    ///
    /// Out-of-range addresses return [`MemValue::DUMMY`] without touching the
    /// cache. Until the bound session has been seen stopped, any loaded page
    /// is served as-is.
    pub async fn get_byte(&self, addr: Address) -> MemValue {
        let (memory, ready) = {
            let state = lock(&self.core.state);
            if !state.in_range(addr) {
                return MemValue::DUMMY;
            }
            (state.memory.clone(), state.ready)
        };

        let val = if !ready && memory.is_loaded(addr) {
            memory.read(addr)
        } else {
            memory.get(addr, self.fetcher()).await
        };
        let pending = lock(&self.core.state).overlay.get(&addr).copied();
        merge(val, pending, memory.is_stale(addr))
    }

    /// Best-effort row containing `addr`, from cache only.
    pub fn get_row_unsafe(&self, addr: Address) -> Vec<MemValue> {
        let state = lock(&self.core.state);
        let row_width = state.row_width();
        if !state.in_range(addr) {
            return vec![MemValue::DUMMY; row_width];
        }

        let offset = addr - state.start_address;
        let row_start = state.start_address + (offset / row_width as u64) * row_width as u64;
        let stale = state.memory.is_stale(row_start);
        let end = state.end_address();
        state
            .memory
            .get_row_sync(row_start, row_width)
            .into_iter()
            .enumerate()
            .map(|(ix, val)| {
                let byte_addr = row_start + ix as u64;
                if byte_addr >= end {
                    return MemValue::DUMMY;
                }
                MemValue {
                    in_range: val.current.is_some(),
                    ..merge(val, state.overlay.get(&byte_addr).copied(), stale)
                }
            })
            .collect()
    }

    /// Record a local edit. Returns the committed value at `addr`.
    ///
    /// Writing the committed value back removes the edit.
    pub fn set_byte_local(&self, addr: Address, value: u8) -> Option<u8> {
        let mut state = lock(&self.core.state);
        let committed = state.memory.get_sync(addr);
        if committed == Some(value) {
            state.overlay.remove(&addr);
        } else {
            state.overlay.insert(addr, value);
        }
        committed
    }

    /// Pending edit at `addr`, if any.
    pub fn pending_edit(&self, addr: Address) -> Option<u8> {
        lock(&self.core.state).overlay.get(&addr).copied()
    }

    pub fn is_modified(&self) -> bool {
        !lock(&self.core.state).overlay.is_empty()
    }

    /// Mark the window expressions and every page stale.
    pub fn mark_as_stale(&self) {
        lock(&self.core.state).mark_stale();
    }

    pub async fn refresh_if_stale(&self) {
        let memory = self.memory();
        memory.refresh_if_stale(self.fetcher()).await;
    }

    /// Load every page of the window.
    pub async fn ensure_all_pages_loaded(&self) {
        let (memory, max_bytes) = {
            let state = lock(&self.core.state);
            (state.memory.clone(), state.max_bytes)
        };
        memory.ensure_all_pages_loaded(max_bytes, self.fetcher()).await;
    }

    /// Apply user settings.
    ///
    /// A new start or size expression marks the document stale. A layout
    /// change re-pages the cache; other changes leave cached bytes alone.
    pub fn update_settings(&self, settings: &DocumentSettings) {
        let mut state = lock(&self.core.state);
        if state.expr != settings.expr || state.size != settings.size {
            state.expr = settings.expr.clone();
            state.size = settings.size.clone();
            state.mark_stale();
        }
        state.display_name = settings.display_name.clone();
        state.endian = settings.endian;
        state.format = settings.format;
        state.column = settings.column;

        let page_size = state.page_size();
        if page_size != state.memory.page_size() {
            let generation = self.core.next_generation();
            debug!(doc_id = %self.core.id, page_size, generation, "re-paging cache");
            state.memory = Arc::new(state.memory.repage(page_size, generation));
        }
    }

    /// Write every pending edit back through the source.
    pub async fn commit_edits(&self) -> MemviewResult<CommitReport> {
        let (session_id, edits) = {
            let state = lock(&self.core.state);
            if state.readonly {
                return Err(MemviewError::ReadOnly {
                    doc_id: self.core.id.clone(),
                });
            }
            (state.session_id.clone(), state.overlay.clone())
        };

        let mut report = CommitReport::default();
        for (addr, value) in edits {
            let expr = addr.to_string();
            match self
                .core
                .source
                .write_expression(&session_id, &expr, &value.to_string(), 1)
                .await
            {
                Ok(_) => {
                    let memory = {
                        let mut state = lock(&self.core.state);
                        if state.overlay.get(&addr) == Some(&value) {
                            state.overlay.remove(&addr);
                        }
                        state.memory.clone()
                    };
                    memory.set_byte(addr, value, self.core.strict)?;
                    report.written.push(addr);
                }
                Err(e) => {
                    warn!(doc_id = %self.core.id, addr = format_args!("{:#x}", addr), error = %e, "edit not written");
                    report.failed.push((
                        addr,
                        MemviewError::WriteFailed {
                            expr,
                            message: e.to_string(),
                        },
                    ));
                }
            }
        }

        info!(
            doc_id = %self.core.id,
            written = report.written.len(),
            failed = report.failed.len(),
            "edits committed"
        );
        Ok(report)
    }

    /// Assign `value` to `expr` in the bound session.
    pub async fn write_value(
        &self,
        expr: &str,
        value: &str,
        byte_count: usize,
    ) -> MemviewResult<String> {
        let session_id = {
            let state = lock(&self.core.state);
            if state.readonly {
                return Err(MemviewError::ReadOnly {
                    doc_id: self.core.id.clone(),
                });
            }
            state.session_id.clone()
        };
        self.core
            .source
            .write_expression(&session_id, expr, value, byte_count)
            .await
            .map_err(|e| MemviewError::WriteFailed {
                expr: expr.to_string(),
                message: e.to_string(),
            })
    }

    /// Search the fresh part of the cache for a hex pattern.
    ///
    /// Whitespace and a `0x` prefix are ignored. Anything that is not hex
    /// matches nothing.
    pub fn search(&self, pattern: &str) -> Vec<Address> {
        let cleaned: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();
        let cleaned = cleaned
            .strip_prefix("0x")
            .or_else(|| cleaned.strip_prefix("0X"))
            .unwrap_or(&cleaned);
        if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return Vec::new();
        }

        let (memory, format, endian) = {
            let state = lock(&self.core.state);
            (state.memory.clone(), state.format, state.endian)
        };
        memory.search_visual(cleaned, format.bytes_per_cell(), endian.is_big())
    }

    pub fn summary(&self, is_current: bool) -> DocumentSummary {
        let state = lock(&self.core.state);
        DocumentSummary {
            doc_id: self.core.id.clone(),
            display_name: state.display_name.clone(),
            session_id: state.session_id.clone(),
            status: state.status,
            start_address: state.start_address,
            max_bytes: state.max_bytes,
            is_modified: !state.overlay.is_empty(),
            is_current,
        }
    }

    pub fn client_state(&self, key: &str) -> Option<serde_json::Value> {
        lock(&self.core.state).client_state.get(key).cloned()
    }

    pub fn set_client_state(&self, key: impl Into<String>, value: serde_json::Value) {
        lock(&self.core.state)
            .client_state
            .insert(key.into(), value);
    }

    pub fn set_client_state_all(&self, state: serde_json::Map<String, serde_json::Value>) {
        lock(&self.core.state).client_state = state;
    }

    pub fn client_state_all(&self) -> serde_json::Map<String, serde_json::Value> {
        lock(&self.core.state).client_state.clone()
    }

    /// Force the debugger status, as when opening a view on a known session.
    pub(crate) fn set_status(&self, status: DocStatus) {
        let mut state = lock(&self.core.state);
        state.status = status;
        state.ready = status == DocStatus::Stopped;
    }

    /// Apply a debugger lifecycle event. Returns true if the status or the
    /// bound session changed.
    ///
    /// Events for the bound session drive the status machine. Events for other
    /// sessions may adopt this document when it looks orphaned.
    pub(crate) fn apply_session_event(&self, event: &SessionEvent) -> bool {
        let mut state = lock(&self.core.state);
        let old_status = state.status;
        let old_session = state.session_id.clone();

        if state.session_id != event.session_id {
            let name_match =
                state.session_name.is_empty() || state.session_name == event.session_name;
            let incoming_folder_valid = is_valid_folder(&event.ws_folder);
            let folder_match = !incoming_folder_valid
                || !is_valid_folder(&state.ws_folder)
                || state.ws_folder == event.ws_folder;
            let status_match = matches!(
                event.status,
                SessionStatus::Started | SessionStatus::Stopped
            );
            if !(status_match && name_match && folder_match) {
                return false;
            }

            info!(
                doc_id = %self.core.id,
                from = %state.session_id,
                to = %event.session_id,
                "session adopted document"
            );
            state.session_id = event.session_id.clone();
            state.session_name = event.session_name.clone();
            if incoming_folder_valid || state.ws_folder.is_empty() {
                state.ws_folder = event.ws_folder.clone();
            }
            state.status = DocStatus::Busy;
            state.memory.delete_history();
            state.ready = event.status == SessionStatus::Stopped;
            if event.status == SessionStatus::Stopped {
                state.mark_stale();
                state.status = DocStatus::Stopped;
            }
        } else {
            match event.status {
                SessionStatus::Initializing => {}
                SessionStatus::Stopped => {
                    state.ready = true;
                    state.mark_stale();
                    state.status = DocStatus::Stopped;
                }
                SessionStatus::Terminated => {
                    state.ready = false;
                    state.status = DocStatus::Default;
                    state.memory.delete_history();
                }
                SessionStatus::Started | SessionStatus::Running => {
                    state.ready = false;
                    state.status = DocStatus::Busy;
                }
            }
        }

        if state.status != old_status {
            debug!(doc_id = %self.core.id, from = ?old_status, to = ?state.status, "status changed");
        }
        state.status != old_status || state.session_id != old_session
    }

    /// Take the window-moved signal raised by resolution.
    pub(crate) fn take_window_moved(&self) -> bool {
        std::mem::take(&mut lock(&self.core.state).window_moved)
    }
}

fn restorable_pages(descriptor: &DocumentDescriptor, start_address: Address) -> Option<Vec<Vec<u8>>> {
    let memory = descriptor.memory.as_ref()?;
    if parse_address(&memory.base_address) != Some(start_address) {
        debug!(doc_id = %descriptor.doc_id, "dropping pages captured at another base");
        return None;
    }
    Some(memory.pages.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemviewConfig;
    use crate::source::BufferSource;
    use std::time::Duration;

    const SESSION: &str = "session-1";

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    fn create_test_descriptor(start: Address, max_bytes: u64) -> DocumentDescriptor {
        DocumentDescriptor::new_view("&buf", &MemviewConfig::default())
            .with_session(SESSION, "app", "/work")
            .with_window(start, max_bytes)
            .with_layout(CellFormat::OneByte, 16, Endian::Little)
    }

    fn create_test_document(source: &Arc<BufferSource>, start: Address, max_bytes: u64) -> Document {
        let doc =
            Document::from_descriptor(&create_test_descriptor(start, max_bytes), source.clone(), false)
                .unwrap();
        doc.apply_session_event(&SessionEvent::new(SESSION, SessionStatus::Stopped, "app", "/work"));
        doc
    }

    #[tokio::test]
    async fn test_get_byte_out_of_range_is_dummy() {
        let source = Arc::new(BufferSource::new(0x1000, image(1024)));
        let doc = create_test_document(&source, 0x1000, 512);

        assert_eq!(doc.get_byte(0xfff).await, MemValue::DUMMY);
        assert_eq!(doc.get_byte(0x1200).await, MemValue::DUMMY);
        assert_eq!(source.reads(), 0);
        assert_eq!(doc.memory().num_pages(), 0);
    }

    #[tokio::test]
    async fn test_fetch_is_clamped_to_window() {
        let source = Arc::new(BufferSource::new(0x1000, image(1024)));
        let doc = create_test_document(&source, 0x1000, 300);

        let value = doc.get_byte(0x1000 + 299).await;
        assert_eq!(value.current, Some(43));
        assert_eq!(doc.memory().page_bytes(1).unwrap().len(), 300 - 256);
    }

    #[tokio::test]
    async fn test_overlay_revert_clears_modified() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let doc = create_test_document(&source, 0x1000, 256);
        doc.get_byte(0x1010).await;

        assert_eq!(doc.set_byte_local(0x1010, 0xaa), Some(0x10));
        assert!(doc.is_modified());
        let value = doc.get_byte(0x1010).await;
        assert_eq!(value.current, Some(0xaa));
        assert_eq!(value.original, Some(0x10));
        assert!(value.locally_edited);
        assert!(!value.remote_changed);
        assert!(value.changed());

        doc.set_byte_local(0x1010, 0x10);
        assert!(!doc.is_modified());
        assert!(!doc.get_byte(0x1010).await.changed());
    }

    #[tokio::test]
    async fn test_remote_change_is_highlighted_after_stop() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let doc = create_test_document(&source, 0x1000, 256);
        doc.get_byte(0x1004).await;

        source.poke(0x1004, &[0x99]);
        doc.apply_session_event(&SessionEvent::new(SESSION, SessionStatus::Running, "app", "/work"));
        doc.apply_session_event(&SessionEvent::new(SESSION, SessionStatus::Stopped, "app", "/work"));

        let value = doc.get_byte(0x1004).await;
        assert_eq!(value.current, Some(0x99));
        assert!(value.remote_changed);
        assert!(!value.locally_edited);
        assert!(!doc.get_byte(0x1005).await.remote_changed);
    }

    #[tokio::test]
    async fn test_row_uses_overlay_per_byte() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let doc = create_test_document(&source, 0x1000, 256);
        doc.get_byte(0x1000).await;
        doc.set_byte_local(0x1013, 0xff);

        let row = doc.get_row_unsafe(0x1017);
        assert_eq!(row.len(), 16);
        assert_eq!(row[0].current, Some(0x10));
        assert_eq!(row[3].current, Some(0xff));
        assert!(row[3].locally_edited);
        assert!(!row[4].changed());
        assert!(row.iter().all(|v| v.in_range && !v.stale));
    }

    #[tokio::test]
    async fn test_row_past_window_end_is_dummy() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let doc = create_test_document(&source, 0x1000, 20);
        doc.get_byte(0x1000).await;

        let row = doc.get_row_unsafe(0x1010);
        assert_eq!(row[3].current, Some(0x13));
        assert_eq!(row[4], MemValue::DUMMY);
        assert!(doc.get_row_unsafe(0x2000).iter().all(|v| !v.in_range));
    }

    #[tokio::test]
    async fn test_start_address_resolution_replaces_cache() {
        let source = Arc::new(BufferSource::new(0x1000, image(1024)));
        let doc = create_test_document(&source, 0x1000, 256);
        doc.get_byte(0x1000).await;
        let generation = doc.memory().generation();

        source.set_start_address("0x1100");
        doc.mark_as_stale();
        assert_eq!(doc.resolve_start_address().await, 0x1100);
        assert!(doc.take_window_moved());
        assert!(!doc.take_window_moved());
        assert!(!doc.is_start_address_stale());
        assert!(doc.memory().generation() > generation);
        assert_eq!(doc.memory().num_pages(), 0);

        let value = doc.get_byte(0x1100).await;
        assert_eq!(value.current, Some(0));
    }

    #[tokio::test]
    async fn test_resolution_waits_for_stopped() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let doc = Document::from_descriptor(
            &create_test_descriptor(0x1000, 256),
            source.clone(),
            false,
        )
        .unwrap();
        source.set_start_address("0x2000");

        assert_eq!(doc.resolve_start_address().await, 0x1000);
        assert_eq!(source.resolutions(), 0);
        assert!(doc.is_start_address_stale());
    }

    #[tokio::test]
    async fn test_size_resolution_failure_keeps_window() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let doc = create_test_document(&source, 0x1000, 256);
        source.set_size("a lot");
        assert_eq!(doc.resolve_max_bytes().await, 256);
        assert!(!doc.is_max_bytes_stale());
        assert!(!doc.take_window_moved());
    }

    #[tokio::test]
    async fn test_not_ready_serves_loaded_pages_without_fetch() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let mut desc = create_test_descriptor(0x1000, 256);
        desc.memory = Some(MemorySnapshot {
            base_address: "4096".to_string(),
            pages: vec![vec![7; 256]],
        });
        let doc = Document::from_descriptor(&desc, source.clone(), false).unwrap();

        let value = doc.get_byte(0x1001).await;
        assert_eq!(value.current, Some(7));
        assert!(value.stale);
        assert_eq!(source.reads(), 0);
        assert!(!doc.is_ready());
    }

    #[tokio::test]
    async fn test_concurrent_misses_resolve_once() {
        let source = Arc::new(
            BufferSource::new(0x1000, image(1024)).with_latency(Duration::from_millis(10)),
        );
        let doc = create_test_document(&source, 0x1000, 1024);

        let gets = (0..4u64).map(|i| doc.get_byte(0x1000 + i * 256));
        futures::future::join_all(gets).await;
        assert_eq!(source.resolutions(), 1);
        assert_eq!(source.size_resolutions(), 1);
        assert_eq!(source.reads(), 4);
    }

    #[tokio::test]
    async fn test_commit_edits_writes_and_mirrors() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let doc = create_test_document(&source, 0x1000, 256);
        doc.get_byte(0x1000).await;
        doc.set_byte_local(0x1002, 0xab);
        doc.set_byte_local(0x1003, 0xcd);

        let report = doc.commit_edits().await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.written, vec![0x1002, 0x1003]);
        assert!(!doc.is_modified());
        assert_eq!(source.peek(0x1002), Some(0xab));
        assert_eq!(doc.memory().get_sync(0x1003), Some(0xcd));
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_overlay() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let doc = create_test_document(&source, 0x1000, 256);
        doc.get_byte(0x1000).await;
        doc.set_byte_local(0x1002, 0xab);
        source.set_fail_writes(true);

        let report = doc.commit_edits().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].1, MemviewError::WriteFailed { .. }));
        assert_eq!(doc.pending_edit(0x1002), Some(0xab));
        assert_eq!(doc.memory().get_sync(0x1002), Some(2));
    }

    #[tokio::test]
    async fn test_readonly_refuses_writes() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let desc = create_test_descriptor(0x1000, 256).with_read_only(true);
        let doc = Document::from_descriptor(&desc, source.clone(), false).unwrap();
        doc.set_byte_local(0x1000, 1);

        assert!(matches!(
            doc.commit_edits().await,
            Err(MemviewError::ReadOnly { .. })
        ));
        assert!(matches!(
            doc.write_value("4096", "1", 1).await,
            Err(MemviewError::ReadOnly { .. })
        ));
        assert_eq!(source.writes(), 0);
    }

    #[tokio::test]
    async fn test_search_cleans_pattern() {
        let source = Arc::new(BufferSource::new(0x1000, vec![0x12, 0x34, 0x56, 0x78]));
        let desc = create_test_descriptor(0x1000, 4).with_layout(CellFormat::FourByte, 4, Endian::Little);
        let doc = Document::from_descriptor(&desc, source.clone(), false).unwrap();
        doc.set_status(DocStatus::Stopped);
        doc.get_byte(0x1000).await;

        assert_eq!(doc.search(" 0x34 12 "), vec![0x1000]);
        assert_eq!(doc.search("7856"), vec![0x1000]);
        assert!(doc.search("1234").is_empty());
        assert!(doc.search("zz").is_empty());
        assert!(doc.search("   ").is_empty());
    }

    #[tokio::test]
    async fn test_update_settings() {
        let source = Arc::new(BufferSource::new(0x1000, image(512)));
        let doc = create_test_document(&source, 0x1000, 512);
        doc.get_byte(0x1000).await;
        assert_eq!(doc.memory().page_size(), 256);

        // Cosmetic change keeps the cache.
        let mut settings = doc.settings();
        settings.display_name = "renamed".to_string();
        settings.endian = Endian::Big;
        doc.update_settings(&settings);
        assert!(!doc.memory().is_stale(0x1000));
        assert_eq!(doc.display_name(), "renamed");

        // Layout change re-pages under a new generation.
        let generation = doc.memory().generation();
        settings.column = 8;
        doc.update_settings(&settings);
        let memory = doc.memory();
        assert_eq!(memory.page_size(), 128);
        assert!(memory.generation() > generation);
        assert_eq!(memory.get_sync(0x10ff), Some(0xff));
        assert!(!memory.is_stale(0x1080));

        // New expression marks everything stale.
        settings.expr = "&other".to_string();
        doc.update_settings(&settings);
        assert!(doc.memory().is_stale(0x1000));
        assert!(doc.is_start_address_stale());
        assert!(doc.is_max_bytes_stale());
    }

    #[tokio::test]
    async fn test_descriptor_round_trip_keeps_overlay_and_pages() {
        let source = Arc::new(BufferSource::new(0x1000, image(256)));
        let doc = create_test_document(&source, 0x1000, 256);
        doc.get_byte(0x1000).await;
        doc.set_byte_local(0x1001, 0xee);
        doc.set_client_state("scroll", serde_json::json!(42));

        let desc = doc.to_descriptor(true, true);
        assert!(desc.is_current_doc);
        assert_eq!(desc.modified_map.get("4097"), Some(&0xee));

        let restored = Document::from_descriptor(&desc, source.clone(), false).unwrap();
        assert_eq!(restored.id(), doc.id());
        assert_eq!(restored.pending_edit(0x1001), Some(0xee));
        assert_eq!(restored.client_state("scroll"), Some(serde_json::json!(42)));
        assert_eq!(restored.memory().get_sync(0x10ff), Some(0xff));
        assert!(restored.memory().is_stale(0x1000));
        assert_eq!(restored.status(), DocStatus::Default);
    }

    #[tokio::test]
    async fn test_update_from_descriptor_moves_window() {
        let source = Arc::new(BufferSource::new(0x1000, image(512)));
        let doc = create_test_document(&source, 0x1000, 512);
        doc.get_byte(0x1000).await;

        let mut desc = doc.to_descriptor(false, false);
        desc.base_address_stale = false;
        desc.max_bytes_stale = false;
        doc.update_from_descriptor(&desc).unwrap();
        assert!(!doc.memory().is_stale(0x1000));

        desc.base_address_stale = true;
        doc.update_from_descriptor(&desc).unwrap();
        assert!(doc.memory().is_stale(0x1000));
        assert!(doc.memory().is_loaded(0x1000));

        let desc = desc.with_window(0x1100, 256);
        doc.update_from_descriptor(&desc).unwrap();
        assert_eq!(doc.start_address(), 0x1100);
        assert_eq!(doc.memory().num_pages(), 0);

        let mut bad = desc.clone();
        bad.max_bytes = "lots".to_string();
        assert!(doc.update_from_descriptor(&bad).is_err());
        assert_eq!(doc.max_bytes(), 256);
    }

    #[test]
    fn test_state_machine() {
        let source = Arc::new(BufferSource::new(0x1000, image(16)));
        let doc =
            Document::from_descriptor(&create_test_descriptor(0x1000, 16), source, false).unwrap();
        let event = |status| SessionEvent::new(SESSION, status, "app", "/work");

        assert!(!doc.apply_session_event(&event(SessionStatus::Initializing)));
        assert_eq!(doc.status(), DocStatus::Default);
        assert!(doc.apply_session_event(&event(SessionStatus::Started)));
        assert_eq!(doc.status(), DocStatus::Busy);
        assert!(!doc.apply_session_event(&event(SessionStatus::Running)));
        assert!(doc.apply_session_event(&event(SessionStatus::Stopped)));
        assert_eq!(doc.status(), DocStatus::Stopped);
        assert!(doc.is_ready());
        assert!(doc.apply_session_event(&event(SessionStatus::Terminated)));
        assert_eq!(doc.status(), DocStatus::Default);
        assert!(!doc.is_ready());
    }

    #[test]
    fn test_adoption_rules() {
        let source: Arc<dyn MemorySource> = Arc::new(BufferSource::new(0x1000, image(16)));
        let desc = create_test_descriptor(0x1000, 16).with_session("old", "app", "/work");
        let doc = Document::from_descriptor(&desc, source, false).unwrap();

        // Running never adopts; name and folder must be compatible.
        assert!(!doc.apply_session_event(&SessionEvent::new("new", SessionStatus::Running, "app", "/work")));
        assert!(!doc.apply_session_event(&SessionEvent::new("new", SessionStatus::Started, "other", "/work")));
        assert!(!doc.apply_session_event(&SessionEvent::new("new", SessionStatus::Started, "app", "/elsewhere")));
        assert_eq!(doc.session_id(), "old");

        // Invalid incoming folder keeps the document's own.
        assert!(doc.apply_session_event(&SessionEvent::new("new", SessionStatus::Stopped, "app", ".")));
        assert_eq!(doc.session_id(), "new");
        assert_eq!(doc.ws_folder(), "/work");
        assert_eq!(doc.status(), DocStatus::Stopped);
        assert!(doc.is_start_address_stale());
        assert!(doc.is_ready());
    }

    #[test]
    fn test_adoption_reports_session_change_alone() {
        let source: Arc<dyn MemorySource> = Arc::new(BufferSource::new(0x1000, image(16)));
        let desc = create_test_descriptor(0x1000, 16).with_session("old", "app", "/work");
        let doc = Document::from_descriptor(&desc, source, false).unwrap();
        doc.set_status(DocStatus::Busy);

        assert!(doc.apply_session_event(&SessionEvent::new("new", SessionStatus::Started, "app", "/work")));
        assert_eq!(doc.session_id(), "new");
        assert_eq!(doc.status(), DocStatus::Busy);
    }
}
