//! Paged byte cache for one document window.
//!
//! Pages are `page_size` bytes, indexed by `slot = (addr - base) / page_size`,
//! and the page array only grows as far as the highest slot touched. Each page
//! carries a stale flag and an optional shadow of its previous content, so a
//! refresh can be diffed against what was shown before it.
//!
//! # Fetch coalescing
//!
//! Misses go through a pending-fetch map keyed by page address. The first
//! requester starts the fetch; everyone else awaits the same shared future. The
//! entry is removed inside the fetch itself once it settles, so a later miss
//! always starts a fresh one.
//!
//! # Generations
//!
//! A cache is stamped with a generation when created. The owning document
//! bumps its live generation whenever it replaces the cache, and [`PageCache::set`]
//! drops results for any generation that is no longer live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tracing::{debug, error, warn};

use crate::error::{MemviewError, MemviewResult};
use crate::types::{Address, ByteVal};
use crate::util::lock;

/// Future that reads one page. Failures resolve to an empty buffer.
pub type PageFetch = BoxFuture<'static, Vec<u8>>;

type SharedFetch = Shared<BoxFuture<'static, Arc<[u8]>>>;

#[derive(Debug, Clone, Default)]
struct Page {
    /// Empty means never loaded.
    current: Vec<u8>,
    previous: Option<Vec<u8>>,
    stale: bool,
}

impl Page {
    fn unloaded() -> Self {
        Self {
            current: Vec::new(),
            previous: None,
            stale: true,
        }
    }

    fn byte(&self, offset: usize) -> ByteVal {
        let current = self.current.get(offset).copied();
        let previous = self
            .previous
            .as_ref()
            .and_then(|p| p.get(offset).copied())
            .or(current);
        ByteVal { current, previous }
    }
}

#[derive(Default)]
struct PageState {
    pages: Vec<Page>,
    pending: HashMap<Address, SharedFetch>,
}

impl PageState {
    fn grow(&mut self, slot: usize) {
        if self.pages.len() <= slot {
            self.pages.resize_with(slot + 1, Page::unloaded);
        }
    }
}

/// Page cache for one document window.
pub struct PageCache {
    base: Address,
    page_size: usize,
    generation: u64,
    live_generation: Arc<AtomicU64>,
    state: Arc<Mutex<PageState>>,
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("PageCache")
            .field("base", &self.base)
            .field("page_size", &self.page_size)
            .field("generation", &self.generation)
            .field("pages", &state.pages.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl PageCache {
    /// Create an empty cache stamped with `generation`.
    ///
    /// `live_generation` is shared with the owner; the cache accepts pages only
    /// while it still holds `generation`.
    pub fn new(
        base: Address,
        page_size: usize,
        generation: u64,
        live_generation: Arc<AtomicU64>,
    ) -> Self {
        Self {
            base,
            page_size: page_size.max(1),
            generation,
            live_generation,
            state: Arc::new(Mutex::new(PageState::default())),
        }
    }

    /// Rebuild a cache from persisted page contents. Every page starts stale.
    pub fn restore(
        base: Address,
        page_size: usize,
        generation: u64,
        live_generation: Arc<AtomicU64>,
        pages: Vec<Vec<u8>>,
    ) -> Self {
        let cache = Self::new(base, page_size, generation, live_generation);
        lock(&cache.state).pages = pages
            .into_iter()
            .map(|current| Page {
                current,
                previous: None,
                stale: true,
            })
            .collect();
        cache
    }

    /// Re-slice this cache into pages of `page_size` under a new generation.
    ///
    /// Each new page keeps the known prefix of its bytes. A new page is stale
    /// if any old page it overlaps was stale. In-flight fetches are not carried
    /// over.
    pub fn repage(&self, page_size: usize, generation: u64) -> Self {
        let repaged = Self::new(self.base, page_size, generation, self.live_generation.clone());
        let page_size = repaged.page_size;

        let (current, previous, stale) = {
            let state = lock(&self.state);
            let extent = state.pages.len() * self.page_size;
            let mut current = Vec::with_capacity(extent);
            let mut previous = Vec::with_capacity(extent);
            let mut stale = Vec::with_capacity(extent);
            for page in &state.pages {
                for ix in 0..self.page_size {
                    let byte = page.byte(ix);
                    current.push(byte.current);
                    previous.push(byte.previous);
                    stale.push(page.stale);
                }
            }
            (current, previous, stale)
        };

        let extent = current.len();
        let pages = (0..extent.div_ceil(page_size))
            .map(|slot| {
                let start = slot * page_size;
                let end = (start + page_size).min(extent);
                let known: Vec<u8> = current[start..end].iter().map_while(|b| *b).collect();
                let shadow: Vec<u8> = (start..start + known.len())
                    .map(|ix| previous[ix].or(current[ix]).unwrap_or_default())
                    .collect();
                Page {
                    stale: known.is_empty() || stale[start..end].iter().any(|s| *s),
                    previous: (shadow != known).then_some(shadow),
                    current: known,
                }
            })
            .collect();
        lock(&repaged.state).pages = pages;
        repaged
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this cache is still the owner's current one.
    pub fn is_live(&self) -> bool {
        self.live_generation.load(Ordering::SeqCst) == self.generation
    }

    pub fn num_pages(&self) -> usize {
        lock(&self.state).pages.len()
    }

    /// Number of fetches currently in flight.
    pub fn pending_fetches(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Slot covering `addr`. Addresses below the base are rejected.
    pub fn slot(&self, addr: Address) -> MemviewResult<usize> {
        let offset = addr.checked_sub(self.base).ok_or(MemviewError::InvalidSlot {
            addr,
            base: self.base,
        })?;
        usize::try_from(offset / self.page_size as u64).map_err(|_| MemviewError::InvalidSlot {
            addr,
            base: self.base,
        })
    }

    /// Address of the first byte in `slot`.
    pub fn page_address(&self, slot: usize) -> Address {
        self.base
            .saturating_add((slot as u64).saturating_mul(self.page_size as u64))
    }

    fn locate(&self, addr: Address) -> MemviewResult<(usize, usize)> {
        let slot = self.slot(addr)?;
        let offset = (addr - self.page_address(slot)) as usize;
        Ok((slot, offset))
    }

    /// Byte pair at `addr`, fetching the covering page when it is stale or unloaded.
    ///
    /// `fetch` is only called when no fetch for that page is already in flight.
    pub async fn get<F>(&self, addr: Address, fetch: F) -> ByteVal
    where
        F: FnOnce(Address, usize) -> PageFetch,
    {
        let (slot, offset) = match self.locate(addr) {
            Ok(loc) => loc,
            Err(e) => {
                warn!(error = %e, "page cache get rejected");
                return ByteVal::UNKNOWN;
            }
        };
        let page_addr = self.page_address(slot);

        let shared = {
            let mut state = lock(&self.state);
            if let Some(page) = state.pages.get(slot) {
                if !page.stale && !page.current.is_empty() {
                    return page.byte(offset);
                }
            }
            state.grow(slot);
            match state.pending.get(&page_addr) {
                Some(inflight) => inflight.clone(),
                None => {
                    let fetch = self.start_fetch(page_addr, fetch);
                    state.pending.insert(page_addr, fetch.clone());
                    fetch
                }
            }
        };

        let bytes = shared.await;
        if self.is_stale(page_addr) && !bytes.is_empty() {
            self.set(page_addr, &bytes);
        }
        self.read(addr)
    }

    fn start_fetch<F>(&self, page_addr: Address, fetch: F) -> SharedFetch
    where
        F: FnOnce(Address, usize) -> PageFetch,
    {
        debug!(
            addr = format_args!("{:#x}", page_addr),
            generation = self.generation,
            "fetching page"
        );
        let inner = fetch(page_addr, self.page_size);
        let state = Arc::downgrade(&self.state);
        async move {
            let bytes: Arc<[u8]> = inner.await.into();
            if let Some(state) = state.upgrade() {
                lock(&state).pending.remove(&page_addr);
            }
            bytes
        }
        .boxed()
        .shared()
    }

    /// Cached byte pair, without fetching.
    pub fn read(&self, addr: Address) -> ByteVal {
        let Ok((slot, offset)) = self.locate(addr) else {
            return ByteVal::UNKNOWN;
        };
        lock(&self.state)
            .pages
            .get(slot)
            .map(|page| page.byte(offset))
            .unwrap_or(ByteVal::UNKNOWN)
    }

    /// Best-effort current byte; `None` when unloaded.
    pub fn get_sync(&self, addr: Address) -> Option<u8> {
        self.read(addr).current
    }

    /// Best-effort row of byte pairs starting at the row containing `addr`.
    pub fn get_row_sync(&self, addr: Address, row_width: usize) -> Vec<ByteVal> {
        let row_width = row_width.max(1);
        let Some(offset) = addr.checked_sub(self.base) else {
            return vec![ByteVal::UNKNOWN; row_width];
        };
        let row_start = self.base + (offset / row_width as u64) * row_width as u64;
        let Ok((slot, offset)) = self.locate(row_start) else {
            return vec![ByteVal::UNKNOWN; row_width];
        };

        let state = lock(&self.state);
        match state.pages.get(slot) {
            Some(page) => (offset..offset + row_width).map(|ix| page.byte(ix)).collect(),
            None => vec![ByteVal::UNKNOWN; row_width],
        }
    }

    /// Install a freshly fetched page. Returns false when the result was dropped.
    ///
    /// A stale page with content keeps that content as its shadow.
    pub fn set(&self, addr: Address, bytes: &[u8]) -> bool {
        if !self.is_live() {
            debug!(
                addr = format_args!("{:#x}", addr),
                generation = self.generation,
                "discarding page for replaced cache"
            );
            return false;
        }
        let slot = match self.slot(addr) {
            Ok(slot) => slot,
            Err(e) => {
                error!(error = %e, "page cache set rejected");
                return false;
            }
        };

        let mut state = lock(&self.state);
        state.grow(slot);
        let page = &mut state.pages[slot];
        if page.stale && !page.current.is_empty() {
            page.previous = Some(std::mem::take(&mut page.current));
        }
        page.current = bytes.to_vec();
        page.stale = false;
        true
    }

    /// Patch one loaded byte after a confirmed write.
    ///
    /// With `strict`, writing outside the loaded content is an error; otherwise
    /// it is ignored.
    pub fn set_byte(&self, addr: Address, value: u8, strict: bool) -> MemviewResult<()> {
        let located = self.locate(addr);
        let mut state = lock(&self.state);
        let loaded_end = self.page_address(state.pages.len());
        let loaded = located.ok().and_then(|(slot, offset)| {
            state
                .pages
                .get_mut(slot)
                .and_then(|page| page.current.get_mut(offset))
        });
        match loaded {
            Some(byte) => {
                *byte = value;
                Ok(())
            }
            None if strict => Err(MemviewError::OutOfBounds {
                addr,
                base: self.base,
                loaded_end,
            }),
            None => Ok(()),
        }
    }

    /// Whether the page covering `addr` is stale. Untouched pages are stale.
    pub fn is_stale(&self, addr: Address) -> bool {
        let Ok(slot) = self.slot(addr) else {
            return true;
        };
        lock(&self.state)
            .pages
            .get(slot)
            .map(|page| page.stale)
            .unwrap_or(true)
    }

    /// Whether the page covering `addr` holds any content, fresh or stale.
    pub fn is_loaded(&self, addr: Address) -> bool {
        let Ok(slot) = self.slot(addr) else {
            return false;
        };
        lock(&self.state)
            .pages
            .get(slot)
            .map(|page| !page.current.is_empty())
            .unwrap_or(false)
    }

    /// Flag every page stale. Content stays visible until replaced.
    pub fn mark_all_stale(&self) {
        for page in lock(&self.state).pages.iter_mut() {
            page.stale = true;
        }
    }

    /// Drop every shadow buffer.
    pub fn delete_history(&self) {
        for page in lock(&self.state).pages.iter_mut() {
            page.previous = None;
        }
    }

    /// Content of one page, fresh or stale.
    pub fn page_bytes(&self, slot: usize) -> Option<Vec<u8>> {
        lock(&self.state)
            .pages
            .get(slot)
            .map(|page| page.current.clone())
    }

    /// Content of every page, in slot order.
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        lock(&self.state)
            .pages
            .iter()
            .map(|page| page.current.clone())
            .collect()
    }

    /// Refetch every stale page that exists. Resolves once all fetches settle.
    pub async fn refresh_if_stale<F>(&self, fetch: F)
    where
        F: Fn(Address, usize) -> PageFetch,
    {
        let stale: Vec<Address> = {
            let state = lock(&self.state);
            state
                .pages
                .iter()
                .enumerate()
                .filter(|(_, page)| page.stale)
                .map(|(slot, _)| self.page_address(slot))
                .collect()
        };
        join_all(stale.into_iter().map(|addr| self.get(addr, &fetch))).await;
    }

    /// Load every page of a `total_bytes` window. Resolves once all fetches settle.
    pub async fn ensure_all_pages_loaded<F>(&self, total_bytes: u64, fetch: F)
    where
        F: Fn(Address, usize) -> PageFetch,
    {
        let num_pages = total_bytes.div_ceil(self.page_size as u64) as usize;
        if num_pages == 0 {
            return;
        }
        lock(&self.state).grow(num_pages - 1);
        let addrs: Vec<Address> = (0..num_pages).map(|slot| self.page_address(slot)).collect();
        join_all(addrs.into_iter().map(|addr| self.get(addr, &fetch))).await;
    }

    /// Find cells whose rendered hex contains `pattern` (case-insensitive).
    ///
    /// Only fresh, loaded pages are searched. Each cell is rendered on its own
    /// in display byte order, so a match never spans two cells.
    pub fn search_visual(&self, pattern: &str, cell_width: usize, big_endian: bool) -> Vec<Address> {
        let pattern = pattern.to_ascii_lowercase();
        let cell_width = cell_width.max(1);
        let state = lock(&self.state);
        let mut results = Vec::new();
        let mut cell = Vec::with_capacity(cell_width);

        for (slot, page) in state.pages.iter().enumerate() {
            if page.stale || page.current.is_empty() {
                continue;
            }
            let page_addr = self.page_address(slot);
            for (ix, chunk) in page.current.chunks_exact(cell_width).enumerate() {
                cell.clear();
                cell.extend_from_slice(chunk);
                if !big_endian {
                    cell.reverse();
                }
                if hex::encode(&cell).contains(&pattern) {
                    results.push(page_addr + (ix * cell_width) as u64);
                }
            }
        }
        results
    }
}
