//! Memory-source collaborator.
//!
//! Documents never talk to a debugger directly. Everything remote goes through
//! [`MemorySource`]: expression resolution for the window, page reads, and
//! expression writes. The debug-adapter transport lives outside this crate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{parse_address, Address};
use crate::util::lock;

/// Errors reported by a memory source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// No live session with this id, or it is not stopped.
    #[error("session not available: {session_id}")]
    SessionUnavailable { session_id: String },

    /// The debugger could not evaluate an expression.
    #[error("evaluation failed: {message}")]
    Evaluate { message: String },

    /// Transport-level failure talking to the debugger.
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for memory source calls.
pub type SourceResult<T> = Result<T, SourceError>;

/// Remote memory access for one debugger.
#[async_trait]
pub trait MemorySource: Send + Sync {
    /// Evaluate the start-address expression. `fallback` is the value in use.
    async fn resolve_start_address(
        &self,
        session_id: &str,
        expr: &str,
        fallback: &str,
    ) -> SourceResult<String>;

    /// Evaluate the size expression. `fallback` is the value in use.
    async fn resolve_size(&self, session_id: &str, expr: &str, fallback: &str)
        -> SourceResult<String>;

    /// Read up to `count` bytes at `addr`. Short reads are allowed.
    async fn read_memory(
        &self,
        session_id: &str,
        addr: Address,
        count: usize,
    ) -> SourceResult<Vec<u8>>;

    /// Assign `value` to the `byte_count`-wide object at `expr`.
    async fn write_expression(
        &self,
        session_id: &str,
        expr: &str,
        value: &str,
        byte_count: usize,
    ) -> SourceResult<String>;

    fn provider_name(&self) -> &'static str;
}

/// Source with no debugger behind it. Every call fails.
///
/// Used for offline inspection of restored snapshots.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedSource;

#[async_trait]
impl MemorySource for DetachedSource {
    async fn resolve_start_address(
        &self,
        session_id: &str,
        _expr: &str,
        _fallback: &str,
    ) -> SourceResult<String> {
        Err(SourceError::SessionUnavailable {
            session_id: session_id.to_string(),
        })
    }

    async fn resolve_size(
        &self,
        session_id: &str,
        _expr: &str,
        _fallback: &str,
    ) -> SourceResult<String> {
        Err(SourceError::SessionUnavailable {
            session_id: session_id.to_string(),
        })
    }

    async fn read_memory(
        &self,
        session_id: &str,
        _addr: Address,
        _count: usize,
    ) -> SourceResult<Vec<u8>> {
        Err(SourceError::SessionUnavailable {
            session_id: session_id.to_string(),
        })
    }

    async fn write_expression(
        &self,
        session_id: &str,
        _expr: &str,
        _value: &str,
        _byte_count: usize,
    ) -> SourceResult<String> {
        Err(SourceError::SessionUnavailable {
            session_id: session_id.to_string(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "detached"
    }
}

/// In-memory image mapped at a base address.
///
/// Stands in for a stopped debuggee: reads are served from the image, writes
/// patch it, and every call is counted so callers can assert on traffic.
#[derive(Debug)]
pub struct BufferSource {
    base: Address,
    image: Mutex<Vec<u8>>,
    start_address: Mutex<Option<String>>,
    size: Mutex<Option<String>>,
    latency: Option<Duration>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    resolutions: AtomicUsize,
    size_resolutions: AtomicUsize,
    writes: AtomicUsize,
}

impl BufferSource {
    pub fn new(base: Address, image: impl Into<Vec<u8>>) -> Self {
        Self {
            base,
            image: Mutex::new(image.into()),
            start_address: Mutex::new(None),
            size: Mutex::new(None),
            latency: None,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            resolutions: AtomicUsize::new(0),
            size_resolutions: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Delay every read, so concurrent requests overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Value the start-address expression evaluates to. Unset returns the fallback.
    pub fn set_start_address(&self, value: impl Into<String>) {
        *lock(&self.start_address) = Some(value.into());
    }

    /// Value the size expression evaluates to. Unset returns the fallback.
    pub fn set_size(&self, value: impl Into<String>) {
        *lock(&self.size) = Some(value.into());
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Patch the image directly, as if the debuggee changed it.
    pub fn poke(&self, addr: Address, bytes: &[u8]) {
        let mut image = lock(&self.image);
        let Some(start) = addr.checked_sub(self.base) else {
            return;
        };
        let start = start as usize;
        if start >= image.len() {
            return;
        }
        let end = (start + bytes.len()).min(image.len());
        image[start..end].copy_from_slice(&bytes[..end - start]);
    }

    pub fn peek(&self, addr: Address) -> Option<u8> {
        let offset = addr.checked_sub(self.base)?;
        lock(&self.image).get(offset as usize).copied()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }

    pub fn size_resolutions(&self) -> usize {
        self.size_resolutions.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MemorySource for BufferSource {
    async fn resolve_start_address(
        &self,
        _session_id: &str,
        _expr: &str,
        fallback: &str,
    ) -> SourceResult<String> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.start_address)
            .clone()
            .unwrap_or_else(|| fallback.to_string()))
    }

    async fn resolve_size(
        &self,
        _session_id: &str,
        _expr: &str,
        fallback: &str,
    ) -> SourceResult<String> {
        self.size_resolutions.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.size)
            .clone()
            .unwrap_or_else(|| fallback.to_string()))
    }

    async fn read_memory(
        &self,
        _session_id: &str,
        addr: Address,
        count: usize,
    ) -> SourceResult<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SourceError::Transport {
                message: format!("read of {} bytes at {:#x} refused", count, addr),
            });
        }

        let image = lock(&self.image);
        let start = addr.saturating_sub(self.base) as usize;
        let start = start.min(image.len());
        let end = start.saturating_add(count).min(image.len());
        Ok(image[start..end].to_vec())
    }

    async fn write_expression(
        &self,
        _session_id: &str,
        expr: &str,
        value: &str,
        byte_count: usize,
    ) -> SourceResult<String> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SourceError::Evaluate {
                message: format!("cannot assign {} to {}", value, expr),
            });
        }

        let addr = parse_address(expr).ok_or_else(|| SourceError::Evaluate {
            message: format!("not an address: {}", expr),
        })?;
        let parsed = parse_address(value).ok_or_else(|| SourceError::Evaluate {
            message: format!("not a number: {}", value),
        })?;
        let bytes = parsed.to_le_bytes();
        self.poke(addr, &bytes[..byte_count.min(bytes.len())]);
        Ok(parsed.to_string())
    }

    fn provider_name(&self) -> &'static str {
        "buffer"
    }
}
