//! Shared value types for documents, pages and debugger sessions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Target address. Debuggee addresses need the full 64 bits.
pub type Address = u64;

/// Opaque document identity.
pub type DocId = String;

/// Placeholder id used for unbound sessions and unnamed documents.
pub const UNKNOWN_ID: &str = "Unknown";

/// Rows per page; page size = `ROWS_PER_PAGE * bytes_per_row`.
pub const ROWS_PER_PAGE: usize = 16;

/// Row width used when a layout has no columns.
pub const FALLBACK_ROW_BYTES: usize = 16;

/// Width of one display cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CellFormat {
    #[serde(rename = "1-byte")]
    OneByte,
    #[serde(rename = "2-byte")]
    TwoByte,
    #[default]
    #[serde(rename = "4-byte")]
    FourByte,
    #[serde(rename = "8-byte")]
    EightByte,
}

impl CellFormat {
    /// Bytes per cell.
    pub fn bytes_per_cell(self) -> usize {
        match self {
            Self::OneByte => 1,
            Self::TwoByte => 2,
            Self::FourByte => 4,
            Self::EightByte => 8,
        }
    }

    /// Parse the transfer spelling (`"4-byte"`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "1-byte" => Some(Self::OneByte),
            "2-byte" => Some(Self::TwoByte),
            "4-byte" => Some(Self::FourByte),
            "8-byte" => Some(Self::EightByte),
            _ => None,
        }
    }
}

impl fmt::Display for CellFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-byte", self.bytes_per_cell())
    }
}

/// Byte order used to render a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    pub fn is_big(self) -> bool {
        matches!(self, Self::Big)
    }
}

/// Lifecycle status reported by the debugger tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Started,
    Running,
    Stopped,
    Terminated,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Started => "started",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// One debugger lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub ws_folder: String,
}

impl SessionEvent {
    pub fn new(
        session_id: impl Into<String>,
        status: SessionStatus,
        session_name: impl Into<String>,
        ws_folder: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            status,
            session_name: session_name.into(),
            ws_folder: ws_folder.into(),
        }
    }
}

/// Debugger state as seen by one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DocStatus {
    /// No debugger attached, or no status reported yet.
    #[default]
    Default,
    /// Debugger attached and running.
    Busy,
    /// Debugger attached and stopped.
    Stopped,
}

impl fmt::Display for DocStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Default => "No debugger attached",
            Self::Busy => "Debugger attached, busy",
            Self::Stopped => "Debugger attached, stopped",
        };
        f.write_str(s)
    }
}

/// Raw cached byte with its shadow. `None` means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteVal {
    pub current: Option<u8>,
    pub previous: Option<u8>,
}

impl ByteVal {
    pub const UNKNOWN: Self = Self {
        current: None,
        previous: None,
    };
}

/// Byte as presented to the grid: cache merged with the edit overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemValue {
    /// Displayed value (pending edit if any, else cached).
    pub current: Option<u8>,
    /// Last committed value from the cache.
    pub original: Option<u8>,
    /// Covering page is stale.
    pub stale: bool,
    /// Cached value differs from the shadow captured before the last refresh.
    pub remote_changed: bool,
    /// A pending local edit differs from the cached value.
    pub locally_edited: bool,
    pub in_range: bool,
}

impl MemValue {
    /// Value returned for addresses outside the window.
    pub const DUMMY: Self = Self {
        current: None,
        original: None,
        stale: true,
        remote_changed: false,
        locally_edited: false,
        in_range: false,
    };

    /// Either signal is set; what the grid highlights.
    pub fn changed(&self) -> bool {
        self.remote_changed || self.locally_edited
    }
}

/// User-editable view settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSettings {
    pub display_name: String,
    pub expr: String,
    pub size: String,
    pub endian: Endian,
    pub format: CellFormat,
    pub column: u32,
}

/// Row width for a layout.
pub fn bytes_per_row(format: CellFormat, columns: u32) -> usize {
    let row = format.bytes_per_cell() * columns as usize;
    if row == 0 {
        FALLBACK_ROW_BYTES
    } else {
        row
    }
}

/// Format an address as fixed-width hex, optionally with `0x`.
pub fn hex_addr(addr: Address, with_prefix: bool) -> String {
    if with_prefix {
        format!("0x{:016x}", addr)
    } else {
        format!("{:016x}", addr)
    }
}

/// Parse an address or size reported by an evaluator: decimal or `0x` hex.
pub fn parse_address(text: &str) -> Option<Address> {
    let text = text.trim();
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Address::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
