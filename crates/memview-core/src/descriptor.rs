//! Transfer format for documents.
//!
//! A [`DocumentDescriptor`] is what a document looks like on the wire and in
//! snapshot files: camelCase JSON, numbers that may exceed 53 bits carried as
//! decimal strings, and every optional field defaulted so partial payloads from
//! older hosts still load.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::config::{self, MemviewConfig};
use crate::error::{MemviewError, MemviewResult};
use crate::types::{parse_address, Address, CellFormat, Endian, UNKNOWN_ID};

/// Persisted page contents for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
    /// Address the pages were captured at (decimal).
    pub base_address: String,
    /// Page contents in slot order. Empty pages were never loaded.
    #[serde(default)]
    pub pages: Vec<Vec<u8>>,
}

/// Serializable form of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentDescriptor {
    pub doc_id: String,

    #[serde(default = "unknown_id")]
    pub session_id: String,

    #[serde(default)]
    pub session_name: String,

    #[serde(default)]
    pub display_name: String,

    /// Start-address expression.
    pub expr: String,

    /// Size expression.
    #[serde(default = "config::default_size_expr")]
    pub size: String,

    #[serde(default)]
    pub endian: Endian,

    #[serde(default)]
    pub format: CellFormat,

    /// Columns per row. Older hosts send this as a string.
    #[serde(
        default = "config::default_columns",
        deserialize_with = "deserialize_column"
    )]
    pub column: u32,

    #[serde(default)]
    pub ws_folder: String,

    /// Resolved start address (decimal).
    #[serde(default = "zero")]
    pub start_address: String,

    /// Resolved window size (decimal).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: String,

    #[serde(default = "stale")]
    pub base_address_stale: bool,

    #[serde(default = "stale")]
    pub max_bytes_stale: bool,

    #[serde(default)]
    pub is_current_doc: bool,

    /// Pending edits: decimal address to byte.
    #[serde(default)]
    pub modified_map: BTreeMap<String, u8>,

    /// Opaque state owned by the grid.
    #[serde(default)]
    pub client_state: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub is_read_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySnapshot>,
}

fn unknown_id() -> String {
    UNKNOWN_ID.to_string()
}

fn zero() -> String {
    "0".to_string()
}

fn default_max_bytes() -> String {
    config::default_max_bytes().to_string()
}

fn stale() -> bool {
    true
}

fn deserialize_column<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Column {
        Number(u32),
        Text(String),
    }

    match Column::deserialize(deserializer)? {
        Column::Number(n) => Ok(n),
        Column::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid column count: {}", s))),
    }
}

impl DocumentDescriptor {
    /// Descriptor for a new, unresolved view of `expr` with a fresh id.
    pub fn new_view(expr: impl Into<String>, config: &MemviewConfig) -> Self {
        let expr = expr.into();
        Self {
            doc_id: Uuid::new_v4().to_string(),
            session_id: unknown_id(),
            session_name: String::new(),
            display_name: expr.clone(),
            expr,
            size: config.default_size_expr.clone(),
            endian: config.default_endian,
            format: config.default_format,
            column: config.default_columns,
            ws_folder: String::new(),
            start_address: zero(),
            max_bytes: config.default_max_bytes.to_string(),
            base_address_stale: true,
            max_bytes_stale: true,
            is_current_doc: false,
            modified_map: BTreeMap::new(),
            client_state: serde_json::Map::new(),
            is_read_only: false,
            memory: None,
        }
    }

    /// Bind to a debugger session.
    pub fn with_session(
        mut self,
        session_id: impl Into<String>,
        session_name: impl Into<String>,
        ws_folder: impl Into<String>,
    ) -> Self {
        self.session_id = session_id.into();
        self.session_name = session_name.into();
        self.ws_folder = ws_folder.into();
        self
    }

    /// Set an already-resolved window.
    pub fn with_window(mut self, start: Address, max_bytes: u64) -> Self {
        self.start_address = start.to_string();
        self.max_bytes = max_bytes.to_string();
        self
    }

    pub fn with_layout(mut self, format: CellFormat, column: u32, endian: Endian) -> Self {
        self.format = format;
        self.column = column;
        self.endian = endian;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.is_read_only = read_only;
        self
    }

    pub fn start_address_value(&self) -> MemviewResult<Address> {
        parse_number("startAddress", &self.start_address)
    }

    pub fn max_bytes_value(&self) -> MemviewResult<u64> {
        parse_number("maxBytes", &self.max_bytes)
    }

    /// Pending edits keyed by address.
    pub fn modified_entries(&self) -> MemviewResult<BTreeMap<Address, u8>> {
        self.modified_map
            .iter()
            .map(|(key, value)| Ok((parse_number("modifiedMap", key)?, *value)))
            .collect()
    }

    /// Check every numeric string without building anything.
    pub fn validate(&self) -> MemviewResult<()> {
        if self.doc_id.is_empty() {
            return Err(MemviewError::InvalidDescriptor {
                message: "empty docId".to_string(),
            });
        }
        self.start_address_value()?;
        self.max_bytes_value()?;
        self.modified_entries()?;
        if let Some(memory) = &self.memory {
            parse_number("memory.baseAddress", &memory.base_address)?;
        }
        Ok(())
    }
}

fn parse_number(field: &str, text: &str) -> MemviewResult<u64> {
    parse_address(text).ok_or_else(|| MemviewError::InvalidDescriptor {
        message: format!("{} is not a number: {:?}", field, text),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_descriptor_gets_defaults() {
        let desc: DocumentDescriptor =
            serde_json::from_str(r#"{"docId": "d1", "expr": "&buf"}"#).unwrap();
        assert_eq!(desc.session_id, UNKNOWN_ID);
        assert_eq!(desc.size, "4 * 1024 * 1024");
        assert_eq!(desc.format, CellFormat::FourByte);
        assert_eq!(desc.endian, Endian::Little);
        assert_eq!(desc.column, 4);
        assert_eq!(desc.start_address_value().unwrap(), 0);
        assert_eq!(desc.max_bytes_value().unwrap(), 4 * 1024 * 1024);
        assert!(desc.base_address_stale);
        assert!(desc.max_bytes_stale);
        assert!(desc.memory.is_none());
    }

    #[test]
    fn test_column_accepts_string_or_number() {
        let desc: DocumentDescriptor =
            serde_json::from_str(r#"{"docId": "d1", "expr": "x", "column": "8"}"#).unwrap();
        assert_eq!(desc.column, 8);
        let desc: DocumentDescriptor =
            serde_json::from_str(r#"{"docId": "d1", "expr": "x", "column": 2}"#).unwrap();
        assert_eq!(desc.column, 2);
        assert!(serde_json::from_str::<DocumentDescriptor>(
            r#"{"docId": "d1", "expr": "x", "column": "wide"}"#
        )
        .is_err());
    }

    #[test]
    fn test_camel_case_wire_names() {
        let mut desc = DocumentDescriptor::new_view("&buf", &MemviewConfig::default())
            .with_window(0x1000, 256);
        desc.modified_map.insert("4097".to_string(), 0xab);
        let json = serde_json::to_value(&desc).unwrap();

        assert_eq!(json["startAddress"], "4096");
        assert_eq!(json["maxBytes"], "256");
        assert_eq!(json["modifiedMap"]["4097"], 171);
        assert_eq!(json["isReadOnly"], false);
        assert_eq!(json["column"], 4);
        assert!(json.get("memory").is_none());
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        let mut desc = DocumentDescriptor::new_view("x", &MemviewConfig::default());
        desc.start_address = "main+4".to_string();
        let err = desc.validate().unwrap_err();
        assert!(matches!(err, MemviewError::InvalidDescriptor { .. }));

        let mut desc = DocumentDescriptor::new_view("x", &MemviewConfig::default());
        desc.modified_map.insert("nope".to_string(), 1);
        assert!(desc.modified_entries().is_err());
    }

    #[test]
    fn test_new_view_ids_are_unique() {
        let config = MemviewConfig::default();
        let a = DocumentDescriptor::new_view("x", &config);
        let b = DocumentDescriptor::new_view("x", &config);
        assert_ne!(a.doc_id, b.doc_id);
        assert_eq!(a.display_name, "x");
    }
}
