//! Export cached memory as raw bytes or a hex listing.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::document::Document;
use crate::error::{MemviewError, MemviewResult};
use crate::types::{hex_addr, DocStatus, Endian};

async fn refresh_before_export(doc: &Document) {
    if doc.status() != DocStatus::Stopped {
        return;
    }
    // Failed pages come back empty and stay stale; export what is there.
    doc.refresh_if_stale().await;
    if doc.memory().num_pages() == 0 {
        warn!(doc_id = %doc.id(), "nothing loaded to export");
    }
}

fn export_error(e: std::io::Error) -> MemviewError {
    MemviewError::Export {
        message: e.to_string(),
    }
}

/// Render one cell as hex in display byte order.
pub fn render_cell(bytes: &[u8], endian: Endian) -> String {
    if endian.is_big() {
        hex::encode(bytes)
    } else {
        let reversed: Vec<u8> = bytes.iter().rev().copied().collect();
        hex::encode(reversed)
    }
}

/// Write every loaded page in slot order. Returns the byte count.
pub async fn dump_binary<W>(doc: &Document, writer: &mut W) -> MemviewResult<u64>
where
    W: AsyncWrite + Unpin,
{
    refresh_before_export(doc).await;

    let mut written = 0u64;
    for page in doc.memory().snapshot() {
        writer.write_all(&page).await.map_err(export_error)?;
        written += page.len() as u64;
    }
    writer.flush().await.map_err(export_error)?;
    debug!(doc_id = %doc.id(), bytes = written, "binary export done");
    Ok(written)
}

/// Write a hex listing, one row per line: address then `column` cells.
///
/// Unloaded pages are skipped. Returns the number of lines written.
pub async fn dump_text<W>(doc: &Document, writer: &mut W) -> MemviewResult<usize>
where
    W: AsyncWrite + Unpin,
{
    refresh_before_export(doc).await;

    let memory = doc.memory();
    let row_width = doc.bytes_per_row();
    let cell_width = doc.format().bytes_per_cell();
    let endian = doc.endian();

    let mut lines = 0;
    for (slot, page) in memory.snapshot().into_iter().enumerate() {
        let page_addr = memory.page_address(slot);
        for (row_ix, row) in page.chunks(row_width).enumerate() {
            let mut line = hex_addr(page_addr + (row_ix * row_width) as u64, false);
            for cell in row.chunks(cell_width) {
                line.push(' ');
                line.push_str(&render_cell(cell, endian));
            }
            line.push('\n');
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(export_error)?;
            lines += 1;
        }
    }
    writer.flush().await.map_err(export_error)?;
    debug!(doc_id = %doc.id(), lines, "text export done");
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemviewConfig;
    use crate::descriptor::{DocumentDescriptor, MemorySnapshot};
    use crate::source::{BufferSource, DetachedSource};
    use crate::types::CellFormat;
    use std::sync::Arc;

    fn restored_doc(pages: Vec<Vec<u8>>, format: CellFormat, column: u32, endian: Endian) -> Document {
        let mut desc = DocumentDescriptor::new_view("&buf", &MemviewConfig::default())
            .with_window(0x1000, 1024)
            .with_layout(format, column, endian);
        desc.memory = Some(MemorySnapshot {
            base_address: "4096".to_string(),
            pages,
        });
        Document::from_descriptor(&desc, Arc::new(DetachedSource), false).unwrap()
    }

    #[test]
    fn test_render_cell_byte_order() {
        assert_eq!(render_cell(&[0x12, 0x34], Endian::Little), "3412");
        assert_eq!(render_cell(&[0x12, 0x34], Endian::Big), "1234");
    }

    #[tokio::test]
    async fn test_dump_text_rows() {
        let page: Vec<u8> = (0..20).collect();
        let doc = restored_doc(vec![page], CellFormat::FourByte, 2, Endian::Little);

        let mut out = Vec::new();
        let lines = dump_text(&doc, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();

        assert_eq!(lines, 3);
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows[0], "0000000000001000 03020100 07060504");
        assert_eq!(rows[1], "0000000000001008 0b0a0908 0f0e0d0c");
        assert_eq!(rows[2], "0000000000001010 13121110");
    }

    #[tokio::test]
    async fn test_dump_binary_skips_nothing_loaded() {
        let doc = restored_doc(
            vec![vec![1, 2, 3], Vec::new(), vec![4]],
            CellFormat::OneByte,
            16,
            Endian::Big,
        );
        let mut out = Vec::new();
        let written = dump_binary(&doc, &mut out).await.unwrap();
        assert_eq!(written, 4);
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_export_refreshes_stopped_document() {
        let source = Arc::new(BufferSource::new(0x1000, vec![0xaa; 16]));
        let desc = DocumentDescriptor::new_view("&buf", &MemviewConfig::default())
            .with_session("s1", "app", "")
            .with_window(0x1000, 16)
            .with_layout(CellFormat::OneByte, 16, Endian::Little);
        let doc = Document::from_descriptor(&desc, source.clone(), false).unwrap();
        doc.get_byte(0x1000).await;
        source.poke(0x1000, &[0xbb]);
        doc.mark_as_stale();

        let mut out = Vec::new();
        dump_binary(&doc, &mut out).await.unwrap();
        assert_eq!(out[0], 0xaa, "not stopped, so no refresh");

        doc.set_status(DocStatus::Stopped);
        let mut out = Vec::new();
        dump_binary(&doc, &mut out).await.unwrap();
        assert_eq!(out[0], 0xbb);
    }
}
