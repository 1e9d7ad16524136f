//! Per-file-type text extraction.
//!
//! Dispatches on file extension and returns plain text plus extraction
//! metadata. Extraction is never fatal: unreadable or malformed files yield
//! a short failure text and an `<kind>_failed` method marker, and the file
//! still flows through chunking.

use std::path::Path;

/// Metadata describing how a file's text was obtained.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExtractionMeta {
    /// Lower-cased extension including the dot, e.g. `.md`.
    pub file_type: String,
    pub extraction_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
}

impl ExtractionMeta {
    fn new(file_type: &str, method: &str) -> Self {
        Self {
            file_type: file_type.to_string(),
            extraction_method: method.to_string(),
            encoding: None,
            page_count: None,
        }
    }
}

const CODE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".jsx", ".tsx", ".java", ".c", ".cpp", ".h", ".hpp",
];
const STRUCTURED_EXTENSIONS: &[&str] = &[".json", ".yaml", ".yml"];
const TABULAR_EXTENSIONS: &[&str] = &[".csv", ".tsv"];

/// Extract text from a file, dispatching on its extension.
///
/// `relative_path` is embedded in code-file headers so the origin of a
/// chunk survives into embedding space.
pub fn extract_text(path: &Path, relative_path: &str) -> (String, ExtractionMeta) {
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();

    match ext.as_str() {
        ".pdf" => extract_pdf(path, &ext),
        ".txt" | ".md" | ".markdown" => extract_plain(path, &ext, "plain_text"),
        e if CODE_EXTENSIONS.contains(&e) => extract_code(path, relative_path, &ext),
        e if STRUCTURED_EXTENSIONS.contains(&e) => extract_plain(path, &ext, "structured"),
        e if TABULAR_EXTENSIONS.contains(&e) => extract_plain(path, &ext, "tabular"),
        _ => extract_fallback(path, &ext),
    }
}

fn extract_plain(path: &Path, ext: &str, method: &str) -> (String, ExtractionMeta) {
    let mut meta = ExtractionMeta::new(ext, method);
    match std::fs::read(path) {
        Ok(bytes) => {
            let (text, encoding) = decode_text(&bytes);
            meta.encoding = Some(encoding.to_string());
            (text, meta)
        }
        Err(e) => {
            meta.extraction_method = format!("{}_failed", method);
            (format!("Failed to extract: {}", e), meta)
        }
    }
}

fn extract_code(path: &Path, relative_path: &str, ext: &str) -> (String, ExtractionMeta) {
    let (text, mut meta) = extract_plain(path, ext, "code");
    if meta.extraction_method == "code" {
        // Header aids embedding-time recall of the file's origin.
        return (format!("# File: {}\n\n{}", relative_path, text), meta);
    }
    meta.extraction_method = "code_failed".to_string();
    (text, meta)
}

fn extract_pdf(path: &Path, ext: &str) -> (String, ExtractionMeta) {
    let mut meta = ExtractionMeta::new(ext, "pdf");
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            meta.extraction_method = "pdf_failed".to_string();
            return (format!("Failed to extract: {}", e), meta);
        }
    };

    match pdf_extract::extract_text_from_mem_by_pages(&bytes) {
        Ok(pages) => {
            meta.page_count = Some(pages.len());
            let parts: Vec<String> = pages
                .iter()
                .enumerate()
                .filter(|(_, text)| !text.trim().is_empty())
                .map(|(i, text)| format!("--- Page {} ---\n{}", i + 1, text))
                .collect();
            (parts.join("\n\n"), meta)
        }
        Err(e) => {
            meta.extraction_method = "pdf_failed".to_string();
            (format!("Failed to extract: {}", e), meta)
        }
    }
}

fn extract_fallback(path: &Path, ext: &str) -> (String, ExtractionMeta) {
    let mut meta = ExtractionMeta::new(ext, "fallback");
    match std::fs::read(path) {
        Ok(bytes) => {
            let (text, _) = decode_text(&bytes);
            (text, meta)
        }
        Err(e) => {
            meta.extraction_method = "fallback_failed".to_string();
            (format!("Failed to extract: {}", e), meta)
        }
    }
}

/// Decode bytes to text: BOM sniffing first, then UTF-8, then lossy.
fn decode_text(bytes: &[u8]) -> (String, &'static str) {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return (String::from_utf8_lossy(&bytes[3..]).into_owned(), "utf-8-sig");
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return (decode_utf16(&bytes[2..], true), "utf-16-le");
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return (decode_utf16(&bytes[2..], false), "utf-16-be");
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), "utf-8"),
        Err(_) => (String::from_utf8_lossy(bytes).into_owned(), "utf-8-lossy"),
    }
}

fn decode_utf16(bytes: &[u8], little_endian: bool) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}
