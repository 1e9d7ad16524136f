//! Content-aware text chunking.
//!
//! Splits extracted text into overlapping windows using a recursive
//! character splitter. The separator ladder is chosen by file type so that
//! Markdown splits on headings before paragraphs and code splits on
//! definition boundaries before lines.
//!
//! Each chunk records its `[start_char, end_char)` span in the original
//! text (byte offsets, non-decreasing across the sequence) and a SHA-256
//! hash of its text for staleness detection.

use crate::hash;
use crate::models::Chunk;

const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " ", ""];

const MARKDOWN_SEPARATORS: &[&str] = &[
    "\n# ", "\n## ", "\n### ", "\n#### ", "\n##### ", "\n###### ", "\n\n", "\n", ". ", " ", "",
];

const PYTHON_SEPARATORS: &[&str] = &[
    "\nclass ", "\ndef ", "\n\tdef ", "\n\n", "\n", ". ", " ", "",
];

const JS_SEPARATORS: &[&str] = &[
    "\nfunction ", "\nconst ", "\nlet ", "\nvar ", "\nclass ", "\nif ", "\nfor ", "\nwhile ",
    "\nswitch ", "\ncase ", "\ndefault ", "\n\n", "\n", ". ", " ", "",
];

/// Separator ladder for a file type (lower-cased extension with dot).
fn separators_for(file_type: &str) -> &'static [&'static str] {
    match file_type {
        ".md" | ".markdown" => MARKDOWN_SEPARATORS,
        ".py" => PYTHON_SEPARATORS,
        ".js" | ".ts" | ".jsx" | ".tsx" => JS_SEPARATORS,
        _ => DEFAULT_SEPARATORS,
    }
}

/// Split `text` into chunks for `file_type`, at most roughly `chunk_size`
/// bytes each, overlapping by roughly `overlap` bytes.
///
/// Whitespace-only input produces no chunks. Chunk indices are contiguous
/// from 0 and `start_char` never decreases.
pub fn chunk_text(text: &str, file_type: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size.saturating_sub(1));

    let pieces = split_recursive(text, separators_for(file_type), chunk_size, overlap);

    let mut chunks = Vec::with_capacity(pieces.len());
    let mut search_from = 0usize;

    for (i, piece) in pieces.into_iter().enumerate() {
        // Locate the piece in the original text so offsets survive trimming
        // and separator re-joining. The fallback keeps offsets monotonic
        // even if a piece cannot be found verbatim.
        let start = text
            .get(search_from..)
            .and_then(|rest| rest.find(&piece))
            .map(|pos| search_from + pos)
            .unwrap_or(search_from);
        let end = start + piece.len();
        search_from = start + 1;

        chunks.push(Chunk {
            chunk_index: i as i64,
            chunk_hash: hash::sha256_text(&piece),
            text: piece,
            start_char: start as i64,
            end_char: end as i64,
        });
    }

    chunks
}

/// Recursively split on the first separator present, then merge the splits
/// back into windows of at most `chunk_size` with `overlap` carried over.
fn split_recursive(text: &str, separators: &[&str], chunk_size: usize, overlap: usize) -> Vec<String> {
    // Pick the first separator that occurs in the text; "" is the terminal
    // fallback that windows by size.
    let (sep_idx, separator) = separators
        .iter()
        .enumerate()
        .find(|(_, s)| s.is_empty() || text.contains(**s))
        .map(|(i, s)| (i, *s))
        .unwrap_or((separators.len() - 1, ""));

    if separator.is_empty() {
        return window_by_size(text, chunk_size, overlap);
    }

    let remaining = &separators[sep_idx + 1..];
    let splits: Vec<&str> = text.split(separator).collect();

    let mut finished: Vec<String> = Vec::new();
    let mut good: Vec<String> = Vec::new();

    for split in splits {
        if split.len() < chunk_size {
            good.push(split.to_string());
        } else {
            if !good.is_empty() {
                finished.extend(merge_splits(&good, separator, chunk_size, overlap));
                good.clear();
            }
            finished.extend(split_recursive(split, remaining, chunk_size, overlap));
        }
    }
    if !good.is_empty() {
        finished.extend(merge_splits(&good, separator, chunk_size, overlap));
    }

    finished
}

/// Greedily merge consecutive splits (re-joined with their separator) into
/// windows of at most `chunk_size`, retaining a tail of at most `overlap`
/// bytes between consecutive windows.
fn merge_splits(splits: &[String], separator: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let sep_len = separator.len();
    let mut docs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut total = 0usize;

    for split in splits {
        let len = split.len();
        let joined_extra = if current.is_empty() { 0 } else { sep_len };

        if total + len + joined_extra > chunk_size && !current.is_empty() {
            push_doc(&mut docs, &current, separator);

            // Drop leading splits until the retained tail fits the overlap
            // and leaves room for the incoming split.
            while total > overlap
                || (total + len + if current.is_empty() { 0 } else { sep_len } > chunk_size
                    && total > 0)
            {
                let removed = current.remove(0);
                total -= removed.len() + if current.is_empty() { 0 } else { sep_len };
            }
        }

        current.push(split.as_str());
        total += len + if current.len() > 1 { sep_len } else { 0 };
    }

    push_doc(&mut docs, &current, separator);
    docs
}

fn push_doc(docs: &mut Vec<String>, parts: &[&str], separator: &str) {
    if parts.is_empty() {
        return;
    }
    let doc = parts.join(separator);
    let trimmed = doc.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

/// Terminal splitter: fixed-size windows on char boundaries with overlap.
fn window_by_size(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let mut end = (start + chunk_size).min(text.len());
        while end < text.len() && !text.is_char_boundary(end) {
            end += 1;
        }
        let piece = text[start..end].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        if end == text.len() {
            break;
        }
        let mut next = start + step;
        while next < text.len() && !text.is_char_boundary(next) {
            next += 1;
        }
        start = next;
    }

    out
}
