//! Content and Merkle hashing primitives.
//!
//! Every file in the index is identified by two hashes: the SHA-256 of its
//! bytes (`content_hash`) and a leaf hash binding the relative path to that
//! content (`merkle_leaf`). Internal tree nodes combine sorted child hashes
//! so that equal file universes always produce equal roots, regardless of
//! traversal order.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Read window for streaming file hashing.
const HASH_WINDOW: usize = 64 * 1024;

/// SHA-256 of a file's bytes, streamed in 64 KiB windows.
///
/// An unreadable file still gets a stable identity: the hash of
/// `"ERROR:<message>"`, so the pipeline can record it without aborting.
pub fn content_hash(path: &Path) -> String {
    match hash_file_bytes(path) {
        Ok(digest) => digest,
        Err(e) => sha256_hex(format!("ERROR:{}", e).as_bytes()),
    }
}

fn hash_file_bytes(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_WINDOW];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Leaf hash: `SHA-256("<relative-path>:<content-hash>")`.
pub fn merkle_leaf(relative_path: &str, content_hash: &str) -> String {
    sha256_hex(format!("{}:{}", relative_path, content_hash).as_bytes())
}

/// Internal node hash: SHA-256 over the ascending-sorted child hashes joined
/// with `":"`. Callers pass children in any order.
pub fn merkle_internal(child_hashes: &[String]) -> String {
    let mut sorted: Vec<&str> = child_hashes.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sha256_hex(sorted.join(":").as_bytes())
}

/// Hash of a directory node with no children.
pub fn merkle_empty(node_path: &str) -> String {
    sha256_hex(format!("EMPTY:{}", node_path).as_bytes())
}

/// SHA-256 of arbitrary text, hex encoded. Used for chunk hashes.
pub fn sha256_text(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn content_hash_matches_whole_file_digest() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        let streamed = content_hash(f.path());
        assert_eq!(streamed, sha256_text("hello world"));
    }

    #[test]
    fn content_hash_large_file_spans_windows() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let data = vec![b'a'; HASH_WINDOW * 2 + 17];
        f.write_all(&data).unwrap();
        let streamed = content_hash(f.path());
        assert_eq!(streamed, sha256_hex(&data));
    }

    #[test]
    fn missing_file_hashes_error_text() {
        let h = content_hash(Path::new("/definitely/not/here.txt"));
        // Stable across invocations for the same error
        let again = content_hash(Path::new("/definitely/not/here.txt"));
        assert_eq!(h, again);
        assert_eq!(h.len(), 64);
    }

    #[test]
    fn merkle_leaf_binds_path_and_content() {
        let a = merkle_leaf("a.md", "abc");
        let b = merkle_leaf("b.md", "abc");
        assert_ne!(a, b);
        assert_eq!(a, sha256_text("a.md:abc"));
    }

    #[test]
    fn merkle_internal_is_order_independent() {
        let h1 = merkle_internal(&["x".into(), "y".into(), "z".into()]);
        let h2 = merkle_internal(&["z".into(), "x".into(), "y".into()]);
        assert_eq!(h1, h2);
        assert_eq!(h1, sha256_text("x:y:z"));
    }

    #[test]
    fn empty_node_hash_depends_on_path() {
        assert_ne!(merkle_empty(""), merkle_empty("sub"));
        assert_eq!(merkle_empty("sub"), sha256_text("EMPTY:sub"));
    }
}
