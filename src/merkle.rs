//! Merkle tree construction over a directory's file universe.
//!
//! Leaves are files (`SHA-256(path:content-hash)`), internal nodes cover
//! directory prefixes, and the root (node path `""`) summarizes the whole
//! tree. Children are sorted by path before hashing, so two snapshots with
//! the same `(path, content-hash)` multiset always produce the same root no
//! matter how the filesystem was traversed.

use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::hash;
use crate::models::MerkleNode;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ChildEntry {
    path: String,
    is_leaf: bool,
    /// Leaf hash; internal hashes are computed bottom-up.
    leaf_hash: Option<String>,
}

/// Build the full Merkle tree for a directory snapshot.
///
/// `files` pairs relative paths with content hashes. Returns the root hash
/// and every node (root included) ready for catalog storage.
pub fn build_tree(directory_id: &str, files: &[(String, String)]) -> (String, Vec<MerkleNode>) {
    // parent path -> sorted, de-duplicated children
    let mut children: BTreeMap<String, BTreeSet<ChildEntry>> = BTreeMap::new();

    for (path, content_hash) in files {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for i in 0..parts.len() {
            let parent = parts[..i].join("/");
            let node_path = parts[..=i].join("/");
            let is_leaf = i == parts.len() - 1;
            children.entry(parent).or_default().insert(ChildEntry {
                leaf_hash: is_leaf.then(|| hash::merkle_leaf(path, content_hash)),
                path: node_path,
                is_leaf,
            });
        }
    }

    let mut hashes: BTreeMap<String, String> = BTreeMap::new();
    let root_hash = compute_hash("", &children, &mut hashes);

    let mut nodes = Vec::new();
    nodes.push(MerkleNode {
        id: Uuid::new_v4().to_string(),
        directory_id: directory_id.to_string(),
        node_path: String::new(),
        node_hash: root_hash.clone(),
        is_leaf: false,
        parent_path: None,
        depth: 0,
    });

    for (parent, entries) in &children {
        for entry in entries {
            let node_hash = match &entry.leaf_hash {
                Some(h) => h.clone(),
                None => hashes
                    .get(&entry.path)
                    .cloned()
                    .unwrap_or_else(|| hash::merkle_empty(&entry.path)),
            };
            let depth = entry.path.split('/').count() as i64 - 1;
            nodes.push(MerkleNode {
                id: Uuid::new_v4().to_string(),
                directory_id: directory_id.to_string(),
                node_path: entry.path.clone(),
                node_hash,
                is_leaf: entry.is_leaf,
                parent_path: if parent.is_empty() && !entry.path.contains('/') {
                    None
                } else {
                    Some(parent.clone())
                },
                depth,
            });
        }
    }

    (root_hash, nodes)
}

/// Bottom-up hash of one node, memoized into `hashes`.
fn compute_hash(
    path: &str,
    children: &BTreeMap<String, BTreeSet<ChildEntry>>,
    hashes: &mut BTreeMap<String, String>,
) -> String {
    let entries = match children.get(path) {
        Some(e) if !e.is_empty() => e,
        _ => return hash::merkle_empty(path),
    };

    let mut child_hashes: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let h = match &entry.leaf_hash {
            Some(h) => h.clone(),
            None => compute_hash(&entry.path, children, hashes),
        };
        child_hashes.push(h);
    }

    let combined = hash::merkle_internal(&child_hashes);
    if !path.is_empty() {
        hashes.insert(path.to_string(), combined.clone());
    }
    combined
}
