//! Directory scanner.
//!
//! Walks an indexed directory root, applies glob include/exclude patterns,
//! and yields [`ScannedFile`]s carrying size, mtime, and content hash.
//!
//! Exclude patterns are consulted first and match either the file name or
//! any directory component; excluded directories are pruned so the walker
//! never descends into them. Include patterns admit a file when at least one
//! matches its file name.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use walkdir::WalkDir;

use crate::hash;
use crate::models::ScannedFile;

/// Include patterns applied when a directory is registered without any.
pub fn default_file_patterns() -> Vec<String> {
    [
        "*.txt", "*.md", "*.py", "*.js", "*.json", "*.yaml", "*.yml", "*.csv", "*.log",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Exclude patterns applied when a directory is registered without any.
pub fn default_exclude_patterns() -> Vec<String> {
    [
        "node_modules",
        ".git",
        "__pycache__",
        "*.pyc",
        ".env",
        "venv",
        "build",
        "dist",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Scan `root` and return the matching files plus per-file errors.
///
/// Errors while stat-ing or walking individual entries are collected and do
/// not abort the scan; a missing root is an error.
pub fn scan_directory(
    root: &Path,
    file_patterns: &[String],
    exclude_patterns: &[String],
) -> Result<(Vec<ScannedFile>, Vec<String>)> {
    if !root.is_dir() {
        bail!("Indexed directory root does not exist: {}", root.display());
    }

    let include_set = build_globset(file_patterns)?;
    let exclude_set = build_globset(exclude_patterns)?;

    let mut files = Vec::new();
    let mut errors = Vec::new();

    let walker = WalkDir::new(root)
        .into_iter()
        // Prune excluded directories so the walker never descends into them.
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            !matches_name(&exclude_set, entry.file_name().to_string_lossy().as_ref())
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                errors.push(format!("Error walking directory: {}", e));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let file_name = entry.file_name().to_string_lossy();

        if is_excluded(&exclude_set, &rel_str, &file_name) {
            continue;
        }
        if !matches_name(&include_set, &file_name) {
            continue;
        }

        match file_to_scanned(path, &rel_str) {
            Ok(file) => files.push(file),
            Err(e) => errors.push(format!("Error processing {}: {}", path.display(), e)),
        }
    }

    // Deterministic ordering
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok((files, errors))
}

/// True when the file name or any path component matches an exclude glob.
fn is_excluded(exclude_set: &GlobSet, relative_path: &str, file_name: &str) -> bool {
    if matches_name(exclude_set, file_name) {
        return true;
    }
    relative_path
        .split('/')
        .any(|part| matches_name(exclude_set, part))
}

fn matches_name(set: &GlobSet, name: &str) -> bool {
    set.is_match(Path::new(name))
}

fn file_to_scanned(path: &Path, relative_path: &str) -> Result<ScannedFile> {
    let metadata = std::fs::metadata(path)?;
    let modified: DateTime<Utc> = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .into();

    Ok(ScannedFile {
        relative_path: relative_path.to_string(),
        absolute_path: path.to_path_buf(),
        size: metadata.len() as i64,
        modified,
        content_hash: hash::content_hash(path),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn includes_only_matching_names() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.md", "hello");
        write(tmp.path(), "b.py", "print(1)");
        write(tmp.path(), "c.bin", "xx");

        let (files, errors) = scan_directory(
            tmp.path(),
            &["*.md".into(), "*.py".into()],
            &[],
        )
        .unwrap();
        assert!(errors.is_empty());
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "b.py"]);
    }

    #[test]
    fn excluded_directories_are_pruned() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "keep/a.md", "x");
        write(tmp.path(), "node_modules/pkg/b.md", "y");
        write(tmp.path(), ".git/objects/c.md", "z");

        let (files, _) = scan_directory(
            tmp.path(),
            &["*.md".into()],
            &["node_modules".into(), ".git".into()],
        )
        .unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["keep/a.md"]);
    }

    #[test]
    fn exclude_matches_file_names_too() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "mod.pyc", "binary");
        write(tmp.path(), "ok.py", "print(1)");

        let (files, _) = scan_directory(tmp.path(), &["*.py*".into()], &["*.pyc".into()]).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["ok.py"]);
    }

    #[test]
    fn scanned_files_carry_hash_and_size() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", "hello");

        let (files, _) = scan_directory(tmp.path(), &["*.txt".into()], &[]).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 5);
        assert_eq!(files[0].content_hash, crate::hash::sha256_text("hello"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let err = scan_directory(Path::new("/no/such/root"), &["*.md".into()], &[]);
        assert!(err.is_err());
    }

    #[test]
    fn ordering_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "z.md", "1");
        write(tmp.path(), "a.md", "2");
        write(tmp.path(), "sub/m.md", "3");

        let (files, _) = scan_directory(tmp.path(), &["*.md".into()], &[]).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "sub/m.md", "z.md"]);
    }
}
