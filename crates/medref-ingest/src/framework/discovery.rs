//! Source file discovery

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{IngestError, IngestResult};

/// Recursively list candidate files under `root`, sorted by path
///
/// Hidden files and directories are skipped. When `extensions` is non-empty a
/// file is kept only if its name ends with `.<ext>` for one of them, so
/// multi-part extensions such as `jsonl.gz` work.
pub fn discover_files(root: &Path, extensions: &[String]) -> IngestResult<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(IngestError::config(format!(
            "source directory '{}' does not exist or is not a directory",
            root.display()
        )));
    }

    let suffixes: Vec<String> = extensions
        .iter()
        .map(|ext| format!(".{}", ext.trim_start_matches('.').to_ascii_lowercase()))
        .collect();

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping unreadable directory entry");
                continue;
            },
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if suffixes.is_empty() || suffixes.iter().any(|s| name.ends_with(s.as_str())) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    debug!(root = %root.display(), files = files.len(), "Discovered source files");
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_discovers_recursively_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2024").join("q1");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::create_dir_all(dir.path().join(".cache")).unwrap();

        std::fs::write(dir.path().join("b.jsonl"), "").unwrap();
        std::fs::write(nested.join("a.JSONL.gz"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::write(dir.path().join(".hidden.jsonl"), "").unwrap();
        std::fs::write(dir.path().join(".cache").join("c.jsonl"), "").unwrap();

        let files = discover_files(dir.path(), &["jsonl".into(), "jsonl.gz".into()]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.JSONL.gz", "b.jsonl"]);

        let all = discover_files(dir.path(), &[]).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_missing_directory_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_files(&dir.path().join("nope"), &[]).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(_)));
    }
}
