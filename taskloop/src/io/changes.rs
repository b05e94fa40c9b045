//! Best-effort write detection over a checkout's file set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::core::classifier::is_bookkeeping_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// (mtime, size) of every regular file under a root, keyed by relative path.
///
/// `.git` and the bookkeeping directory are excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSnapshot {
    files: BTreeMap<PathBuf, Stamp>,
}

impl FileSnapshot {
    pub fn capture(root: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| !is_bookkeeping_path(rel))
                .unwrap_or(true)
        });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .with_context(|| format!("relativize {}", entry.path().display()))?
                .to_path_buf();
            files.insert(
                rel,
                Stamp {
                    modified: meta.modified().ok(),
                    len: meta.len(),
                },
            );
        }
        Ok(Self { files })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Paths added, removed or modified since `before`, sorted.
    pub fn changed_since(&self, before: &FileSnapshot) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|(path, stamp)| before.files.get(*path) != Some(*stamp))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            before
                .files
                .keys()
                .filter(|path| !self.files.contains_key(*path))
                .cloned(),
        );
        changed.sort();
        changed
    }
}
