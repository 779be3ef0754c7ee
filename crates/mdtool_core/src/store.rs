use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use crate::filesystem::{
    ScanOptions, display_path, is_markdown_path, normalize_pathbuf, path_eq_ignore_case,
    scan_markdown_files,
};

/// Everything the fix pipeline reads from or writes to the working tree.
pub trait DocumentStore {
    fn read(&self, path: &Path) -> Result<String>;
    fn write(&mut self, path: &Path, content: &str) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    /// True only when the parent directory lists an entry with exactly this name.
    fn has_exact_entry(&self, path: &Path) -> bool;
    fn rename(&mut self, from: &Path, to: &Path) -> Result<()>;
    fn copy(&mut self, from: &Path, to: &Path) -> Result<()>;
    fn remove(&mut self, path: &Path) -> Result<()>;
    fn list_markdown(&self, root: &Path, options: &ScanOptions) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsStore;

impl DocumentStore for FsStore {
    fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn write(&mut self, path: &Path, content: &str) -> Result<()> {
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn has_exact_entry(&self, path: &Path) -> bool {
        exact_entry_on_disk(path)
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if from != to && path_eq_ignore_case(from, to) {
            // Case-only rename: hop through a temporary name so that
            // case-insensitive filesystems actually change the entry.
            let hop = case_hop_path(to);
            fs::rename(from, &hop).with_context(|| {
                format!("failed to rename {} to {}", from.display(), hop.display())
            })?;
            return fs::rename(&hop, to).with_context(|| {
                format!("failed to rename {} to {}", hop.display(), to.display())
            });
        }
        fs::rename(from, to).with_context(|| {
            format!("failed to rename {} to {}", from.display(), to.display())
        })
    }

    fn copy(&mut self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(from, to)
            .map(|_| ())
            .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
    }

    fn list_markdown(&self, root: &Path, options: &ScanOptions) -> Result<Vec<PathBuf>> {
        scan_markdown_files(root, options)
    }
}

fn case_hop_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.mdtool-case"))
}

fn exact_entry_on_disk(path: &Path) -> bool {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return false;
    };
    let Ok(entries) = fs::read_dir(parent) else {
        return false;
    };
    entries.flatten().any(|entry| entry.file_name() == name)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DocumentChange {
    pub original_path: String,
    pub path: String,
    pub before: String,
    pub after: String,
}

/// In-memory copy-on-write view of the tree. Nothing touches disk.
#[derive(Debug, Default)]
pub struct OverlayStore {
    /// `Some` = current content, `None` = removed.
    entries: BTreeMap<PathBuf, Option<String>>,
    /// Current path -> path the content was originally read from.
    origins: BTreeMap<PathBuf, PathBuf>,
}

impl OverlayStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn origin_of(&self, path: &Path) -> PathBuf {
        self.origins
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_path_buf())
    }

    pub fn changes(&self) -> Vec<DocumentChange> {
        let mut out = Vec::new();
        for (path, content) in &self.entries {
            let Some(after) = content else {
                continue;
            };
            let origin = self.origin_of(path);
            let before = fs::read_to_string(&origin).unwrap_or_default();
            if origin == *path && before == *after {
                continue;
            }
            out.push(DocumentChange {
                original_path: display_path(&origin),
                path: display_path(path),
                before,
                after: after.clone(),
            });
        }
        out
    }
}

impl DocumentStore for OverlayStore {
    fn read(&self, path: &Path) -> Result<String> {
        let path = normalize_pathbuf(path);
        match self.entries.get(&path) {
            Some(Some(content)) => Ok(content.clone()),
            Some(None) => Err(anyhow!("failed to read {}: removed", path.display())),
            None => fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn write(&mut self, path: &Path, content: &str) -> Result<()> {
        self.entries
            .insert(normalize_pathbuf(path), Some(content.to_string()));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let path = normalize_pathbuf(path);
        match self.entries.get(&path) {
            Some(entry) => entry.is_some(),
            None => {
                // A case-insensitive filesystem would report a removed entry
                // under another casing as still present.
                if self.has_removed_case_variant(&path) && !exact_entry_on_disk(&path) {
                    return false;
                }
                path.exists()
            }
        }
    }

    fn has_exact_entry(&self, path: &Path) -> bool {
        let path = normalize_pathbuf(path);
        match self.entries.get(&path) {
            Some(entry) => entry.is_some(),
            None => exact_entry_on_disk(&path),
        }
    }

    fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        let from = normalize_pathbuf(from);
        let to = normalize_pathbuf(to);
        let content = self.read(&from)?;
        let origin = self.origin_of(&from);
        self.entries.insert(from.clone(), None);
        self.origins.remove(&from);
        self.entries.insert(to.clone(), Some(content));
        self.origins.insert(to, origin);
        Ok(())
    }

    fn copy(&mut self, from: &Path, to: &Path) -> Result<()> {
        let content = self.read(from)?;
        self.entries.insert(normalize_pathbuf(to), Some(content));
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> Result<()> {
        self.entries.insert(normalize_pathbuf(path), None);
        Ok(())
    }

    fn list_markdown(&self, root: &Path, options: &ScanOptions) -> Result<Vec<PathBuf>> {
        let mut files: BTreeSet<PathBuf> = scan_markdown_files(root, options)?
            .into_iter()
            .collect();
        let root = normalize_pathbuf(root);
        for (path, entry) in &self.entries {
            if !path.starts_with(&root) {
                continue;
            }
            match entry {
                Some(_) if is_markdown_path(path) => {
                    files.insert(path.clone());
                }
                Some(_) => {}
                None => {
                    files.remove(path);
                }
            }
        }
        Ok(files.into_iter().collect())
    }
}

impl OverlayStore {
    fn has_removed_case_variant(&self, path: &Path) -> bool {
        let wanted = display_path(path).to_lowercase();
        self.entries.iter().any(|(candidate, entry)| {
            entry.is_none() && display_path(candidate).to_lowercase() == wanted
        })
    }
}
