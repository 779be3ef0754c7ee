use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, warn};

use crate::filesystem::{display_path, relative_link_path};
use crate::links::LinkReference;
use crate::store::DocumentStore;

const BACKUP_SUFFIX: &str = ".mdtool-bak";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEdit {
    pub file: PathBuf,
    pub line: usize,
    pub span: Range<usize>,
    pub old_text: String,
    pub new_text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LinkUpdate {
    pub file: PathBuf,
    pub line: usize,
    pub old_destination: String,
    pub new_destination: String,
}

/// Destination text pointing `link` at `new_target`, in the link's own style.
pub fn rewritten_destination(link: &LinkReference, new_target: &Path, project_root: &Path) -> String {
    let path = if link.target.starts_with('/') {
        format!("/{}", relative_link_path(project_root, new_target))
    } else {
        let source_dir = link.source_file.parent().unwrap_or(project_root);
        let relative = relative_link_path(source_dir, new_target);
        if link.target.starts_with("./") && !relative.starts_with("../") {
            format!("./{relative}")
        } else {
            relative
        }
    };
    let path = if link.angle_bracketed {
        path
    } else {
        path.replace(' ', "%20")
    };
    format!("{path}{}", link.fragment)
}

pub fn plan_link_rewrites(links: &[LinkReference], new_target: &Path, project_root: &Path) -> Vec<LinkEdit> {
    links
        .iter()
        .filter_map(|link| {
            let old_text = link.destination();
            let new_text = rewritten_destination(link, new_target, project_root);
            (old_text != new_text).then(|| LinkEdit {
                file: link.source_file.clone(),
                line: link.line,
                span: link.span.clone(),
                old_text,
                new_text,
            })
        })
        .collect()
}

fn backup_path(file: &Path) -> PathBuf {
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    file.with_file_name(format!(".{name}{BACKUP_SUFFIX}"))
}

/// Apply `edits` to every file exactly once, all or nothing.
pub fn apply_link_edits<S: DocumentStore + ?Sized>(store: &mut S, edits: &[LinkEdit]) -> Result<Vec<LinkUpdate>> {
    let mut by_file: BTreeMap<&Path, Vec<&LinkEdit>> = BTreeMap::new();
    for edit in edits {
        by_file.entry(edit.file.as_path()).or_default().push(edit);
    }

    let mut planned: Vec<(PathBuf, String)> = Vec::with_capacity(by_file.len());
    let mut updates = Vec::new();
    for (file, mut file_edits) in by_file {
        let mut content = store.read(file)?;
        file_edits.sort_by(|left, right| right.span.start.cmp(&left.span.start));
        file_edits.dedup_by(|left, right| left.span == right.span);
        let mut previous_start = usize::MAX;
        for edit in &file_edits {
            if edit.span.end > previous_start {
                bail!(
                    "overlapping link edits in {} at line {}",
                    display_path(file),
                    edit.line
                );
            }
            match content.get(edit.span.clone()) {
                Some(current) if current == edit.old_text => {}
                _ => bail!(
                    "link at {}:{} no longer reads {:?}",
                    display_path(file),
                    edit.line,
                    edit.old_text
                ),
            }
            content.replace_range(edit.span.clone(), &edit.new_text);
            previous_start = edit.span.start;
        }
        for edit in file_edits.iter().rev() {
            updates.push(LinkUpdate {
                file: file.to_path_buf(),
                line: edit.line,
                old_destination: edit.old_text.clone(),
                new_destination: edit.new_text.clone(),
            });
        }
        planned.push((file.to_path_buf(), content));
    }

    let mut touched: Vec<(PathBuf, PathBuf)> = Vec::new();
    for (file, content) in &planned {
        let backup = backup_path(file);
        let step = store
            .copy(file, &backup)
            .map(|()| touched.push((file.clone(), backup.clone())))
            .and_then(|()| store.write(file, content));
        if let Err(error) = step {
            warn!(
                file = %file.display(),
                restored = touched.len(),
                "link rewrite failed; rolling back batch"
            );
            restore_all(store, &touched);
            return Err(error.context(format!(
                "link rewrite batch rolled back after failure in {}",
                display_path(file)
            )));
        }
        debug!(file = %file.display(), "rewrote links");
    }
    for (_, backup) in &touched {
        if let Err(error) = store.remove(backup) {
            warn!(backup = %backup.display(), "failed to remove rewrite backup: {error:#}");
        }
    }
    Ok(updates)
}

fn restore_all<S: DocumentStore + ?Sized>(store: &mut S, touched: &[(PathBuf, PathBuf)]) {
    for (file, backup) in touched.iter().rev() {
        if let Err(error) = store.copy(backup, file) {
            warn!(file = %file.display(), "failed to restore from backup: {error:#}");
        }
        if let Err(error) = store.remove(backup) {
            warn!(backup = %backup.display(), "failed to remove rewrite backup: {error:#}");
        }
    }
}
