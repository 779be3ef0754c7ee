use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::content_match::{ContentMatchReport, DeletedFile, UntrackedFile, match_by_content};
use crate::filesystem::is_markdown_path;
use crate::rename::{AmbiguousRename, RenameMapping, RenameSource};
use crate::vcs::{ChangeStatus, DiffRange, VersionControl};

pub const HEAD: &str = "HEAD";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub mappings: Vec<RenameMapping>,
    pub ambiguous: Vec<AmbiguousRename>,
}

impl Detection {
    fn extend(&mut self, other: Detection) {
        self.mappings.extend(other.mappings);
        self.ambiguous.extend(other.ambiguous);
    }
}

/// Independent producer of rename mappings. An unusable repository yields an
/// empty detection, never an error.
pub trait RenameDetector {
    fn name(&self) -> &'static str;
    fn detect(&self, root: &Path) -> Detection;
}

pub fn detect_all(detectors: &[&dyn RenameDetector], root: &Path) -> Detection {
    let mut detection = Detection::default();
    for detector in detectors {
        let found = detector.detect(root);
        info!(
            detector = detector.name(),
            count = found.mappings.len(),
            ambiguous = found.ambiguous.len(),
            "rename detection finished"
        );
        detection.extend(found);
    }
    detection
}

fn repository_top<V: VersionControl + ?Sized>(vcs: &V, root: &Path, detector: &str) -> Option<PathBuf> {
    if !vcs.is_work_tree(root) {
        debug!(detector, root = %root.display(), "not a version-controlled tree");
        return None;
    }
    match vcs.toplevel(root) {
        Ok(top) => Some(top),
        Err(error) => {
            warn!(detector, "cannot locate repository top level: {error:#}");
            None
        }
    }
}

pub struct UncommittedDetector<'a, V: VersionControl + ?Sized> {
    vcs: &'a V,
}

impl<'a, V: VersionControl + ?Sized> UncommittedDetector<'a, V> {
    pub fn new(vcs: &'a V) -> Self {
        Self { vcs }
    }

    fn try_detect(&self, top: &Path) -> Result<Detection> {
        let mut entries = self.vcs.diff_name_status(top, &DiffRange::Staged)?;
        entries.extend(self.vcs.diff_name_status(top, &DiffRange::Unstaged)?);

        let mut detection = Detection::default();
        let mut deleted_paths: BTreeSet<PathBuf> = BTreeSet::new();
        for entry in entries {
            match (entry.status, entry.original) {
                (ChangeStatus::Renamed, Some(original)) => detection.mappings.push(RenameMapping::new(
                    top.join(original),
                    top.join(&entry.path),
                    RenameSource::VcsUncommitted,
                )),
                (ChangeStatus::Deleted, _) if is_markdown_path(&entry.path) => {
                    deleted_paths.insert(entry.path);
                }
                _ => {}
            }
        }
        if deleted_paths.is_empty() {
            return Ok(detection);
        }

        // A failed content scan still leaves the diff renames usable.
        let report = match self.match_deleted_content(top, deleted_paths) {
            Ok(report) => report,
            Err(error) => {
                warn!("content matching skipped: {error:#}");
                return Ok(detection);
            }
        };
        for ambiguous in report.ambiguous {
            warn!(
                deleted = ?ambiguous.deleted,
                candidates = ?ambiguous.candidates,
                "ambiguous content match left unpaired"
            );
            detection
                .ambiguous
                .extend(ambiguous.deleted.into_iter().map(|old_path| AmbiguousRename {
                    old_path,
                    candidates: ambiguous.candidates.clone(),
                }));
        }
        detection.mappings.extend(report.pairs.into_iter().map(|pair| {
            RenameMapping::new(pair.deleted, pair.untracked, RenameSource::VcsUncommitted)
        }));
        Ok(detection)
    }

    fn match_deleted_content(&self, top: &Path, deleted_paths: BTreeSet<PathBuf>) -> Result<ContentMatchReport> {
        let mut deleted = Vec::new();
        for path in deleted_paths {
            match self.vcs.show_blob(top, HEAD, &path) {
                Ok(content) => deleted.push(DeletedFile {
                    path: top.join(&path),
                    content,
                }),
                Err(error) => debug!(path = %path.display(), "no committed content: {error:#}"),
            }
        }
        let mut untracked = Vec::new();
        for path in self.vcs.untracked_files(top)? {
            if !is_markdown_path(&path) {
                continue;
            }
            let absolute = top.join(&path);
            match fs::read(&absolute) {
                Ok(content) => untracked.push(UntrackedFile {
                    path: absolute,
                    content,
                }),
                Err(error) => debug!(path = %absolute.display(), "unreadable untracked file: {error}"),
            }
        }
        Ok(match_by_content(&deleted, &untracked))
    }
}

impl<V: VersionControl + ?Sized> RenameDetector for UncommittedDetector<'_, V> {
    fn name(&self) -> &'static str {
        "uncommitted"
    }

    fn detect(&self, root: &Path) -> Detection {
        let Some(top) = repository_top(self.vcs, root, self.name()) else {
            return Detection::default();
        };
        self.try_detect(&top).unwrap_or_else(|error| {
            warn!(detector = self.name(), "rename detection failed: {error:#}");
            Detection::default()
        })
    }
}

/// Committed renames since the upstream, or since the oldest reachable
/// ancestor within `window` commits.
pub struct HistoryDetector<'a, V: VersionControl + ?Sized> {
    vcs: &'a V,
    window: usize,
}

impl<'a, V: VersionControl + ?Sized> HistoryDetector<'a, V> {
    pub fn new(vcs: &'a V, window: usize) -> Self {
        Self { vcs, window }
    }

    fn baseline(&self, top: &Path) -> Option<String> {
        if let Some(upstream) = self.vcs.upstream(top) {
            return Some(upstream);
        }
        (1..=self.window)
            .rev()
            .map(|depth| format!("{HEAD}~{depth}"))
            .find(|revision| self.vcs.revision_exists(top, revision))
    }

    fn try_detect(&self, top: &Path) -> Result<Vec<RenameMapping>> {
        let Some(from) = self.baseline(top) else {
            debug!("no baseline revision within the history window");
            return Ok(Vec::new());
        };
        debug!(baseline = %from, "diffing committed history");
        let entries = self.vcs.diff_name_status(
            top,
            &DiffRange::Revisions {
                from,
                to: HEAD.to_string(),
            },
        )?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match (entry.status, entry.original) {
                (ChangeStatus::Renamed, Some(original)) => Some(RenameMapping::new(
                    top.join(original),
                    top.join(&entry.path),
                    RenameSource::VcsHistory,
                )),
                _ => None,
            })
            .collect())
    }
}

impl<V: VersionControl + ?Sized> RenameDetector for HistoryDetector<'_, V> {
    fn name(&self) -> &'static str {
        "history"
    }

    fn detect(&self, root: &Path) -> Detection {
        let Some(top) = repository_top(self.vcs, root, self.name()) else {
            return Detection::default();
        };
        let mappings = self.try_detect(&top).unwrap_or_else(|error| {
            warn!(detector = self.name(), "rename detection failed: {error:#}");
            Vec::new()
        });
        Detection {
            mappings,
            ambiguous: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{Detection, HistoryDetector, RenameDetector, UncommittedDetector, detect_all};
    use crate::rename::RenameSource;
    use crate::vcs::NameStatusEntry;
    use crate::vcs::testing::FakeVcs;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write");
    }

    #[test]
    fn not_a_work_tree_yields_nothing() {
        let vcs = FakeVcs::default();
        let root = Path::new("/nowhere");
        assert_eq!(UncommittedDetector::new(&vcs).detect(root), Detection::default());
        assert_eq!(HistoryDetector::new(&vcs, 50).detect(root), Detection::default());
    }

    #[test]
    fn uncommitted_reads_staged_renames_and_content_pairs() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("docs/moved.md"), "# Moved\nsame bytes\n");
        write_file(&root.join("docs/copy-a.md"), "dup\n");
        write_file(&root.join("docs/copy-b.md"), "dup\n");

        let mut vcs = FakeVcs::repo(root);
        vcs.staged = vec![NameStatusEntry::renamed("docs/Old.md", "docs/old.md")];
        vcs.unstaged = vec![
            NameStatusEntry::deleted("docs/original.md"),
            NameStatusEntry::deleted("docs/duplicated.md"),
        ];
        vcs.blobs.insert(
            ("HEAD".to_string(), PathBuf::from("docs/original.md")),
            b"# Moved\nsame bytes\n".to_vec(),
        );
        vcs.blobs.insert(
            ("HEAD".to_string(), PathBuf::from("docs/duplicated.md")),
            b"dup\n".to_vec(),
        );
        vcs.untracked = vec![
            PathBuf::from("docs/moved.md"),
            PathBuf::from("docs/copy-a.md"),
            PathBuf::from("docs/copy-b.md"),
        ];

        let detection = UncommittedDetector::new(&vcs).detect(root);
        let mappings = &detection.mappings;
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].old_path, root.join("docs/Old.md"));
        assert_eq!(mappings[0].new_path, root.join("docs/old.md"));
        assert_eq!(mappings[1].old_path, root.join("docs/original.md"));
        assert_eq!(mappings[1].new_path, root.join("docs/moved.md"));
        assert!(
            mappings
                .iter()
                .all(|mapping| mapping.source == RenameSource::VcsUncommitted)
        );
        assert_eq!(detection.ambiguous.len(), 1);
        assert_eq!(detection.ambiguous[0].old_path, root.join("docs/duplicated.md"));
        assert_eq!(
            detection.ambiguous[0].candidates,
            vec![root.join("docs/copy-a.md"), root.join("docs/copy-b.md")]
        );
    }

    #[test]
    fn untracked_listing_failure_keeps_diff_renames() {
        let root = Path::new("/repo");
        let mut vcs = FakeVcs::repo(root);
        vcs.staged = vec![NameStatusEntry::renamed("Old.md", "old.md")];
        vcs.unstaged = vec![NameStatusEntry::deleted("gone.md")];
        vcs.blobs.insert(
            ("HEAD".to_string(), PathBuf::from("gone.md")),
            b"gone\n".to_vec(),
        );
        vcs.untracked_error = Some("index.lock exists".to_string());

        let detection = UncommittedDetector::new(&vcs).detect(root);
        assert_eq!(detection.mappings.len(), 1);
        assert_eq!(detection.mappings[0].new_path, Path::new("/repo/old.md"));
        assert!(detection.ambiguous.is_empty());
    }

    #[test]
    fn history_prefers_upstream() {
        let root = Path::new("/repo");
        let mut vcs = FakeVcs::repo(root);
        vcs.upstream = Some("origin/main".to_string());
        vcs.revision_diffs.insert(
            ("origin/main".to_string(), "HEAD".to_string()),
            vec![
                NameStatusEntry::renamed("a.md", "b.md"),
                NameStatusEntry::deleted("c.md"),
            ],
        );
        let mappings = HistoryDetector::new(&vcs, 50).detect(root).mappings;
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].old_path, Path::new("/repo/a.md"));
        assert_eq!(mappings[0].source, RenameSource::VcsHistory);
    }

    #[test]
    fn history_walks_back_to_oldest_reachable_ancestor() {
        let root = Path::new("/repo");
        let mut vcs = FakeVcs::repo(root);
        for depth in 1..=3 {
            vcs.revisions.insert(format!("HEAD~{depth}"));
        }
        vcs.revision_diffs.insert(
            ("HEAD~3".to_string(), "HEAD".to_string()),
            vec![NameStatusEntry::renamed("x.md", "y.md")],
        );
        let mappings = HistoryDetector::new(&vcs, 50).detect(root).mappings;
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].new_path, Path::new("/repo/y.md"));

        let narrow = HistoryDetector::new(&vcs, 2).detect(root);
        assert!(narrow.mappings.is_empty());
    }

    #[test]
    fn detect_all_concatenates_in_order() {
        let root = Path::new("/repo");
        let mut vcs = FakeVcs::repo(root);
        vcs.staged = vec![NameStatusEntry::renamed("s.md", "t.md")];
        vcs.upstream = Some("origin/main".to_string());
        vcs.revision_diffs.insert(
            ("origin/main".to_string(), "HEAD".to_string()),
            vec![NameStatusEntry::renamed("h.md", "i.md")],
        );
        let uncommitted = UncommittedDetector::new(&vcs);
        let history = HistoryDetector::new(&vcs, 50);
        let mappings = detect_all(&[&uncommitted, &history], root).mappings;
        let sources: Vec<RenameSource> = mappings.iter().map(|mapping| mapping.source).collect();
        assert_eq!(
            sources,
            vec![RenameSource::VcsUncommitted, RenameSource::VcsHistory]
        );
    }
}
