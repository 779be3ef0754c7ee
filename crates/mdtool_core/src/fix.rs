use std::collections::BTreeSet;
use std::mem;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_yaml::Mapping;
use tracing::{debug, info, warn};

use crate::config::MdtoolConfig;
use crate::detect::{HistoryDetector, RenameDetector, UncommittedDetector, detect_all};
use crate::filesystem::{
    ScanOptions, display_path, is_within_any, normalize_pathbuf, path_eq_ignore_case,
};
use crate::frontmatter::{parse_document, render_document};
use crate::heal::{HealSkip, HealedLink, heal_broken_links};
use crate::invariants::{
    Clock, UidState, alias_for, ensure_alias, ensure_uid, new_uid, refresh_fingerprint, uid_state,
};
use crate::links::{BrokenLink, find_broken_links, find_links_to};
use crate::lint::{LintIssue, LintOptions, LintRule, lint_document, suggested_path};
use crate::rename::{AmbiguousRename, RenameMapping, RenameSource, normalize_mappings};
use crate::rewrite::{LinkUpdate, apply_link_edits, plan_link_rewrites};
use crate::store::{DocumentChange, DocumentStore, OverlayStore};
use crate::vcs::{CancelFlag, VersionControl};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FixPhase {
    SnapshotBrokenLinks,
    EnsureIdentifiers,
    EnsureAliases,
    Canonicalize,
    Heal,
    Fingerprint,
    Done,
}

impl FixPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SnapshotBrokenLinks => "snapshot_broken_links",
            Self::EnsureIdentifiers => "ensure_identifiers",
            Self::EnsureAliases => "ensure_aliases",
            Self::Canonicalize => "canonicalize",
            Self::Heal => "heal",
            Self::Fingerprint => "fingerprint",
            Self::Done => "done",
        }
    }

    fn next(self) -> Self {
        match self {
            Self::SnapshotBrokenLinks => Self::EnsureIdentifiers,
            Self::EnsureIdentifiers => Self::EnsureAliases,
            Self::EnsureAliases => Self::Canonicalize,
            Self::Canonicalize => Self::Heal,
            Self::Heal => Self::Fingerprint,
            Self::Fingerprint | Self::Done => Self::Done,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixOptions {
    pub dry_run: bool,
    pub force: bool,
    /// Empty means the fix root itself.
    pub scope_roots: Vec<PathBuf>,
    pub history_window: usize,
    pub detect_vcs: bool,
    pub excluded_dirs: Vec<String>,
    pub exempt_filenames: Vec<String>,
    pub cancel: CancelFlag,
    pub backup_dir: Option<PathBuf>,
}

impl FixOptions {
    pub fn from_config(config: &MdtoolConfig, project_root: &Path) -> Self {
        Self {
            dry_run: false,
            force: false,
            scope_roots: config.scope_roots(project_root),
            history_window: config.history_window(),
            detect_vcs: config.detect_vcs(),
            excluded_dirs: config.excluded_dirs(),
            exempt_filenames: config.exempt_filenames(),
            cancel: CancelFlag::new(),
            backup_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RenameOperation {
    pub from: PathBuf,
    pub to: PathBuf,
    pub tracked: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrontmatterOpKind {
    UidInserted,
    AliasInserted,
    FingerprintUpdated,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FrontmatterOperation {
    pub file: PathBuf,
    pub kind: FrontmatterOpKind,
    pub value: String,
    pub lastmod: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FixError {
    pub file: Option<PathBuf>,
    pub phase: FixPhase,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixResult {
    pub root: PathBuf,
    pub dry_run: bool,
    pub inspected_files: usize,
    pub detected_mappings: Vec<RenameMapping>,
    pub renames: Vec<RenameOperation>,
    pub link_updates: Vec<LinkUpdate>,
    pub frontmatter_ops: Vec<FrontmatterOperation>,
    pub broken_links: Vec<BrokenLink>,
    pub healed_links: Vec<HealedLink>,
    pub heal_skips: Vec<HealSkip>,
    pub unresolved_links: Vec<BrokenLink>,
    pub manual_issues: Vec<LintIssue>,
    pub errors: Vec<FixError>,
    pub backup_dir: Option<PathBuf>,
}

impl FixResult {
    fn new(root: &Path, options: &FixOptions) -> Self {
        Self {
            root: root.to_path_buf(),
            dry_run: options.dry_run,
            inspected_files: 0,
            detected_mappings: Vec::new(),
            renames: Vec::new(),
            link_updates: Vec::new(),
            frontmatter_ops: Vec::new(),
            broken_links: Vec::new(),
            healed_links: Vec::new(),
            heal_skips: Vec::new(),
            unresolved_links: Vec::new(),
            manual_issues: Vec::new(),
            errors: Vec::new(),
            backup_dir: options.backup_dir.clone(),
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.renames.is_empty() || !self.link_updates.is_empty() || !self.frontmatter_ops.is_empty()
    }

    pub fn remaining_broken_links(&self) -> usize {
        self.unresolved_links.len() + self.heal_skips.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.remaining_broken_links() > 0
    }

    pub fn fingerprint_updates(&self) -> usize {
        self.frontmatter_ops
            .iter()
            .filter(|op| op.kind == FrontmatterOpKind::FingerprintUpdated)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FixPlan {
    pub result: FixResult,
    pub changes: Vec<DocumentChange>,
}

impl FixPlan {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Run the pipeline against an in-memory overlay; disk is never touched.
pub fn plan_fix<V: VersionControl + ?Sized>(
    root: &Path,
    options: &FixOptions,
    vcs: &V,
    clock: &dyn Clock,
) -> Result<FixPlan> {
    let mut overlay = OverlayStore::new();
    let options = FixOptions {
        dry_run: true,
        ..options.clone()
    };
    let result = run_fix_with(&mut overlay, vcs, clock, root, &options)?;
    Ok(FixPlan {
        result,
        changes: overlay.changes(),
    })
}

pub fn run_fix_with<S: DocumentStore + ?Sized, V: VersionControl + ?Sized>(
    store: &mut S,
    vcs: &V,
    clock: &dyn Clock,
    root: &Path,
    options: &FixOptions,
) -> Result<FixResult> {
    if !root.is_dir() {
        bail!("fix root does not exist: {}", root.display());
    }
    let root = normalize_pathbuf(root);
    let scope_roots = if options.scope_roots.is_empty() {
        vec![root.clone()]
    } else {
        options
            .scope_roots
            .iter()
            .map(|path| normalize_pathbuf(path))
            .collect()
    };
    let files: Vec<PathBuf> = store
        .list_markdown(
            &root,
            &ScanOptions {
                excluded_dirs: options.excluded_dirs.clone(),
            },
        )
        .with_context(|| format!("failed to scan {}", root.display()))?
        .into_iter()
        .filter(|file| is_within_any(file, &scope_roots))
        .collect();
    let vcs_top = if vcs.is_work_tree(&root) {
        vcs.toplevel(&root).ok()
    } else {
        None
    };

    let mut run = FixRun {
        store,
        vcs,
        vcs_top,
        clock,
        options,
        lint_options: LintOptions {
            project_root: root.clone(),
            exempt_filenames: options.exempt_filenames.clone(),
        },
        scope_roots,
        result: FixResult::new(&root, options),
        root,
        files,
        dirty: BTreeSet::new(),
        malformed: BTreeSet::new(),
        vcs_mappings: Vec::new(),
        vcs_ambiguous: Vec::new(),
        self_mappings: Vec::new(),
    };
    run.result.inspected_files = run.files.len();

    let mut phase = FixPhase::SnapshotBrokenLinks;
    while phase != FixPhase::Done {
        if options.cancel.is_cancelled() {
            warn!(phase = phase.as_str(), "fix cancelled");
            run.record_error(None, phase, "cancelled before phase started".to_string());
            break;
        }
        info!(phase = phase.as_str(), "fix phase");
        match phase {
            FixPhase::SnapshotBrokenLinks => run.snapshot()?,
            FixPhase::EnsureIdentifiers => run.ensure_identifiers(),
            FixPhase::EnsureAliases => run.ensure_aliases(),
            FixPhase::Canonicalize => run.canonicalize()?,
            FixPhase::Heal => run.heal()?,
            FixPhase::Fingerprint => run.fingerprint(),
            FixPhase::Done => {}
        }
        phase = phase.next();
    }

    let result = run.result;
    info!(
        renames = result.renames.len(),
        link_updates = result.link_updates.len(),
        frontmatter_ops = result.frontmatter_ops.len(),
        errors = result.errors.len(),
        dry_run = result.dry_run,
        "fix finished"
    );
    Ok(result)
}

struct FixRun<'a, S: ?Sized, V: ?Sized> {
    store: &'a mut S,
    vcs: &'a V,
    vcs_top: Option<PathBuf>,
    clock: &'a dyn Clock,
    options: &'a FixOptions,
    lint_options: LintOptions,
    scope_roots: Vec<PathBuf>,
    root: PathBuf,
    files: Vec<PathBuf>,
    dirty: BTreeSet<PathBuf>,
    malformed: BTreeSet<PathBuf>,
    vcs_mappings: Vec<RenameMapping>,
    vcs_ambiguous: Vec<AmbiguousRename>,
    self_mappings: Vec<RenameMapping>,
    result: FixResult,
}

impl<S: DocumentStore + ?Sized, V: VersionControl + ?Sized> FixRun<'_, S, V> {
    fn record_error(&mut self, file: Option<&Path>, phase: FixPhase, message: String) {
        warn!(
            phase = phase.as_str(),
            file = %file.map(display_path).unwrap_or_default(),
            "{message}"
        );
        self.result.errors.push(FixError {
            file: file.map(Path::to_path_buf),
            phase,
            message,
        });
    }

    fn snapshot(&mut self) -> Result<()> {
        self.result.broken_links = find_broken_links(&*self.store, &self.files, &self.root)?;
        debug!(count = self.result.broken_links.len(), "broken links before fix");

        if self.options.detect_vcs {
            let uncommitted = UncommittedDetector::new(self.vcs);
            let history = HistoryDetector::new(self.vcs, self.options.history_window);
            let detectors: [&dyn RenameDetector; 2] = [&uncommitted, &history];
            let detection = detect_all(&detectors, &self.root);
            self.vcs_mappings = detection.mappings;
            self.vcs_ambiguous = detection.ambiguous;
        }

        for file in self.files.clone() {
            let content = match self.store.read(&file) {
                Ok(content) => content,
                Err(error) => {
                    self.record_error(Some(file.as_path()), FixPhase::SnapshotBrokenLinks, format!("{error:#}"));
                    continue;
                }
            };
            for issue in lint_document(&file, &content, &self.lint_options) {
                if issue.rule.is_fingerprint_rule() {
                    self.dirty.insert(file.clone());
                }
                if issue.rule == LintRule::MalformedFrontmatter {
                    self.malformed.insert(file.clone());
                    self.record_error(
                        Some(file.as_path()),
                        FixPhase::SnapshotBrokenLinks,
                        format!("malformed frontmatter: {}", issue.message),
                    );
                }
                if !issue.fixable {
                    self.result.manual_issues.push(issue);
                }
            }
        }
        Ok(())
    }

    fn edit_frontmatter<F>(&mut self, file: &Path, phase: FixPhase, edit: F) -> bool
    where
        F: FnOnce(&mut Mapping, &str) -> Result<Vec<FrontmatterOperation>>,
    {
        if self.malformed.contains(file) {
            return false;
        }
        let outcome = (|| -> Result<Vec<FrontmatterOperation>> {
            let content = self.store.read(file)?;
            let mut document = parse_document(&content)
                .with_context(|| format!("failed to parse frontmatter of {}", display_path(file)))?;
            let operations = edit(&mut document.mapping, &document.body)?;
            if !operations.is_empty() {
                let rendered = render_document(&document.mapping, &document.body)?;
                if rendered != content {
                    self.store.write(file, &rendered)?;
                }
            }
            Ok(operations)
        })();
        match outcome {
            Ok(operations) if operations.is_empty() => false,
            Ok(operations) => {
                debug!(file = %file.display(), count = operations.len(), "frontmatter updated");
                self.result.frontmatter_ops.extend(operations);
                true
            }
            Err(error) => {
                self.record_error(Some(file), phase, format!("{error:#}"));
                false
            }
        }
    }

    fn ensure_identifiers(&mut self) {
        for file in self.files.clone() {
            let changed = self.edit_frontmatter(&file, FixPhase::EnsureIdentifiers, |mapping, _| {
                Ok(match ensure_uid(mapping, new_uid) {
                    Some(uid) => vec![
                        FrontmatterOperation {
                            file: file.clone(),
                            kind: FrontmatterOpKind::UidInserted,
                            value: uid.clone(),
                            lastmod: None,
                        },
                        FrontmatterOperation {
                            file: file.clone(),
                            kind: FrontmatterOpKind::AliasInserted,
                            value: alias_for(&uid),
                            lastmod: None,
                        },
                    ],
                    None => Vec::new(),
                })
            });
            if changed {
                self.dirty.insert(file);
            }
        }
    }

    fn ensure_aliases(&mut self) {
        for file in self.files.clone() {
            let changed = self.edit_frontmatter(&file, FixPhase::EnsureAliases, |mapping, _| {
                let UidState::Valid(uid) = uid_state(mapping) else {
                    return Ok(Vec::new());
                };
                if !ensure_alias(mapping, &uid) {
                    return Ok(Vec::new());
                }
                Ok(vec![FrontmatterOperation {
                    file: file.clone(),
                    kind: FrontmatterOpKind::AliasInserted,
                    value: alias_for(&uid),
                    lastmod: None,
                }])
            });
            if changed {
                self.dirty.insert(file);
            }
        }
    }

    fn is_tracked(&self, file: &Path) -> bool {
        let Some(top) = self.vcs_top.as_deref() else {
            return false;
        };
        file.strip_prefix(top)
            .is_ok_and(|relative| self.vcs.is_tracked(top, relative))
    }

    fn move_file(&mut self, from: &Path, to: &Path, tracked: bool) -> Result<()> {
        if tracked
            && !self.options.dry_run
            && let Some(top) = self.vcs_top.clone()
            && let (Ok(relative_from), Ok(relative_to)) = (from.strip_prefix(&top), to.strip_prefix(&top))
        {
            return self.vcs.move_path(&top, relative_from, relative_to);
        }
        self.store.rename(from, to)
    }

    fn target_collides(&self, file: &Path, target: &Path) -> bool {
        if !self.store.exists(target) {
            return false;
        }
        // Case-insensitive filesystems report the source itself under the new casing.
        !(path_eq_ignore_case(file, target) && !self.store.has_exact_entry(target))
    }

    fn canonicalize(&mut self) -> Result<()> {
        for file in self.files.clone() {
            let Some(target) = suggested_path(&file, &self.options.exempt_filenames) else {
                continue;
            };
            if self.target_collides(&file, &target) && !self.options.force {
                self.record_error(
                    Some(file.as_path()),
                    FixPhase::Canonicalize,
                    format!("rename target already exists: {}", display_path(&target)),
                );
                continue;
            }

            let mut links = find_links_to(&*self.store, &self.files, &file, &self.root)?;
            for link in &mut links {
                if link.source_file == file {
                    link.source_file = target.clone();
                }
            }
            let edits = plan_link_rewrites(&links, &target, &self.root);

            let tracked = self.is_tracked(&file) && !self.target_collides(&file, &target);
            if let Err(error) = self.move_file(&file, &target, tracked) {
                self.record_error(Some(file.as_path()), FixPhase::Canonicalize, format!("{error:#}"));
                continue;
            }

            let updates = match apply_link_edits(&mut *self.store, &edits) {
                Ok(updates) => updates,
                Err(error) => {
                    self.record_error(Some(file.as_path()), FixPhase::Canonicalize, format!("{error:#}"));
                    if let Err(revert) = self.move_file(&target, &file, tracked) {
                        self.record_error(
                            Some(target.as_path()),
                            FixPhase::Canonicalize,
                            format!("failed to revert rename: {revert:#}"),
                        );
                    }
                    continue;
                }
            };

            info!(
                from = %file.display(),
                to = %target.display(),
                links = updates.len(),
                "renamed to canonical file name"
            );
            if self.dirty.remove(&file) {
                self.dirty.insert(target.clone());
            }
            if self.malformed.remove(&file) {
                self.malformed.insert(target.clone());
            }
            for update in &updates {
                self.dirty.insert(update.file.clone());
            }
            if let Some(slot) = self.files.iter_mut().find(|candidate| **candidate == file) {
                *slot = target.clone();
            }
            self.files.sort();
            self.files.dedup();
            self.self_mappings.push(RenameMapping::new(
                &file,
                &target,
                RenameSource::SelfCanonicalization,
            ));
            self.result.renames.push(RenameOperation {
                from: file,
                to: target,
                tracked,
            });
            self.result.link_updates.extend(updates);
        }
        Ok(())
    }

    fn heal(&mut self) -> Result<()> {
        let mut union = mem::take(&mut self.self_mappings);
        union.append(&mut self.vcs_mappings);
        let mappings = normalize_mappings(union, &self.scope_roots);
        self.result.detected_mappings = mappings.clone();

        let broken = find_broken_links(&*self.store, &self.files, &self.root)?;
        if broken.is_empty() {
            return Ok(());
        }
        let scope_roots = &self.scope_roots;
        let ambiguous: Vec<AmbiguousRename> = mem::take(&mut self.vcs_ambiguous)
            .into_iter()
            .filter(|entry| is_within_any(&entry.old_path, scope_roots))
            .collect();
        match heal_broken_links(&mut *self.store, &broken, &mappings, &ambiguous, &self.root) {
            Ok(report) => {
                for healed in &report.healed {
                    self.dirty.insert(healed.broken.link.source_file.clone());
                }
                self.result.healed_links = report.healed;
                self.result.link_updates.extend(report.updates);
                self.result.heal_skips = report.skips;
                self.result.unresolved_links = report.unresolved;
            }
            Err(error) => {
                self.record_error(None, FixPhase::Heal, format!("{error:#}"));
                self.result.unresolved_links = broken;
            }
        }
        Ok(())
    }

    fn fingerprint(&mut self) {
        let clock = self.clock;
        for file in mem::take(&mut self.dirty) {
            self.edit_frontmatter(&file, FixPhase::Fingerprint, |mapping, body| {
                Ok(refresh_fingerprint(mapping, body, clock)?
                    .map(|change| FrontmatterOperation {
                        file: file.clone(),
                        kind: FrontmatterOpKind::FingerprintUpdated,
                        value: change.fingerprint,
                        lastmod: Some(change.lastmod),
                    })
                    .into_iter()
                    .collect())
            });
        }
    }
}
