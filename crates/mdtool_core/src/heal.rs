use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::filesystem::path_eq_ignore_case;
use crate::links::BrokenLink;
use crate::rename::{AmbiguousRename, RenameMapping, RenameSource, follow_chain};
use crate::rewrite::{LinkEdit, LinkUpdate, apply_link_edits, rewritten_destination};
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealSkipReason {
    AmbiguousCaseMatch,
    AmbiguousContentMatch,
    TargetMissing,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealSkip {
    pub broken: BrokenLink,
    pub reason: HealSkipReason,
    pub candidates: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealedLink {
    pub broken: BrokenLink,
    pub new_target: PathBuf,
    pub source: RenameSource,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HealReport {
    pub healed: Vec<HealedLink>,
    pub updates: Vec<LinkUpdate>,
    pub skips: Vec<HealSkip>,
    pub unresolved: Vec<BrokenLink>,
}

enum Resolution<'a> {
    Matched(&'a RenameMapping),
    Ambiguous(Vec<PathBuf>),
    Unknown,
}

/// Mapping for `target`: exact case first, then case-insensitive.
fn resolve_mapping<'a>(mappings: &'a [RenameMapping], target: &Path) -> Resolution<'a> {
    for exact in [true, false] {
        let matched: Vec<&RenameMapping> = mappings
            .iter()
            .filter(|mapping| {
                if exact {
                    mapping.old_path == target
                } else {
                    path_eq_ignore_case(&mapping.old_path, target)
                }
            })
            .collect();
        let destinations: BTreeSet<&PathBuf> =
            matched.iter().map(|mapping| &mapping.new_path).collect();
        match destinations.len() {
            0 => continue,
            1 => return Resolution::Matched(matched[0]),
            _ => return Resolution::Ambiguous(destinations.into_iter().cloned().collect()),
        }
    }
    Resolution::Unknown
}

fn ambiguous_candidates(ambiguous: &[AmbiguousRename], target: &Path) -> Option<Vec<PathBuf>> {
    let exact = ambiguous.iter().find(|entry| entry.old_path == target);
    exact
        .or_else(|| {
            ambiguous
                .iter()
                .find(|entry| path_eq_ignore_case(&entry.old_path, target))
        })
        .map(|entry| entry.candidates.clone())
}

fn final_existing_path<S: DocumentStore + ?Sized>(
    store: &S,
    mappings: &[RenameMapping],
    start: &Path,
) -> Option<PathBuf> {
    let mut chain = vec![start.to_path_buf()];
    chain.extend(follow_chain(mappings, start));
    chain.into_iter().rev().find(|path| store.exists(path))
}

/// Retarget each broken link through `mappings`, as one transactional batch.
pub fn heal_broken_links<S: DocumentStore + ?Sized>(
    store: &mut S,
    broken: &[BrokenLink],
    mappings: &[RenameMapping],
    ambiguous: &[AmbiguousRename],
    project_root: &Path,
) -> Result<HealReport> {
    let mut report = HealReport::default();
    let mut edits = Vec::new();
    for link in broken {
        let mapping = match resolve_mapping(mappings, &link.resolved) {
            Resolution::Matched(mapping) => mapping,
            Resolution::Ambiguous(candidates) => {
                debug!(
                    file = %link.link.source_file.display(),
                    line = link.link.line,
                    candidates = candidates.len(),
                    "skipping ambiguous heal"
                );
                report.skips.push(HealSkip {
                    broken: link.clone(),
                    reason: HealSkipReason::AmbiguousCaseMatch,
                    candidates,
                });
                continue;
            }
            Resolution::Unknown => {
                match ambiguous_candidates(ambiguous, &link.resolved) {
                    Some(candidates) => report.skips.push(HealSkip {
                        broken: link.clone(),
                        reason: HealSkipReason::AmbiguousContentMatch,
                        candidates,
                    }),
                    None => report.unresolved.push(link.clone()),
                }
                continue;
            }
        };
        let Some(target) = final_existing_path(&*store, mappings, &mapping.new_path) else {
            report.skips.push(HealSkip {
                broken: link.clone(),
                reason: HealSkipReason::TargetMissing,
                candidates: vec![mapping.new_path.clone()],
            });
            continue;
        };
        let new_text = rewritten_destination(&link.link, &target, project_root);
        edits.push(LinkEdit {
            file: link.link.source_file.clone(),
            line: link.link.line,
            span: link.link.span.clone(),
            old_text: link.link.destination(),
            new_text,
        });
        report.healed.push(HealedLink {
            broken: link.clone(),
            new_target: target,
            source: mapping.source,
        });
    }

    if !edits.is_empty() {
        report.updates = apply_link_edits(store, &edits)?;
        info!(healed = report.healed.len(), "healed broken links");
    }
    Ok(report)
}
