use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::filesystem::{is_within_any, normalize_pathbuf};

/// Where a rename mapping was observed. Declaration order is priority order.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RenameSource {
    SelfCanonicalization,
    VcsUncommitted,
    VcsHistory,
}

impl RenameSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfCanonicalization => "self_canonicalization",
            Self::VcsUncommitted => "vcs_uncommitted",
            Self::VcsHistory => "vcs_history",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RenameMapping {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
    pub source: RenameSource,
}

impl RenameMapping {
    pub fn new(old_path: impl AsRef<Path>, new_path: impl AsRef<Path>, source: RenameSource) -> Self {
        Self {
            old_path: normalize_pathbuf(old_path.as_ref()),
            new_path: normalize_pathbuf(new_path.as_ref()),
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AmbiguousRename {
    pub old_path: PathBuf,
    pub candidates: Vec<PathBuf>,
}

/// Clean, scope-filter and deduplicate mappings.
pub fn normalize_mappings(mappings: Vec<RenameMapping>, scope_roots: &[PathBuf]) -> Vec<RenameMapping> {
    let mut prioritized: Vec<(usize, RenameMapping)> = mappings
        .into_iter()
        .enumerate()
        .map(|(order, mapping)| {
            (
                order,
                RenameMapping::new(&mapping.old_path, &mapping.new_path, mapping.source),
            )
        })
        .filter(|(_, mapping)| {
            let keep = mapping.old_path != mapping.new_path
                && is_within_any(&mapping.old_path, scope_roots)
                && is_within_any(&mapping.new_path, scope_roots);
            if !keep {
                debug!(
                    old = %mapping.old_path.display(),
                    new = %mapping.new_path.display(),
                    "dropping out-of-scope or identity rename mapping"
                );
            }
            keep
        })
        .collect();
    prioritized.sort_by_key(|(order, mapping)| (mapping.source, *order));

    let mut seen: BTreeSet<(PathBuf, PathBuf)> = BTreeSet::new();
    let mut kept: Vec<(usize, RenameMapping)> = prioritized
        .into_iter()
        .filter(|(_, mapping)| seen.insert((mapping.old_path.clone(), mapping.new_path.clone())))
        .collect();
    kept.sort_by_key(|(order, _)| *order);
    kept.into_iter().map(|(_, mapping)| mapping).collect()
}

/// Follow `old -> new` edges from `start` until no mapping applies.
pub fn follow_chain(mappings: &[RenameMapping], start: &Path) -> Vec<PathBuf> {
    let mut visited: BTreeSet<PathBuf> = BTreeSet::new();
    visited.insert(start.to_path_buf());
    let mut chain = Vec::new();
    let mut current = start.to_path_buf();
    while let Some(next) = mappings
        .iter()
        .find(|mapping| mapping.old_path == current)
        .map(|mapping| mapping.new_path.clone())
    {
        if !visited.insert(next.clone()) {
            break;
        }
        chain.push(next.clone());
        current = next;
    }
    chain
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{RenameMapping, RenameSource, follow_chain, normalize_mappings};

    #[test]
    fn normalize_drops_out_of_scope_identity_and_duplicates() {
        let roots = vec![PathBuf::from("/repo/docs")];
        let mappings = vec![
            RenameMapping::new("/repo/docs/a.md", "/repo/docs/b.md", RenameSource::VcsHistory),
            RenameMapping::new("/repo/docs/./a.md", "/repo/docs/b.md", RenameSource::VcsUncommitted),
            RenameMapping::new("/repo/src/x.md", "/repo/docs/x.md", RenameSource::VcsHistory),
            RenameMapping::new("/repo/docs/y.md", "/repo/outside/y.md", RenameSource::VcsHistory),
            RenameMapping::new("/repo/docs/c.md", "/repo/docs/c.md", RenameSource::VcsHistory),
            RenameMapping::new("/repo/docs/d.md", "/repo/docs/e.md", RenameSource::SelfCanonicalization),
        ];

        let normalized = normalize_mappings(mappings, &roots);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].old_path, Path::new("/repo/docs/a.md"));
        assert_eq!(normalized[0].source, RenameSource::VcsUncommitted);
        assert_eq!(normalized[1].source, RenameSource::SelfCanonicalization);
    }

    #[test]
    fn chain_follows_renames_and_stops_on_cycles() {
        let mappings = vec![
            RenameMapping::new("/r/a.md", "/r/b.md", RenameSource::VcsHistory),
            RenameMapping::new("/r/b.md", "/r/c.md", RenameSource::SelfCanonicalization),
            RenameMapping::new("/r/c.md", "/r/a.md", RenameSource::VcsHistory),
        ];
        assert_eq!(
            follow_chain(&mappings, Path::new("/r/a.md")),
            vec![PathBuf::from("/r/b.md"), PathBuf::from("/r/c.md")]
        );
        assert!(follow_chain(&mappings, Path::new("/r/z.md")).is_empty());
    }
}
