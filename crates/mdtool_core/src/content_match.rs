use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::filesystem::content_digest;

/// A file that disappeared, with the bytes it last had.
#[derive(Debug, Clone)]
pub struct DeletedFile {
    pub path: PathBuf,
    pub content: Vec<u8>,
}

/// A file that appeared without provenance.
#[derive(Debug, Clone)]
pub struct UntrackedFile {
    pub path: PathBuf,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContentPair {
    pub deleted: PathBuf,
    pub untracked: PathBuf,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AmbiguousMatch {
    pub deleted: Vec<PathBuf>,
    pub candidates: Vec<PathBuf>,
    pub digest: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ContentMatchReport {
    pub pairs: Vec<ContentPair>,
    pub ambiguous: Vec<AmbiguousMatch>,
}

/// Pair deleted files with untracked files by digest equality.
///
/// A pair is emitted only when exactly one deleted file and exactly one
/// untracked file share a digest. Anything else is reported as ambiguous and
/// never guessed.
pub fn match_by_content(deleted: &[DeletedFile], untracked: &[UntrackedFile]) -> ContentMatchReport {
    let mut untracked_by_digest: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for file in untracked {
        untracked_by_digest
            .entry(content_digest(&file.content))
            .or_default()
            .push(file.path.clone());
    }
    let mut deleted_by_digest: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for file in deleted {
        deleted_by_digest
            .entry(content_digest(&file.content))
            .or_default()
            .push(file.path.clone());
    }

    let mut report = ContentMatchReport::default();
    for (digest, deleted_paths) in deleted_by_digest {
        let Some(candidates) = untracked_by_digest.get(&digest) else {
            continue;
        };
        if let ([deleted], [untracked]) = (deleted_paths.as_slice(), candidates.as_slice()) {
            report.pairs.push(ContentPair {
                deleted: deleted.clone(),
                untracked: untracked.clone(),
                digest,
            });
        } else {
            report.ambiguous.push(AmbiguousMatch {
                deleted: deleted_paths,
                candidates: candidates.clone(),
                digest,
            });
        }
    }
    report.pairs.sort_by(|left, right| left.deleted.cmp(&right.deleted));
    report
}
