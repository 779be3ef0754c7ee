use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::filesystem::display_path;
use crate::frontmatter::{key, parse_mapping, split};
use crate::invariants::{
    UidState, alias_for, compute_fingerprint, has_alias, stored_fingerprint, uid_state,
};
use crate::links::find_broken_links;
use crate::store::DocumentStore;

const TAXONOMY_KEYS: &[&str] = &["tags", "categories"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LintRule {
    FilenameConvention,
    MalformedFrontmatter,
    MissingUid,
    MalformedUid,
    MissingUidAlias,
    MissingFingerprint,
    StaleFingerprint,
    TaxonomyCasing,
    BrokenLink,
}

impl LintRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FilenameConvention => "filename-convention",
            Self::MalformedFrontmatter => "malformed-frontmatter",
            Self::MissingUid => "missing-uid",
            Self::MalformedUid => "malformed-uid",
            Self::MissingUidAlias => "missing-uid-alias",
            Self::MissingFingerprint => "missing-fingerprint",
            Self::StaleFingerprint => "stale-fingerprint",
            Self::TaxonomyCasing => "taxonomy-casing",
            Self::BrokenLink => "broken-link",
        }
    }

    /// Whether `fix` acts on this rule (broken links are attempted by healing).
    pub fn is_fixable(self) -> bool {
        !matches!(
            self,
            Self::MalformedFrontmatter | Self::MalformedUid | Self::TaxonomyCasing
        )
    }

    pub fn is_fingerprint_rule(self) -> bool {
        matches!(self, Self::MissingFingerprint | Self::StaleFingerprint)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LintIssue {
    pub file: PathBuf,
    pub line: usize,
    pub rule: LintRule,
    pub message: String,
    pub fixable: bool,
}

impl LintIssue {
    fn new(file: &Path, line: usize, rule: LintRule, message: impl Into<String>) -> Self {
        Self {
            file: file.to_path_buf(),
            line,
            rule,
            message: message.into(),
            fixable: rule.is_fixable(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LintReport {
    pub root: PathBuf,
    pub inspected_files: usize,
    pub total_issues: usize,
    pub fixable_issues: usize,
    pub issues: Vec<LintIssue>,
}

#[derive(Debug, Clone, Default)]
pub struct LintOptions {
    pub project_root: PathBuf,
    pub exempt_filenames: Vec<String>,
}

/// Lower-case, whitespace runs collapsed to `-`, extension lower-cased.
pub fn canonical_file_name(name: &str) -> String {
    let (stem, extension) = match name.rfind('.') {
        Some(index) if index > 0 => (&name[..index], Some(&name[index + 1..])),
        _ => (name, None),
    };
    let stem = stem
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    match extension {
        Some(extension) => format!("{stem}.{}", extension.to_lowercase()),
        None => stem,
    }
}

pub fn is_exempt(name: &str, exempt: &[String]) -> bool {
    exempt
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

/// Canonical sibling path for `path`, `None` when already canonical or exempt.
pub fn suggested_path(path: &Path, exempt: &[String]) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    if is_exempt(name, exempt) {
        return None;
    }
    let canonical = canonical_file_name(name);
    (canonical != name).then(|| path.with_file_name(canonical))
}

/// 1-based line of a top-level frontmatter key, or 1 when not found.
fn key_line(content: &str, name: &str) -> usize {
    let prefix = format!("{name}:");
    split(content)
        .frontmatter
        .and_then(|yaml| {
            yaml.lines()
                .position(|line| line.starts_with(&prefix))
                .map(|index| index + 2)
        })
        .unwrap_or(1)
}

/// Per-document rules. Broken links need the whole tree; see [`lint_tree`].
pub fn lint_document(path: &Path, content: &str, options: &LintOptions) -> Vec<LintIssue> {
    let mut issues = Vec::new();
    if let Some(suggested) = suggested_path(path, &options.exempt_filenames) {
        let suggested_name = suggested
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        issues.push(LintIssue::new(
            path,
            1,
            LintRule::FilenameConvention,
            format!("file name should be {suggested_name}"),
        ));
    }

    let parts = split(content);
    let mapping = match parts.frontmatter.map(parse_mapping).transpose() {
        Ok(mapping) => mapping.unwrap_or_default(),
        Err(error) => {
            issues.push(LintIssue::new(
                path,
                1,
                LintRule::MalformedFrontmatter,
                format!("{error:#}"),
            ));
            return issues;
        }
    };

    match uid_state(&mapping) {
        UidState::Missing => {
            issues.push(LintIssue::new(path, 1, LintRule::MissingUid, "uid is missing"));
        }
        UidState::Malformed(value) => {
            issues.push(LintIssue::new(
                path,
                key_line(content, "uid"),
                LintRule::MalformedUid,
                format!("uid {value:?} is not a UUID; it is kept as-is"),
            ));
        }
        UidState::Valid(uid) => {
            if !has_alias(&mapping, &uid) {
                issues.push(LintIssue::new(
                    path,
                    key_line(content, "aliases"),
                    LintRule::MissingUidAlias,
                    format!("aliases lacks {}", alias_for(&uid)),
                ));
            }
        }
    }

    match stored_fingerprint(&mapping) {
        None => issues.push(LintIssue::new(
            path,
            1,
            LintRule::MissingFingerprint,
            "fingerprint is missing",
        )),
        Some(stored) => match compute_fingerprint(&mapping, parts.body) {
            Ok(computed) if computed != stored => issues.push(LintIssue::new(
                path,
                key_line(content, "fingerprint"),
                LintRule::StaleFingerprint,
                "fingerprint does not match content",
            )),
            Ok(_) => {}
            Err(error) => issues.push(LintIssue::new(
                path,
                1,
                LintRule::MalformedFrontmatter,
                format!("{error:#}"),
            )),
        },
    }

    issues.extend(taxonomy_issues(path, content, &mapping));
    issues
}

fn taxonomy_issues(path: &Path, content: &str, mapping: &Mapping) -> Vec<LintIssue> {
    let mut issues = Vec::new();
    for name in TAXONOMY_KEYS {
        let terms: Vec<&str> = match mapping.get(key(name)) {
            Some(Value::String(term)) => vec![term.as_str()],
            Some(Value::Sequence(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => continue,
        };
        for term in terms {
            if term != term.to_lowercase() {
                issues.push(LintIssue::new(
                    path,
                    key_line(content, name),
                    LintRule::TaxonomyCasing,
                    format!("{name} entry {term:?} should be {:?}", term.to_lowercase()),
                ));
            }
        }
    }
    issues
}

pub fn lint_tree<S: DocumentStore + ?Sized>(
    store: &S,
    files: &[PathBuf],
    options: &LintOptions,
) -> Result<LintReport> {
    let mut issues = Vec::new();
    for file in files {
        let content = store.read(file)?;
        issues.extend(lint_document(file, &content, options));
    }
    for broken in find_broken_links(store, files, &options.project_root)? {
        issues.push(LintIssue::new(
            &broken.link.source_file,
            broken.link.line,
            LintRule::BrokenLink,
            format!(
                "{} link target does not exist: {}",
                broken.link.kind.as_str(),
                display_path(&broken.resolved)
            ),
        ));
    }
    issues.sort_by(|left, right| {
        (&left.file, left.line, left.rule).cmp(&(&right.file, right.line, right.rule))
    });

    let fixable_issues = issues.iter().filter(|issue| issue.fixable).count();
    Ok(LintReport {
        root: options.project_root.clone(),
        inspected_files: files.len(),
        total_issues: issues.len(),
        fixable_issues,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{LintOptions, LintRule, canonical_file_name, lint_document, lint_tree, suggested_path};
    use crate::frontmatter::parse_document;
    use crate::invariants::compute_fingerprint;
    use crate::store::FsStore;

    const UID: &str = "7d4f3a9e-2b1c-4c8e-9f00-1234567890ab";

    fn options() -> LintOptions {
        LintOptions {
            project_root: PathBuf::from("/r"),
            exempt_filenames: vec!["README.md".to_string()],
        }
    }

    fn rules(issues: &[super::LintIssue]) -> Vec<LintRule> {
        issues.iter().map(|issue| issue.rule).collect()
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_file_name("BadName.md"), "badname.md");
        assert_eq!(canonical_file_name("My  Great Page.MD"), "my-great-page.md");
        assert_eq!(canonical_file_name("already-fine.md"), "already-fine.md");
        assert_eq!(suggested_path(Path::new("/r/README.md"), &["readme.md".to_string()]), None);
        assert_eq!(
            suggested_path(Path::new("/r/docs/Guide.md"), &[]),
            Some(PathBuf::from("/r/docs/guide.md"))
        );
    }

    #[test]
    fn reports_missing_invariants_and_taxonomy_casing() {
        let content = "---\ntitle: A\ntags:\n  - Rust\n  - cli\n---\nbody\n";
        let issues = lint_document(Path::new("/r/docs/Page.md"), content, &options());
        assert_eq!(
            rules(&issues),
            vec![
                LintRule::FilenameConvention,
                LintRule::MissingUid,
                LintRule::MissingFingerprint,
                LintRule::TaxonomyCasing,
            ]
        );
        assert_eq!(issues[3].line, 3);
        assert!(!issues[3].fixable);
    }

    #[test]
    fn malformed_uid_and_missing_alias() {
        let malformed = lint_document(
            Path::new("/r/a.md"),
            "---\ntitle: A\nuid: nope\n---\n",
            &options(),
        );
        let issue = malformed
            .iter()
            .find(|issue| issue.rule == LintRule::MalformedUid)
            .expect("malformed uid");
        assert_eq!(issue.line, 3);
        assert!(!issue.fixable);

        let missing_alias = lint_document(
            Path::new("/r/a.md"),
            &format!("---\nuid: {UID}\naliases: [/old/]\n---\n"),
            &options(),
        );
        assert!(rules(&missing_alias).contains(&LintRule::MissingUidAlias));
    }

    #[test]
    fn clean_document_has_no_issues_and_stale_fingerprint_is_caught() {
        let base = format!("---\ntitle: A\nuid: {UID}\naliases:\n- /_uid/{UID}/\n---\nbody\n");
        let document = parse_document(&base).expect("parse");
        let fingerprint = compute_fingerprint(&document.mapping, &document.body).expect("fp");
        let clean = base.replacen("title: A\n", &format!("title: A\nfingerprint: {fingerprint}\n"), 1);
        assert!(lint_document(Path::new("/r/a.md"), &clean, &options()).is_empty());

        let edited = clean.replace("body\n", "body edited\n");
        let issues = lint_document(Path::new("/r/a.md"), &edited, &options());
        assert_eq!(rules(&issues), vec![LintRule::StaleFingerprint]);
        assert_eq!(issues[0].line, 3);
    }

    #[test]
    fn malformed_frontmatter_stops_frontmatter_rules() {
        let issues = lint_document(Path::new("/r/a.md"), "---\n- a\n---\nbody\n", &options());
        assert_eq!(rules(&issues), vec![LintRule::MalformedFrontmatter]);
    }

    #[test]
    fn tree_lint_adds_broken_links() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::write(root.join("index.md"), "[gone](missing.md)\n").expect("write");
        let report = lint_tree(
            &FsStore,
            &[root.join("index.md")],
            &LintOptions {
                project_root: root.to_path_buf(),
                exempt_filenames: Vec::new(),
            },
        )
        .expect("lint");
        assert_eq!(report.inspected_files, 1);
        assert!(
            report
                .issues
                .iter()
                .any(|issue| issue.rule == LintRule::BrokenLink && issue.line == 1)
        );
        assert_eq!(report.total_issues, report.issues.len());
    }
}
