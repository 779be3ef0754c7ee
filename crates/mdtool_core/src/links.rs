use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::filesystem::{normalize_pathbuf, path_eq_ignore_case, percent_decode};
use crate::frontmatter::split;
use crate::invariants::UID_ALIAS_PREFIX;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Inline,
    Image,
    ReferenceDefinition,
}

impl LinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Image => "image",
            Self::ReferenceDefinition => "reference_definition",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LinkReference {
    pub source_file: PathBuf,
    /// 1-based line in the original file, frontmatter included.
    pub line: usize,
    pub kind: LinkKind,
    pub target: String,
    pub fragment: String,
    /// Byte span of the destination text (inside `<>` when bracketed).
    pub span: Range<usize>,
    pub label_span: Range<usize>,
    pub angle_bracketed: bool,
    /// Absolute target for local file links, `None` for everything else.
    pub resolved: Option<PathBuf>,
}

impl LinkReference {
    pub fn destination(&self) -> String {
        format!("{}{}", self.target, self.fragment)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BrokenLink {
    pub link: LinkReference,
    pub resolved: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawLink {
    kind: LinkKind,
    line: usize,
    span: Range<usize>,
    label_span: Range<usize>,
    angle_bracketed: bool,
}

/// Every link in `content`, classified and resolved relative to `source_file`.
pub fn document_links(source_file: &Path, content: &str, project_root: &Path) -> Vec<LinkReference> {
    let source_dir = source_file.parent().unwrap_or(project_root);
    extract_raw_links(content)
        .into_iter()
        .map(|raw| {
            let destination = &content[raw.span.clone()];
            let (target, fragment) = match destination.find('#') {
                Some(index) => (&destination[..index], &destination[index..]),
                None => (destination, ""),
            };
            let resolved = if is_local_destination(destination) && !target.is_empty() {
                Some(resolve_target(source_dir, project_root, target))
            } else {
                None
            };
            LinkReference {
                source_file: source_file.to_path_buf(),
                line: raw.line,
                kind: raw.kind,
                target: target.to_string(),
                fragment: fragment.to_string(),
                span: raw.span,
                label_span: raw.label_span,
                angle_bracketed: raw.angle_bracketed,
                resolved,
            }
        })
        .collect()
}

pub fn is_local_destination(destination: &str) -> bool {
    let destination = destination.trim();
    if destination.is_empty()
        || destination.starts_with('#')
        || destination.starts_with("//")
        || destination.starts_with("{{")
        || destination.starts_with(UID_ALIAS_PREFIX)
    {
        return false;
    }
    if has_scheme(destination) {
        return false;
    }
    let before_fragment = destination.split('#').next().unwrap_or_default();
    !(before_fragment.contains('@') && !before_fragment.contains('/'))
}

fn has_scheme(destination: &str) -> bool {
    let Some(colon) = destination.find(':') else {
        return false;
    };
    let scheme = &destination[..colon];
    // Single letters are drive prefixes, not schemes.
    scheme.len() >= 2
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

pub fn resolve_target(source_dir: &Path, project_root: &Path, target: &str) -> PathBuf {
    let decoded = percent_decode(target);
    let joined = match decoded.strip_prefix('/') {
        Some(site_relative) => project_root.join(site_relative),
        None => source_dir.join(&decoded),
    };
    normalize_pathbuf(&joined)
}

/// Links in `files` whose resolved target equals `target`, ignoring case.
pub fn find_links_to<S: DocumentStore + ?Sized>(
    store: &S,
    files: &[PathBuf],
    target: &Path,
    project_root: &Path,
) -> Result<Vec<LinkReference>> {
    let mut found = Vec::new();
    for file in files {
        let content = store.read(file)?;
        found.extend(
            document_links(file, &content, project_root)
                .into_iter()
                .filter(|link| {
                    link.resolved
                        .as_deref()
                        .is_some_and(|resolved| path_eq_ignore_case(resolved, target))
                }),
        );
    }
    debug!(
        path = %target.display(),
        count = found.len(),
        "located links to target"
    );
    Ok(found)
}

pub fn find_broken_links<S: DocumentStore + ?Sized>(
    store: &S,
    files: &[PathBuf],
    project_root: &Path,
) -> Result<Vec<BrokenLink>> {
    let mut broken = Vec::new();
    for file in files {
        let content = store.read(file)?;
        for link in document_links(file, &content, project_root) {
            let Some(resolved) = link.resolved.clone() else {
                continue;
            };
            if !store.exists(&resolved) {
                broken.push(BrokenLink { link, resolved });
            }
        }
    }
    Ok(broken)
}

fn extract_raw_links(content: &str) -> Vec<RawLink> {
    let body = split(content);
    let mut links = Vec::new();
    let mut fence: Option<(u8, usize)> = None;
    let mut offset = body.body_offset;
    let mut line_number = body.body_line;

    for raw_line in body.body.split_inclusive('\n') {
        line_number += 1;
        let line_start = offset;
        offset += raw_line.len();
        let line = raw_line.trim_end_matches(['\n', '\r']);

        if let Some((open_char, open_len)) = fence {
            if closes_fence(line, open_char, open_len) {
                fence = None;
            }
            continue;
        }
        if let Some(marker) = fence_marker(line) {
            fence = Some(marker);
            continue;
        }
        if let Some(raw) = parse_reference_definition(line, line_start, line_number) {
            links.push(raw);
            continue;
        }
        scan_inline_links(line, line_start, line_number, &mut links);
    }
    links.sort_by_key(|link| link.span.start);
    links
}

fn fence_marker(line: &str) -> Option<(u8, usize)> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line.as_bytes()[indent..];
    let marker = *rest.first()?;
    if marker != b'`' && marker != b'~' {
        return None;
    }
    let run = rest.iter().take_while(|byte| **byte == marker).count();
    if run < 3 {
        return None;
    }
    if marker == b'`' && rest[run..].contains(&b'`') {
        return None;
    }
    Some((marker, run))
}

fn closes_fence(line: &str, open_char: u8, open_len: usize) -> bool {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return false;
    }
    let rest = &line.as_bytes()[indent..];
    let run = rest.iter().take_while(|byte| **byte == open_char).count();
    run >= open_len && rest[run..].iter().all(u8::is_ascii_whitespace)
}

/// `[label]: destination "title"` with at most three spaces of indent.
fn parse_reference_definition(line: &str, line_start: usize, line_number: usize) -> Option<RawLink> {
    let bytes = line.as_bytes();
    let indent = bytes.iter().take_while(|byte| **byte == b' ').count();
    if indent > 3 || bytes.get(indent) != Some(&b'[') {
        return None;
    }
    let label_start = indent + 1;
    if bytes.get(label_start) == Some(&b'^') {
        // Footnote definition.
        return None;
    }
    let mut cursor = label_start;
    while cursor < bytes.len() {
        match bytes[cursor] {
            b'\\' => cursor += 2,
            b'[' => return None,
            b']' => break,
            _ => cursor += 1,
        }
    }
    if cursor >= bytes.len() || cursor == label_start || bytes.get(cursor + 1) != Some(&b':') {
        return None;
    }
    let label_end = cursor;
    cursor += 2;
    while cursor < bytes.len() && (bytes[cursor] == b' ' || bytes[cursor] == b'\t') {
        cursor += 1;
    }
    let (dest_start, dest_end, angle) = if bytes.get(cursor) == Some(&b'<') {
        let close = line[cursor + 1..].find('>')? + cursor + 1;
        (cursor + 1, close, true)
    } else {
        let start = cursor;
        while cursor < bytes.len() && !bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor == start {
            return None;
        }
        (start, cursor, false)
    };
    Some(RawLink {
        kind: LinkKind::ReferenceDefinition,
        line: line_number,
        span: line_start + dest_start..line_start + dest_end,
        label_span: line_start + label_start..line_start + label_end,
        angle_bracketed: angle,
    })
}

/// Byte mask of inline code spans: equal-length backtick runs.
fn code_span_mask(bytes: &[u8]) -> Vec<bool> {
    let mut mask = vec![false; bytes.len()];
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'\\' {
            index += 2;
            continue;
        }
        if bytes[index] != b'`' {
            index += 1;
            continue;
        }
        let start = index;
        while index < bytes.len() && bytes[index] == b'`' {
            index += 1;
        }
        let run = index - start;
        let mut scan = index;
        while scan < bytes.len() {
            if bytes[scan] != b'`' {
                scan += 1;
                continue;
            }
            let close_start = scan;
            while scan < bytes.len() && bytes[scan] == b'`' {
                scan += 1;
            }
            if scan - close_start == run {
                mask[start..scan].fill(true);
                index = scan;
                break;
            }
        }
    }
    mask
}

struct InlineMatch {
    label: Range<usize>,
    destination: Range<usize>,
    angle_bracketed: bool,
    end: usize,
}

fn scan_inline_links(line: &str, line_start: usize, line_number: usize, out: &mut Vec<RawLink>) {
    let bytes = line.as_bytes();
    let mask = code_span_mask(bytes);
    // Close-bracket index -> end of that link, so destinations are never rescanned
    // while labels still are (images nested in link labels).
    let mut skips: BTreeMap<usize, usize> = BTreeMap::new();
    let mut index = 0usize;
    while index < bytes.len() {
        if let Some(end) = skips.remove(&index) {
            index = end;
            continue;
        }
        if mask[index] {
            index += 1;
            continue;
        }
        match bytes[index] {
            b'\\' => {
                index += 2;
                continue;
            }
            b'[' => {
                if let Some(found) = parse_inline_at(bytes, &mask, index) {
                    let image = index > 0
                        && bytes[index - 1] == b'!'
                        && (index < 2 || bytes[index - 2] != b'\\');
                    out.push(RawLink {
                        kind: if image {
                            LinkKind::Image
                        } else {
                            LinkKind::Inline
                        },
                        line: line_number,
                        span: line_start + found.destination.start
                            ..line_start + found.destination.end,
                        label_span: line_start + found.label.start..line_start + found.label.end,
                        angle_bracketed: found.angle_bracketed,
                    });
                    skips.insert(found.label.end, found.end);
                }
            }
            _ => {}
        }
        index += 1;
    }
}

fn parse_inline_at(bytes: &[u8], mask: &[bool], open: usize) -> Option<InlineMatch> {
    let mut depth = 1usize;
    let mut cursor = open + 1;
    while cursor < bytes.len() {
        if mask[cursor] {
            cursor += 1;
            continue;
        }
        match bytes[cursor] {
            b'\\' => {
                cursor += 2;
                continue;
            }
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
        cursor += 1;
    }
    if cursor >= bytes.len() {
        return None;
    }
    let label = open + 1..cursor;
    if bytes.get(cursor + 1) != Some(&b'(') || mask[cursor + 1] {
        return None;
    }
    cursor += 2;
    cursor = skip_spaces(bytes, cursor);

    let (destination, angle_bracketed) = if bytes.get(cursor) == Some(&b'<') {
        let start = cursor + 1;
        let mut close = start;
        while close < bytes.len() && bytes[close] != b'>' {
            if bytes[close] == b'<' {
                return None;
            }
            close += 1;
        }
        if close >= bytes.len() {
            return None;
        }
        cursor = close + 1;
        (start..close, true)
    } else {
        let start = cursor;
        let mut parens = 0usize;
        while cursor < bytes.len() {
            match bytes[cursor] {
                b'\\' => {
                    cursor += 2;
                    continue;
                }
                byte if byte.is_ascii_whitespace() => break,
                b'(' => parens += 1,
                b')' => {
                    if parens == 0 {
                        break;
                    }
                    parens -= 1;
                }
                _ => {}
            }
            cursor += 1;
        }
        cursor = cursor.min(bytes.len());
        (start..cursor, false)
    };

    cursor = skip_spaces(bytes, cursor);
    if let Some(&opener) = bytes.get(cursor)
        && matches!(opener, b'"' | b'\'' | b'(')
    {
        let closer = if opener == b'(' { b')' } else { opener };
        cursor += 1;
        while cursor < bytes.len() && bytes[cursor] != closer {
            if bytes[cursor] == b'\\' {
                cursor += 1;
            }
            cursor += 1;
        }
        if cursor >= bytes.len() {
            return None;
        }
        cursor = skip_spaces(bytes, cursor + 1);
    }
    if bytes.get(cursor) != Some(&b')') {
        return None;
    }
    Some(InlineMatch {
        label,
        destination,
        angle_bracketed,
        end: cursor + 1,
    })
}

fn skip_spaces(bytes: &[u8], mut cursor: usize) -> usize {
    while cursor < bytes.len() && (bytes[cursor] == b' ' || bytes[cursor] == b'\t') {
        cursor += 1;
    }
    cursor
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{LinkKind, document_links, find_broken_links, find_links_to, is_local_destination};
    use crate::store::FsStore;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write");
    }

    #[test]
    fn extracts_three_kinds_with_original_line_numbers() {
        let content = "---\ntitle: Doc\n---\nSee [guide](guide.md#setup \"Guide\").\n\n![diagram](img/arch.png)\n\n[ref]: ../other.md\n";
        let links = document_links(Path::new("/r/docs/a.md"), content, Path::new("/r"));
        assert_eq!(links.len(), 3);

        assert_eq!(links[0].kind, LinkKind::Inline);
        assert_eq!(links[0].line, 4);
        assert_eq!(links[0].target, "guide.md");
        assert_eq!(links[0].fragment, "#setup");
        assert_eq!(&content[links[0].span.clone()], "guide.md#setup");
        assert_eq!(&content[links[0].label_span.clone()], "guide");
        assert_eq!(links[0].resolved, Some(PathBuf::from("/r/docs/guide.md")));

        assert_eq!(links[1].kind, LinkKind::Image);
        assert_eq!(links[1].line, 6);
        assert_eq!(links[1].resolved, Some(PathBuf::from("/r/docs/img/arch.png")));

        assert_eq!(links[2].kind, LinkKind::ReferenceDefinition);
        assert_eq!(links[2].line, 8);
        assert_eq!(links[2].resolved, Some(PathBuf::from("/r/other.md")));
    }

    #[test]
    fn code_blocks_and_spans_are_skipped() {
        let content = "```md\n[a](inside-fence.md)\n```\n~~~~\n[b](tilde.md)\n~~~~\nUse `[c](span.md)` or [d](real.md).\n";
        let links = document_links(Path::new("/r/a.md"), content, Path::new("/r"));
        let targets: Vec<&str> = links.iter().map(|link| link.target.as_str()).collect();
        assert_eq!(targets, vec!["real.md"]);
        assert_eq!(links[0].line, 7);
    }

    #[test]
    fn image_nested_in_link_yields_both() {
        let content = "[![badge](badge.svg)](docs/page.md)\n";
        let links = document_links(Path::new("/r/a.md"), content, Path::new("/r"));
        let kinds: Vec<(LinkKind, &str)> = links
            .iter()
            .map(|link| (link.kind, link.target.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![(LinkKind::Image, "badge.svg"), (LinkKind::Inline, "docs/page.md")]
        );
    }

    #[test]
    fn angle_brackets_escapes_and_site_root_links() {
        let content = "[a](<my file.md>) \\[not](a-link.md) [b](/docs/top.md) [c](my%20doc.md)\n";
        let links = document_links(Path::new("/r/docs/x/a.md"), content, Path::new("/r"));
        assert_eq!(links.len(), 3);
        assert!(links[0].angle_bracketed);
        assert_eq!(links[0].resolved, Some(PathBuf::from("/r/docs/x/my file.md")));
        assert_eq!(links[1].resolved, Some(PathBuf::from("/r/docs/top.md")));
        assert_eq!(links[2].resolved, Some(PathBuf::from("/r/docs/x/my doc.md")));
    }

    #[test]
    fn non_local_destinations_are_classified() {
        for destination in [
            "",
            "#section",
            "https://example.com/a.md",
            "mailto:someone@example.com",
            "someone@example.com",
            "//cdn.example.com/x.png",
            "{{< ref \"a.md\" >}}",
            "/_uid/7d4f3a9e-2b1c-4c8e-9f00-1234567890ab/",
        ] {
            assert!(!is_local_destination(destination), "{destination}");
        }
        assert!(is_local_destination("../a.md#x"));
        assert!(is_local_destination("/docs/a.md"));
    }

    #[test]
    fn case_insensitive_link_matching_round_trip() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("docs/API_Guide.md"), "# API\n");
        write_file(&root.join("docs/index.md"), "Read [the guide](api_guide.md).\n");
        let files = vec![root.join("docs/API_Guide.md"), root.join("docs/index.md")];

        let found = find_links_to(&FsStore, &files, &root.join("docs/API_Guide.md"), root)
            .expect("find");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_file, root.join("docs/index.md"));
        assert_eq!(found[0].target, "api_guide.md");
        assert_eq!(
            fs::read_to_string(root.join("docs/index.md")).expect("read"),
            "Read [the guide](api_guide.md).\n"
        );
    }

    #[test]
    fn broken_links_only_report_missing_local_targets() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("a.md"), "[ok](b.md) [gone](missing.md#x) [web](https://x.y)\n");
        write_file(&root.join("b.md"), "b\n");
        let files = vec![root.join("a.md"), root.join("b.md")];
        let broken = find_broken_links(&FsStore, &files, root).expect("broken");
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].link.target, "missing.md");
        assert_eq!(broken[0].link.fragment, "#x");
        assert_eq!(broken[0].resolved, root.join("missing.md"));
    }
}
