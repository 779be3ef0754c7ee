use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::{DirEntry, WalkDir};

pub const BACKUP_DIR_PREFIX: &str = ".mdtool-backup-";
pub const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown"];

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub excluded_dirs: Vec<String>,
}

/// Walk `root` for Markdown files, sorted by path.
pub fn scan_markdown_files(root: &Path, options: &ScanOptions) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_entry(entry, options));
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if is_markdown_path(entry.path()) {
            files.push(normalize_pathbuf(entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

fn is_skipped_entry(entry: &DirEntry, options: &ScanOptions) -> bool {
    let name = entry.file_name().to_string_lossy();
    if is_hidden_name(&name) {
        return true;
    }
    entry.file_type().is_dir()
        && options
            .excluded_dirs
            .iter()
            .any(|excluded| excluded == name.as_ref())
}

pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

pub fn is_markdown_path(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(is_hidden_name);
    if hidden {
        return false;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            MARKDOWN_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

pub fn content_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

pub fn display_path(path: &Path) -> String {
    normalize_separators(&path.to_string_lossy())
}

pub fn relative_display(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => display_path(rel),
        _ => display_path(path),
    }
}

/// Lexically clean a path: drop `.`, resolve `..` against preceding components.
pub fn normalize_pathbuf(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

pub fn path_eq_ignore_case(left: &Path, right: &Path) -> bool {
    display_path(left).to_lowercase() == display_path(right).to_lowercase()
}

pub fn is_within(path: &Path, root: &Path) -> bool {
    normalize_pathbuf(path).starts_with(normalize_pathbuf(root))
}

pub fn is_within_any(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| is_within(path, root))
}

/// `/`-separated relative path from directory `from_dir` to `target`.
pub fn relative_link_path(from_dir: &Path, target: &Path) -> String {
    let from = normalize_pathbuf(from_dir);
    let to = normalize_pathbuf(target);
    let from_parts: Vec<Component<'_>> = from.components().collect();
    let to_parts: Vec<Component<'_>> = to.components().collect();

    let mut shared = 0usize;
    while shared < from_parts.len()
        && shared < to_parts.len()
        && from_parts[shared] == to_parts[shared]
    {
        shared += 1;
    }

    let mut segments: Vec<String> = Vec::new();
    for _ in shared..from_parts.len() {
        segments.push("..".to_string());
    }
    for part in &to_parts[shared..] {
        segments.push(part.as_os_str().to_string_lossy().to_string());
    }
    if segments.is_empty() {
        return ".".to_string();
    }
    segments.join("/")
}

/// Decode `%XX` escapes; malformed escapes are kept verbatim.
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && index + 2 < bytes.len()
            && let (Some(high), Some(low)) =
                (hex_value(bytes[index + 1]), hex_value(bytes[index + 2]))
        {
            out.push(high * 16 + low);
            index += 3;
            continue;
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| value.to_string())
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{
        ScanOptions, content_digest, is_markdown_path, normalize_pathbuf, path_eq_ignore_case,
        percent_decode, relative_display, relative_link_path, scan_markdown_files,
    };

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write");
    }

    #[test]
    fn scan_skips_hidden_backup_and_excluded_dirs() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("docs/guide.md"), "guide");
        write_file(&root.join("docs/Notes.MARKDOWN"), "notes");
        write_file(&root.join("docs/image.png"), "png");
        write_file(&root.join(".git/info.md"), "git");
        write_file(&root.join(".mdtool-backup-20260101-000000/docs/guide.md"), "old");
        write_file(&root.join("docs/.guide.md.mdtool-bak"), "bak");
        write_file(&root.join("node_modules/pkg/readme.md"), "dep");

        let files = scan_markdown_files(
            root,
            &ScanOptions {
                excluded_dirs: vec!["node_modules".to_string()],
            },
        )
        .expect("scan");
        let relative: Vec<String> = files
            .iter()
            .map(|path| relative_display(root, path))
            .collect();
        assert_eq!(relative, vec!["docs/Notes.MARKDOWN", "docs/guide.md"]);
    }

    #[test]
    fn relative_link_path_walks_up_and_down() {
        assert_eq!(
            relative_link_path(Path::new("/r/docs/a"), Path::new("/r/docs/b/c.md")),
            "../b/c.md"
        );
        assert_eq!(
            relative_link_path(Path::new("/r/docs"), Path::new("/r/docs/c.md")),
            "c.md"
        );
        assert_eq!(
            relative_link_path(Path::new("/r/docs/a/b"), Path::new("/r/top.md")),
            "../../../top.md"
        );
    }

    #[test]
    fn normalize_resolves_parent_segments() {
        assert_eq!(
            normalize_pathbuf(Path::new("/r/docs/./a/../b.md")),
            PathBuf::from("/r/docs/b.md")
        );
    }

    #[test]
    fn case_insensitive_equality() {
        assert!(path_eq_ignore_case(
            Path::new("/r/docs/API_Guide.md"),
            Path::new("/r/docs/api_guide.md")
        ));
        assert!(!path_eq_ignore_case(
            Path::new("/r/docs/api.md"),
            Path::new("/r/docs/apis.md")
        ));
    }

    #[test]
    fn percent_decode_handles_valid_and_invalid_escapes() {
        assert_eq!(percent_decode("my%20file.md"), "my file.md");
        assert_eq!(percent_decode("100%.md"), "100%.md");
        assert_eq!(percent_decode("bad%zzname"), "bad%zzname");
    }

    #[test]
    fn markdown_detection_ignores_hidden_files() {
        assert!(is_markdown_path(Path::new("docs/a.md")));
        assert!(!is_markdown_path(Path::new("docs/.a.md")));
        assert!(!is_markdown_path(Path::new("docs/a.txt")));
    }

    #[test]
    fn digest_is_stable_hex() {
        let digest = content_digest(b"hello");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, content_digest(b"hello"));
        assert_ne!(digest, content_digest(b"hello!"));
    }
}
