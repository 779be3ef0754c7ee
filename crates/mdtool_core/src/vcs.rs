use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared flag that aborts in-flight version-control invocations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffRange {
    /// Index against `HEAD`.
    Staged,
    /// Working tree against the index.
    Unstaged,
    Revisions { from: String, to: String },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Added,
    Deleted,
    Modified,
    Renamed,
    Copied,
    TypeChanged,
    Other,
}

impl ChangeStatus {
    fn from_code(code: &str) -> Self {
        match code.chars().next() {
            Some('A') => Self::Added,
            Some('D') => Self::Deleted,
            Some('M') => Self::Modified,
            Some('R') => Self::Renamed,
            Some('C') => Self::Copied,
            Some('T') => Self::TypeChanged,
            _ => Self::Other,
        }
    }

    fn has_source_path(self) -> bool {
        matches!(self, Self::Renamed | Self::Copied)
    }
}

/// One `--name-status` row. Paths are relative to the repository top level.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NameStatusEntry {
    pub status: ChangeStatus,
    pub path: PathBuf,
    /// Source path of a rename or copy.
    pub original: Option<PathBuf>,
}

impl NameStatusEntry {
    pub fn renamed(original: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            status: ChangeStatus::Renamed,
            path: path.into(),
            original: Some(original.into()),
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            status: ChangeStatus::Deleted,
            path: path.into(),
            original: None,
        }
    }
}

/// The version-control operations the fixer depends on.
pub trait VersionControl {
    fn is_work_tree(&self, dir: &Path) -> bool;
    fn toplevel(&self, dir: &Path) -> Result<PathBuf>;
    fn diff_name_status(&self, repo: &Path, range: &DiffRange) -> Result<Vec<NameStatusEntry>>;
    fn untracked_files(&self, repo: &Path) -> Result<Vec<PathBuf>>;
    fn show_blob(&self, repo: &Path, revision: &str, path: &Path) -> Result<Vec<u8>>;
    fn revision_exists(&self, repo: &Path, revision: &str) -> bool;
    fn upstream(&self, repo: &Path) -> Option<String>;
    fn is_tracked(&self, repo: &Path, path: &Path) -> bool;
    fn move_path(&self, repo: &Path, from: &Path, to: &Path) -> Result<()>;
    fn hard_reset(&self, repo: &Path, revision: &str) -> Result<()>;
}

struct GitOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: String,
}

/// `git` driven as an external process.
#[derive(Debug, Clone)]
pub struct GitCli {
    binary: PathBuf,
    cancel: CancelFlag,
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>, cancel: CancelFlag) -> Self {
        Self {
            binary: binary.into(),
            cancel,
        }
    }

    fn run<I, S>(&self, repo: &Path, args: I) -> Result<GitOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let rendered = args
            .iter()
            .map(|arg| arg.as_ref().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        if self.cancel.is_cancelled() {
            bail!("git {rendered} cancelled");
        }
        debug!(command = %rendered, repo = %repo.display(), "running git");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .current_dir(repo)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to execute {}", self.binary.display()))?;

        let stdout_reader = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                let _ = pipe.read_to_end(&mut buffer);
                buffer
            })
        });
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                let _ = pipe.read_to_end(&mut buffer);
                buffer
            })
        });

        let status = loop {
            if self.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                bail!("git {rendered} cancelled");
            }
            match child
                .try_wait()
                .with_context(|| format!("failed to wait for git {rendered}"))?
            {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let stdout = stdout_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok(GitOutput {
            status,
            stdout,
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        })
    }

    fn run_checked<I, S>(&self, repo: &Path, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let output = self.run(repo, &args)?;
        if !output.status.success() {
            let rendered = args
                .iter()
                .map(|arg| arg.as_ref().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join(" ");
            bail!(
                "git {rendered} failed ({}): {}",
                output.status,
                output.stderr
            );
        }
        Ok(output.stdout)
    }
}

impl VersionControl for GitCli {
    fn is_work_tree(&self, dir: &Path) -> bool {
        self.run(dir, ["rev-parse", "--is-inside-work-tree"])
            .map(|output| {
                output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true"
            })
            .unwrap_or(false)
    }

    fn toplevel(&self, dir: &Path) -> Result<PathBuf> {
        let stdout = self.run_checked(dir, ["rev-parse", "--show-toplevel"])?;
        let text = String::from_utf8_lossy(&stdout).trim().to_string();
        if text.is_empty() {
            bail!("git did not report a top-level directory for {}", dir.display());
        }
        Ok(PathBuf::from(text))
    }

    fn diff_name_status(&self, repo: &Path, range: &DiffRange) -> Result<Vec<NameStatusEntry>> {
        let mut args: Vec<String> = vec![
            "diff".to_string(),
            "--name-status".to_string(),
            "-M".to_string(),
            "-z".to_string(),
        ];
        match range {
            DiffRange::Staged => args.push("--cached".to_string()),
            DiffRange::Unstaged => {}
            DiffRange::Revisions { from, to } => args.push(format!("{from}..{to}")),
        }
        let stdout = self.run_checked(repo, &args)?;
        Ok(parse_name_status_z(&stdout))
    }

    fn untracked_files(&self, repo: &Path) -> Result<Vec<PathBuf>> {
        let stdout = self.run_checked(
            repo,
            ["ls-files", "--others", "--exclude-standard", "--full-name", "-z"],
        )?;
        Ok(split_nul(&stdout).map(PathBuf::from).collect())
    }

    fn show_blob(&self, repo: &Path, revision: &str, path: &Path) -> Result<Vec<u8>> {
        let object = format!("{revision}:{}", path.to_string_lossy().replace('\\', "/"));
        self.run_checked(repo, ["show".to_string(), object])
    }

    fn revision_exists(&self, repo: &Path, revision: &str) -> bool {
        self.run(
            repo,
            [
                "rev-parse".to_string(),
                "--verify".to_string(),
                "--quiet".to_string(),
                format!("{revision}^{{commit}}"),
            ],
        )
        .map(|output| output.status.success())
        .unwrap_or(false)
    }

    fn upstream(&self, repo: &Path) -> Option<String> {
        let output = self
            .run(
                repo,
                ["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
            )
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!name.is_empty()).then_some(name)
    }

    fn is_tracked(&self, repo: &Path, path: &Path) -> bool {
        self.run(
            repo,
            [
                OsStr::new("ls-files"),
                OsStr::new("--error-unmatch"),
                OsStr::new("--"),
                path.as_os_str(),
            ],
        )
        .map(|output| output.status.success())
        .unwrap_or(false)
    }

    fn move_path(&self, repo: &Path, from: &Path, to: &Path) -> Result<()> {
        self.run_checked(
            repo,
            [
                OsStr::new("mv"),
                OsStr::new("--"),
                from.as_os_str(),
                to.as_os_str(),
            ],
        )
        .map(|_| ())
    }

    fn hard_reset(&self, repo: &Path, revision: &str) -> Result<()> {
        self.run_checked(repo, ["reset", "--hard", revision])
            .map(|_| ())
    }
}

fn split_nul(bytes: &[u8]) -> impl Iterator<Item = String> + '_ {
    bytes
        .split(|byte| *byte == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
}

/// Parse `git diff --name-status -z`: `status NUL path NUL` or, for renames
/// and copies, `status NUL old NUL new NUL`.
pub fn parse_name_status_z(bytes: &[u8]) -> Vec<NameStatusEntry> {
    let mut fields = split_nul(bytes);
    let mut entries = Vec::new();
    while let Some(code) = fields.next() {
        let status = ChangeStatus::from_code(code.trim());
        let Some(first) = fields.next() else {
            break;
        };
        if status.has_source_path() {
            let Some(second) = fields.next() else {
                break;
            };
            entries.push(NameStatusEntry {
                status,
                path: PathBuf::from(second),
                original: Some(PathBuf::from(first)),
            });
        } else {
            entries.push(NameStatusEntry {
                status,
                path: PathBuf::from(first),
                original: None,
            });
        }
    }
    entries
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;
    use std::path::{Path, PathBuf};

    use anyhow::{Result, anyhow, bail};

    use super::{DiffRange, NameStatusEntry, VersionControl};

    /// Canned repository state for detector and orchestrator tests.
    #[derive(Debug, Default)]
    pub(crate) struct FakeVcs {
        pub work_tree: bool,
        pub toplevel: PathBuf,
        pub staged: Vec<NameStatusEntry>,
        pub unstaged: Vec<NameStatusEntry>,
        pub revision_diffs: BTreeMap<(String, String), Vec<NameStatusEntry>>,
        pub untracked: Vec<PathBuf>,
        pub untracked_error: Option<String>,
        pub blobs: BTreeMap<(String, PathBuf), Vec<u8>>,
        pub revisions: BTreeSet<String>,
        pub upstream: Option<String>,
        pub tracked: BTreeSet<PathBuf>,
        pub moves: RefCell<Vec<(PathBuf, PathBuf)>>,
        pub resets: RefCell<Vec<String>>,
    }

    impl FakeVcs {
        pub(crate) fn repo(toplevel: &Path) -> Self {
            Self {
                work_tree: true,
                toplevel: toplevel.to_path_buf(),
                ..Self::default()
            }
        }
    }

    impl VersionControl for FakeVcs {
        fn is_work_tree(&self, _dir: &Path) -> bool {
            self.work_tree
        }

        fn toplevel(&self, _dir: &Path) -> Result<PathBuf> {
            if !self.work_tree {
                bail!("not a git repository");
            }
            Ok(self.toplevel.clone())
        }

        fn diff_name_status(&self, _repo: &Path, range: &DiffRange) -> Result<Vec<NameStatusEntry>> {
            Ok(match range {
                DiffRange::Staged => self.staged.clone(),
                DiffRange::Unstaged => self.unstaged.clone(),
                DiffRange::Revisions { from, to } => self
                    .revision_diffs
                    .get(&(from.clone(), to.clone()))
                    .cloned()
                    .unwrap_or_default(),
            })
        }

        fn untracked_files(&self, _repo: &Path) -> Result<Vec<PathBuf>> {
            if let Some(message) = &self.untracked_error {
                bail!("git ls-files failed: {message}");
            }
            Ok(self.untracked.clone())
        }

        fn show_blob(&self, _repo: &Path, revision: &str, path: &Path) -> Result<Vec<u8>> {
            self.blobs
                .get(&(revision.to_string(), path.to_path_buf()))
                .cloned()
                .ok_or_else(|| anyhow!("no blob {revision}:{}", path.display()))
        }

        fn revision_exists(&self, _repo: &Path, revision: &str) -> bool {
            self.revisions.contains(revision)
        }

        fn upstream(&self, _repo: &Path) -> Option<String> {
            self.upstream.clone()
        }

        fn is_tracked(&self, repo: &Path, path: &Path) -> bool {
            let relative = path.strip_prefix(repo).unwrap_or(path);
            self.tracked.contains(relative)
        }

        fn move_path(&self, repo: &Path, from: &Path, to: &Path) -> Result<()> {
            fs::rename(repo.join(from), repo.join(to))?;
            self.moves
                .borrow_mut()
                .push((from.to_path_buf(), to.to_path_buf()));
            Ok(())
        }

        fn hard_reset(&self, _repo: &Path, revision: &str) -> Result<()> {
            self.resets.borrow_mut().push(revision.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{CancelFlag, ChangeStatus, GitCli, VersionControl, parse_name_status_z};

    #[test]
    fn parses_nul_separated_name_status() {
        let raw = b"M\0docs/a.md\0R087\0docs/Old.md\0docs/old.md\0D\0docs/gone.md\0A\0new.md\0";
        let entries = parse_name_status_z(raw);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].status, ChangeStatus::Modified);
        assert_eq!(entries[1].status, ChangeStatus::Renamed);
        assert_eq!(entries[1].original, Some(PathBuf::from("docs/Old.md")));
        assert_eq!(entries[1].path, PathBuf::from("docs/old.md"));
        assert_eq!(entries[2].status, ChangeStatus::Deleted);
        assert_eq!(entries[3].path, PathBuf::from("new.md"));
    }

    #[test]
    fn truncated_output_is_ignored() {
        let entries = parse_name_status_z(b"R100\0only-old.md\0");
        assert!(entries.is_empty());
    }

    #[test]
    fn cancelled_flag_refuses_to_spawn() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let git = GitCli::new("git", cancel.clone());
        assert!(cancel.is_cancelled());
        assert!(!git.is_work_tree(std::path::Path::new(".")));
        assert!(git.toplevel(std::path::Path::new(".")).is_err());
    }

    #[test]
    fn missing_binary_is_not_a_work_tree() {
        let git = GitCli::new("/nonexistent/mdtool-git", CancelFlag::new());
        assert!(!git.is_work_tree(std::path::Path::new(".")));
        assert!(git.upstream(std::path::Path::new(".")).is_none());
    }
}
