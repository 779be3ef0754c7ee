use std::fmt::Write as _;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDateTime};
use similar::TextDiff;
use tracing::info;

use crate::filesystem::{BACKUP_DIR_PREFIX, normalize_pathbuf, relative_display};
use crate::fix::{FixOptions, FixPlan, FixResult, plan_fix, run_fix_with};
use crate::invariants::Clock;
use crate::store::FsStore;
use crate::vcs::VersionControl;

pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const DIFF_CONTEXT: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct GuardOptions {
    pub dry_run: bool,
    /// Skip the confirmation prompt.
    pub assume_yes: bool,
    pub backup: bool,
}

#[derive(Debug)]
pub enum GuardedOutcome {
    /// The plan found nothing to change; the planned result is returned.
    NoChanges(FixResult),
    Previewed(FixPlan),
    Declined(FixPlan),
    Applied(FixResult),
}

impl GuardedOutcome {
    pub fn result(&self) -> &FixResult {
        match self {
            Self::NoChanges(result) | Self::Applied(result) => result,
            Self::Previewed(plan) | Self::Declined(plan) => &plan.result,
        }
    }
}

/// Human-readable summary of a plan followed by unified diffs.
pub fn render_preview(plan: &FixPlan) -> String {
    let result = &plan.result;
    let root = result.root.as_path();
    let mut out = String::new();
    let _ = writeln!(out, "Planned changes under {}", root.display());

    let _ = writeln!(out, "renames: {}", result.renames.len());
    for rename in &result.renames {
        let _ = writeln!(
            out,
            "  {} -> {}{}",
            relative_display(root, &rename.from),
            relative_display(root, &rename.to),
            if rename.tracked { " (tracked)" } else { "" }
        );
    }
    let _ = writeln!(out, "link updates: {}", result.link_updates.len());
    for update in &result.link_updates {
        let _ = writeln!(
            out,
            "  {}:{} {} -> {}",
            relative_display(root, &update.file),
            update.line,
            update.old_destination,
            update.new_destination
        );
    }
    let _ = writeln!(out, "frontmatter operations: {}", result.frontmatter_ops.len());
    for op in &result.frontmatter_ops {
        let _ = writeln!(
            out,
            "  {} {:?} {}",
            relative_display(root, &op.file),
            op.kind,
            op.value
        );
    }
    if !result.heal_skips.is_empty() {
        let _ = writeln!(out, "heal skips: {}", result.heal_skips.len());
        for skip in &result.heal_skips {
            let _ = writeln!(
                out,
                "  {}:{} {} ({:?}, {} candidates)",
                relative_display(root, &skip.broken.link.source_file),
                skip.broken.link.line,
                skip.broken.link.destination(),
                skip.reason,
                skip.candidates.len()
            );
        }
    }
    if !result.unresolved_links.is_empty() {
        let _ = writeln!(out, "unresolved links: {}", result.unresolved_links.len());
        for broken in &result.unresolved_links {
            let _ = writeln!(
                out,
                "  {}:{} {}",
                relative_display(root, &broken.link.source_file),
                broken.link.line,
                broken.link.destination()
            );
        }
    }
    if !result.errors.is_empty() {
        let _ = writeln!(out, "errors: {}", result.errors.len());
        for error in &result.errors {
            let file = error
                .file
                .as_deref()
                .map(|file| relative_display(root, file))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(out, "  [{}] {}: {}", error.phase.as_str(), file, error.message);
        }
    }

    for change in &plan.changes {
        let before = relative_display(root, Path::new(&change.original_path));
        let after = relative_display(root, Path::new(&change.path));
        let diff = TextDiff::from_lines(&change.before, &change.after);
        let _ = write!(
            out,
            "\n{}",
            diff.unified_diff()
                .context_radius(DIFF_CONTEXT)
                .header(&format!("a/{before}"), &format!("b/{after}"))
        );
    }
    out
}

/// Prompt on `output`, read one line from `input`; only `y`/`yes` accept.
pub fn confirm<R: BufRead, W: Write>(input: &mut R, output: &mut W, prompt: &str) -> Result<bool> {
    write!(output, "{prompt} [y/N] ").context("failed to write prompt")?;
    output.flush().context("failed to flush prompt")?;
    let mut answer = String::new();
    input
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

pub fn backup_dir_name(now: NaiveDateTime) -> String {
    format!("{BACKUP_DIR_PREFIX}{}", now.format(BACKUP_TIMESTAMP_FORMAT))
}

/// Copy `files` into `<root>/.mdtool-backup-<timestamp>/`, mirroring their
/// paths relative to `root`. Files outside `root` or already gone are skipped.
pub fn create_backup(root: &Path, files: &[PathBuf], now: NaiveDateTime) -> Result<PathBuf> {
    let backup_root = root.join(backup_dir_name(now));
    fs::create_dir_all(&backup_root)
        .with_context(|| format!("failed to create {}", backup_root.display()))?;
    for file in files {
        let Ok(relative) = file.strip_prefix(root) else {
            continue;
        };
        if !file.is_file() {
            continue;
        }
        let destination = backup_root.join(relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(file, &destination).with_context(|| {
            format!(
                "failed to back up {} to {}",
                file.display(),
                destination.display()
            )
        })?;
    }
    info!(backup = %backup_root.display(), files = files.len(), "backup created");
    Ok(backup_root)
}

/// Reset the working tree to `revision`. Refuses outside a work tree.
pub fn rollback<V: VersionControl + ?Sized>(vcs: &V, root: &Path, revision: &str) -> Result<()> {
    if !vcs.is_work_tree(root) {
        bail!(
            "rollback requires a version-controlled tree: {}",
            root.display()
        );
    }
    let top = vcs.toplevel(root)?;
    vcs.hard_reset(&top, revision)
        .with_context(|| format!("failed to reset {} to {revision}", top.display()))?;
    info!(revision, repo = %top.display(), "working tree reset");
    Ok(())
}

/// Plan, preview, confirm, back up, then apply.
#[allow(clippy::too_many_arguments)]
pub fn run_guarded_fix<V, R, W>(
    root: &Path,
    options: &FixOptions,
    guard: GuardOptions,
    vcs: &V,
    clock: &dyn Clock,
    input: &mut R,
    output: &mut W,
) -> Result<GuardedOutcome>
where
    V: VersionControl + ?Sized,
    R: BufRead,
    W: Write,
{
    let plan = plan_fix(root, options, vcs, clock)?;
    if !plan.has_changes() {
        return Ok(GuardedOutcome::NoChanges(plan.result));
    }
    if guard.dry_run {
        return Ok(GuardedOutcome::Previewed(plan));
    }
    if !guard.assume_yes {
        output
            .write_all(render_preview(&plan).as_bytes())
            .context("failed to write preview")?;
        if !confirm(input, output, "Apply these changes?")? {
            return Ok(GuardedOutcome::Declined(plan));
        }
    }

    let backup_dir = if guard.backup {
        let originals: Vec<PathBuf> = plan
            .changes
            .iter()
            .map(|change| PathBuf::from(&change.original_path))
            .collect();
        Some(create_backup(
            &normalize_pathbuf(root),
            &originals,
            Local::now().naive_local(),
        )?)
    } else {
        None
    };

    let result = run_fix_with(
        &mut FsStore,
        vcs,
        clock,
        root,
        &FixOptions {
            dry_run: false,
            backup_dir,
            ..options.clone()
        },
    )?;
    Ok(GuardedOutcome::Applied(result))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::path::Path;

    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::{
        GuardOptions, GuardedOutcome, backup_dir_name, confirm, create_backup, render_preview,
        rollback, run_guarded_fix,
    };
    use crate::fix::{FixOptions, plan_fix};
    use crate::invariants::FixedClock;
    use crate::vcs::testing::FakeVcs;

    fn write_file(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write");
    }

    fn clock() -> FixedClock {
        FixedClock(NaiveDate::from_ymd_opt(2026, 1, 15).expect("date"))
    }

    fn options() -> FixOptions {
        FixOptions {
            history_window: 50,
            ..FixOptions::default()
        }
    }

    fn seed(root: &Path) {
        write_file(&root.join("docs/BadName.md"), "# Bad\n");
        write_file(&root.join("docs/other.md"), "[x](BadName.md)\n");
    }

    #[test]
    fn confirm_accepts_only_yes() {
        for (answer, expected) in [("y\n", true), ("YES\n", true), ("n\n", false), ("\n", false)] {
            let mut input = Cursor::new(answer.as_bytes());
            let mut output = Vec::new();
            assert_eq!(
                confirm(&mut input, &mut output, "Apply?").expect("confirm"),
                expected
            );
            assert!(String::from_utf8(output).expect("utf8").contains("[y/N]"));
        }
    }

    #[test]
    fn backup_mirrors_relative_paths() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        seed(root);
        let now = NaiveDate::from_ymd_opt(2026, 1, 15)
            .and_then(|date| date.and_hms_opt(9, 30, 5))
            .expect("timestamp");
        assert_eq!(backup_dir_name(now), ".mdtool-backup-20260115-093005");

        let backup = create_backup(
            root,
            &[root.join("docs/other.md"), root.join("docs/missing.md")],
            now,
        )
        .expect("backup");
        assert_eq!(backup, root.join(".mdtool-backup-20260115-093005"));
        assert_eq!(
            fs::read_to_string(backup.join("docs/other.md")).expect("read"),
            "[x](BadName.md)\n"
        );
        assert!(!backup.join("docs/missing.md").exists());
    }

    #[test]
    fn preview_lists_operations_and_diffs() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        seed(root);
        let plan = plan_fix(root, &options(), &FakeVcs::default(), &clock()).expect("plan");
        let preview = render_preview(&plan);
        assert!(preview.contains("renames: 1"));
        assert!(preview.contains("docs/BadName.md -> docs/badname.md"));
        assert!(preview.contains("BadName.md -> badname.md"));
        assert!(preview.contains("+[x](badname.md)"));
    }

    #[test]
    fn dry_run_and_declined_runs_leave_disk_alone() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        seed(root);
        let vcs = FakeVcs::default();

        let previewed = run_guarded_fix(
            root,
            &options(),
            GuardOptions {
                dry_run: true,
                ..GuardOptions::default()
            },
            &vcs,
            &clock(),
            &mut Cursor::new(Vec::new()),
            &mut Vec::new(),
        )
        .expect("dry run");
        assert!(matches!(previewed, GuardedOutcome::Previewed(_)));

        let declined = run_guarded_fix(
            root,
            &options(),
            GuardOptions {
                backup: true,
                ..GuardOptions::default()
            },
            &vcs,
            &clock(),
            &mut Cursor::new(b"no\n".to_vec()),
            &mut Vec::new(),
        )
        .expect("declined");
        assert!(matches!(declined, GuardedOutcome::Declined(_)));
        assert!(root.join("docs/BadName.md").exists());
        assert_eq!(
            fs::read_to_string(root.join("docs/other.md")).expect("read"),
            "[x](BadName.md)\n"
        );
        let leftovers = fs::read_dir(root)
            .expect("read dir")
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".mdtool-backup-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn confirmed_run_backs_up_then_applies() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        seed(root);
        let outcome = run_guarded_fix(
            root,
            &options(),
            GuardOptions {
                assume_yes: true,
                backup: true,
                ..GuardOptions::default()
            },
            &FakeVcs::default(),
            &clock(),
            &mut Cursor::new(Vec::new()),
            &mut Vec::new(),
        )
        .expect("apply");
        let GuardedOutcome::Applied(result) = outcome else {
            panic!("expected applied outcome");
        };
        assert!(!result.dry_run);
        let backup = result.backup_dir.expect("backup dir");
        assert_eq!(
            fs::read_to_string(backup.join("docs/BadName.md")).expect("backup copy"),
            "# Bad\n"
        );
        assert_eq!(
            fs::read_to_string(backup.join("docs/other.md")).expect("backup copy"),
            "[x](BadName.md)\n"
        );
        assert!(
            fs::read_to_string(root.join("docs/other.md"))
                .expect("read")
                .contains("[x](badname.md)")
        );
    }

    #[test]
    fn rollback_requires_work_tree_and_resets() {
        let root = Path::new("/repo");
        assert!(rollback(&FakeVcs::default(), root, "HEAD").is_err());

        let vcs = FakeVcs::repo(root);
        rollback(&vcs, root, "HEAD~1").expect("rollback");
        assert_eq!(vcs.resets.borrow().as_slice(), &["HEAD~1".to_string()]);
    }
}
