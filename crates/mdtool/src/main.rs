use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use mdtool_core::config::{MdtoolConfig, git_binary, load_config};
use mdtool_core::detect::{
    Detection, HistoryDetector, RenameDetector, UncommittedDetector, detect_all,
};
use mdtool_core::filesystem::{
    ScanOptions, is_within_any, normalize_pathbuf, relative_display, scan_markdown_files,
};
use mdtool_core::fix::{FixOptions, FixResult};
use mdtool_core::invariants::SystemClock;
use mdtool_core::links::find_links_to;
use mdtool_core::lint::{LintOptions, LintReport, lint_tree};
use mdtool_core::rename::normalize_mappings;
use mdtool_core::runtime::{
    PathOverrides, ResolutionContext, ResolvedPaths, ensure_project_root, resolve_paths,
};
use mdtool_core::safety::{
    GuardOptions, GuardedOutcome, confirm, render_preview, rollback, run_guarded_fix,
};
use mdtool_core::store::FsStore;
use mdtool_core::vcs::{CancelFlag, GitCli, VersionControl};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "MDTOOL_LOG";
const EXIT_RUNTIME_ERROR: u8 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "mdtool",
    version,
    about = "Lint and repair Markdown documentation trees"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Debug-level logging on stderr")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    cancel: CancelFlag,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli, cancel: CancelFlag) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            cancel,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Report convention violations without writing")]
    Lint(LintArgs),
    #[command(about = "Repair filenames, links and frontmatter")]
    Fix(FixArgs),
    #[command(about = "Print rename mappings detected from version control")]
    Renames(RenamesArgs),
    #[command(about = "List every link pointing at a document")]
    Links(LinksArgs),
    #[command(about = "Reset the working tree to a revision")]
    Rollback(RollbackArgs),
    Status,
}

#[derive(Debug, Args)]
struct LintArgs {
    path: Option<PathBuf>,
    #[arg(long, help = "Emit the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct FixArgs {
    path: Option<PathBuf>,
    #[arg(long, help = "Show planned changes without writing anything")]
    dry_run: bool,
    #[arg(long, help = "Allow a rename to overwrite an existing file")]
    force: bool,
    #[arg(short = 'y', long, help = "Apply without the confirmation prompt")]
    yes: bool,
    #[arg(long, help = "Skip the backup tree")]
    no_backup: bool,
    #[arg(long, help = "Emit the result as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct RenamesArgs {
    path: Option<PathBuf>,
    #[arg(long, help = "Emit the mappings as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct LinksArgs {
    target: PathBuf,
    #[arg(long, value_name = "PATH", help = "Tree to search (default: project root)")]
    root: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RollbackArgs {
    #[arg(long, default_value = "HEAD")]
    revision: String,
    #[arg(short = 'y', long, help = "Reset without the confirmation prompt")]
    yes: bool,
}

struct Workspace {
    paths: ResolvedPaths,
    config: MdtoolConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let cancel = CancelFlag::new();
    install_interrupt_handler(&cancel);
    let runtime = RuntimeOptions::from_cli(&cli, cancel);

    let outcome = match cli.command {
        Some(Commands::Lint(args)) => run_lint(&runtime, args),
        Some(Commands::Fix(args)) => run_fix(&runtime, args),
        Some(Commands::Renames(args)) => run_renames(&runtime, args),
        Some(Commands::Links(args)) => run_links(&runtime, args),
        Some(Commands::Rollback(args)) => run_rollback(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        None => {
            let mut command = Cli::command();
            command
                .print_help()
                .map(|()| {
                    println!();
                    ExitCode::SUCCESS
                })
                .map_err(anyhow::Error::from)
        }
    };

    match outcome {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("mdtool=debug,mdtool_core=debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new("mdtool=info,mdtool_core=info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn install_interrupt_handler(cancel: &CancelFlag) {
    let flag = cancel.clone();
    if let Err(error) = ctrlc::set_handler(move || flag.cancel()) {
        warn!("failed to install Ctrl-C handler: {error}");
    }
}

fn run_lint(runtime: &RuntimeOptions, args: LintArgs) -> Result<ExitCode> {
    let workspace = load_workspace(runtime)?;
    let root = command_root(&workspace.paths, args.path.as_deref())?;
    let files = scoped_files(&workspace, &root)?;
    let report = lint_tree(
        &FsStore,
        &files,
        &LintOptions {
            project_root: root.clone(),
            exempt_filenames: workspace.config.exempt_filenames(),
        },
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_lint_report(&report);
    }
    print_diagnostics(runtime, &workspace.paths);
    Ok(if report.total_issues > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_lint_report(report: &LintReport) {
    println!("lint");
    println!("root: {}", normalize_path(&report.root));
    println!("inspected_files: {}", report.inspected_files);
    println!("issues.total: {}", report.total_issues);
    println!("issues.fixable: {}", report.fixable_issues);
    for issue in &report.issues {
        println!(
            "{}:{}: [{}] {}{}",
            relative_display(&report.root, &issue.file),
            issue.line,
            issue.rule.as_str(),
            issue.message,
            if issue.fixable { " (fixable)" } else { "" }
        );
    }
}

fn run_fix(runtime: &RuntimeOptions, args: FixArgs) -> Result<ExitCode> {
    let workspace = load_workspace(runtime)?;
    let root = command_root(&workspace.paths, args.path.as_deref())?;
    let options = FixOptions {
        force: args.force,
        cancel: runtime.cancel.clone(),
        ..FixOptions::from_config(&workspace.config, &workspace.paths.project_root)
    };
    let guard = GuardOptions {
        dry_run: args.dry_run,
        assume_yes: args.yes,
        backup: !args.no_backup && workspace.config.backup_enabled(),
    };
    let vcs = GitCli::new(git_binary(), runtime.cancel.clone());

    // Keep stdout clean for JSON consumers.
    let mut prompt_output: Box<dyn Write> = if args.json {
        Box::new(io::stderr())
    } else {
        Box::new(io::stdout())
    };
    let outcome = run_guarded_fix(
        &root,
        &options,
        guard,
        &vcs,
        &SystemClock,
        &mut io::stdin().lock(),
        &mut prompt_output,
    )?;

    if args.json {
        let rendered = match &outcome {
            GuardedOutcome::Previewed(plan) => serde_json::to_string_pretty(plan)?,
            other => serde_json::to_string_pretty(other.result())?,
        };
        println!("{rendered}");
    } else {
        match &outcome {
            GuardedOutcome::NoChanges(_) => println!("nothing to fix"),
            GuardedOutcome::Previewed(plan) => print!("{}", render_preview(plan)),
            GuardedOutcome::Declined(_) => println!("aborted; no changes were made"),
            GuardedOutcome::Applied(_) => {}
        }
        print_fix_summary(outcome.result());
    }
    print_diagnostics(runtime, &workspace.paths);

    let failed = match &outcome {
        GuardedOutcome::Declined(_) => true,
        other => other.result().has_errors(),
    };
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_fix_summary(result: &FixResult) {
    let root = result.root.as_path();
    println!("fix");
    println!("root: {}", normalize_path(root));
    println!("dry_run: {}", format_flag(result.dry_run));
    println!("inspected_files: {}", result.inspected_files);
    println!("mappings.detected: {}", result.detected_mappings.len());
    println!("renames: {}", result.renames.len());
    println!("link_updates: {}", result.link_updates.len());
    println!("frontmatter_ops: {}", result.frontmatter_ops.len());
    println!("fingerprint_updates: {}", result.fingerprint_updates());
    println!("broken_links.before: {}", result.broken_links.len());
    println!("broken_links.healed: {}", result.healed_links.len());
    println!("broken_links.remaining: {}", result.remaining_broken_links());
    for broken in &result.unresolved_links {
        println!(
            "unresolved: {}:{} {}",
            relative_display(root, &broken.link.source_file),
            broken.link.line,
            broken.link.destination()
        );
    }
    for skip in &result.heal_skips {
        println!(
            "heal_skip: {}:{} {} ({:?})",
            relative_display(root, &skip.broken.link.source_file),
            skip.broken.link.line,
            skip.broken.link.destination(),
            skip.reason
        );
    }
    for issue in &result.manual_issues {
        println!(
            "manual: {}:{} [{}] {}",
            relative_display(root, &issue.file),
            issue.line,
            issue.rule.as_str(),
            issue.message
        );
    }
    for error in &result.errors {
        println!(
            "error: [{}] {}{}",
            error.phase.as_str(),
            error
                .file
                .as_deref()
                .map(|file| format!("{}: ", relative_display(root, file)))
                .unwrap_or_default(),
            error.message
        );
    }
    if let Some(backup) = &result.backup_dir {
        println!("backup: {}", normalize_path(backup));
    }
}

fn run_renames(runtime: &RuntimeOptions, args: RenamesArgs) -> Result<ExitCode> {
    let workspace = load_workspace(runtime)?;
    let root = command_root(&workspace.paths, args.path.as_deref())?;
    let scope_roots = workspace.config.scope_roots(&workspace.paths.project_root);
    let detection = if workspace.config.detect_vcs() {
        let vcs = GitCli::new(git_binary(), runtime.cancel.clone());
        let uncommitted = UncommittedDetector::new(&vcs);
        let history = HistoryDetector::new(&vcs, workspace.config.history_window());
        let detectors: [&dyn RenameDetector; 2] = [&uncommitted, &history];
        detect_all(&detectors, &root)
    } else {
        Detection::default()
    };
    let mappings = normalize_mappings(detection.mappings, &scope_roots);
    let ambiguous: Vec<_> = detection
        .ambiguous
        .into_iter()
        .filter(|entry| is_within_any(&entry.old_path, &scope_roots))
        .collect();

    if args.json {
        let report = serde_json::json!({
            "mappings": mappings,
            "ambiguous": ambiguous,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("renames");
        println!("root: {}", normalize_path(&root));
        println!("detect_vcs: {}", format_flag(workspace.config.detect_vcs()));
        println!("mappings.count: {}", mappings.len());
        for mapping in &mappings {
            println!(
                "{}: {} -> {}",
                mapping.source.as_str(),
                relative_display(&root, &mapping.old_path),
                relative_display(&root, &mapping.new_path)
            );
        }
        println!("ambiguous.count: {}", ambiguous.len());
        for entry in &ambiguous {
            let candidates: Vec<String> = entry
                .candidates
                .iter()
                .map(|candidate| relative_display(&root, candidate))
                .collect();
            println!(
                "ambiguous: {} -> {{{}}}",
                relative_display(&root, &entry.old_path),
                candidates.join(", ")
            );
        }
    }
    print_diagnostics(runtime, &workspace.paths);
    Ok(ExitCode::SUCCESS)
}

fn run_links(runtime: &RuntimeOptions, args: LinksArgs) -> Result<ExitCode> {
    let workspace = load_workspace(runtime)?;
    let root = command_root(&workspace.paths, args.root.as_deref())?;
    let target = absolutize_arg(&args.target)?;
    let files = scoped_files(&workspace, &root)?;
    let links = find_links_to(&FsStore, &files, &target, &root)?;

    println!("links");
    println!("target: {}", normalize_path(&target));
    println!("links.count: {}", links.len());
    for link in &links {
        println!(
            "{}:{} [{}] {}",
            relative_display(&root, &link.source_file),
            link.line,
            link.kind.as_str(),
            link.destination()
        );
    }
    print_diagnostics(runtime, &workspace.paths);
    Ok(ExitCode::SUCCESS)
}

fn run_rollback(runtime: &RuntimeOptions, args: RollbackArgs) -> Result<ExitCode> {
    let paths = resolve_runtime_paths(runtime)?;
    ensure_project_root(&paths)?;
    let vcs = GitCli::new(git_binary(), runtime.cancel.clone());

    if !args.yes {
        let prompt = format!(
            "Reset {} to {}? Uncommitted changes will be lost.",
            normalize_path(&paths.project_root),
            args.revision
        );
        if !confirm(&mut io::stdin().lock(), &mut io::stdout(), &prompt)? {
            println!("rollback aborted");
            return Ok(ExitCode::FAILURE);
        }
    }
    rollback(&vcs, &paths.project_root, &args.revision)?;
    println!("reset to {}", args.revision);
    print_diagnostics(runtime, &paths);
    Ok(ExitCode::SUCCESS)
}

fn run_status(runtime: &RuntimeOptions) -> Result<ExitCode> {
    let workspace = load_workspace(runtime)?;
    let paths = &workspace.paths;
    let config = &workspace.config;
    let vcs = GitCli::new(git_binary(), runtime.cancel.clone());

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "config_path: {} ({})",
        normalize_path(&paths.config_path),
        if paths.config_path.exists() {
            "found"
        } else {
            "missing"
        }
    );
    for scope in config.scope_roots(&paths.project_root) {
        println!("scan.root: {}", normalize_path(&scope));
    }
    println!("scan.exclude: {}", config.excluded_dirs().join(", "));
    println!("filenames.exempt: {}", config.exempt_filenames().join(", "));
    println!("fix.history_window: {}", config.history_window());
    println!("fix.detect_vcs: {}", format_flag(config.detect_vcs()));
    println!("fix.backup: {}", format_flag(config.backup_enabled()));
    println!("git: {}", normalize_path(&git_binary()));
    println!(
        "work_tree: {}",
        format_flag(vcs.is_work_tree(&paths.project_root))
    );
    print_diagnostics(runtime, paths);
    Ok(ExitCode::SUCCESS)
}

fn load_workspace(runtime: &RuntimeOptions) -> Result<Workspace> {
    let paths = resolve_runtime_paths(runtime)?;
    ensure_project_root(&paths)?;
    let config = load_config(&paths.config_path)?;
    Ok(Workspace { paths, config })
}

/// Markdown files under `root` that fall inside the configured scope roots.
fn scoped_files(workspace: &Workspace, root: &Path) -> Result<Vec<PathBuf>> {
    let scope = workspace
        .config
        .scope_roots(&workspace.paths.project_root)
        .iter()
        .map(|path| normalize_pathbuf(path))
        .collect::<Vec<_>>();
    let files = scan_markdown_files(
        root,
        &ScanOptions {
            excluded_dirs: workspace.config.excluded_dirs(),
        },
    )?;
    Ok(files
        .into_iter()
        .filter(|file| is_within_any(file, &scope))
        .collect())
}

fn command_root(paths: &ResolvedPaths, path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => absolutize_arg(path),
        None => Ok(normalize_pathbuf(&paths.project_root)),
    }
}

fn absolutize_arg(path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(path)
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    Ok(normalize_pathbuf(&absolute))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        eprintln!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
