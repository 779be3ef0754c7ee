use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::filesystem::{display_path, normalize_pathbuf};

pub const STATE_DIR_NAME: &str = ".mdtool";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const PROJECT_ROOT_ENV: &str = "MDTOOL_PROJECT_ROOT";
pub const CONFIG_ENV: &str = "MDTOOL_CONFIG";

/// Directories whose presence marks a project root, strongest first.
const ROOT_MARKERS: &[&str] = &[STATE_DIR_NAME, ".git"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Flag,
    Env,
    /// Nearest ancestor holding a root marker.
    Marker,
    WorkingDir,
    Default,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Marker => "marker",
            Self::WorkingDir => "cwd",
            Self::Default => "default",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        Ok(Self {
            cwd: env::current_dir().context("cannot determine the working directory")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_from: Provenance,
    pub config_from: Provenance,
}

impl ResolvedPaths {
    pub fn for_root(project_root: &Path) -> Self {
        let project_root = normalize_pathbuf(project_root);
        let state_dir = project_root.join(STATE_DIR_NAME);
        Self {
            config_path: state_dir.join(CONFIG_FILENAME),
            state_dir,
            project_root,
            root_from: Provenance::Flag,
            config_from: Provenance::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        [
            format!("project_root={} ({})", display_path(&self.project_root), self.root_from),
            format!("state_dir={}", display_path(&self.state_dir)),
            format!("config_path={} ({})", display_path(&self.config_path), self.config_from),
        ]
        .join("\n")
    }
}

pub fn resolve_paths(context: &ResolutionContext, overrides: &PathOverrides) -> Result<ResolvedPaths> {
    resolve_with_env(context, overrides, &|key| env::var(key).ok())
}

fn resolve_with_env(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    env_var: &dyn Fn(&str) -> Option<String>,
) -> Result<ResolvedPaths> {
    let (root, root_from) = if let Some(path) = overrides.project_root.as_deref() {
        (anchored(path, &context.cwd), Provenance::Flag)
    } else if let Some(path) = env_path(env_var, PROJECT_ROOT_ENV) {
        (anchored(&path, &context.cwd), Provenance::Env)
    } else if let Some(path) = marker_ancestor(&context.cwd) {
        (path, Provenance::Marker)
    } else {
        (context.cwd.clone(), Provenance::WorkingDir)
    };

    let mut paths = ResolvedPaths::for_root(&root);
    paths.root_from = root_from;
    // Relative config paths are taken from the project root, not the cwd.
    if let Some(path) = overrides.config.as_deref() {
        paths.config_path = anchored(path, &paths.project_root);
        paths.config_from = Provenance::Flag;
    } else if let Some(path) = env_path(env_var, CONFIG_ENV) {
        paths.config_path = anchored(&path, &paths.project_root);
        paths.config_from = Provenance::Env;
    }
    Ok(paths)
}

fn env_path(env_var: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    env_var(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn marker_ancestor(cwd: &Path) -> Option<PathBuf> {
    ROOT_MARKERS.iter().find_map(|marker| {
        cwd.ancestors()
            .find(|dir| dir.join(marker).exists())
            .map(Path::to_path_buf)
    })
}

fn anchored(path: &Path, base: &Path) -> PathBuf {
    normalize_pathbuf(&base.join(path))
}

pub fn ensure_project_root(paths: &ResolvedPaths) -> Result<()> {
    match fs::metadata(&paths.project_root) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => bail!(
            "project root is not a directory: {}",
            display_path(&paths.project_root)
        ),
        Err(_) => bail!(
            "project root does not exist: {}",
            display_path(&paths.project_root)
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        PathOverrides, Provenance, ResolutionContext, ResolvedPaths, ensure_project_root,
        resolve_with_env,
    };

    #[test]
    fn flag_beats_environment() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };
        let overrides = PathOverrides {
            project_root: Some("site".into()),
            ..PathOverrides::default()
        };
        let env = HashMap::from([("MDTOOL_PROJECT_ROOT", "/elsewhere")]);

        let paths = resolve_with_env(&context, &overrides, &|key| {
            env.get(key).map(|value| value.to_string())
        })
        .expect("resolve");
        assert_eq!(paths.project_root, temp.path().join("site"));
        assert_eq!(paths.root_from, Provenance::Flag);
        assert_eq!(
            paths.config_path,
            temp.path().join("site/.mdtool/config.toml")
        );
        assert_eq!(paths.config_from, Provenance::Default);
    }

    #[test]
    fn env_config_is_relative_to_project_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        let env = HashMap::from([
            ("MDTOOL_PROJECT_ROOT", root.to_string_lossy().to_string()),
            ("MDTOOL_CONFIG", " lint.toml ".to_string()),
        ]);
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
        };

        let paths = resolve_with_env(&context, &PathOverrides::default(), &|key| {
            env.get(key).cloned()
        })
        .expect("resolve");
        assert_eq!(paths.root_from, Provenance::Env);
        assert_eq!(paths.config_from, Provenance::Env);
        assert_eq!(paths.config_path, root.join("lint.toml"));
    }

    #[test]
    fn state_dir_marker_wins_over_enclosing_repository() {
        let temp = tempdir().expect("tempdir");
        let repo = temp.path().join("repo");
        let site = repo.join("site");
        let cwd = site.join("content/posts");
        fs::create_dir_all(repo.join(".git")).expect("git dir");
        fs::create_dir_all(site.join(".mdtool")).expect("state dir");
        fs::create_dir_all(&cwd).expect("cwd");

        let paths = resolve_with_env(
            &ResolutionContext { cwd: cwd.clone() },
            &PathOverrides::default(),
            &|_| None,
        )
        .expect("resolve");
        assert_eq!(paths.project_root, site);
        assert_eq!(paths.root_from, Provenance::Marker);

        fs::remove_dir_all(site.join(".mdtool")).expect("remove state dir");
        let paths = resolve_with_env(&ResolutionContext { cwd }, &PathOverrides::default(), &|_| None)
            .expect("resolve");
        assert_eq!(paths.project_root, repo);
    }

    #[test]
    fn missing_or_file_root_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let missing = ResolvedPaths::for_root(&temp.path().join("absent"));
        let error = ensure_project_root(&missing).expect_err("missing root");
        assert!(error.to_string().contains("does not exist"));

        let file = temp.path().join("file.md");
        fs::write(&file, "x").expect("write");
        let error = ensure_project_root(&ResolvedPaths::for_root(&file)).expect_err("file root");
        assert!(error.to_string().contains("not a directory"));

        ensure_project_root(&ResolvedPaths::for_root(temp.path())).expect("dir root");
    }
}
