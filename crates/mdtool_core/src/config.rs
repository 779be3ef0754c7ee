use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HISTORY_WINDOW: usize = 50;
pub const DEFAULT_EXEMPT_FILENAMES: &[&str] = &[
    "README.md",
    "CHANGELOG.md",
    "CONTRIBUTING.md",
    "CODE_OF_CONDUCT.md",
    "LICENSE.md",
    "SECURITY.md",
    "_index.md",
    "index.md",
];
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &["node_modules", "vendor", "target"];

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MdtoolConfig {
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub filenames: FilenameSection,
    #[serde(default)]
    pub fix: FixSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ScanSection {
    #[serde(default)]
    pub roots: Vec<String>,
    pub exclude: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FilenameSection {
    pub exempt: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FixSection {
    pub history_window: Option<usize>,
    pub detect_vcs: Option<bool>,
    pub backup: Option<bool>,
}

impl MdtoolConfig {
    /// Scope roots as absolute paths; the project root itself when none are configured.
    pub fn scope_roots(&self, project_root: &Path) -> Vec<PathBuf> {
        let roots = self
            .scan
            .roots
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(|value| {
                let path = Path::new(value);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    project_root.join(path)
                }
            })
            .collect::<Vec<_>>();
        if roots.is_empty() {
            vec![project_root.to_path_buf()]
        } else {
            roots
        }
    }

    pub fn excluded_dirs(&self) -> Vec<String> {
        match &self.scan.exclude {
            Some(values) => values.clone(),
            None => DEFAULT_EXCLUDED_DIRS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    pub fn exempt_filenames(&self) -> Vec<String> {
        match &self.filenames.exempt {
            Some(values) => values.clone(),
            None => DEFAULT_EXEMPT_FILENAMES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Resolve the history window: env MDTOOL_HISTORY_WINDOW > config > default.
    pub fn history_window(&self) -> usize {
        if let Ok(value) = env::var("MDTOOL_HISTORY_WINDOW")
            && let Ok(parsed) = value.trim().parse::<usize>()
            && parsed > 0
        {
            return parsed;
        }
        self.fix
            .history_window
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HISTORY_WINDOW)
    }

    pub fn detect_vcs(&self) -> bool {
        self.fix.detect_vcs.unwrap_or(true)
    }

    pub fn backup_enabled(&self) -> bool {
        self.fix.backup.unwrap_or(true)
    }
}

/// Resolve the git binary: env MDTOOL_GIT > `git` on PATH.
pub fn git_binary() -> PathBuf {
    env::var("MDTOOL_GIT")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("git"))
}

/// Load and parse the config from a TOML file. Returns default if the file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MdtoolConfig> {
    if !config_path.exists() {
        return Ok(MdtoolConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MdtoolConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
