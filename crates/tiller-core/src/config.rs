//! Typed configuration loaded from `tiller.toml`.
//!
//! Every field has a default applied at deserialization time, so a missing
//! file, a missing section and a missing key all produce the same value.
//! Validation happens once, through [`crate::validation::Validate`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{BranchTier, MergeStrategy, SquashLevel};

pub const DEFAULT_CONFIG_FILE: &str = "tiller.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to create config parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TillerConfig {
    pub haven: HavenConfig,
    pub agents: AgentsConfig,
    pub effort: EffortConfig,
    pub merge: MergeConfig,
    pub gantt: GanttConfig,
}

/// Out-of-tree directory holding worktrees, agent state and logs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HavenConfig {
    /// Relative paths resolve against the repository root. Defaults to a
    /// sibling directory `../<repo-name>.tiller`.
    pub root: Option<PathBuf>,
}

impl HavenConfig {
    pub fn resolve(&self, repo_root: &Path) -> PathBuf {
        match &self.root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => repo_root.join(root),
            None => {
                let name = repo_root
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "repo".to_string());
                repo_root
                    .parent()
                    .unwrap_or(repo_root)
                    .join(format!("{name}.tiller"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub command: String,
    /// Arguments with `{task_id}`, `{title}`, `{worktree}`, `{branch}` and
    /// `{prompt}` placeholders.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub max_parallel: usize,
    /// Hard wall-clock cap per agent.
    pub timeout_secs: u64,
    /// Watchdog: kill after this long without any output.
    pub idle_timeout_secs: u64,
    pub kill_grace_secs: u64,
    pub poll_interval_ms: u64,
    /// Queue spawns beyond `max_parallel` instead of refusing them.
    pub queue: bool,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["-p".to_string(), "{prompt}".to_string()],
            env: BTreeMap::new(),
            max_parallel: 3,
            timeout_secs: 3_600,
            idle_timeout_secs: 600,
            kill_grace_secs: 5,
            poll_interval_ms: 100,
            queue: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffortConfig {
    pub default_hours: f64,
    pub hours_per_day: f64,
    /// Legacy size tokens, matched case-insensitively.
    pub sizes: BTreeMap<String, f64>,
}

impl Default for EffortConfig {
    fn default() -> Self {
        let sizes = [("S", 2.0), ("M", 4.0), ("L", 8.0), ("XL", 16.0)]
            .into_iter()
            .map(|(size, hours)| (size.to_string(), hours))
            .collect();
        Self {
            default_hours: 4.0,
            hours_per_day: 8.0,
            sizes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Branch at the top of the cascade; the repository's current branch when unset.
    pub main_branch: Option<String>,
    /// Strategy for task → epic (or the nearest existing parent tier).
    pub task_strategy: MergeStrategy,
    pub epic_strategy: MergeStrategy,
    pub prd_strategy: MergeStrategy,
    pub squash_level: SquashLevel,
    /// Commit leftover changes in an agent worktree on its behalf before merging.
    pub auto_commit: bool,
    /// Keep merging upward once every task of an epic/PRD is terminal.
    pub auto_cascade: bool,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            main_branch: None,
            task_strategy: MergeStrategy::Merge,
            epic_strategy: MergeStrategy::Merge,
            prd_strategy: MergeStrategy::Squash,
            squash_level: SquashLevel::Prd,
            auto_commit: false,
            auto_cascade: true,
            author_name: None,
            author_email: None,
        }
    }
}

impl MergeConfig {
    /// Strategy applied when `source` merges into its parent tier.
    pub fn strategy_for(&self, source: BranchTier) -> MergeStrategy {
        if self.squash_level.squashes(source) {
            return MergeStrategy::Squash;
        }
        match source {
            BranchTier::Task => self.task_strategy,
            BranchTier::Epic => self.epic_strategy,
            BranchTier::Prd | BranchTier::Main => self.prd_strategy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GanttConfig {
    pub display_padding_hours: f64,
    pub display_min_hours: f64,
    pub display_max_hours: Option<f64>,
}

impl Default for GanttConfig {
    fn default() -> Self {
        Self {
            display_padding_hours: 0.0,
            display_min_hours: 1.0,
            display_max_hours: None,
        }
    }
}

pub fn parse_config(contents: &str) -> Result<TillerConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<TillerConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// Load the config file, falling back to defaults when it does not exist.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<TillerConfig, ConfigError> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        return Ok(TillerConfig::default());
    }
    load_config(path_ref)
}

pub fn save_config(path: impl AsRef<Path>, config: &TillerConfig) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    if let Some(parent_dir) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent_dir).map_err(|source| ConfigError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }

    let body = toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
        path: path_ref.to_path_buf(),
        source,
    })?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })?;
    Ok(())
}
