// SPDX-License-Identifier: MIT OR Apache-2.0
//! User-wide configuration and the workspace map.
//!
//! The user configuration file is a structured document (same contract as
//! project declarations); environment variables override individual
//! settings. The workspace map (`workspaces.yaml`) is a user-edited flat
//! mapping from element names to local source directories.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strata_error::{LoadError, LoadErrorReason};
use strata_node::FileRegistry;

/// Environment variable overriding the cache directory.
pub const ENV_CACHE_DIR: &str = "STRATA_CACHE_DIR";
/// Environment variable overriding the parallel-task pool size.
pub const ENV_MAX_JOBS: &str = "STRATA_MAX_JOBS";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "STRATA_LOG_LEVEL";

const CONFIG_KEYS: &[&str] = &[
    "cache-dir",
    "strict",
    "max-jobs",
    "log-level",
    "scheduler",
    "remotes",
    "push-remote",
];
const SCHEDULER_KEYS: &[&str] = &["builders", "fetchers", "cache-ops", "max-retries"];
const LOG_LEVELS: &[&str] = &["debug", "info", "warning", "error"];

/// Advisory issues found while loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A pool is sized zero and will stall its queue.
    ZeroPool {
        /// Pool name.
        pool: String,
    },
    /// The configured cache directory does not exist yet.
    MissingCacheDir {
        /// The directory.
        path: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ZeroPool { pool } => {
                write!(f, "resource pool '{pool}' has zero capacity; its queue will never run")
            }
            ConfigWarning::MissingCacheDir { path } => {
                write!(f, "cache directory '{path}' does not exist; it will be created")
            }
        }
    }
}

/// User-wide runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfig {
    /// Cache directory holding `cas/`, `artifacts/`, `sources/`, logs,
    /// and `workspaces.yaml`.
    pub cache_dir: PathBuf,
    /// Strict plan mode default.
    pub strict: bool,
    /// Parallel job count for element builds.
    pub max_jobs: u32,
    /// Log level: one of `debug`, `info`, `warning`, `error`.
    pub log_level: String,
    /// Resource pool capacities (`process`, `network`, `cache`).
    pub pools: BTreeMap<String, usize>,
    /// Retry budget for retriable job failures.
    pub max_retries: u32,
    /// Pull remote endpoints, tried in order.
    pub remotes: Vec<String>,
    /// Push remote endpoint.
    pub push_remote: Option<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);
        let mut pools = BTreeMap::new();
        pools.insert("process".to_owned(), parallelism as usize);
        pools.insert("network".to_owned(), 8);
        pools.insert("cache".to_owned(), 4);
        Self {
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("strata"),
            strict: true,
            max_jobs: parallelism,
            log_level: "warning".to_owned(),
            pools,
            max_retries: 2,
            remotes: Vec::new(),
            push_remote: None,
        }
    }
}

impl UserConfig {
    /// Load the configuration file at `path`, starting from defaults.
    ///
    /// A missing file yields plain defaults; a present file must parse.
    pub fn load(
        registry: &FileRegistry,
        path: Option<&Path>,
    ) -> Result<(Self, Vec<ConfigWarning>), LoadError> {
        let mut config = Self::default();
        if let Some(path) = path {
            if path.exists() {
                let node = strata_node::load_file(registry, path)?;
                node.validate_keys(CONFIG_KEYS)?;

                if let Some(dir) = node.get_str_opt("cache-dir")? {
                    config.cache_dir = PathBuf::from(dir);
                }
                config.strict = node.get_bool_or("strict", config.strict)?;
                config.max_jobs = parse_jobs(node.get_int_or("max-jobs", config.max_jobs as i64)?)?;
                config.log_level =
                    node.get_enum("log-level", LOG_LEVELS, Some(config.log_level.as_str()))?;

                if let Some(scheduler) = node.get_mapping_opt("scheduler")? {
                    scheduler.validate_keys(SCHEDULER_KEYS)?;
                    for (key, pool) in [
                        ("builders", "process"),
                        ("fetchers", "network"),
                        ("cache-ops", "cache"),
                    ] {
                        if let Some(capacity) = scheduler.get_node(key) {
                            config
                                .pools
                                .insert(pool.to_owned(), capacity.as_int()?.max(0) as usize);
                        }
                    }
                    config.max_retries =
                        scheduler.get_int_or("max-retries", config.max_retries as i64)? as u32;
                }

                config.remotes = node.get_str_list_or_empty("remotes")?;
                config.push_remote = node.get_str_opt("push-remote")?;
            }
        }
        let warnings = config.warnings();
        Ok((config, warnings))
    }

    /// Apply `STRATA_*` environment overrides.
    pub fn apply_env(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), LoadError> {
        for (key, value) in vars {
            match key.as_str() {
                ENV_CACHE_DIR => self.cache_dir = PathBuf::from(value),
                ENV_MAX_JOBS => {
                    let jobs: i64 = value.parse().map_err(|_| {
                        LoadError::new(
                            LoadErrorReason::InvalidData,
                            format!("{ENV_MAX_JOBS} must be an integer, got '{value}'"),
                        )
                    })?;
                    self.max_jobs = parse_jobs(jobs)?;
                    self.pools.insert("process".to_owned(), self.max_jobs as usize);
                }
                ENV_LOG_LEVEL => {
                    if !LOG_LEVELS.contains(&value.as_str()) {
                        return Err(LoadError::new(
                            LoadErrorReason::InvalidData,
                            format!(
                                "{ENV_LOG_LEVEL} must be one of {}, got '{value}'",
                                LOG_LEVELS.join(", ")
                            ),
                        ));
                    }
                    self.log_level = value;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        for (pool, capacity) in &self.pools {
            if *capacity == 0 {
                warnings.push(ConfigWarning::ZeroPool { pool: pool.clone() });
            }
        }
        if !self.cache_dir.exists() {
            warnings.push(ConfigWarning::MissingCacheDir {
                path: self.cache_dir.display().to_string(),
            });
        }
        warnings
    }

    /// The path of the workspace map inside the cache directory.
    pub fn workspaces_path(&self) -> PathBuf {
        self.cache_dir.join("workspaces.yaml")
    }
}

fn parse_jobs(value: i64) -> Result<u32, LoadError> {
    if (1..=1024).contains(&value) {
        Ok(value as u32)
    } else {
        Err(LoadError::new(
            LoadErrorReason::InvalidData,
            format!("max-jobs must be between 1 and 1024, got {value}"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Workspace map
// ---------------------------------------------------------------------------

/// The user-edited map of open workspaces: element name → directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workspaces {
    map: BTreeMap<String, PathBuf>,
}

impl Workspaces {
    /// Load the workspace map from `path`; a missing file is empty.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|err| {
            LoadError::new(
                LoadErrorReason::InvalidData,
                format!("could not read '{}': {err}", path.display()),
            )
        })?;
        let map: BTreeMap<String, PathBuf> =
            serde_yaml::from_str(&contents).map_err(|err| {
                LoadError::new(
                    LoadErrorReason::InvalidYaml,
                    format!("invalid workspace map '{}': {err}", path.display()),
                )
            })?;
        Ok(Self { map })
    }

    /// Persist the workspace map to `path`.
    pub fn save(&self, path: &Path) -> Result<(), LoadError> {
        let contents = serde_yaml::to_string(&self.map).map_err(|err| {
            LoadError::new(
                LoadErrorReason::InvalidData,
                format!("could not encode workspace map: {err}"),
            )
        })?;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::write(path, contents).map_err(|err| {
            LoadError::new(
                LoadErrorReason::InvalidData,
                format!("could not write '{}': {err}", path.display()),
            )
        })
    }

    /// Open a workspace for `element` at `directory`.
    pub fn open(&mut self, element: &str, directory: PathBuf) {
        self.map.insert(element.to_owned(), directory);
    }

    /// Close the workspace for `element`, returning its directory.
    pub fn close(&mut self, element: &str) -> Option<PathBuf> {
        self.map.remove(element)
    }

    /// The workspace directory for `element`, if open.
    pub fn get(&self, element: &str) -> Option<&Path> {
        self.map.get(element).map(PathBuf::as_path)
    }

    /// Iterate over `(element, directory)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }

    /// The raw map, for handing to the session.
    pub fn to_map(&self) -> BTreeMap<String, PathBuf> {
        self.map.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = UserConfig::default();
        assert!(config.strict);
        assert!(config.max_jobs >= 1);
        assert_eq!(config.pools.get("network"), Some(&8));
        assert!(config.cache_dir.ends_with("strata"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let registry = FileRegistry::new();
        let (config, _) =
            UserConfig::load(&registry, Some(Path::new("/no/such/config.yaml"))).unwrap();
        assert_eq!(config, UserConfig::default());
    }

    #[test]
    fn file_settings_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            concat!(
                "cache-dir: /var/cache/strata\n",
                "strict: false\n",
                "max-jobs: 12\n",
                "log-level: debug\n",
                "scheduler:\n",
                "  builders: 2\n",
                "  fetchers: 3\n",
                "  max-retries: 5\n",
                "remotes:\n",
                "- /mnt/shared-cache\n",
                "push-remote: /mnt/shared-cache\n",
            ),
        )
        .unwrap();

        let registry = FileRegistry::new();
        let (config, _) = UserConfig::load(&registry, Some(&path)).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/strata"));
        assert!(!config.strict);
        assert_eq!(config.max_jobs, 12);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.pools.get("process"), Some(&2));
        assert_eq!(config.pools.get("network"), Some(&3));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.remotes, ["/mnt/shared-cache"]);
        assert_eq!(config.push_remote.as_deref(), Some("/mnt/shared-cache"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "cache-dirs: /oops\n").unwrap();

        let registry = FileRegistry::new();
        let err = UserConfig::load(&registry, Some(&path)).unwrap_err();
        assert_eq!(err.reason, LoadErrorReason::InvalidData);
    }

    #[test]
    fn env_overrides_win() {
        let mut config = UserConfig::default();
        config
            .apply_env([
                (ENV_CACHE_DIR.to_owned(), "/tmp/strata-test".to_owned()),
                (ENV_MAX_JOBS.to_owned(), "3".to_owned()),
                (ENV_LOG_LEVEL.to_owned(), "error".to_owned()),
                ("UNRELATED".to_owned(), "ignored".to_owned()),
            ])
            .unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/strata-test"));
        assert_eq!(config.max_jobs, 3);
        assert_eq!(config.pools.get("process"), Some(&3));
        assert_eq!(config.log_level, "error");
    }

    #[test]
    fn bad_env_values_are_errors() {
        let mut config = UserConfig::default();
        assert!(
            config
                .apply_env([(ENV_MAX_JOBS.to_owned(), "lots".to_owned())])
                .is_err()
        );
        assert!(
            config
                .apply_env([(ENV_LOG_LEVEL.to_owned(), "loud".to_owned())])
                .is_err()
        );
    }

    #[test]
    fn zero_pool_warns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "scheduler:\n  builders: 0\n").unwrap();

        let registry = FileRegistry::new();
        let (_, warnings) = UserConfig::load(&registry, Some(&path)).unwrap();
        assert!(
            warnings
                .iter()
                .any(|w| matches!(w, ConfigWarning::ZeroPool { pool } if pool == "process"))
        );
    }

    #[test]
    fn workspace_map_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspaces.yaml");

        let mut workspaces = Workspaces::default();
        workspaces.open("app.bst", PathBuf::from("/src/app"));
        workspaces.open("lib.bst", PathBuf::from("/src/lib"));
        workspaces.save(&path).unwrap();

        let loaded = Workspaces::load(&path).unwrap();
        assert_eq!(loaded, workspaces);
        assert_eq!(loaded.get("app.bst"), Some(Path::new("/src/app")));

        let mut reopened = loaded;
        assert!(reopened.close("app.bst").is_some());
        assert!(reopened.get("app.bst").is_none());
    }

    #[test]
    fn missing_workspace_map_is_empty() {
        let loaded = Workspaces::load(Path::new("/no/workspaces.yaml")).unwrap();
        assert!(loaded.iter().next().is_none());
    }
}
