//! catchup configuration file parsing (.catchup.toml)

use std::path::Path;

use crate::classify::{CompareConfig, ContentPolicy, Granularity};
use crate::filter::SyncMode;
use crate::session::DEFAULT_FETCH_CONCURRENCY;

/// catchup project configuration
#[derive(Debug, serde::Deserialize)]
#[serde(default)]
pub struct CatchupConfig {
    /// Repository location (`:method:[user@]host:/root` or a path)
    pub repository: Option<String>,

    /// Tag to compare against (`HEAD`, `branch:x`, `version:x`, `date:x`)
    pub tag: Option<String>,

    /// Remote folder mapped to the working-tree root
    pub module: Option<String>,

    /// How local files are compared with their baseline
    pub granularity: Granularity,

    /// Ignore whitespace when comparing both-changed files
    pub ignore_whitespace: bool,

    /// Default view mode
    pub mode: SyncMode,

    /// Concurrent content fetches during refresh
    pub fetch_concurrency: usize,

    /// Extra ignore files, on top of .gitignore
    pub ignore: Vec<String>,
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            repository: None,
            tag: None,
            module: None,
            granularity: Granularity::default(),
            ignore_whitespace: false,
            mode: SyncMode::default(),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            ignore: Vec::new(),
        }
    }
}

/// Config file name
pub const CONFIG_FILE: &str = ".catchup.toml";

impl CatchupConfig {
    /// Load config from project root.
    ///
    /// Returns default config if .catchup.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Comparison settings described by this config
    #[must_use]
    pub fn compare(&self) -> CompareConfig {
        CompareConfig {
            granularity: self.granularity,
            policy: if self.ignore_whitespace {
                ContentPolicy::IgnoreWhitespace
            } else {
                ContentPolicy::Exact
            },
        }
    }

    /// `module` split into server path segments
    #[must_use]
    pub fn module_path(&self) -> Vec<String> {
        self.module
            .as_deref()
            .unwrap_or_default()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}
