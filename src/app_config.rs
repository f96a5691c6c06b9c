//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rm_fs::fs::Mode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn rm_fs_data_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::data_dir() {
        return Some(path.join("rm-fs"));
    }

    dirs::home_dir().map(|home| home.join(".local").join("share").join("rm-fs"))
}

fn default_mount_point() -> PathBuf {
    rm_fs_data_dir().map_or_else(|| PathBuf::from("/tmp/rm-fs/mnt"), |rd| rd.join("mnt"))
}

fn default_store_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("/tmp/rm-fs/xochitl"),
        |dd| dd.join("remarkable").join("xochitl"),
    )
}

const fn default_refresh_interval_secs() -> u64 {
    300
}

const fn default_cache_capacity() -> usize {
    1
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

/// Where documents are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Directory holding documents in the tablet's on-disk layout.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// How annotated PDFs are produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RenderConfig {
    /// External renderer command line, program first. Without one, only documents that already
    /// are PDFs can be shown in `annot` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Passed to the renderer as `--key=value`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// The mode documents are presented in after mounting.
    #[serde(default)]
    pub mode: Mode,

    /// Seconds between background refreshes of the remote tree.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// How many materialized documents to keep in memory.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// The user owning every file. If not specified, the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group owning every file. If not specified, the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    /// Where documents are read from.
    #[serde(default)]
    pub store: StoreConfig,

    /// How annotated PDFs are produced.
    #[serde(default)]
    pub render: RenderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            mode: Mode::default(),
            refresh_interval_secs: default_refresh_interval_secs(),
            cache_capacity: default_cache_capacity(),
            uid: current_uid(),
            gid: current_gid(),
            store: StoreConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

/// Errors raised while reading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration could not be encoded as TOML.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    /// The configuration file is not valid TOML for [`Config`].
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    /// Reading or writing the file failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The configuration path has no parent directory.
    #[error("Config parent directory does not exist.")]
    NoParentDir,

    /// No search path could be determined.
    #[error("No suitable configuration path found.")]
    NoSuitableConfigPath,
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing every validation error message otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.refresh_interval_secs == 0 {
            errors.push("refresh-interval-secs must be at least 1.".to_owned());
        }

        if self.cache_capacity == 0 {
            errors.push("cache-capacity must be at least 1.".to_owned());
        }

        if self.mount_point.as_os_str().is_empty() {
            errors.push("mount-point must not be empty.".to_owned());
        }

        if !self.store.path.is_dir() {
            errors.push(format!(
                "Store path '{}' is not a directory.",
                self.store.path.display()
            ));
        }

        if self
            .render
            .command
            .as_ref()
            .is_some_and(|command| command.is_empty())
        {
            errors.push("render.command must name a program.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("rm-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            let path = home.join(".config").join("rm-fs").join("config.toml");
            if !paths.contains(&path) {
                paths.push(path);
            }
        }

        paths.push(PathBuf::from("/etc/rm-fs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads configuration from the first found config file, or the external path if given.
    pub fn load(external_config_path: Option<&Path>) -> Option<Result<Self, ConfigError>> {
        if let Some(path) = external_config_path {
            return Some(Self::load_from_file(path));
        }

        Self::find_config_file().map(|path| Self::load_from_file(&path))
    }

    /// Loads config, falling back to the defaults if no file exists.
    /// Errors if a config file exists but is malformed.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match Self::load(external_config_path) {
            Some(res) => {
                let config = res?;
                debug!("Loaded configuration successfully.");
                Ok(config)
            }
            None => {
                debug!("No configuration file found, using defaults.");
                Ok(Self::default())
            }
        }
    }

    /// Writes the defaults to the highest-priority search path, or prints them to stdout when a
    /// file already exists there. Returns the path written, if any.
    pub fn write_default() -> Result<Option<PathBuf>, ConfigError> {
        let path = Self::config_search_paths()
            .into_iter()
            .next()
            .ok_or(ConfigError::NoSuitableConfigPath)?;
        let toml_str = toml::to_string_pretty(&Self::default())?;

        if path.exists() {
            print!("{toml_str}");
            return Ok(None);
        }

        std::fs::create_dir_all(path.parent().ok_or(ConfigError::NoParentDir)?)?;
        std::fs::write(&path, toml_str)?;
        Ok(Some(path))
    }
}
