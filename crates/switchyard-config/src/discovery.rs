//! Config file discovery and layered merging.
//!
//! Resolution order (later overrides earlier):
//! 1. `~/.config/switchyard/config.toml` (user config, or `SWITCHYARD_CONFIG_DIR`)
//! 2. `./switchyard.toml` (project-local)

use std::path::{Path, PathBuf};

use crate::{ConfigError, Result, SwitchyardConfig};

const PROJECT_CONFIG_FILE: &str = "switchyard.toml";

const USER_CONFIG_FILE: &str = "config.toml";

const APP_NAME: &str = "switchyard";

/// Overrides the platform config directory when set.
const CONFIG_DIR_ENV: &str = "SWITCHYARD_CONFIG_DIR";

/// Tracks where each config layer was loaded from.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// Whether the file was found and loaded.
    pub loaded: bool,
}

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged configuration.
    pub config: SwitchyardConfig,
    /// Sources that were checked, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Layers that existed but could not be loaded.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Paths of sources that were actually loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Discover and merge all config layers.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Discover and merge config layers with an explicit user config directory.
///
/// `config_dir` overrides both `SWITCHYARD_CONFIG_DIR` and the platform default.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut config = SwitchyardConfig::new();
    let mut sources = Vec::new();
    let mut warnings = Vec::new();

    let user_path = match config_dir {
        Some(dir) => Some(dir.join(USER_CONFIG_FILE)),
        None => user_config_path(),
    };
    if let Some(path) = user_path {
        sources.push(load_layer(&mut config, &path, &mut warnings));
    }

    let project_path = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    sources.push(load_layer(&mut config, &project_path, &mut warnings));

    Ok(LoadedConfig {
        config,
        sources,
        warnings,
    })
}

/// Load a single config file (no discovery).
pub fn load_config_file(path: &Path) -> Result<SwitchyardConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    SwitchyardConfig::from_toml(&contents)
}

/// Write `config` to `path`, creating parent directories.
pub fn save_config(config: &SwitchyardConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }
    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })
}

/// Path of the user config file.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// The user config directory: `SWITCHYARD_CONFIG_DIR`, else the platform default.
pub fn user_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV)
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|d| d.join(APP_NAME))
}

fn load_layer(config: &mut SwitchyardConfig, path: &Path, warnings: &mut Vec<String>) -> ConfigSource {
    if !path.is_file() {
        return ConfigSource {
            path: path.to_path_buf(),
            loaded: false,
        };
    }

    match load_config_file(path) {
        Ok(layer) => {
            config.merge(layer);
            ConfigSource {
                path: path.to_path_buf(),
                loaded: true,
            }
        }
        Err(e) => {
            warnings.push(format!("Failed to load {}: {}", path.display(), e));
            ConfigSource {
                path: path.to_path_buf(),
                loaded: false,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
