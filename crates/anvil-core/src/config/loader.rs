//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

use super::defaults::config_file_names;
use super::types::Config;
use super::validation::validate_config;

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<Config> {
    let format = if path.extension().is_some_and(|e| e == "toml") {
        "TOML"
    } else {
        "YAML"
    };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: Config = if format == "TOML" {
        toml::from_str(&content).map_err(ConfigError::TomlError)?
    } else {
        serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?
    };

    validate_config(&config)?;
    debug!(path = %path.display(), "config loaded and validated");
    Ok(config)
}

/// Find configuration file in directory or parent directories.
///
/// The first matching name in the nearest directory wins.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found config file");
                return Some(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no config file found");
    None
}

/// Load configuration from directory (searching parent directories)
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let mut config = load_config(&config_path)?;
    if let Some(root) = config_path.parent() {
        resolve_relative_paths(&mut config, root);
    }
    Ok((config, config_path))
}

/// Load configuration or use defaults
pub fn load_config_or_default(dir: &Path) -> (Config, Option<PathBuf>) {
    match load_config_from_dir(dir) {
        Ok((config, path)) => (config, Some(path)),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "no usable config found, using defaults");
            let mut config = Config::default();
            resolve_relative_paths(&mut config, dir);
            (config, None)
        }
    }
}

/// Anchor relative store and sandbox paths at the directory holding the config
fn resolve_relative_paths(config: &mut Config, root: &Path) {
    if config.cas.path.is_relative() {
        config.cas.path = root.join(&config.cas.path);
    }
    if let Some(remote) = config.cas.remote_path.as_mut() {
        if remote.is_relative() {
            *remote = root.join(&*remote);
        }
    }
    if let Some(sandbox) = config.caching.sandbox_dir.as_mut() {
        if sandbox.is_relative() {
            *sandbox = root.join(&*sandbox);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("anvil.toml");
        std::fs::write(&config_path, "[scheduler]\nconcurrency = 2").unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_prefers_toml_over_yaml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("anvil.toml");
        let yaml_path = temp.path().join("anvil.yaml");
        std::fs::write(&toml_path, "[scheduler]\nconcurrency = 2").unwrap();
        std::fs::write(&yaml_path, "scheduler:\n  concurrency: 3").unwrap();

        let found = find_config(temp.path()).unwrap();
        assert_eq!(found, toml_path);
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        let config_path = temp.path().join(".anvil.yaml");
        std::fs::write(&config_path, "scheduler:\n  concurrency: 3").unwrap();

        assert_eq!(find_config(&nested), Some(config_path));
    }

    #[test]
    fn test_load_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("anvil.toml");
        std::fs::write(
            &config_path,
            "[cas]\nsize_limit = \"10G\"\nstrict_errors = true\n\n[caching]\ndebugging_remarks = true\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.cas.size_limit.as_deref(), Some("10G"));
        assert!(config.cas.strict_errors);
        assert!(config.caching.debugging_remarks);
    }

    #[test]
    fn test_load_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("anvil.yaml");
        std::fs::write(
            &config_path,
            "cas:\n  percent_limit: 25\npreferences:\n  enable_debug_activity_logs: true\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.cas.percent_limit, Some(25));
        assert!(config.preferences.enable_debug_activity_logs);
    }

    #[test]
    fn test_relative_paths_anchor_at_config_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("anvil.toml"),
            "[cas]\npath = \"store\"\nremote_path = \"mirror\"\n",
        )
        .unwrap();

        let (config, _) = load_config_from_dir(temp.path()).unwrap();
        assert_eq!(config.cas.path, temp.path().join("store"));
        assert_eq!(config.cas.remote_path, Some(temp.path().join("mirror")));
    }

    #[test]
    fn test_load_config_or_default_without_file() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path());
        assert!(path.is_none());
        assert_eq!(config.cas.path, temp.path().join(".anvil/cas"));
    }
}
