//! Default configuration values

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "anvil.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "anvil.yaml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".anvil.toml",
        ".anvil.yaml",
    ]
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# anvil configuration

[cas]
path = ".anvil/cas"
keep_directory = true
# size_limit = "10G"
# percent_limit = 50
integrated_queries = false
diagnostic_remarks = false
strict_errors = false
detached_key_queries = false

[caching]
enabled = true
enforce_sandbox = false
extra_sandbox_subdirectories = []
debugging_remarks = false

[scheduler]
concurrency = 4

[preferences]
enable_debug_activity_logs = false
verify_scanner_dependencies = false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_to_defaults() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        let defaults = Config::default();
        assert_eq!(config.cas.path, defaults.cas.path);
        assert_eq!(config.caching.enabled, defaults.caching.enabled);
        assert_eq!(config.scheduler.concurrency, defaults.scheduler.concurrency);
    }

    #[test]
    fn test_default_config_toml_round_trips() {
        let rendered = default_config_toml();
        let config: Config = toml::from_str(&rendered).unwrap();
        assert!(config.cas.keep_directory);
    }
}
