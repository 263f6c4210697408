//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for anvil
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version of the config schema
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Content-addressable store configuration
    pub cas: CasConfig,

    /// Generic caching executor configuration
    pub caching: CachingConfig,

    /// Local scheduler configuration
    pub scheduler: SchedulerConfig,

    /// User preferences that affect diagnostics only
    pub preferences: PreferencesConfig,
}

/// Content-addressable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    /// Root directory of the local store
    pub path: PathBuf,

    /// Directory of a second store treated as the remote mirror
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<PathBuf>,

    /// Keep the store between builds; when false it is discarded after use
    pub keep_directory: bool,

    /// Absolute size limit ("0" for unlimited, or a number with K/M/G/T suffix)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_limit: Option<String>,

    /// Size limit as a percentage of the available disk space
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_limit: Option<u32>,

    /// Query the cache from within compile tasks instead of separate key-query tasks
    pub integrated_queries: bool,

    /// Emit notes for cache misses and missing objects
    pub diagnostic_remarks: bool,

    /// Treat cache and network failures as task failures
    pub strict_errors: bool,

    /// Run key queries outside the regular execution lanes
    pub detached_key_queries: bool,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".anvil/cas"),
            remote_path: None,
            keep_directory: true,
            size_limit: None,
            percent_limit: None,
            integrated_queries: false,
            diagnostic_remarks: false,
            strict_errors: false,
            detached_key_queries: false,
        }
    }
}

/// Generic caching executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingConfig {
    /// Whether commands run through the caching executor at all
    pub enabled: bool,

    /// Parent directory for per-invocation sandboxes (defaults to the system temp dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_dir: Option<PathBuf>,

    /// Wrap commands in an OS sandbox where the host supports one
    pub enforce_sandbox: bool,

    /// Extra directories created inside every sandbox
    pub extra_sandbox_subdirectories: Vec<PathBuf>,

    /// Developer directory the enforced sandbox may write to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub developer_dir: Option<PathBuf>,

    /// Emit remarks describing cache keys, hits and misses
    pub debugging_remarks: bool,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sandbox_dir: None,
            enforce_sandbox: false,
            extra_sandbox_subdirectories: Vec::new(),
            developer_dir: None,
            debugging_remarks: false,
        }
    }
}

/// Local scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrent dynamic tasks
    pub concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// User preferences
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferencesConfig {
    /// Emit the discovered dependency nodes of driver tasks to the activity log
    pub enable_debug_activity_logs: bool,

    /// Cross-check scanner dependencies against make-style dependency files
    pub verify_scanner_dependencies: bool,
}
