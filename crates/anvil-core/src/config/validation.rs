//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_cas(config)?;
    validate_caching(config)?;
    validate_scheduler(config)?;
    debug!("configuration validation passed");
    Ok(())
}

/// Parse a size limit such as `"1024"`, `"512M"` or `"10G"`.
///
/// Plain integers are bytes; `K`, `M`, `G` and `T` suffixes are binary
/// multiples. `"0"` parses to zero, which callers treat as "no limit".
/// Returns `None` for anything else, including overflow.
pub fn parse_size_limit(value: &str) -> Option<u64> {
    if let Ok(size) = value.parse::<u64>() {
        return Some(size);
    }
    let suffix = value.chars().last()?;
    let number: u64 = value[..value.len() - suffix.len_utf8()].parse().ok()?;
    let shift = match suffix {
        'K' => 10,
        'M' => 20,
        'G' => 30,
        'T' => 40,
        _ => return None,
    };
    number.checked_mul(1u64 << shift)
}

fn validate_cas(config: &Config) -> Result<()> {
    if config.cas.path.as_os_str().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "cas.path".to_string(),
            message: "path cannot be empty".to_string(),
        }
        .into());
    }

    if let Some(limit) = &config.cas.size_limit {
        if parse_size_limit(limit).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "cas.size_limit".to_string(),
                message: format!("invalid size limit: '{}'", limit),
            }
            .into());
        }
    }

    Ok(())
}

fn validate_caching(config: &Config) -> Result<()> {
    for (i, dir) in config.caching.extra_sandbox_subdirectories.iter().enumerate() {
        if dir.is_absolute() {
            return Err(ConfigError::InvalidValue {
                field: format!("caching.extra_sandbox_subdirectories[{}]", i),
                message: "must be relative to the sandbox".to_string(),
            }
            .into());
        }
    }

    Ok(())
}

fn validate_scheduler(config: &Config) -> Result<()> {
    if config.scheduler.concurrency == 0 {
        return Err(ConfigError::InvalidValue {
            field: "scheduler.concurrency".to_string(),
            message: "must be at least 1".to_string(),
        }
        .into());
    }

    Ok(())
}
