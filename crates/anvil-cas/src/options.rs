//! Store options carried by caching task actions

use std::path::{Path, PathBuf};

use anvil_core::config::{parse_size_limit, CasConfig};
use anvil_core::serialization::{Deserializer, Serializable, Serializer};
use anvil_core::SerializationError;
use serde::Serialize;

use crate::error::{CasError, Result};

/// How the on-disk size of a store is bounded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SizeLimitingStrategy {
    /// The store is removed after the build
    Discarded,
    /// Fixed byte limit; `None` means unlimited
    MaxSizeBytes(Option<u64>),
    /// Percentage of the space available to the store (its own size plus free space)
    MaxPercentageOfAvailableSpace(u32),
}

impl Default for SizeLimitingStrategy {
    fn default() -> Self {
        SizeLimitingStrategy::MaxPercentageOfAvailableSpace(50)
    }
}

impl Serializable for SizeLimitingStrategy {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(2, |s| match self {
            SizeLimitingStrategy::Discarded => {
                s.serialize(&0u8);
                s.serialize_nil();
            }
            SizeLimitingStrategy::MaxSizeBytes(size) => {
                s.serialize(&1u8);
                s.serialize(size);
            }
            SizeLimitingStrategy::MaxPercentageOfAvailableSpace(percent) => {
                s.serialize(&2u8);
                s.serialize(percent);
            }
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(2)?;
        let tag: u8 = deserializer.deserialize()?;
        match tag {
            0 => {
                deserializer.deserialize_nil();
                Ok(SizeLimitingStrategy::Discarded)
            }
            1 => Ok(SizeLimitingStrategy::MaxSizeBytes(deserializer.deserialize()?)),
            2 => Ok(SizeLimitingStrategy::MaxPercentageOfAvailableSpace(
                deserializer.deserialize()?,
            )),
            tag => Err(SerializationError::UnsupportedVariant {
                type_name: "SizeLimitingStrategy",
                tag: tag as u64,
            }),
        }
    }
}

/// Options identifying a store and how tasks should treat it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CasOptions {
    pub cas_path: PathBuf,
    pub remote_service_path: Option<PathBuf>,
    pub enable_integrated_cache_queries: bool,
    pub enable_diagnostic_remarks: bool,
    pub enable_strict_cas_errors: bool,
    /// Key queries run outside the regular execution lanes
    pub enable_detached_key_queries: bool,
    pub limiting_strategy: SizeLimitingStrategy,
}

impl CasOptions {
    /// Options for a local store at `cas_path` with every flag off
    pub fn new(cas_path: impl Into<PathBuf>) -> Self {
        Self {
            cas_path: cas_path.into(),
            remote_service_path: None,
            enable_integrated_cache_queries: false,
            enable_diagnostic_remarks: false,
            enable_strict_cas_errors: false,
            enable_detached_key_queries: false,
            limiting_strategy: SizeLimitingStrategy::default(),
        }
    }

    /// Builder: set the remote mirror
    pub fn with_remote(mut self, path: impl Into<PathBuf>) -> Self {
        self.remote_service_path = Some(path.into());
        self
    }

    /// Builder: set the size limiting strategy
    pub fn with_limiting_strategy(mut self, strategy: SizeLimitingStrategy) -> Self {
        self.limiting_strategy = strategy;
        self
    }

    /// Builder: promote cache errors to failures
    pub fn with_strict_errors(mut self, strict: bool) -> Self {
        self.enable_strict_cas_errors = strict;
        self
    }

    /// Builder: emit notes about cache misses and missing objects
    pub fn with_diagnostic_remarks(mut self, enabled: bool) -> Self {
        self.enable_diagnostic_remarks = enabled;
        self
    }

    pub fn has_remote_cache(&self) -> bool {
        self.remote_service_path.is_some()
    }

    /// Derive options from the `[cas]` configuration section.
    ///
    /// An explicit size limit wins over a percentage; `"0"` means unlimited.
    pub fn from_config(config: &CasConfig) -> Result<Self> {
        let limiting_strategy = if !config.keep_directory {
            SizeLimitingStrategy::Discarded
        } else if let Some(limit) = &config.size_limit {
            let size = parse_size_limit(limit).ok_or_else(|| CasError::InvalidSizeLimit {
                value: limit.clone(),
                origin: "cas.size_limit".to_string(),
            })?;
            SizeLimitingStrategy::MaxSizeBytes((size > 0).then_some(size))
        } else if let Some(percent) = config.percent_limit {
            SizeLimitingStrategy::MaxPercentageOfAvailableSpace(percent)
        } else {
            SizeLimitingStrategy::default()
        };

        Ok(Self {
            cas_path: config.path.clone(),
            remote_service_path: config.remote_path.clone(),
            enable_integrated_cache_queries: config.integrated_queries,
            enable_diagnostic_remarks: config.diagnostic_remarks,
            enable_strict_cas_errors: config.strict_errors,
            enable_detached_key_queries: config.detached_key_queries,
            limiting_strategy,
        })
    }
}

impl Serializable for CasOptions {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(7, |s| {
            s.serialize(&self.cas_path);
            s.serialize(&self.remote_service_path);
            s.serialize(&self.enable_integrated_cache_queries);
            s.serialize(&self.enable_diagnostic_remarks);
            s.serialize(&self.enable_strict_cas_errors);
            s.serialize(&self.enable_detached_key_queries);
            s.serialize(&self.limiting_strategy);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(7)?;
        Ok(Self {
            cas_path: deserializer.deserialize()?,
            remote_service_path: deserializer.deserialize()?,
            enable_integrated_cache_queries: deserializer.deserialize()?,
            enable_diagnostic_remarks: deserializer.deserialize()?,
            enable_strict_cas_errors: deserializer.deserialize()?,
            enable_detached_key_queries: deserializer.deserialize()?,
            limiting_strategy: deserializer.deserialize()?,
        })
    }
}

/// The byte limit to apply to a store currently `db_size` bytes large.
///
/// `None` means "do not limit": the store size is unknown, the store is
/// discarded anyway, or the strategy says unlimited.
pub fn compute_size_limit(
    strategy: SizeLimitingStrategy,
    db_size: Option<u64>,
    cas_path: &Path,
) -> Result<Option<u64>> {
    let Some(db_size) = db_size else {
        return Ok(None);
    };
    match strategy {
        SizeLimitingStrategy::Discarded => Ok(None),
        SizeLimitingStrategy::MaxSizeBytes(size) => Ok(size),
        SizeLimitingStrategy::MaxPercentageOfAvailableSpace(percent) => {
            if percent == 0 {
                return Ok(None);
            }
            let percent = percent.min(100) as u64;
            let free_space = free_disk_space(cas_path)?;
            Ok(Some(percent_of(db_size.saturating_add(free_space), percent)))
        }
    }
}

fn percent_of(available: u64, percent: u64) -> u64 {
    ((available as u128 * percent as u128) / 100) as u64
}

/// Free space on the volume holding `path`, measured at the nearest existing ancestor
fn free_disk_space(path: &Path) -> Result<u64> {
    let mut existing = path;
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    Ok(fs2::available_space(existing)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::serialization::{from_bytes, to_bytes};
    use tempfile::TempDir;

    #[test]
    fn test_options_round_trip() {
        let options = CasOptions::new("/tmp/cas")
            .with_remote("/tmp/remote")
            .with_strict_errors(true)
            .with_limiting_strategy(SizeLimitingStrategy::MaxSizeBytes(Some(4096)));
        let decoded: CasOptions = from_bytes(&to_bytes(&options)).unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn test_strategy_round_trip() {
        for strategy in [
            SizeLimitingStrategy::Discarded,
            SizeLimitingStrategy::MaxSizeBytes(None),
            SizeLimitingStrategy::MaxPercentageOfAvailableSpace(75),
        ] {
            let decoded: SizeLimitingStrategy = from_bytes(&to_bytes(&strategy)).unwrap();
            assert_eq!(decoded, strategy);
        }
    }

    #[test]
    fn test_from_config_size_limit() {
        let mut config = CasConfig::default();
        config.size_limit = Some("2G".to_string());
        config.percent_limit = Some(10);
        let options = CasOptions::from_config(&config).unwrap();
        assert_eq!(
            options.limiting_strategy,
            SizeLimitingStrategy::MaxSizeBytes(Some(2 << 30))
        );
    }

    #[test]
    fn test_from_config_zero_is_unlimited() {
        let mut config = CasConfig::default();
        config.size_limit = Some("0".to_string());
        let options = CasOptions::from_config(&config).unwrap();
        assert_eq!(options.limiting_strategy, SizeLimitingStrategy::MaxSizeBytes(None));
    }

    #[test]
    fn test_from_config_discarded_and_default() {
        let mut config = CasConfig::default();
        assert_eq!(
            CasOptions::from_config(&config).unwrap().limiting_strategy,
            SizeLimitingStrategy::MaxPercentageOfAvailableSpace(50)
        );
        config.keep_directory = false;
        assert_eq!(
            CasOptions::from_config(&config).unwrap().limiting_strategy,
            SizeLimitingStrategy::Discarded
        );
    }

    #[test]
    fn test_from_config_invalid_limit() {
        let mut config = CasConfig::default();
        config.size_limit = Some("huge".to_string());
        assert!(matches!(
            CasOptions::from_config(&config),
            Err(CasError::InvalidSizeLimit { .. })
        ));
    }

    #[test]
    fn test_compute_size_limit() {
        let temp = TempDir::new().unwrap();
        let path = temp.path();
        assert_eq!(
            compute_size_limit(SizeLimitingStrategy::MaxSizeBytes(Some(10)), None, path).unwrap(),
            None
        );
        assert_eq!(
            compute_size_limit(SizeLimitingStrategy::MaxSizeBytes(Some(10)), Some(5), path).unwrap(),
            Some(10)
        );
        assert_eq!(
            compute_size_limit(SizeLimitingStrategy::Discarded, Some(5), path).unwrap(),
            None
        );
        assert_eq!(
            compute_size_limit(
                SizeLimitingStrategy::MaxPercentageOfAvailableSpace(0),
                Some(5),
                path
            )
            .unwrap(),
            None
        );
    }

    #[test]
    fn test_percentage_is_clamped() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("not/yet/created");
        let full = compute_size_limit(
            SizeLimitingStrategy::MaxPercentageOfAvailableSpace(100),
            Some(0),
            &missing,
        )
        .unwrap();
        let over = compute_size_limit(
            SizeLimitingStrategy::MaxPercentageOfAvailableSpace(250),
            Some(0),
            &missing,
        )
        .unwrap();
        // Free space may drift between calls; the clamp keeps both near equal
        let (full, over) = (full.unwrap(), over.unwrap());
        assert!(over <= full.saturating_add(1 << 24));
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(1000, 50), 500);
        assert_eq!(percent_of(u64::MAX, 100), u64::MAX);
    }
}
