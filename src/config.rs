//! Engine configuration: `KPI_GATE_CONFIG`, then `kpi_gate.toml`, then defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "KPI_GATE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "kpi_gate.toml";

/// Default alert band as a multiple of the warn band.
pub const DEFAULT_ALERT_BAND_MULTIPLIER: f64 = 2.0;

/// Fewest readings a period needs before contributors are ranked.
pub const DEFAULT_RCA_MIN_SAMPLES: u32 = 3;
pub const DEFAULT_RCA_TOP_N: usize = 10;

/// Fewest paired months a calibration run needs.
pub const DEFAULT_MIN_PAIRED_SAMPLES: u32 = 6;
pub const DEFAULT_CALIBRATION_TOLERANCE: f64 = 1e-9;
pub const DEFAULT_CALIBRATION_MAX_ITERATIONS: u32 = 50;
pub const DEFAULT_MAX_CONDITION_NUMBER: f64 = 1e8;

pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PAGE_SIZE: u32 = 500;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub flags: FlagConfig,
    pub rca: RcaConfig,
    pub calibration: CalibrationConfig,
    pub upstream: UpstreamConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagConfig {
    pub default_alert_band_multiplier: f64,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            default_alert_band_multiplier: DEFAULT_ALERT_BAND_MULTIPLIER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcaConfig {
    pub min_samples: u32,
    pub default_top_n: usize,
}

impl Default for RcaConfig {
    fn default() -> Self {
        Self {
            min_samples: DEFAULT_RCA_MIN_SAMPLES,
            default_top_n: DEFAULT_RCA_TOP_N,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub min_paired_samples: u32,
    /// Residual sum-of-squares change below which the fit counts as stable.
    pub tolerance: f64,
    pub max_iterations: u32,
    pub max_condition_number: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_paired_samples: DEFAULT_MIN_PAIRED_SAMPLES,
            tolerance: DEFAULT_CALIBRATION_TOLERANCE,
            max_iterations: DEFAULT_CALIBRATION_MAX_ITERATIONS,
            max_condition_number: DEFAULT_MAX_CONDITION_NUMBER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_ms: u64,
    pub page_size: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_UPSTREAM_TIMEOUT_MS,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl GateConfig {
    /// Load following the documented search order, falling back to defaults.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            tracing::info!(path = %path, "Loading config from {CONFIG_ENV_VAR}");
            return Self::from_file(Path::new(&path));
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            tracing::info!(path = %local.display(), "Loading config from working directory");
            return Self::from_file(local);
        }

        tracing::debug!("No config file found, using built-in defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: GateConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, message: String| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid { field, message })
        };

        if !(self.flags.default_alert_band_multiplier >= 1.0) {
            return invalid(
                "flags.default_alert_band_multiplier",
                format!("must be >= 1.0, got {}", self.flags.default_alert_band_multiplier),
            );
        }
        if self.rca.min_samples == 0 {
            return invalid("rca.min_samples", "must be at least 1".to_string());
        }
        if self.rca.default_top_n == 0 {
            return invalid("rca.default_top_n", "must be at least 1".to_string());
        }
        if self.calibration.min_paired_samples < 3 {
            return invalid(
                "calibration.min_paired_samples",
                format!("must be >= 3, got {}", self.calibration.min_paired_samples),
            );
        }
        if !(self.calibration.tolerance > 0.0) {
            return invalid("calibration.tolerance", "must be positive".to_string());
        }
        if self.calibration.max_iterations == 0 {
            return invalid("calibration.max_iterations", "must be at least 1".to_string());
        }
        if !(self.calibration.max_condition_number > 1.0) {
            return invalid("calibration.max_condition_number", "must exceed 1.0".to_string());
        }
        if self.upstream.timeout_ms == 0 {
            return invalid("upstream.timeout_ms", "must be positive".to_string());
        }
        if self.upstream.page_size == 0 {
            return invalid("upstream.page_size", "must be at least 1".to_string());
        }
        if self.database.max_connections == 0 {
            return invalid("database.max_connections", "must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flags.default_alert_band_multiplier, 2.0);
        assert_eq!(config.rca.min_samples, 3);
        assert_eq!(config.upstream.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config = GateConfig::from_toml_str(
            r#"
[rca]
default_top_n = 5

[calibration]
max_iterations = 20
"#,
        )
        .unwrap();
        assert_eq!(config.rca.default_top_n, 5);
        assert_eq!(config.rca.min_samples, DEFAULT_RCA_MIN_SAMPLES);
        assert_eq!(config.calibration.max_iterations, 20);
        assert_eq!(config.calibration.tolerance, DEFAULT_CALIBRATION_TOLERANCE);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = GateConfig::from_toml_str("[flags]\ndefault_alert_band_multiplier = 0.5\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { field: "flags.default_alert_band_multiplier", .. }
        ));

        let err = GateConfig::from_toml_str("[upstream]\npage_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "upstream.page_size", .. }));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            GateConfig::from_toml_str("[rca\nmin_samples = 3"),
            Err(ConfigError::Parse(_))
        ));
    }
}
