//! Configuration loading and database path resolution
//!
//! The association engine consumes an enumerated configuration resolved once
//! per session. The TOML file is owned by the operator; missing files fall
//! back to compiled defaults with a warning rather than terminating.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the catalog database location
pub const DATABASE_ENV_VAR: &str = "SKYCAT_DATABASE";

/// Which catalog records are cross-matched after association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchScope {
    /// Every record the session wrote (created, merged or null-incremented)
    All,
    /// Only records created by the session
    NewOnly,
}

/// Reference catalog cross-match mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossMatchMode {
    /// Discard any existing match and query every configured catalog
    Redo,
    /// Query only catalogs not yet checked for the record
    Update,
}

/// Configuration/beam-class compatibility rule for cone searches
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityRule {
    /// Class keys must be identical
    Exact,
    /// Beam sizes may differ by at most this ratio (>= 1.0)
    BeamRatio(f64),
}

impl CompatibilityRule {
    /// Check whether two configuration classes may be associated
    pub fn accepts(&self, key_a: &str, beam_a_deg: f64, key_b: &str, beam_b_deg: f64) -> bool {
        match *self {
            CompatibilityRule::Exact => key_a == key_b,
            CompatibilityRule::BeamRatio(tolerance) => {
                if key_a == key_b {
                    return true;
                }
                let (lo, hi) = if beam_a_deg <= beam_b_deg {
                    (beam_a_deg, beam_b_deg)
                } else {
                    (beam_b_deg, beam_a_deg)
                };
                lo > 0.0 && hi / lo <= tolerance
            }
        }
    }
}

/// What to do with a detection that fails measurement validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidMeasurementPolicy {
    /// Exclude the detection and report it in the session outcome
    Skip,
    /// Abort the whole image
    FailFast,
}

/// Association and cross-match settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    pub match_scope: MatchScope,
    pub crossmatch_enabled: bool,
    pub crossmatch_mode: CrossMatchMode,
    /// Reference catalogs in query order
    pub catalogs: Vec<String>,
    /// Maximum admissible de Ruiter radius (exclusive)
    pub de_ruiter_threshold: f64,
    /// Fraction of the image field radius searched for known sources
    pub search_radius_scale: f64,
    /// Hard cap on any cone search radius (degrees)
    pub max_search_radius_deg: f64,
    /// Per-detection candidate cone, in beam major axes
    pub candidate_radius_beams: f64,
    /// Reject detections lying outside the scaled image search region
    pub restrict_to_search_region: bool,
    pub compatibility: CompatibilityRule,
    pub invalid_measurement_policy: InvalidMeasurementPolicy,
    /// Retries after a write conflict before the image is reported failed
    pub max_conflict_retries: u32,
    pub max_concurrent_images: usize,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            match_scope: MatchScope::All,
            crossmatch_enabled: false,
            crossmatch_mode: CrossMatchMode::Update,
            catalogs: Vec::new(),
            de_ruiter_threshold: 5.68,
            search_radius_scale: 0.5,
            max_search_radius_deg: 3.0,
            candidate_radius_beams: 1.0,
            restrict_to_search_region: false,
            compatibility: CompatibilityRule::Exact,
            invalid_measurement_policy: InvalidMeasurementPolicy::Skip,
            max_conflict_retries: 3,
            max_concurrent_images: 4,
        }
    }
}

impl AssociationConfig {
    /// Validate settings; called before any cone search is issued
    pub fn validate(&self) -> Result<()> {
        if !self.de_ruiter_threshold.is_finite() || self.de_ruiter_threshold <= 0.0 {
            return Err(Error::Config(format!(
                "de_ruiter_threshold must be a positive number, got {}",
                self.de_ruiter_threshold
            )));
        }
        for (name, value) in [
            ("search_radius_scale", self.search_radius_scale),
            ("max_search_radius_deg", self.max_search_radius_deg),
            ("candidate_radius_beams", self.candidate_radius_beams),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }
        if self.max_search_radius_deg > 180.0 {
            return Err(Error::Config(format!(
                "max_search_radius_deg cannot exceed 180, got {}",
                self.max_search_radius_deg
            )));
        }
        if let CompatibilityRule::BeamRatio(tolerance) = self.compatibility {
            if !tolerance.is_finite() || tolerance < 1.0 {
                return Err(Error::Config(format!(
                    "beam_ratio tolerance must be >= 1.0, got {}",
                    tolerance
                )));
            }
        }
        if self.max_concurrent_images == 0 {
            return Err(Error::Config(
                "max_concurrent_images must be at least 1".to_string(),
            ));
        }
        if self.crossmatch_enabled && self.catalogs.is_empty() {
            warn!("Cross-matching enabled but no reference catalogs configured");
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive (e.g. "info", "skycat_assoc=debug")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Top-level TOML configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub database_path: Option<PathBuf>,
    /// Reference catalog database; defaults to the catalog database
    pub reference_database_path: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub association: AssociationConfig,
}

/// Default configuration file location (`<config dir>/skycat/skycat.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("skycat").join("skycat.toml"))
}

/// Load a TOML configuration file
///
/// A missing file yields compiled defaults with a warning. A file that exists
/// but cannot be parsed is a configuration error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file {} not found, using compiled defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Write a TOML configuration atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Database path resolution, in priority order:
/// 1. Command-line argument
/// 2. `SKYCAT_DATABASE` environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default
pub fn resolve_database_path(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.database_path {
        return path.clone();
    }

    default_database_path()
}

/// Get OS-dependent default catalog database path
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("skycat").join("catalog.db"))
        .unwrap_or_else(|| PathBuf::from("./skycat_data/catalog.db"))
}
