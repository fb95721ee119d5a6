//! Engine configuration.
//!
//! Loaded once at startup and read-only afterwards:
//!
//! 1. TOML file at `$XDG_CONFIG_HOME/talent-match/engine.toml` (or the platform config
//!    dir); missing file means defaults.
//! 2. `TALENT_MATCH_*` environment overrides (a `.env` file is honored).
//! 3. [`EngineConfig::validate`].
//!
//! # Example
//!
//! ```toml
//! [vector]
//! metric = "cosine"
//! n_lists = 64
//! n_probe = 8
//!
//! [vector.dimensions]
//! candidate = 384
//! posting = 384
//!
//! [fusion.weights]
//! vector = 0.5
//! text = 0.3
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::indexer::coordinator::CoordinatorConfig;
use crate::model::types::ClassMap;
use crate::search::ann_index::{DistanceMetric, IvfParams};
use crate::search::fusion::FusionConfig;
use crate::search::planner::PlannerConfig;

pub const APP_DIR: &str = "talent-match";
pub const CONFIG_FILE: &str = "engine.toml";
pub const ENV_PREFIX: &str = "TALENT_MATCH_";
pub const DEFAULT_DIMENSION: usize = 384;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Invalid value for {key}: {value:?}")]
    InvalidOverride { key: String, value: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub metric: DistanceMetric,
    #[serde(flatten)]
    pub ivf: IvfParams,
    /// Embedding dimension per entity class.
    pub dimensions: ClassMap<usize>,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::default(),
            ivf: IvfParams::default(),
            dimensions: ClassMap::from_fn(|_| DEFAULT_DIMENSION),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub vector: VectorConfig,
    pub fusion: FusionConfig,
    pub planner: PlannerConfig,
    pub coordinator: CoordinatorConfig,
}

impl EngineConfig {
    /// Load from the default location, apply environment overrides, validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from a specific path (defaults if absent), apply environment overrides,
    /// validate.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::read_file(path)?;
        config.apply_overrides(|key| dotenvy::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a file without overrides or validation.
    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Default configuration file path.
    ///
    /// - Primary: `$XDG_CONFIG_HOME/talent-match/engine.toml`
    /// - Fallback: platform config dir (e.g. `~/.config/talent-match/engine.toml`)
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(xdg_config) = dotenvy::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config).join(APP_DIR).join(CONFIG_FILE));
        }
        dirs::config_dir()
            .map(|p| p.join(APP_DIR).join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Apply `TALENT_MATCH_*` overrides read through `lookup`.
    ///
    /// Unparseable values are an error rather than silently ignored.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |suffix: &str| {
            let key = format!("{ENV_PREFIX}{suffix}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("CANDIDATE_DIM") {
            self.vector.dimensions.candidate = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("POSTING_DIM") {
            self.vector.dimensions.posting = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("METRIC") {
            self.vector.metric = match value.trim().to_ascii_lowercase().as_str() {
                "cosine" => DistanceMetric::Cosine,
                "l2" | "euclidean" => DistanceMetric::L2,
                _ => return Err(ConfigError::InvalidOverride { key, value }),
            };
        }
        if let Some((key, value)) = get("N_LISTS") {
            self.vector.ivf.n_lists = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("N_PROBE") {
            self.vector.ivf.n_probe = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("TRAIN_THRESHOLD") {
            self.vector.ivf.train_threshold = parse_override(&key, &value)?;
        }

        let weights = &mut self.fusion.weights;
        for (suffix, slot) in [
            ("WEIGHT_VECTOR", &mut weights.vector),
            ("WEIGHT_TEXT", &mut weights.text),
            ("WEIGHT_SKILL", &mut weights.skill),
            ("WEIGHT_SENIORITY", &mut weights.seniority),
            ("WEIGHT_GEO", &mut weights.geo),
        ] {
            if let Some((key, value)) = get(suffix) {
                *slot = parse_override(&key, &value)?;
            }
        }

        if let Some((key, value)) = get("OVER_FETCH") {
            self.planner.over_fetch_factor = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("MIN_CANDIDATES") {
            self.planner.min_candidates = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("STALENESS_MS") {
            self.planner.staleness_timeout_ms = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("RETRY_MAX") {
            self.coordinator.retry.max_attempts = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("BACKOFF_BASE_MS") {
            self.coordinator.retry.base_delay_ms = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("BACKOFF_MAX_MS") {
            self.coordinator.retry.max_delay_ms = parse_override(&key, &value)?;
        }
        if let Some((key, value)) = get("PROPAGATION_BATCH") {
            self.coordinator.propagation_batch = parse_override(&key, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let dims = &self.vector.dimensions;
        if dims.candidate == 0 || dims.posting == 0 {
            return Err(ConfigError::Validation(
                "vector dimensions must be at least 1".into(),
            ));
        }
        let ivf = &self.vector.ivf;
        if ivf.n_lists == 0 {
            return Err(ConfigError::Validation("n_lists must be at least 1".into()));
        }
        if ivf.n_probe == 0 || ivf.n_probe > ivf.n_lists {
            return Err(ConfigError::Validation(format!(
                "n_probe must be between 1 and n_lists ({}), got {}",
                ivf.n_lists, ivf.n_probe
            )));
        }
        for (name, weight) in self.fusion.weights.iter() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "fusion weight {name} must be a non-negative number, got {weight}"
                )));
            }
        }
        if !self.fusion.rrf_k.is_finite() || self.fusion.rrf_k < 0.0 {
            return Err(ConfigError::Validation(
                "rrf_k must be a non-negative number".into(),
            ));
        }
        if self.planner.over_fetch_factor == 0 {
            return Err(ConfigError::Validation(
                "over_fetch_factor must be at least 1".into(),
            ));
        }
        let retry = &self.coordinator.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter_pct) {
            return Err(ConfigError::Validation(
                "retry jitter_pct must be within 0.0..=1.0".into(),
            ));
        }
        if self.coordinator.propagation_batch == 0 {
            return Err(ConfigError::Validation(
                "propagation_batch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::fusion::TextNormalization;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.vector.dimensions.candidate, DEFAULT_DIMENSION);
        assert_eq!(config.vector.metric, DistanceMetric::Cosine);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::read_file(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [vector]
            metric = "l2"
            n_probe = 4

            [vector.dimensions]
            candidate = 768
            posting = 384

            [fusion]
            text_normalization = "reciprocal_rank"

            [fusion.weights]
            text = 0.6
            "#,
        )
        .unwrap();
        assert_eq!(config.vector.metric, DistanceMetric::L2);
        assert_eq!(config.vector.ivf.n_probe, 4);
        assert_eq!(config.vector.ivf.n_lists, IvfParams::default().n_lists);
        assert_eq!(config.vector.dimensions.candidate, 768);
        assert_eq!(config.fusion.text_normalization, TextNormalization::ReciprocalRank);
        assert_eq!(config.fusion.weights.text, 0.6);
        assert_eq!(config.fusion.weights.vector, 0.5);
        config.validate().unwrap();
    }

    #[test]
    fn save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(APP_DIR).join(CONFIG_FILE);
        let mut config = EngineConfig::default();
        config.planner.min_candidates = 10;
        config.save_to(&path).unwrap();
        assert_eq!(EngineConfig::read_file(&path).unwrap(), config);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(lookup(&[
                ("TALENT_MATCH_CANDIDATE_DIM", "128"),
                ("TALENT_MATCH_METRIC", "L2"),
                ("TALENT_MATCH_WEIGHT_GEO", "0.2"),
                ("TALENT_MATCH_OVER_FETCH", "8"),
                ("TALENT_MATCH_RETRY_MAX", "5"),
            ]))
            .unwrap();
        assert_eq!(config.vector.dimensions.candidate, 128);
        assert_eq!(config.vector.dimensions.posting, DEFAULT_DIMENSION);
        assert_eq!(config.vector.metric, DistanceMetric::L2);
        assert_eq!(config.fusion.weights.geo, 0.2);
        assert_eq!(config.planner.over_fetch_factor, 8);
        assert_eq!(config.coordinator.retry.max_attempts, 5);
    }

    #[test]
    fn bad_override_is_an_error() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(lookup(&[("TALENT_MATCH_N_PROBE", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { key, .. } if key == "TALENT_MATCH_N_PROBE"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.fusion.weights.text = -0.1;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = EngineConfig::default();
        config.vector.ivf.n_probe = config.vector.ivf.n_lists + 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.vector.dimensions.posting = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_path_ends_with_app_file() {
        if let Ok(path) = EngineConfig::config_path() {
            assert!(path.ends_with(Path::new(APP_DIR).join(CONFIG_FILE)));
        }
    }
}
