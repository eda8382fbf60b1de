use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::beat::OnsetFunction;
use crate::error::ConfigError;

/// Pipeline configuration. Missing JSON fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Audio sample rate in Hz.
    pub sample_rate: u32,
    /// Samples between consecutive analysis frames.
    pub hop_size: usize,
    /// Analysis window of the reference frontend.
    pub fft_size: usize,
    pub min_tempo: f32,
    pub max_tempo: f32,
    /// Candidates below this confidence never become beat events.
    pub confidence_threshold: f32,
    pub beats_per_measure: u8,
    /// Beat events kept for `recent_beats`.
    pub history_capacity: usize,
    pub adaptive_peak_window_size: usize,
    pub adaptive_peak_alpha: f32,
    pub initial_threshold: f32,
    pub scorer_timeout_ms: u64,
    pub onset_function: OnsetFunction,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            hop_size: 512,
            fft_size: 1024,
            min_tempo: 60.0,
            max_tempo: 200.0,
            confidence_threshold: 0.7,
            beats_per_measure: 4,
            history_capacity: 100,
            adaptive_peak_window_size: 5,
            adaptive_peak_alpha: 0.01,
            initial_threshold: 0.3,
            scorer_timeout_ms: 50,
            onset_function: OnsetFunction::SpectralFlux,
        }
    }
}

impl SyncConfig {
    /// Seconds between consecutive analysis frames.
    pub fn hop_seconds(&self) -> f64 {
        self.hop_size as f64 / f64::from(self.sample_rate.max(1))
    }

    pub fn scorer_timeout(&self) -> Duration {
        Duration::from_millis(self.scorer_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::out_of_range("sample_rate", 0, "> 0"));
        }
        if self.hop_size == 0 {
            return Err(ConfigError::out_of_range("hop_size", 0, "> 0"));
        }
        if self.fft_size < self.hop_size {
            return Err(ConfigError::out_of_range(
                "fft_size",
                self.fft_size as f64,
                ">= hop_size",
            ));
        }
        let tempo_ok = self.min_tempo.is_finite()
            && self.max_tempo.is_finite()
            && self.min_tempo > 0.0
            && self.min_tempo < self.max_tempo;
        if !tempo_ok {
            return Err(ConfigError::InvalidTempoRange {
                min: self.min_tempo,
                max: self.max_tempo,
            });
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::out_of_range(
                "confidence_threshold",
                self.confidence_threshold,
                "0.0..=1.0",
            ));
        }
        if self.beats_per_measure == 0 {
            return Err(ConfigError::out_of_range("beats_per_measure", 0, ">= 1"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::out_of_range("history_capacity", 0, ">= 1"));
        }
        if self.adaptive_peak_window_size < 3 {
            return Err(ConfigError::out_of_range(
                "adaptive_peak_window_size",
                self.adaptive_peak_window_size as f64,
                ">= 3",
            ));
        }
        if self.adaptive_peak_window_size % 2 == 0 {
            return Err(ConfigError::EvenWindow(self.adaptive_peak_window_size));
        }
        if !(self.adaptive_peak_alpha > 0.0 && self.adaptive_peak_alpha <= 1.0) {
            return Err(ConfigError::out_of_range(
                "adaptive_peak_alpha",
                self.adaptive_peak_alpha,
                "0.0 < alpha <= 1.0",
            ));
        }
        if !self.initial_threshold.is_finite() || self.initial_threshold < 0.0 {
            return Err(ConfigError::out_of_range(
                "initial_threshold",
                self.initial_threshold,
                "finite and >= 0",
            ));
        }
        if self.scorer_timeout_ms == 0 {
            return Err(ConfigError::out_of_range("scorer_timeout_ms", 0, ">= 1"));
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("beatsync").join("config.json")
    }

    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults on any
    /// problem.
    pub fn load_or_default() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => {
                log::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("Ignoring config {}: {e:#}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        log::info!("Saved config to {}", path.display());
        Ok(())
    }
}

/// Partial configuration change for `SyncEngine::update_config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfigUpdate {
    pub sample_rate: Option<u32>,
    pub hop_size: Option<usize>,
    pub fft_size: Option<usize>,
    pub min_tempo: Option<f32>,
    pub max_tempo: Option<f32>,
    pub confidence_threshold: Option<f32>,
    pub beats_per_measure: Option<u8>,
    pub history_capacity: Option<usize>,
    pub adaptive_peak_window_size: Option<usize>,
    pub adaptive_peak_alpha: Option<f32>,
    pub initial_threshold: Option<f32>,
    pub scorer_timeout_ms: Option<u64>,
    pub onset_function: Option<OnsetFunction>,
}

impl SyncConfigUpdate {
    /// Merge into `base` and validate the result. `base` is left untouched.
    pub fn apply_to(&self, base: &SyncConfig) -> Result<SyncConfig, ConfigError> {
        let mut next = base.clone();
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { next.$field = v; })*
            };
        }
        merge!(
            sample_rate,
            hop_size,
            fft_size,
            min_tempo,
            max_tempo,
            confidence_threshold,
            beats_per_measure,
            history_capacity,
            adaptive_peak_window_size,
            adaptive_peak_alpha,
            initial_threshold,
            scorer_timeout_ms,
            onset_function,
        );
        next.validate()?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.hop_seconds() - 512.0 / 44100.0).abs() < 1e-12);
    }

    #[test]
    fn inverted_tempo_range_rejected() {
        let config = SyncConfig {
            min_tempo: 180.0,
            max_tempo: 90.0,
            ..SyncConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTempoRange { min: 180.0, max: 90.0 })
        );
        let equal = SyncConfig {
            min_tempo: 120.0,
            max_tempo: 120.0,
            ..SyncConfig::default()
        };
        assert!(equal.validate().is_err());
    }

    #[test]
    fn even_window_rejected() {
        let config = SyncConfig {
            adaptive_peak_window_size: 6,
            ..SyncConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::EvenWindow(6)));
    }

    #[test]
    fn out_of_range_fields_rejected() {
        let bad = [
            SyncConfig { confidence_threshold: 1.5, ..SyncConfig::default() },
            SyncConfig { adaptive_peak_alpha: 0.0, ..SyncConfig::default() },
            SyncConfig { beats_per_measure: 0, ..SyncConfig::default() },
            SyncConfig { history_capacity: 0, ..SyncConfig::default() },
            SyncConfig { hop_size: 0, ..SyncConfig::default() },
            SyncConfig { sample_rate: 0, ..SyncConfig::default() },
            SyncConfig { scorer_timeout_ms: 0, ..SyncConfig::default() },
            SyncConfig { initial_threshold: f32::NAN, ..SyncConfig::default() },
            SyncConfig { fft_size: 256, ..SyncConfig::default() },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ConfigError::OutOfRange { .. })),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn update_merges_and_validates() {
        let base = SyncConfig::default();
        let update = SyncConfigUpdate {
            min_tempo: Some(80.0),
            beats_per_measure: Some(3),
            ..SyncConfigUpdate::default()
        };
        let next = update.apply_to(&base).unwrap();
        assert_eq!(next.min_tempo, 80.0);
        assert_eq!(next.beats_per_measure, 3);
        assert_eq!(next.max_tempo, base.max_tempo);

        let bad = SyncConfigUpdate {
            min_tempo: Some(250.0),
            ..SyncConfigUpdate::default()
        };
        assert!(bad.apply_to(&base).is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{ "min_tempo": 90.0, "onset_function": "complex-domain" }"#)
                .unwrap();
        assert_eq!(config.min_tempo, 90.0);
        assert_eq!(config.onset_function, OnsetFunction::ComplexDomain);
        assert_eq!(config.max_tempo, 200.0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = SyncConfig {
            beats_per_measure: 3,
            onset_function: OnsetFunction::PhaseDeviation,
            ..SyncConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "min_tempo": 300.0 }"#).unwrap();
        assert!(SyncConfig::load(&path).is_err());
        std::fs::write(&path, "not json").unwrap();
        assert!(SyncConfig::load(&path).is_err());
    }
}
