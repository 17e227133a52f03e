/// Fabrication settings, loaded from RON with every field defaulted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::core::scoring::ScoreTerms;
use crate::schema::content::ProgramType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    /// Weight of meme isometry, shared by every program and instrument decision.
    pub meme_weight: f64,
    pub directly_bound_bonus: f64,
    pub entropy_sigma: f64,
    /// Weight of chord Markov affinity for chord-bearing layer programs.
    pub chord_affinity_weight: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            meme_weight: 10.0,
            directly_bound_bonus: 100.0,
            entropy_sigma: 0.5,
            chord_affinity_weight: 1.0,
        }
    }
}

impl ScoringConfig {
    pub fn terms(&self) -> ScoreTerms {
        ScoreTerms {
            meme_weight: self.meme_weight,
            entropy_sigma: self.entropy_sigma,
            bound_bonus: self.directly_bound_bonus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DigestCacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
    pub refresh_after_secs: u64,
}

impl Default for DigestCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            ttl_secs: 3600,
            refresh_after_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FabricationConfig {
    /// Longest segment in beats; `None` crafts one whole main sequence per segment.
    pub segment_beats: Option<u32>,
    pub previous_segment_limit: usize,
    pub tuning_a4_hz: f64,
    /// Arrangement layers crafted after macro/main, in order.
    pub layers: Vec<ProgramType>,
    pub markov_order: usize,
    /// Stagger layer choices in and out across a main program's run.
    pub choice_delta_enabled: bool,
    /// Beats of a main program run that layer windows are spread over.
    pub main_length_max_delta: u32,
    pub scoring: ScoringConfig,
    pub digest_cache: DigestCacheConfig,
}

impl Default for FabricationConfig {
    fn default() -> Self {
        Self {
            segment_beats: None,
            previous_segment_limit: 8,
            tuning_a4_hz: 432.0,
            layers: vec![ProgramType::Rhythm, ProgramType::Detail],
            markov_order: 3,
            choice_delta_enabled: false,
            main_length_max_delta: 280,
            scoring: ScoringConfig::default(),
            digest_cache: DigestCacheConfig::default(),
        }
    }
}

impl FabricationConfig {
    pub fn parse_ron(input: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_ron(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.markov_order == 0 {
            return Err(ConfigError::Invalid("markov_order must be at least 1".into()));
        }
        if !(self.tuning_a4_hz.is_finite() && self.tuning_a4_hz > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tuning_a4_hz must be positive, got {}",
                self.tuning_a4_hz
            )));
        }
        if self.segment_beats == Some(0) {
            return Err(ConfigError::Invalid("segment_beats must be positive".into()));
        }
        if self.choice_delta_enabled && self.main_length_max_delta < 2 {
            return Err(ConfigError::Invalid(
                "main_length_max_delta must be at least 2 beats".into(),
            ));
        }
        if self.scoring.entropy_sigma < 0.0 {
            return Err(ConfigError::Invalid("entropy_sigma must not be negative".into()));
        }
        if self.digest_cache.refresh_after_secs > self.digest_cache.ttl_secs {
            return Err(ConfigError::Invalid(
                "digest_cache.refresh_after_secs must not exceed ttl_secs".into(),
            ));
        }
        if let Some(t) = self.layers.iter().find(|t| t.is_structural()) {
            return Err(ConfigError::Invalid(format!(
                "{:?} is crafted by macro/main and cannot be a layer",
                t
            )));
        }
        Ok(())
    }
}
