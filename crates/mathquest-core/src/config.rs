//! Tunable engine policy. Every field has a default so an empty document is a valid config.

use serde::{Deserialize, Serialize};

use crate::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct XpPolicy {
    /// XP for a perfect attempt; partial attempts earn a rounded share.
    pub max_attempt_xp: u64,
    pub first_completion_bonus: u64,
}

impl Default for XpPolicy {
    fn default() -> Self {
        Self { max_attempt_xp: 10, first_completion_bonus: 20 }
    }
}

impl XpPolicy {
    /// XP earned by one attempt, proportional to `raw_score / max_score` and rounded half up.
    #[must_use]
    pub fn attempt_xp(&self, raw_score: u32, max_score: u32) -> u64 {
        if max_score == 0 {
            return 0;
        }
        let max = u64::from(max_score);
        let raw = u64::from(raw_score.min(max_score));
        (raw.saturating_mul(self.max_attempt_xp) + max / 2) / max
    }
}

/// Monotonic XP thresholds; entry `n` is the XP needed to reach level `n + 1`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LevelTable(pub Vec<u64>);

impl Default for LevelTable {
    fn default() -> Self {
        Self(vec![0, 100, 300, 600, 1000, 1500, 2100, 2800, 3600, 4500])
    }
}

impl LevelTable {
    #[must_use]
    pub fn level_for(&self, xp: u64) -> u32 {
        let reached = self.0.iter().take_while(|threshold| **threshold <= xp).count();
        u32::try_from(reached).unwrap_or(u32::MAX).max(1)
    }

    /// XP still missing for the next level, `None` at the top of the table.
    #[must_use]
    pub fn xp_to_next_level(&self, xp: u64) -> Option<u64> {
        self.0.iter().find(|threshold| **threshold > xp).map(|threshold| threshold - xp)
    }

    fn validate(&self) -> Result<(), EngineError> {
        match self.0.first() {
            None => return Err(EngineError::InvalidConfig("level table MUST be non-empty".into())),
            Some(first) if *first != 0 => {
                return Err(EngineError::InvalidConfig(
                    "level table MUST start at 0 XP".to_string(),
                ))
            }
            Some(_) => {}
        }
        if self.0.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(EngineError::InvalidConfig(
                "level table thresholds MUST be strictly increasing".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub xp: XpPolicy,
    pub levels: LevelTable,
    /// Attempts on an unmastered level before analytics flags the learner.
    pub needs_help_attempts: u32,
    pub recent_activity_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            xp: XpPolicy::default(),
            levels: LevelTable::default(),
            needs_help_attempts: 3,
            recent_activity_limit: 5,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`EngineError::InvalidConfig`] when parsing or validation fails.
    pub fn from_yaml_str(raw: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| EngineError::InvalidConfig(format!("yaml parse failed: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`EngineError::InvalidConfig`] when parsing or validation fails.
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| EngineError::InvalidConfig(format!("json parse failed: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`EngineError::InvalidConfig`] when the level table is malformed.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.levels.validate()
    }
}
