//! Mutable per-learner progress records and their persisted snapshot form.
//!
//! Only stored facts live here. Mastery and topic percentages are derived on read by the
//! engine and never written back into these records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::catalog::{Catalog, CpaStage};
use crate::{AchievementId, ActivityId, EventId, LearnerId, LevelId, RewardId, TopicId};

/// Bumped whenever the serialized layout of [`ProgressSnapshot`] changes.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorObservation {
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub remediation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPattern {
    pub kind: String,
    pub description: String,
    pub frequency: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_occurred: OffsetDateTime,
    pub suggested_remediation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityRecord {
    pub activity_id: ActivityId,
    pub best_score: u32,
    pub max_score: u32,
    pub attempts: u32,
    pub time_spent_secs: u64,
    pub completed: bool,
    #[serde(default)]
    pub errors: Vec<ErrorPattern>,
}

impl ActivityRecord {
    #[must_use]
    pub fn new(activity_id: ActivityId, max_score: u32) -> Self {
        Self {
            activity_id,
            best_score: 0,
            max_score,
            attempts: 0,
            time_spent_secs: 0,
            completed: false,
            errors: Vec::new(),
        }
    }

    /// Best score as a percentage of the maximum; 0 before the first attempt.
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.attempts == 0 || self.max_score == 0 {
            return 0.0;
        }
        f64::from(self.best_score) / f64::from(self.max_score) * 100.0
    }

    /// Merge observed mistakes into the pattern list, keyed by `kind` in first-seen order.
    pub fn record_errors(&mut self, observations: &[ErrorObservation], at: OffsetDateTime) {
        for observation in observations {
            if let Some(pattern) =
                self.errors.iter_mut().find(|pattern| pattern.kind == observation.kind)
            {
                pattern.frequency = pattern.frequency.saturating_add(1);
                pattern.last_occurred = at;
                pattern.description.clone_from(&observation.description);
                if observation.remediation.is_some() {
                    pattern.suggested_remediation.clone_from(&observation.remediation);
                }
                continue;
            }

            self.errors.push(ErrorPattern {
                kind: observation.kind.clone(),
                description: observation.description.clone(),
                frequency: 1,
                last_occurred: at,
                suggested_remediation: observation.remediation.clone(),
            });
        }
    }

    fn rescaled(mut self, max_score: u32) -> Self {
        if self.max_score != max_score && self.max_score > 0 {
            let scaled = (u64::from(self.best_score) * u64::from(max_score)
                + u64::from(self.max_score) / 2)
                / u64::from(self.max_score);
            self.best_score = u32::try_from(scaled).unwrap_or(max_score).min(max_score);
            self.max_score = max_score;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelState {
    pub level_id: LevelId,
    pub unlocked: bool,
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicState {
    pub topic_id: TopicId,
    pub unlocked: bool,
    pub completed: bool,
}

/// One recorded attempt. Entries are appended and never edited or removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    pub event_id: EventId,
    pub topic_id: TopicId,
    pub level_id: LevelId,
    pub activity_id: ActivityId,
    pub score: u32,
    pub max_score: u32,
    pub time_spent_secs: u64,
    pub attempts: u32,
    pub cpa_stage: CpaStage,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AchievementUnlock {
    pub achievement_id: AchievementId,
    pub xp_reward: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub unlocked_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MiniGameRecord {
    pub reward_id: RewardId,
    pub high_score: u32,
    pub plays: u32,
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressState {
    pub topics: BTreeMap<TopicId, TopicState>,
    pub levels: BTreeMap<LevelId, LevelState>,
    pub activities: BTreeMap<ActivityId, ActivityRecord>,
    #[serde(default)]
    pub events: Vec<ProgressEvent>,
    #[serde(default)]
    pub achievements: Vec<AchievementUnlock>,
    #[serde(default)]
    pub unlocked_rewards: BTreeSet<RewardId>,
    #[serde(default)]
    pub mini_games: BTreeMap<RewardId, MiniGameRecord>,
}

impl ProgressState {
    /// Fresh state: everything locked and zeroed except the first topic and its first level.
    #[must_use]
    pub fn initial(catalog: &Catalog) -> Self {
        let mut state = Self::default();
        let entry_topic = catalog.topics_in_order().first().map(|topic| topic.id.clone());

        for topic in &catalog.topics {
            let is_entry = entry_topic.as_ref() == Some(&topic.id);
            state.topics.insert(
                topic.id.clone(),
                TopicState { topic_id: topic.id.clone(), unlocked: is_entry, completed: false },
            );

            let entry_level = topic.levels_in_order().first().map(|level| level.id.clone());
            for level in &topic.levels {
                state.levels.insert(
                    level.id.clone(),
                    LevelState {
                        level_id: level.id.clone(),
                        unlocked: is_entry && entry_level.as_ref() == Some(&level.id),
                        completed: false,
                    },
                );
                for activity in &level.activities {
                    state.activities.insert(
                        activity.id.clone(),
                        ActivityRecord::new(activity.id.clone(), activity.scoring.max_score),
                    );
                }
            }
        }

        for reward in &catalog.rewards {
            if reward.xp_required == 0 {
                state.unlocked_rewards.insert(reward.id.clone());
            }
        }

        state
    }

    /// Carry `previous` over onto the shape of `catalog`.
    ///
    /// Ids new to the catalog start locked and zeroed, retained ids keep their progress,
    /// ids dropped from the catalog leave the tree. Logs are carried over untouched.
    #[must_use]
    pub fn reconcile(catalog: &Catalog, previous: Self) -> Self {
        let mut state = Self::initial(catalog);
        let Self {
            topics,
            levels,
            activities,
            events,
            achievements,
            unlocked_rewards,
            mini_games,
        } = previous;

        for (id, topic) in topics {
            if let Some(slot) = state.topics.get_mut(&id) {
                slot.unlocked |= topic.unlocked;
                slot.completed = topic.completed;
            }
        }
        for (id, level) in levels {
            if let Some(slot) = state.levels.get_mut(&id) {
                slot.unlocked |= level.unlocked;
                slot.completed = level.completed;
            }
        }
        // Completed levels are sticky; a topic stays completed only while all its levels are.
        for topic in &catalog.topics {
            let finished = topic
                .levels
                .iter()
                .all(|level| state.levels.get(&level.id).is_some_and(|slot| slot.completed));
            if let Some(slot) = state.topics.get_mut(&topic.id) {
                slot.completed &= finished;
            }
        }
        for (id, record) in activities {
            if let Some(slot) = state.activities.get_mut(&id) {
                let max_score = slot.max_score;
                *slot = record.rescaled(max_score);
            }
        }
        for id in unlocked_rewards {
            if catalog.reward(&id).is_some() {
                state.unlocked_rewards.insert(id);
            }
        }
        for (id, record) in mini_games {
            if catalog.reward(&id).is_some() {
                state.mini_games.insert(id, record);
            }
        }

        state.events = events;
        state.achievements = achievements;
        state
    }

    #[must_use]
    pub fn is_achievement_unlocked(&self, id: &AchievementId) -> bool {
        self.achievements.iter().any(|unlock| &unlock.achievement_id == id)
    }

    #[must_use]
    pub fn activities_completed(&self) -> u32 {
        let count = self.activities.values().filter(|record| record.completed).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn levels_completed(&self) -> u32 {
        let count = self.levels.values().filter(|level| level.completed).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn completed_topics(&self) -> BTreeSet<TopicId> {
        self.topics
            .values()
            .filter(|topic| topic.completed)
            .map(|topic| topic.topic_id.clone())
            .collect()
    }
}

/// Durable, schema-versioned form of one learner's progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub schema_version: u32,
    pub learner_id: LearnerId,
    pub catalog_version: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: OffsetDateTime,
    pub state: ProgressState,
}
