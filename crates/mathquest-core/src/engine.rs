//! Per-learner progress engine.
//!
//! Every mutating call validates against the current state first, then applies the whole
//! transition to a clone and swaps it in. Callers never observe a half-applied cascade.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::cascade::{self, CatalogIndex, ProfileFacts};
use crate::catalog::{Catalog, CpaStage, RewardKind};
use crate::config::EngineConfig;
use crate::profile::{LearnerProfile, XpAward};
use crate::progress::{
    AchievementUnlock, ActivityRecord, ErrorObservation, MiniGameRecord, ProgressEvent,
    ProgressSnapshot, ProgressState, SNAPSHOT_SCHEMA_VERSION,
};
use crate::{
    AchievementId, ActivityId, EngineError, EventId, LearnerId, LevelId, RewardId, TopicId,
};

/// One submitted attempt at an activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attempt {
    pub activity_id: ActivityId,
    pub raw_score: u32,
    pub max_score: u32,
    pub time_spent_secs: u64,
    #[serde(default)]
    pub errors: Vec<ErrorObservation>,
}

/// Everything a transaction newly unlocked or completed, in the order it happened.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Unlocks {
    pub levels: Vec<LevelId>,
    pub topics: Vec<TopicId>,
    pub completed_levels: Vec<LevelId>,
    pub completed_topics: Vec<TopicId>,
    pub achievements: Vec<AchievementUnlock>,
    pub rewards: Vec<RewardId>,
}

impl Unlocks {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
            && self.topics.is_empty()
            && self.completed_levels.is_empty()
            && self.completed_topics.is_empty()
            && self.achievements.is_empty()
            && self.rewards.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelView {
    pub level_id: LevelId,
    pub topic_id: TopicId,
    pub title: String,
    pub cpa_stage: CpaStage,
    pub order: u32,
    pub unlocked: bool,
    pub completed: bool,
    /// Mean best-score percentage over the level's activities.
    pub current_score: f64,
    pub mastery_threshold: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicView {
    pub topic_id: TopicId,
    pub title: String,
    pub order: u32,
    pub unlocked: bool,
    pub completed: bool,
    pub progress: f64,
    pub levels: Vec<LevelView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptOutcome {
    pub event: ProgressEvent,
    pub activity: ActivityRecord,
    pub level: LevelView,
    pub first_completion: bool,
    pub score_improved: bool,
    pub unlocks: Unlocks,
    pub xp: XpAward,
}

/// Result of an administrative unlock. Unknown ids are reported, not raised.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnlockStatus {
    Unlocked,
    AlreadyUnlocked,
    UnknownId,
}

impl UnlockStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::AlreadyUnlocked => "already_unlocked",
            Self::UnknownId => "unknown_id",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub status: UnlockStatus,
    pub unlocks: Unlocks,
    pub xp: XpAward,
}

impl TransitionOutcome {
    fn unchanged(status: UnlockStatus) -> Self {
        Self { status, unlocks: Unlocks::default(), xp: XpAward::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MiniGameOutcome {
    pub record: MiniGameRecord,
    pub new_high_score: bool,
    pub first_completion: bool,
    pub unlocks: Unlocks,
    pub xp: XpAward,
}

/// Narrows the event log for "recent activity" style reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityFilter {
    pub topic_id: Option<TopicId>,
    pub level_id: Option<LevelId>,
    pub cpa_stage: Option<CpaStage>,
}

impl ActivityFilter {
    #[must_use]
    pub fn matches(&self, event: &ProgressEvent) -> bool {
        self.topic_id.iter().all(|id| id == &event.topic_id)
            && self.level_id.iter().all(|id| id == &event.level_id)
            && self.cpa_stage.iter().all(|stage| *stage == event.cpa_stage)
    }

    /// True when every event matches.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.topic_id.is_none() && self.level_id.is_none() && self.cpa_stage.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEngine {
    learner_id: LearnerId,
    catalog: Arc<Catalog>,
    index: CatalogIndex,
    config: EngineConfig,
    state: ProgressState,
}

impl ProgressEngine {
    /// Fresh engine with every entry point at its initial state.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidCatalog`] or [`EngineError::InvalidConfig`] when either
    /// input fails validation.
    pub fn new(
        catalog: Arc<Catalog>,
        learner_id: LearnerId,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        catalog.validate()?;
        config.validate()?;
        let index = CatalogIndex::build(&catalog);
        let mut state = ProgressState::initial(&catalog);
        cascade::settle_structure(&index, &mut state, &mut Unlocks::default());
        Ok(Self { learner_id, catalog, index, config, state })
    }

    /// Rebuild an engine from a persisted snapshot, reconciling it against `catalog`.
    ///
    /// # Errors
    /// Returns [`EngineError::IncompatibleSnapshot`] for an unknown schema version, plus the
    /// validation errors of [`ProgressEngine::new`].
    pub fn restore(
        catalog: Arc<Catalog>,
        snapshot: ProgressSnapshot,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        if snapshot.schema_version == 0 || snapshot.schema_version > SNAPSHOT_SCHEMA_VERSION {
            return Err(EngineError::IncompatibleSnapshot(format!(
                "schema version {} is not supported (expected 1..={SNAPSHOT_SCHEMA_VERSION})",
                snapshot.schema_version
            )));
        }
        catalog.validate()?;
        config.validate()?;

        let index = CatalogIndex::build(&catalog);
        let mut state = ProgressState::reconcile(&catalog, snapshot.state);
        let mut unlocks = Unlocks::default();
        cascade::settle_structure(&index, &mut state, &mut unlocks);
        if snapshot.catalog_version != catalog.catalog_version {
            info!(
                learner_id = %snapshot.learner_id,
                from = snapshot.catalog_version,
                to = catalog.catalog_version,
                unlocked_levels = unlocks.levels.len(),
                "reconciled snapshot against newer catalog"
            );
        }

        Ok(Self { learner_id: snapshot.learner_id, catalog, index, config, state })
    }

    #[must_use]
    pub fn learner_id(&self) -> &LearnerId {
        &self.learner_id
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Record one attempt and run the unlock cascade as a single transaction.
    ///
    /// XP predicates are evaluated against `profile.xp` plus the XP this call awards; the
    /// profile itself is left for the caller to update with [`LearnerProfile::apply_award`].
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownActivity`], [`EngineError::LockedActivity`] or
    /// [`EngineError::InvalidScore`], checked in that order. State is untouched on error.
    pub fn record_attempt(
        &mut self,
        attempt: &Attempt,
        profile: &LearnerProfile,
        at: OffsetDateTime,
    ) -> Result<AttemptOutcome, EngineError> {
        self.check_profile(profile)?;
        let Some(meta) = self.index.activities.get(&attempt.activity_id) else {
            return Err(EngineError::UnknownActivity(attempt.activity_id.clone()));
        };
        let level_unlocked = self
            .state
            .levels
            .get(&meta.level_id)
            .is_some_and(|level| level.unlocked);
        if !level_unlocked {
            return Err(EngineError::LockedActivity {
                activity_id: attempt.activity_id.clone(),
                level_id: meta.level_id.clone(),
            });
        }
        validate_score(attempt, meta.max_score)?;

        let topic_id = meta.topic_id.clone();
        let level_id = meta.level_id.clone();
        let cpa_stage = self
            .index
            .levels
            .get(&level_id)
            .map_or(CpaStage::Concrete, |level| level.cpa_stage);

        let mut next = self.state.clone();
        let mut xp = XpAward {
            attempt_xp: self.config.xp.attempt_xp(attempt.raw_score, attempt.max_score),
            ..XpAward::default()
        };

        let record = next
            .activities
            .entry(attempt.activity_id.clone())
            .or_insert_with(|| ActivityRecord::new(attempt.activity_id.clone(), meta.max_score));
        let first_completion = !record.completed;
        let score_improved = record.attempts == 0 || attempt.raw_score > record.best_score;
        record.attempts = record.attempts.saturating_add(1);
        record.time_spent_secs = record.time_spent_secs.saturating_add(attempt.time_spent_secs);
        record.best_score = record.best_score.max(attempt.raw_score);
        record.completed = true;
        record.record_errors(&attempt.errors, at);
        let activity = record.clone();

        if first_completion {
            xp.completion_bonus = self.config.xp.first_completion_bonus;
        }

        let event = ProgressEvent {
            event_id: EventId::new(),
            topic_id,
            level_id: level_id.clone(),
            activity_id: attempt.activity_id.clone(),
            score: attempt.raw_score,
            max_score: attempt.max_score,
            time_spent_secs: attempt.time_spent_secs,
            attempts: activity.attempts,
            cpa_stage,
            completed_at: at,
        };
        next.events.push(event.clone());

        let mut unlocks = Unlocks::default();
        cascade::settle_structure(&self.index, &mut next, &mut unlocks);
        cascade::settle_rewards(
            &self.catalog,
            &mut next,
            facts(profile),
            &mut xp,
            at,
            &mut unlocks,
        );

        self.state = next;
        debug!(
            learner_id = %self.learner_id,
            activity_id = %attempt.activity_id,
            score = attempt.raw_score,
            max_score = attempt.max_score,
            xp = xp.total(),
            "attempt recorded"
        );

        let level = self.level_view(&level_id).ok_or_else(|| {
            EngineError::InvalidCatalog(format!("level {level_id} missing from index"))
        })?;
        Ok(AttemptOutcome { event, activity, level, first_completion, score_improved, unlocks, xp })
    }

    /// Administrative unlock of a topic and its first level. Bypasses sequencing.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownEntity`] when `profile` belongs to another learner.
    pub fn unlock_topic(
        &mut self,
        topic_id: &TopicId,
        profile: &LearnerProfile,
        at: OffsetDateTime,
    ) -> Result<TransitionOutcome, EngineError> {
        self.check_profile(profile)?;
        let Some(topic) = self.state.topics.get(topic_id) else {
            return Ok(TransitionOutcome::unchanged(UnlockStatus::UnknownId));
        };
        if topic.unlocked {
            return Ok(TransitionOutcome::unchanged(UnlockStatus::AlreadyUnlocked));
        }

        Ok(self.transition(profile, at, |index, state, unlocks| {
            cascade::unlock_topic(index, state, topic_id, unlocks);
        }))
    }

    /// Administrative unlock of one level; its topic is unlocked with it.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownEntity`] when `profile` belongs to another learner.
    pub fn unlock_level(
        &mut self,
        level_id: &LevelId,
        profile: &LearnerProfile,
        at: OffsetDateTime,
    ) -> Result<TransitionOutcome, EngineError> {
        self.check_profile(profile)?;
        let Some(level) = self.state.levels.get(level_id) else {
            return Ok(TransitionOutcome::unchanged(UnlockStatus::UnknownId));
        };
        if level.unlocked {
            return Ok(TransitionOutcome::unchanged(UnlockStatus::AlreadyUnlocked));
        }
        let Some(topic_id) = self.index.levels.get(level_id).map(|meta| meta.topic_id.clone())
        else {
            return Ok(TransitionOutcome::unchanged(UnlockStatus::UnknownId));
        };

        Ok(self.transition(profile, at, |_, state, unlocks| {
            if let Some(topic) = state.topics.get_mut(&topic_id) {
                if !topic.unlocked {
                    topic.unlocked = true;
                    unlocks.topics.push(topic_id.clone());
                }
            }
            cascade::unlock_level(state, level_id, unlocks);
        }))
    }

    /// Grant an achievement directly. Its XP reward is paid at most once.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownEntity`] when `profile` belongs to another learner.
    pub fn unlock_achievement(
        &mut self,
        achievement_id: &AchievementId,
        profile: &LearnerProfile,
        at: OffsetDateTime,
    ) -> Result<TransitionOutcome, EngineError> {
        self.check_profile(profile)?;
        let Some(definition) = self.catalog.achievement(achievement_id) else {
            return Ok(TransitionOutcome::unchanged(UnlockStatus::UnknownId));
        };
        if self.state.is_achievement_unlocked(achievement_id) {
            return Ok(TransitionOutcome::unchanged(UnlockStatus::AlreadyUnlocked));
        }
        let unlock = AchievementUnlock {
            achievement_id: definition.id.clone(),
            xp_reward: definition.xp_reward,
            unlocked_at: at,
        };

        Ok(self.transition(profile, at, |_, state, unlocks| {
            state.achievements.push(unlock.clone());
            unlocks.achievements.push(unlock);
        }))
    }

    /// Unlock an avatar, theme or mini-game regardless of XP.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownEntity`] when `profile` belongs to another learner.
    pub fn unlock_reward(
        &mut self,
        reward_id: &RewardId,
        profile: &LearnerProfile,
        at: OffsetDateTime,
    ) -> Result<TransitionOutcome, EngineError> {
        self.check_profile(profile)?;
        if self.catalog.reward(reward_id).is_none() {
            return Ok(TransitionOutcome::unchanged(UnlockStatus::UnknownId));
        }
        if self.state.unlocked_rewards.contains(reward_id) {
            return Ok(TransitionOutcome::unchanged(UnlockStatus::AlreadyUnlocked));
        }

        Ok(self.transition(profile, at, |_, state, unlocks| {
            state.unlocked_rewards.insert(reward_id.clone());
            unlocks.rewards.push(reward_id.clone());
        }))
    }

    /// Record one play of an unlocked mini-game.
    ///
    /// # Errors
    /// Returns [`EngineError::UnknownEntity`] for ids that are not mini-games and
    /// [`EngineError::LockedReward`] for mini-games not yet unlocked.
    pub fn record_mini_game(
        &mut self,
        reward_id: &RewardId,
        score: u32,
        profile: &LearnerProfile,
        at: OffsetDateTime,
    ) -> Result<MiniGameOutcome, EngineError> {
        self.check_profile(profile)?;
        let Some(definition) =
            self.catalog.reward(reward_id).filter(|reward| reward.kind == RewardKind::MiniGame)
        else {
            return Err(EngineError::UnknownEntity(format!("mini-game {reward_id}")));
        };
        if !self.state.unlocked_rewards.contains(reward_id) {
            return Err(EngineError::LockedReward(reward_id.clone()));
        }

        let mut next = self.state.clone();
        let record = next.mini_games.entry(reward_id.clone()).or_insert_with(|| MiniGameRecord {
            reward_id: reward_id.clone(),
            high_score: 0,
            plays: 0,
            completed: false,
        });
        let new_high_score = record.plays == 0 || score > record.high_score;
        let first_completion = !record.completed;
        record.plays = record.plays.saturating_add(1);
        record.high_score = record.high_score.max(score);
        record.completed = true;
        let record = record.clone();

        let mut xp = XpAward::default();
        if first_completion {
            xp.reward_xp = definition.xp_reward;
        }
        let mut unlocks = Unlocks::default();
        cascade::settle_rewards(&self.catalog, &mut next, facts(profile), &mut xp, at, &mut unlocks);

        self.state = next;
        debug!(reward_id = %reward_id, score, plays = record.plays, "mini-game recorded");
        Ok(MiniGameOutcome { record, new_high_score, first_completion, unlocks, xp })
    }

    /// Full progress tree in catalog order.
    #[must_use]
    pub fn topic_views(&self) -> Vec<TopicView> {
        self.catalog
            .topics_in_order()
            .into_iter()
            .map(|topic| {
                let state = self.state.topics.get(&topic.id);
                TopicView {
                    topic_id: topic.id.clone(),
                    title: topic.title.clone(),
                    order: topic.order,
                    unlocked: state.is_some_and(|t| t.unlocked),
                    completed: state.is_some_and(|t| t.completed),
                    progress: cascade::topic_progress(&self.index, &self.state, &topic.id),
                    levels: topic
                        .levels_in_order()
                        .into_iter()
                        .filter_map(|level| self.level_view(&level.id))
                        .collect(),
                }
            })
            .collect()
    }

    #[must_use]
    pub fn level_view(&self, level_id: &LevelId) -> Option<LevelView> {
        let meta = self.index.levels.get(level_id)?;
        let topic = self.catalog.topics.iter().find(|topic| topic.id == meta.topic_id)?;
        let level = topic.levels.iter().find(|level| &level.id == level_id)?;
        let state = self.state.levels.get(level_id);
        Some(LevelView {
            level_id: level_id.clone(),
            topic_id: meta.topic_id.clone(),
            title: level.title.clone(),
            cpa_stage: meta.cpa_stage,
            order: level.order,
            unlocked: state.is_some_and(|l| l.unlocked),
            completed: state.is_some_and(|l| l.completed),
            current_score: cascade::level_score(&self.index, &self.state, level_id),
            mastery_threshold: meta.mastery_threshold,
        })
    }

    #[must_use]
    pub fn activity_record(&self, activity_id: &ActivityId) -> Option<&ActivityRecord> {
        self.state.activities.get(activity_id)
    }

    /// Whole event log, oldest first.
    #[must_use]
    pub fn events(&self) -> &[ProgressEvent] {
        &self.state.events
    }

    /// Most recent matching events, newest first.
    #[must_use]
    pub fn recent_activity(&self, filter: &ActivityFilter, limit: usize) -> Vec<&ProgressEvent> {
        self.state.events.iter().rev().filter(|event| filter.matches(event)).take(limit).collect()
    }

    #[must_use]
    pub fn snapshot(&self, at: OffsetDateTime) -> ProgressSnapshot {
        ProgressSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            learner_id: self.learner_id.clone(),
            catalog_version: self.catalog.catalog_version,
            saved_at: at,
            state: self.state.clone(),
        }
    }

    fn check_profile(&self, profile: &LearnerProfile) -> Result<(), EngineError> {
        if profile.learner_id == self.learner_id {
            Ok(())
        } else {
            Err(EngineError::UnknownEntity(format!(
                "profile {} does not belong to learner {}",
                profile.learner_id, self.learner_id
            )))
        }
    }

    /// Apply `change` to a copy of the state, settle the cascade, then swap the copy in.
    fn transition(
        &mut self,
        profile: &LearnerProfile,
        at: OffsetDateTime,
        change: impl FnOnce(&CatalogIndex, &mut ProgressState, &mut Unlocks),
    ) -> TransitionOutcome {
        let mut next = self.state.clone();
        let mut unlocks = Unlocks::default();
        let mut xp = XpAward::default();

        change(&self.index, &mut next, &mut unlocks);
        xp.achievement_xp =
            unlocks.achievements.iter().map(|unlock| unlock.xp_reward).fold(0, u64::saturating_add);
        cascade::settle_structure(&self.index, &mut next, &mut unlocks);
        cascade::settle_rewards(&self.catalog, &mut next, facts(profile), &mut xp, at, &mut unlocks);

        self.state = next;
        TransitionOutcome { status: UnlockStatus::Unlocked, unlocks, xp }
    }
}

fn facts(profile: &LearnerProfile) -> ProfileFacts {
    ProfileFacts { streak: profile.streak, xp: profile.xp }
}

fn validate_score(attempt: &Attempt, catalog_max: u32) -> Result<(), EngineError> {
    let reason = if attempt.max_score == 0 {
        Some("max_score must be positive".to_string())
    } else if attempt.max_score != catalog_max {
        Some(format!("max_score must equal the activity maximum of {catalog_max}"))
    } else if attempt.raw_score > attempt.max_score {
        Some("raw_score exceeds max_score".to_string())
    } else {
        None
    };

    match reason {
        None => Ok(()),
        Some(reason) => Err(EngineError::InvalidScore {
            raw_score: attempt.raw_score,
            max_score: attempt.max_score,
            reason,
        }),
    }
}
