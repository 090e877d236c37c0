//! Unlock cascade: the state-transition rules that run after every engine mutation.
//!
//! Structural rules, applied to a fixpoint:
//! 1. an unlocked, incomplete level whose mastery reaches its threshold becomes completed;
//! 2. a completed level unlocks the next level of its topic;
//! 3. an unlocked topic whose levels are all completed (or that has none) becomes completed;
//! 4. a completed topic unlocks the next topic;
//! 5. an unlocked topic has its first level unlocked.
//!
//! Every rule only ever sets flags, so reapplying it is a no-op. Ordering comes from the
//! catalog's ordering keys through [`CatalogIndex`], never from map or vector position.

use std::collections::BTreeMap;

use time::OffsetDateTime;
use tracing::{debug, info};

use crate::achievements::AchievementContext;
use crate::catalog::{Catalog, CpaStage};
use crate::engine::Unlocks;
use crate::profile::XpAward;
use crate::progress::{AchievementUnlock, ProgressState};
use crate::{ActivityId, LevelId, TopicId};

#[derive(Debug, Clone)]
pub(crate) struct LevelMeta {
    pub topic_id: TopicId,
    pub cpa_stage: CpaStage,
    pub mastery_threshold: u8,
    pub activities: Vec<ActivityId>,
}

#[derive(Debug, Clone)]
pub(crate) struct ActivityMeta {
    pub topic_id: TopicId,
    pub level_id: LevelId,
    pub max_score: u32,
}

/// Ordering and ownership lookups derived once from the catalog.
#[derive(Debug, Clone)]
pub(crate) struct CatalogIndex {
    pub topic_order: Vec<TopicId>,
    pub level_order: BTreeMap<TopicId, Vec<LevelId>>,
    pub levels: BTreeMap<LevelId, LevelMeta>,
    pub activities: BTreeMap<ActivityId, ActivityMeta>,
}

impl CatalogIndex {
    pub fn build(catalog: &Catalog) -> Self {
        let mut index = Self {
            topic_order: catalog.topics_in_order().iter().map(|topic| topic.id.clone()).collect(),
            level_order: BTreeMap::new(),
            levels: BTreeMap::new(),
            activities: BTreeMap::new(),
        };

        for topic in &catalog.topics {
            index.level_order.insert(
                topic.id.clone(),
                topic.levels_in_order().iter().map(|level| level.id.clone()).collect(),
            );
            for level in &topic.levels {
                index.levels.insert(
                    level.id.clone(),
                    LevelMeta {
                        topic_id: topic.id.clone(),
                        cpa_stage: level.cpa_stage,
                        mastery_threshold: level.mastery_threshold,
                        activities: level.activities.iter().map(|a| a.id.clone()).collect(),
                    },
                );
                for activity in &level.activities {
                    index.activities.insert(
                        activity.id.clone(),
                        ActivityMeta {
                            topic_id: topic.id.clone(),
                            level_id: level.id.clone(),
                            max_score: activity.scoring.max_score,
                        },
                    );
                }
            }
        }

        index
    }

    fn levels_of(&self, topic_id: &TopicId) -> &[LevelId] {
        self.level_order.get(topic_id).map_or(&[], Vec::as_slice)
    }

    fn next_level(&self, level_id: &LevelId) -> Option<&LevelId> {
        let meta = self.levels.get(level_id)?;
        let ordered = self.levels_of(&meta.topic_id);
        let position = ordered.iter().position(|id| id == level_id)?;
        ordered.get(position + 1)
    }

    fn next_topic(&self, topic_id: &TopicId) -> Option<&TopicId> {
        let position = self.topic_order.iter().position(|id| id == topic_id)?;
        self.topic_order.get(position + 1)
    }
}

/// Mean best-score percentage over a level's activities; unattempted activities count as 0.
pub(crate) fn level_score(index: &CatalogIndex, state: &ProgressState, level_id: &LevelId) -> f64 {
    let Some(meta) = index.levels.get(level_id) else {
        return 0.0;
    };
    mean(meta.activities.iter().map(|id| state.activities.get(id).map_or(0.0, |r| r.percent())))
}

/// Mean mastery over a topic's levels; 0 for a topic without levels.
pub(crate) fn topic_progress(
    index: &CatalogIndex,
    state: &ProgressState,
    topic_id: &TopicId,
) -> f64 {
    mean(index.levels_of(topic_id).iter().map(|id| level_score(index, state, id)))
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0_u32), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / f64::from(count)
    }
}

pub(crate) fn unlock_topic(
    index: &CatalogIndex,
    state: &mut ProgressState,
    topic_id: &TopicId,
    unlocks: &mut Unlocks,
) -> bool {
    let Some(topic) = state.topics.get_mut(topic_id) else {
        return false;
    };
    if topic.unlocked {
        return false;
    }
    topic.unlocked = true;
    debug!(topic_id = %topic_id, "topic unlocked");
    unlocks.topics.push(topic_id.clone());

    if let Some(first) = index.levels_of(topic_id).first() {
        unlock_level(state, first, unlocks);
    }
    true
}

pub(crate) fn unlock_level(
    state: &mut ProgressState,
    level_id: &LevelId,
    unlocks: &mut Unlocks,
) -> bool {
    let Some(level) = state.levels.get_mut(level_id) else {
        return false;
    };
    if level.unlocked {
        return false;
    }
    level.unlocked = true;
    debug!(level_id = %level_id, "level unlocked");
    unlocks.levels.push(level_id.clone());
    true
}

/// Apply the structural rules until nothing changes.
pub(crate) fn settle_structure(
    index: &CatalogIndex,
    state: &mut ProgressState,
    unlocks: &mut Unlocks,
) {
    loop {
        let mut changed = false;

        for topic_id in &index.topic_order {
            let Some(topic) = state.topics.get(topic_id) else {
                continue;
            };
            if !topic.unlocked {
                continue;
            }

            if let Some(first) = index.levels_of(topic_id).first() {
                changed |= unlock_level(state, first, unlocks);
            }

            for level_id in index.levels_of(topic_id) {
                changed |= complete_level_if_mastered(index, state, level_id, unlocks);

                let completed = state.levels.get(level_id).is_some_and(|level| level.completed);
                if completed {
                    if let Some(next) = index.next_level(level_id) {
                        changed |= unlock_level(state, next, unlocks);
                    }
                }
            }

            changed |= complete_topic_if_finished(index, state, topic_id, unlocks);

            let topic_completed = state.topics.get(topic_id).is_some_and(|topic| topic.completed);
            if topic_completed {
                if let Some(next) = index.next_topic(topic_id) {
                    changed |= unlock_topic(index, state, next, unlocks);
                }
            }
        }

        if !changed {
            break;
        }
    }
}

fn complete_level_if_mastered(
    index: &CatalogIndex,
    state: &mut ProgressState,
    level_id: &LevelId,
    unlocks: &mut Unlocks,
) -> bool {
    let Some(meta) = index.levels.get(level_id) else {
        return false;
    };
    let score = level_score(index, state, level_id);
    let Some(level) = state.levels.get_mut(level_id) else {
        return false;
    };
    if !level.unlocked || level.completed || score < f64::from(meta.mastery_threshold) {
        return false;
    }

    level.completed = true;
    info!(level_id = %level_id, score, threshold = meta.mastery_threshold, "level mastered");
    unlocks.completed_levels.push(level_id.clone());
    true
}

fn complete_topic_if_finished(
    index: &CatalogIndex,
    state: &mut ProgressState,
    topic_id: &TopicId,
    unlocks: &mut Unlocks,
) -> bool {
    // Vacuously true for a topic without levels, so the cascade passes through it.
    let all_completed = index
        .levels_of(topic_id)
        .iter()
        .all(|id| state.levels.get(id).is_some_and(|level| level.completed));
    let Some(topic) = state.topics.get_mut(topic_id) else {
        return false;
    };
    if !all_completed || topic.completed || !topic.unlocked {
        return false;
    }

    topic.completed = true;
    info!(topic_id = %topic_id, "topic completed");
    unlocks.completed_topics.push(topic_id.clone());
    true
}

/// Inputs from the learner profile that gamification rules read.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProfileFacts {
    pub streak: u32,
    pub xp: u64,
}

/// Unlock every achievement and XP-gated reward whose condition now holds.
///
/// Achievement XP feeds back into the projected XP, so this also runs to a fixpoint.
pub(crate) fn settle_rewards(
    catalog: &Catalog,
    state: &mut ProgressState,
    facts: ProfileFacts,
    award: &mut XpAward,
    at: OffsetDateTime,
    unlocks: &mut Unlocks,
) {
    loop {
        let mut changed = false;
        let ctx = AchievementContext {
            activities_completed: state.activities_completed(),
            levels_completed: state.levels_completed(),
            completed_topics: state.completed_topics(),
            streak: facts.streak,
            projected_xp: facts.xp.saturating_add(award.total()),
        };

        for definition in &catalog.achievements {
            if state.is_achievement_unlocked(&definition.id) || !definition.rule.is_satisfied(&ctx)
            {
                continue;
            }
            let unlock = AchievementUnlock {
                achievement_id: definition.id.clone(),
                xp_reward: definition.xp_reward,
                unlocked_at: at,
            };
            info!(
                achievement_id = %definition.id,
                xp_reward = definition.xp_reward,
                "achievement unlocked"
            );
            award.achievement_xp = award.achievement_xp.saturating_add(definition.xp_reward);
            state.achievements.push(unlock.clone());
            unlocks.achievements.push(unlock);
            changed = true;
        }

        let projected_xp = facts.xp.saturating_add(award.total());
        for reward in &catalog.rewards {
            if reward.xp_required <= projected_xp && state.unlocked_rewards.insert(reward.id.clone())
            {
                debug!(reward_id = %reward.id, kind = reward.kind.as_str(), "reward unlocked");
                unlocks.rewards.push(reward.id.clone());
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Activity, ActivityType, Level, ScoringContent, Topic};

    fn two_topic_catalog() -> Catalog {
        let level = |id: &str, order: u32, threshold: u8, activities: &[&str]| Level {
            id: LevelId::from(id),
            title: id.to_string(),
            cpa_stage: CpaStage::Concrete,
            order,
            mastery_threshold: threshold,
            activities: activities
                .iter()
                .map(|activity| Activity {
                    id: ActivityId::from(*activity),
                    title: (*activity).to_string(),
                    activity_type: ActivityType::Counting,
                    scoring: ScoringContent { correct_answers: vec![], max_score: 10 },
                    content: serde_json::Value::Null,
                })
                .collect(),
        };
        Catalog {
            catalog_version: 1,
            topics: vec![
                Topic {
                    id: TopicId::from("second"),
                    title: "Second".to_string(),
                    description: String::new(),
                    order: 20,
                    levels: vec![level("s1", 1, 80, &["s1a"])],
                },
                Topic {
                    id: TopicId::from("first"),
                    title: "First".to_string(),
                    description: String::new(),
                    order: 10,
                    levels: vec![level("f2", 2, 0, &[]), level("f1", 1, 80, &["f1a"])],
                },
            ],
            achievements: vec![],
            rewards: vec![],
        }
    }

    #[test]
    fn index_orders_by_key_not_position() {
        let index = CatalogIndex::build(&two_topic_catalog());
        assert_eq!(index.topic_order, vec![TopicId::from("first"), TopicId::from("second")]);
        assert_eq!(index.next_level(&LevelId::from("f1")), Some(&LevelId::from("f2")));
        assert_eq!(index.next_level(&LevelId::from("f2")), None);
        assert_eq!(index.next_topic(&TopicId::from("second")), None);
    }

    #[test]
    fn zero_threshold_level_completes_as_soon_as_it_unlocks() {
        let catalog = two_topic_catalog();
        let index = CatalogIndex::build(&catalog);
        let mut state = ProgressState::initial(&catalog);
        if let Some(record) = state.activities.get_mut(&ActivityId::from("f1a")) {
            record.attempts = 1;
            record.best_score = 8;
            record.completed = true;
        }

        let mut unlocks = Unlocks::default();
        settle_structure(&index, &mut state, &mut unlocks);

        assert_eq!(unlocks.completed_levels, vec![LevelId::from("f1"), LevelId::from("f2")]);
        assert_eq!(unlocks.completed_topics, vec![TopicId::from("first")]);
        assert_eq!(unlocks.topics, vec![TopicId::from("second")]);
        assert_eq!(unlocks.levels, vec![LevelId::from("f2"), LevelId::from("s1")]);
    }

    #[test]
    fn settle_is_idempotent() {
        let catalog = two_topic_catalog();
        let index = CatalogIndex::build(&catalog);
        let mut state = ProgressState::initial(&catalog);
        if let Some(record) = state.activities.get_mut(&ActivityId::from("f1a")) {
            record.attempts = 1;
            record.best_score = 10;
        }
        let mut first = Unlocks::default();
        settle_structure(&index, &mut state, &mut first);
        let after_first = state.clone();

        let mut second = Unlocks::default();
        settle_structure(&index, &mut state, &mut second);
        assert_eq!(state, after_first);
        assert!(second.is_empty());
    }

    #[test]
    fn level_score_counts_unattempted_activities_as_zero() {
        let mut catalog = two_topic_catalog();
        catalog.topics[1].levels[1].activities.push(Activity {
            id: ActivityId::from("f1b"),
            title: "f1b".to_string(),
            activity_type: ActivityType::Counting,
            scoring: ScoringContent { correct_answers: vec![], max_score: 10 },
            content: serde_json::Value::Null,
        });
        let index = CatalogIndex::build(&catalog);
        let mut state = ProgressState::initial(&catalog);
        if let Some(record) = state.activities.get_mut(&ActivityId::from("f1a")) {
            record.attempts = 1;
            record.best_score = 10;
        }
        let score = level_score(&index, &state, &LevelId::from("f1"));
        assert!((score - 50.0).abs() < f64::EPSILON);
        let progress = topic_progress(&index, &state, &TopicId::from("first"));
        assert!((progress - 25.0).abs() < f64::EPSILON);
    }
}
