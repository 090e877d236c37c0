use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::TopicId;

/// Predicate deciding when an achievement unlocks.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AchievementRule {
    ActivitiesCompleted { count: u32 },
    LevelsCompleted { count: u32 },
    TopicsCompleted { count: u32 },
    TopicCompleted { topic_id: TopicId },
    StreakDays { days: u32 },
    TotalXp { xp: u64 },
}

/// Progress facts an achievement rule is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AchievementContext {
    pub activities_completed: u32,
    pub levels_completed: u32,
    pub completed_topics: BTreeSet<TopicId>,
    pub streak: u32,
    pub projected_xp: u64,
}

impl AchievementRule {
    #[must_use]
    pub fn is_satisfied(&self, ctx: &AchievementContext) -> bool {
        match self {
            Self::ActivitiesCompleted { count } => ctx.activities_completed >= *count,
            Self::LevelsCompleted { count } => ctx.levels_completed >= *count,
            Self::TopicsCompleted { count } => {
                u32::try_from(ctx.completed_topics.len()).unwrap_or(u32::MAX) >= *count
            }
            Self::TopicCompleted { topic_id } => ctx.completed_topics.contains(topic_id),
            Self::StreakDays { days } => ctx.streak >= *days,
            Self::TotalXp { xp } => ctx.projected_xp >= *xp,
        }
    }
}
