use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod achievements;
pub mod analytics;
pub mod catalog;
mod cascade;
pub mod config;
pub mod engine;
pub mod profile;
pub mod progress;

pub use achievements::{AchievementContext, AchievementRule};
pub use analytics::{class_overview, ClassOverview, LearnerReport, Misconception, TopicReport};
pub use catalog::{
    AchievementDefinition, Activity, ActivityType, Catalog, CpaStage, Level, RewardDefinition,
    RewardKind, ScoringContent, Topic,
};
pub use config::{EngineConfig, LevelTable, XpPolicy};
pub use engine::{
    ActivityFilter, Attempt, AttemptOutcome, LevelView, MiniGameOutcome, ProgressEngine,
    TopicView, TransitionOutcome, UnlockStatus, Unlocks,
};
pub use profile::{LearnerProfile, LevelChange, XpAward};
pub use progress::{
    AchievementUnlock, ActivityRecord, ErrorObservation, ErrorPattern, LevelState, MiniGameRecord,
    ProgressEvent, ProgressSnapshot, ProgressState, TopicState, SNAPSHOT_SCHEMA_VERSION,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("unknown activity: {0}")]
    UnknownActivity(ActivityId),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("activity {activity_id} is locked: level {level_id} has not been unlocked")]
    LockedActivity { activity_id: ActivityId, level_id: LevelId },
    #[error("reward {0} is locked")]
    LockedReward(RewardId),
    #[error("invalid score {raw_score}/{max_score}: {reason}")]
    InvalidScore { raw_score: u32, max_score: u32, reason: String },
    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("incompatible snapshot: {0}")]
    IncompatibleSnapshot(String),
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque learner key handed over by the identity provider.
    LearnerId
);
string_id!(TopicId);
string_id!(LevelId);
string_id!(ActivityId);
string_id!(AchievementId);
string_id!(
    /// Avatar, theme or mini-game identifier.
    RewardId
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(pub Ulid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
