//! Static curriculum and gamification definitions.
//!
//! A [`Catalog`] is loaded once, validated, and never mutated afterwards. Ordering inside the
//! catalog is carried by explicit `order` keys; vector position carries no meaning.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::achievements::AchievementRule;
use crate::{AchievementId, ActivityId, EngineError, LevelId, RewardId, TopicId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CpaStage {
    Concrete,
    Pictorial,
    Abstract,
}

impl CpaStage {
    pub const ALL: [Self; 3] = [Self::Concrete, Self::Pictorial, Self::Abstract];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Concrete => "concrete",
            Self::Pictorial => "pictorial",
            Self::Abstract => "abstract",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "concrete" => Some(Self::Concrete),
            "pictorial" => Some(Self::Pictorial),
            "abstract" => Some(Self::Abstract),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityType {
    DragDrop,
    MultipleChoice,
    FillBlank,
    Matching,
    Counting,
    NumberLine,
    Shapes,
    Measurement,
    Patterns,
    Time,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScoringContent {
    #[serde(default)]
    pub correct_answers: Vec<String>,
    pub max_score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub id: ActivityId,
    pub title: String,
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    pub scoring: ScoringContent,
    /// Presentation payload (question text, manipulatives, hints). Never read by the engine.
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Level {
    pub id: LevelId,
    pub title: String,
    pub cpa_stage: CpaStage,
    pub order: u32,
    pub mastery_threshold: u8,
    #[serde(default)]
    pub activities: Vec<Activity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Topic {
    pub id: TopicId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub order: u32,
    #[serde(default)]
    pub levels: Vec<Level>,
}

impl Topic {
    /// Levels sorted by their ordering key.
    #[must_use]
    pub fn levels_in_order(&self) -> Vec<&Level> {
        let mut levels = self.levels.iter().collect::<Vec<_>>();
        levels.sort_by_key(|level| level.order);
        levels
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AchievementDefinition {
    pub id: AchievementId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub xp_reward: u64,
    pub rule: AchievementRule,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RewardKind {
    Avatar,
    Theme,
    MiniGame,
}

impl RewardKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avatar => "avatar",
            Self::Theme => "theme",
            Self::MiniGame => "mini_game",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardDefinition {
    pub id: RewardId,
    pub kind: RewardKind,
    pub name: String,
    pub xp_required: u64,
    /// XP granted the first time a mini-game is completed.
    #[serde(default)]
    pub xp_reward: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    pub catalog_version: u32,
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub achievements: Vec<AchievementDefinition>,
    #[serde(default)]
    pub rewards: Vec<RewardDefinition>,
}

impl Catalog {
    /// Parse and validate a catalog from YAML.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidCatalog`] when the document cannot be parsed or fails
    /// validation.
    pub fn from_yaml_str(raw: &str) -> Result<Self, EngineError> {
        let catalog: Self = serde_yaml::from_str(raw)
            .map_err(|err| EngineError::InvalidCatalog(format!("yaml parse failed: {err}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Parse and validate a catalog from JSON.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidCatalog`] when the document cannot be parsed or fails
    /// validation.
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let catalog: Self = serde_json::from_str(raw)
            .map_err(|err| EngineError::InvalidCatalog(format!("json parse failed: {err}")))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check identity, ordering and range constraints of every definition.
    ///
    /// # Errors
    /// Returns [`EngineError::InvalidCatalog`] describing the first violation found.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut topic_ids = BTreeSet::new();
        let mut topic_orders = BTreeSet::new();
        let mut level_ids = BTreeSet::new();
        let mut activity_ids = BTreeSet::new();

        for topic in &self.topics {
            if topic.id.as_str().trim().is_empty() {
                return Err(invalid("topic id MUST be non-empty"));
            }
            if !topic_ids.insert(&topic.id) {
                return Err(invalid(format!("duplicate topic id {}", topic.id)));
            }
            if !topic_orders.insert(topic.order) {
                return Err(invalid(format!(
                    "topic {} reuses ordering key {}",
                    topic.id, topic.order
                )));
            }

            let mut level_orders = BTreeSet::new();
            for level in &topic.levels {
                if level.id.as_str().trim().is_empty() {
                    return Err(invalid(format!("topic {} has a level without id", topic.id)));
                }
                if !level_ids.insert(&level.id) {
                    return Err(invalid(format!("duplicate level id {}", level.id)));
                }
                if !level_orders.insert(level.order) {
                    return Err(invalid(format!(
                        "level {} reuses ordering key {} within topic {}",
                        level.id, level.order, topic.id
                    )));
                }
                if level.mastery_threshold > 100 {
                    return Err(invalid(format!(
                        "level {} mastery_threshold MUST be in [0, 100]",
                        level.id
                    )));
                }

                for activity in &level.activities {
                    if activity.id.as_str().trim().is_empty() {
                        return Err(invalid(format!(
                            "level {} has an activity without id",
                            level.id
                        )));
                    }
                    if !activity_ids.insert(&activity.id) {
                        return Err(invalid(format!("duplicate activity id {}", activity.id)));
                    }
                    if activity.scoring.max_score == 0 {
                        return Err(invalid(format!(
                            "activity {} max_score MUST be > 0",
                            activity.id
                        )));
                    }
                }
            }
        }

        let mut achievement_ids = BTreeSet::new();
        for achievement in &self.achievements {
            if !achievement_ids.insert(&achievement.id) {
                return Err(invalid(format!("duplicate achievement id {}", achievement.id)));
            }
            if let AchievementRule::TopicCompleted { topic_id } = &achievement.rule {
                if !topic_ids.contains(topic_id) {
                    return Err(invalid(format!(
                        "achievement {} references unknown topic {topic_id}",
                        achievement.id
                    )));
                }
            }
        }

        let mut reward_ids = BTreeSet::new();
        for reward in &self.rewards {
            if !reward_ids.insert(&reward.id) {
                return Err(invalid(format!("duplicate reward id {}", reward.id)));
            }
        }

        Ok(())
    }

    /// Topics sorted by their ordering key.
    #[must_use]
    pub fn topics_in_order(&self) -> Vec<&Topic> {
        let mut topics = self.topics.iter().collect::<Vec<_>>();
        topics.sort_by_key(|topic| topic.order);
        topics
    }

    #[must_use]
    pub fn achievement(&self, id: &AchievementId) -> Option<&AchievementDefinition> {
        self.achievements.iter().find(|achievement| &achievement.id == id)
    }

    #[must_use]
    pub fn reward(&self, id: &RewardId) -> Option<&RewardDefinition> {
        self.rewards.iter().find(|reward| &reward.id == id)
    }

    /// The built-in grade-1 numeracy curriculum.
    #[must_use]
    pub fn grade_one() -> Self {
        let numbers_to_20 = Topic {
            id: TopicId::from("numbers-to-20"),
            title: "Numbers to 20".to_string(),
            description: "Learn to count and recognize numbers from 1 to 20".to_string(),
            order: 1,
            levels: vec![
                Level {
                    id: LevelId::from("concrete-1"),
                    title: "Count with Blocks".to_string(),
                    cpa_stage: CpaStage::Concrete,
                    order: 1,
                    mastery_threshold: 80,
                    activities: vec![activity(
                        "count-blocks-1",
                        "Count the Blocks",
                        ActivityType::DragDrop,
                        "How many blocks are there?",
                        "5",
                    )],
                },
                Level {
                    id: LevelId::from("pictorial-1"),
                    title: "Number Pictures".to_string(),
                    cpa_stage: CpaStage::Pictorial,
                    order: 2,
                    mastery_threshold: 80,
                    activities: vec![activity(
                        "match-pictures-1",
                        "Match the Pictures",
                        ActivityType::Matching,
                        "Match each number with its picture",
                        "7",
                    )],
                },
                Level {
                    id: LevelId::from("abstract-1"),
                    title: "Number Symbols".to_string(),
                    cpa_stage: CpaStage::Abstract,
                    order: 3,
                    mastery_threshold: 80,
                    activities: vec![activity(
                        "number-symbols-1",
                        "Write the Number",
                        ActivityType::FillBlank,
                        "Which number comes after 12?",
                        "13",
                    )],
                },
            ],
        };

        let mut topics = vec![numbers_to_20];
        for (order, (id, title, description)) in [
            ("addition-subtraction", "Addition & Subtraction", "Add and subtract within 20"),
            ("place-value", "Place Value", "Understand tens and ones"),
            ("shapes", "Shapes", "Learn about 2D and 3D shapes"),
            ("measurement", "Measurement", "Measure length, weight, and capacity"),
            ("fractions", "Fractions", "Introduction to simple fractions"),
            ("patterns", "Patterns", "Recognize and create patterns"),
            ("time", "Time", "Tell time to the hour and half hour"),
            ("data", "Data Handling", "Collect and organize data"),
        ]
        .into_iter()
        .enumerate()
        {
            topics.push(Topic {
                id: TopicId::from(id),
                title: title.to_string(),
                description: description.to_string(),
                order: u32::try_from(order).unwrap_or(u32::MAX).saturating_add(2),
                levels: Vec::new(),
            });
        }

        Self {
            catalog_version: 1,
            topics,
            achievements: vec![
                AchievementDefinition {
                    id: AchievementId::from("first-activity"),
                    title: "First Steps".to_string(),
                    description: "Complete your first activity".to_string(),
                    xp_reward: 50,
                    rule: AchievementRule::ActivitiesCompleted { count: 1 },
                },
                AchievementDefinition {
                    id: AchievementId::from("streak-3"),
                    title: "On Fire!".to_string(),
                    description: "Maintain a 3-day streak".to_string(),
                    xp_reward: 100,
                    rule: AchievementRule::StreakDays { days: 3 },
                },
                AchievementDefinition {
                    id: AchievementId::from("mastery-1"),
                    title: "Master".to_string(),
                    description: "Achieve mastery in your first topic".to_string(),
                    xp_reward: 200,
                    rule: AchievementRule::TopicsCompleted { count: 1 },
                },
            ],
            rewards: vec![
                reward("default", RewardKind::Avatar, "Default", 0, 0),
                reward("cat", RewardKind::Avatar, "Cat", 100, 0),
                reward("unicorn", RewardKind::Avatar, "Unicorn", 500, 0),
                reward("ocean", RewardKind::Theme, "Ocean", 0, 0),
                reward("forest", RewardKind::Theme, "Forest", 200, 0),
                reward("space", RewardKind::Theme, "Space", 1000, 0),
                reward("number-race", RewardKind::MiniGame, "Number Race", 150, 50),
                reward("shape-matcher", RewardKind::MiniGame, "Shape Matcher", 300, 50),
            ],
        }
    }
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::InvalidCatalog(message.into())
}

fn activity(
    id: &str,
    title: &str,
    activity_type: ActivityType,
    question: &str,
    answer: &str,
) -> Activity {
    Activity {
        id: ActivityId::from(id),
        title: title.to_string(),
        activity_type,
        scoring: ScoringContent { correct_answers: vec![answer.to_string()], max_score: 10 },
        content: serde_json::json!({ "question": question }),
    }
}

fn reward(id: &str, kind: RewardKind, name: &str, xp_required: u64, xp_reward: u64) -> RewardDefinition {
    RewardDefinition { id: RewardId::from(id), kind, name: name.to_string(), xp_required, xp_reward }
}
