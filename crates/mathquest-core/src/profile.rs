use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};

use crate::config::LevelTable;
use crate::LearnerId;

/// XP earned by one engine transaction, split by source.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct XpAward {
    pub attempt_xp: u64,
    pub completion_bonus: u64,
    pub achievement_xp: u64,
    pub reward_xp: u64,
}

impl XpAward {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.attempt_xp
            .saturating_add(self.completion_bonus)
            .saturating_add(self.achievement_xp)
            .saturating_add(self.reward_xp)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LevelChange {
    pub xp_before: u64,
    pub xp_after: u64,
    pub level_before: u32,
    pub level_after: u32,
}

impl LevelChange {
    #[must_use]
    pub fn leveled_up(&self) -> bool {
        self.level_after > self.level_before
    }
}

/// Identity-provider record for one learner. The engine reads it but never writes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LearnerProfile {
    pub learner_id: LearnerId,
    pub display_name: String,
    pub xp: u64,
    pub streak: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_active_at: Option<OffsetDateTime>,
}

impl LearnerProfile {
    #[must_use]
    pub fn new(learner_id: LearnerId, display_name: impl Into<String>) -> Self {
        Self { learner_id, display_name: display_name.into(), xp: 0, streak: 0, last_active_at: None }
    }

    #[must_use]
    pub fn level(&self, table: &LevelTable) -> u32 {
        table.level_for(self.xp)
    }

    /// Advance the daily streak for activity at `at`.
    ///
    /// Days are UTC calendar days whatever offset `at` carries. Same day keeps the streak,
    /// the following day extends it, any longer gap restarts it at 1. Returns `true` when
    /// the streak value changed.
    pub fn register_activity(&mut self, at: OffsetDateTime) -> bool {
        let before = self.streak;
        let today = utc_day(at);
        match self.last_active_at.map(utc_day) {
            None => self.streak = 1,
            Some(last) if last == today => {}
            Some(last) if last > today => return false,
            Some(last) if last.next_day() == Some(today) => {
                self.streak = self.streak.saturating_add(1);
            }
            Some(_) => self.streak = 1,
        }
        self.last_active_at = Some(at);
        before != self.streak
    }

    pub fn apply_award(&mut self, award: &XpAward, table: &LevelTable) -> LevelChange {
        let xp_before = self.xp;
        let level_before = table.level_for(xp_before);
        self.xp = self.xp.saturating_add(award.total());
        LevelChange { xp_before, xp_after: self.xp, level_before, level_after: table.level_for(self.xp) }
    }
}

fn utc_day(at: OffsetDateTime) -> Date {
    at.to_offset(UtcOffset::UTC).date()
}
