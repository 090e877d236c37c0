//! Teacher-facing summaries computed from a learner's engine state. Read-only.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::catalog::CpaStage;
use crate::engine::{ActivityFilter, ProgressEngine, TopicView};
use crate::profile::LearnerProfile;
use crate::progress::ProgressEvent;
use crate::{ActivityId, LearnerId, LevelId, TopicId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicReport {
    pub topic_id: TopicId,
    pub title: String,
    pub unlocked: bool,
    pub completed: bool,
    pub progress: f64,
    /// Mean mastery of the topic's levels at each CPA stage it contains.
    pub stages: BTreeMap<CpaStage, f64>,
}

impl TopicReport {
    fn from_view(view: &TopicView) -> Self {
        let mut totals: BTreeMap<CpaStage, (f64, u32)> = BTreeMap::new();
        for level in &view.levels {
            let entry = totals.entry(level.cpa_stage).or_insert((0.0, 0));
            entry.0 += level.current_score;
            entry.1 += 1;
        }

        Self {
            topic_id: view.topic_id.clone(),
            title: view.title.clone(),
            unlocked: view.unlocked,
            completed: view.completed,
            progress: view.progress,
            stages: totals
                .into_iter()
                .map(|(stage, (sum, count))| (stage, sum / f64::from(count)))
                .collect(),
        }
    }
}

/// One error kind aggregated over every activity it was seen in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Misconception {
    pub kind: String,
    pub description: String,
    pub frequency: u32,
    pub activity_ids: Vec<ActivityId>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_occurred: OffsetDateTime,
    pub suggested_remediation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearnerReport {
    pub learner_id: LearnerId,
    pub display_name: String,
    pub xp: u64,
    pub level: u32,
    pub streak: u32,
    /// Completed topics as a percentage of all topics.
    pub overall_progress: f64,
    pub topics: Vec<TopicReport>,
    pub needs_help: bool,
    pub struggling_levels: Vec<LevelId>,
    pub misconceptions: Vec<Misconception>,
    pub recent_activity: Vec<ProgressEvent>,
}

impl LearnerReport {
    #[must_use]
    pub fn build(engine: &ProgressEngine, profile: &LearnerProfile) -> Self {
        let config = engine.config();
        let views = engine.topic_views();
        let completed = views.iter().filter(|view| view.completed).count();
        let overall_progress = if views.is_empty() {
            0.0
        } else {
            // Topic counts stay far below f64 precision limits.
            #[allow(clippy::cast_precision_loss)]
            let ratio = completed as f64 / views.len() as f64;
            ratio * 100.0
        };

        let struggling_levels = struggling_levels(engine, &views, config.needs_help_attempts);

        Self {
            learner_id: profile.learner_id.clone(),
            display_name: profile.display_name.clone(),
            xp: profile.xp,
            level: profile.level(&config.levels),
            streak: profile.streak,
            overall_progress,
            topics: views.iter().map(TopicReport::from_view).collect(),
            needs_help: !struggling_levels.is_empty(),
            struggling_levels,
            misconceptions: misconceptions(engine),
            recent_activity: engine
                .recent_activity(&ActivityFilter::default(), config.recent_activity_limit)
                .into_iter()
                .cloned()
                .collect(),
        }
    }
}

/// Unlocked, unmastered levels the learner has already tried at least `min_attempts` times.
fn struggling_levels(
    engine: &ProgressEngine,
    views: &[TopicView],
    min_attempts: u32,
) -> Vec<LevelId> {
    let mut struggling = Vec::new();
    for level in views.iter().flat_map(|view| &view.levels) {
        if !level.unlocked || level.completed {
            continue;
        }
        let attempts: u32 = engine
            .catalog()
            .topics
            .iter()
            .flat_map(|topic| &topic.levels)
            .filter(|candidate| candidate.id == level.level_id)
            .flat_map(|candidate| &candidate.activities)
            .filter_map(|activity| engine.activity_record(&activity.id))
            .map(|record| record.attempts)
            .fold(0, u32::saturating_add);
        if attempts >= min_attempts && level.current_score < f64::from(level.mastery_threshold) {
            struggling.push(level.level_id.clone());
        }
    }
    struggling
}

fn misconceptions(engine: &ProgressEngine) -> Vec<Misconception> {
    let mut merged: Vec<Misconception> = Vec::new();
    for record in engine.state().activities.values() {
        for pattern in &record.errors {
            if let Some(existing) = merged.iter_mut().find(|m| m.kind == pattern.kind) {
                existing.frequency = existing.frequency.saturating_add(pattern.frequency);
                existing.activity_ids.push(record.activity_id.clone());
                if pattern.last_occurred > existing.last_occurred {
                    existing.last_occurred = pattern.last_occurred;
                    existing.description.clone_from(&pattern.description);
                    if pattern.suggested_remediation.is_some() {
                        existing.suggested_remediation.clone_from(&pattern.suggested_remediation);
                    }
                }
                continue;
            }
            merged.push(Misconception {
                kind: pattern.kind.clone(),
                description: pattern.description.clone(),
                frequency: pattern.frequency,
                activity_ids: vec![record.activity_id.clone()],
                last_occurred: pattern.last_occurred,
                suggested_remediation: pattern.suggested_remediation.clone(),
            });
        }
    }
    merged.sort_by(|a, b| b.frequency.cmp(&a.frequency).then_with(|| a.kind.cmp(&b.kind)));
    merged
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassOverview {
    pub learner_count: usize,
    pub average_progress: f64,
    pub average_xp: f64,
    pub needs_help: Vec<LearnerId>,
}

#[must_use]
pub fn class_overview(reports: &[LearnerReport]) -> ClassOverview {
    let needs_help =
        reports.iter().filter(|report| report.needs_help).map(|r| r.learner_id.clone()).collect();
    if reports.is_empty() {
        return ClassOverview {
            learner_count: 0,
            average_progress: 0.0,
            average_xp: 0.0,
            needs_help,
        };
    }

    #[allow(clippy::cast_precision_loss)]
    let count = reports.len() as f64;
    #[allow(clippy::cast_precision_loss)]
    let total_xp = reports.iter().map(|report| report.xp as f64).sum::<f64>();
    ClassOverview {
        learner_count: reports.len(),
        average_progress: reports.iter().map(|report| report.overall_progress).sum::<f64>()
            / count,
        average_xp: total_xp / count,
        needs_help,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::EngineConfig;
    use crate::engine::Attempt;
    use crate::progress::ErrorObservation;
    use std::sync::Arc;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn learner(id: &str, name: &str) -> (ProgressEngine, LearnerProfile) {
        let learner_id = LearnerId::from(id);
        match ProgressEngine::new(
            Arc::new(Catalog::grade_one()),
            learner_id.clone(),
            EngineConfig::default(),
        ) {
            Ok(engine) => (engine, LearnerProfile::new(learner_id, name)),
            Err(err) => panic!("grade one catalog should load: {err}"),
        }
    }

    fn submit(
        engine: &mut ProgressEngine,
        profile: &mut LearnerProfile,
        activity: &str,
        raw_score: u32,
        errors: Vec<ErrorObservation>,
    ) {
        let attempt = Attempt {
            activity_id: ActivityId::from(activity),
            raw_score,
            max_score: 10,
            time_spent_secs: 45,
            errors,
        };
        match engine.record_attempt(&attempt, profile, fixture_time()) {
            Ok(outcome) => {
                profile.apply_award(&outcome.xp, &engine.config().levels);
            }
            Err(err) => panic!("attempt should be accepted: {err}"),
        }
    }

    fn miscount() -> ErrorObservation {
        ErrorObservation {
            kind: "off-by-one".to_string(),
            description: "Counted a block twice".to_string(),
            remediation: Some("Touch each block once".to_string()),
        }
    }

    #[test]
    fn repeated_low_scores_flag_learner_for_help() {
        let (mut engine, mut profile) = learner("2", "Liam");
        for _ in 0..3 {
            submit(&mut engine, &mut profile, "count-blocks-1", 4, vec![miscount()]);
        }

        let report = LearnerReport::build(&engine, &profile);
        assert!(report.needs_help);
        assert_eq!(report.struggling_levels, vec![LevelId::from("concrete-1")]);
        assert_eq!(report.misconceptions.len(), 1);
        assert_eq!(report.misconceptions[0].frequency, 3);
        assert_eq!(report.recent_activity.len(), 3);
    }

    #[test]
    fn mastered_levels_do_not_need_help() {
        let (mut engine, mut profile) = learner("1", "Emma");
        submit(&mut engine, &mut profile, "count-blocks-1", 9, vec![]);
        submit(&mut engine, &mut profile, "match-pictures-1", 10, vec![]);
        submit(&mut engine, &mut profile, "number-symbols-1", 8, vec![]);

        let report = LearnerReport::build(&engine, &profile);
        assert!(!report.needs_help);
        let numbers = &report.topics[0];
        assert!(numbers.completed);
        assert!((numbers.stages[&CpaStage::Pictorial] - 100.0).abs() < f64::EPSILON);
        assert!((numbers.stages[&CpaStage::Abstract] - 80.0).abs() < f64::EPSILON);
        assert!(report.overall_progress > 0.0);
        assert_eq!(report.recent_activity[0].activity_id, ActivityId::from("number-symbols-1"));
    }

    #[test]
    fn class_overview_averages_and_collects_learners_needing_help() {
        let (mut emma, mut emma_profile) = learner("1", "Emma");
        submit(&mut emma, &mut emma_profile, "count-blocks-1", 10, vec![]);
        let (mut liam, mut liam_profile) = learner("2", "Liam");
        for _ in 0..3 {
            submit(&mut liam, &mut liam_profile, "count-blocks-1", 2, vec![]);
        }

        let reports = vec![
            LearnerReport::build(&emma, &emma_profile),
            LearnerReport::build(&liam, &liam_profile),
        ];
        let overview = class_overview(&reports);
        assert_eq!(overview.learner_count, 2);
        assert_eq!(overview.needs_help, vec![LearnerId::from("2")]);
        assert!(overview.average_xp > 0.0);

        let empty = class_overview(&[]);
        assert_eq!(empty.learner_count, 0);
        assert!(empty.average_progress.abs() < f64::EPSILON);
    }
}
