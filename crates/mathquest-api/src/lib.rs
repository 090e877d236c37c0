use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use mathquest_core::{
    class_overview, AchievementId, AchievementUnlock, ActivityFilter, Attempt, AttemptOutcome,
    Catalog, ClassOverview, EngineConfig, EngineError, LearnerId, LearnerProfile, LearnerReport,
    LevelChange, LevelId, MiniGameOutcome, MiniGameRecord, ProgressEngine, ProgressEvent,
    RewardId, TopicId, TopicView, TransitionOutcome,
};
use mathquest_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileView {
    pub profile: LearnerProfile,
    pub level: u32,
    pub xp_to_next_level: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressView {
    pub learner_id: LearnerId,
    pub topics: Vec<TopicView>,
    pub achievements: Vec<AchievementUnlock>,
    pub unlocked_rewards: Vec<RewardId>,
    pub mini_games: Vec<MiniGameRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrollResult {
    pub profile: ProfileView,
    pub progress: ProgressView,
}

/// Engine result plus the profile after the XP award. `persisted` is false when the
/// transaction succeeded but could not be written to the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Applied<T> {
    pub outcome: T,
    pub profile: LearnerProfile,
    pub level_change: LevelChange,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassReport {
    pub overview: ClassOverview,
    pub learners: Vec<LearnerReport>,
}

#[derive(Debug, Clone)]
pub struct MathQuestApi {
    db_path: PathBuf,
    catalog: Arc<Catalog>,
    config: EngineConfig,
}

impl MathQuestApi {
    #[must_use]
    pub fn new(db_path: PathBuf, catalog: Arc<Catalog>, config: EngineConfig) -> Self {
        Self { db_path, catalog, config }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create a learner with a fresh progress tree.
    ///
    /// # Errors
    /// Returns an error when the learner already exists or persistence fails.
    pub fn enroll(
        &self,
        learner_id: LearnerId,
        display_name: &str,
        at: OffsetDateTime,
    ) -> Result<EnrollResult> {
        let mut store = self.open_migrated_store()?;
        if store.load_profile(&learner_id)?.is_some() {
            return Err(anyhow::anyhow!("learner already enrolled: {learner_id}"));
        }

        let engine =
            ProgressEngine::new(Arc::clone(&self.catalog), learner_id.clone(), self.config.clone())?;
        let profile = LearnerProfile::new(learner_id, display_name);
        store
            .save_learner(&profile, &engine.snapshot(at))
            .with_context(|| format!("failed to persist new learner {}", profile.learner_id))?;
        info!(learner_id = %profile.learner_id, "learner enrolled");

        Ok(EnrollResult { profile: self.profile_view(profile), progress: progress_view(&engine) })
    }

    /// # Errors
    /// Returns [`EngineError::UnknownEntity`] for learners that were never enrolled.
    pub fn profile(&self, learner_id: &LearnerId) -> Result<ProfileView> {
        let store = self.open_migrated_store()?;
        let profile = load_profile(&store, learner_id)?;
        Ok(self.profile_view(profile))
    }

    /// Record an attempt, advance the streak, apply the XP award and persist.
    ///
    /// # Errors
    /// Returns the engine's typed rejection, or an error when the learner cannot be loaded.
    pub fn record_attempt(
        &self,
        learner_id: &LearnerId,
        attempt: &Attempt,
        at: OffsetDateTime,
    ) -> Result<Applied<AttemptOutcome>> {
        self.transact(learner_id, at, |engine, profile| {
            let mut touched = profile.clone();
            touched.register_activity(at);
            let outcome = engine.record_attempt(attempt, &touched, at)?;
            *profile = touched;
            Ok((outcome.xp, outcome))
        })
    }

    /// # Errors
    /// Returns an error when the learner cannot be loaded.
    pub fn unlock_topic(
        &self,
        learner_id: &LearnerId,
        topic_id: &TopicId,
        at: OffsetDateTime,
    ) -> Result<Applied<TransitionOutcome>> {
        self.transact(learner_id, at, |engine, profile| {
            let outcome = engine.unlock_topic(topic_id, profile, at)?;
            Ok((outcome.xp, outcome))
        })
    }

    /// # Errors
    /// Returns an error when the learner cannot be loaded.
    pub fn unlock_level(
        &self,
        learner_id: &LearnerId,
        level_id: &LevelId,
        at: OffsetDateTime,
    ) -> Result<Applied<TransitionOutcome>> {
        self.transact(learner_id, at, |engine, profile| {
            let outcome = engine.unlock_level(level_id, profile, at)?;
            Ok((outcome.xp, outcome))
        })
    }

    /// # Errors
    /// Returns an error when the learner cannot be loaded.
    pub fn unlock_achievement(
        &self,
        learner_id: &LearnerId,
        achievement_id: &AchievementId,
        at: OffsetDateTime,
    ) -> Result<Applied<TransitionOutcome>> {
        self.transact(learner_id, at, |engine, profile| {
            let outcome = engine.unlock_achievement(achievement_id, profile, at)?;
            Ok((outcome.xp, outcome))
        })
    }

    /// # Errors
    /// Returns an error when the learner cannot be loaded.
    pub fn unlock_reward(
        &self,
        learner_id: &LearnerId,
        reward_id: &RewardId,
        at: OffsetDateTime,
    ) -> Result<Applied<TransitionOutcome>> {
        self.transact(learner_id, at, |engine, profile| {
            let outcome = engine.unlock_reward(reward_id, profile, at)?;
            Ok((outcome.xp, outcome))
        })
    }

    /// # Errors
    /// Returns [`EngineError::LockedReward`] or [`EngineError::UnknownEntity`] from the engine,
    /// or an error when the learner cannot be loaded.
    pub fn record_mini_game(
        &self,
        learner_id: &LearnerId,
        reward_id: &RewardId,
        score: u32,
        at: OffsetDateTime,
    ) -> Result<Applied<MiniGameOutcome>> {
        self.transact(learner_id, at, |engine, profile| {
            let outcome = engine.record_mini_game(reward_id, score, profile, at)?;
            Ok((outcome.xp, outcome))
        })
    }

    /// # Errors
    /// Returns an error when the learner cannot be loaded.
    pub fn progress(&self, learner_id: &LearnerId) -> Result<ProgressView> {
        let store = self.open_migrated_store()?;
        let engine = self.load_engine(&store, learner_id)?;
        Ok(progress_view(&engine))
    }

    /// Newest-first events, `limit` defaulting to the configured recent-activity size.
    ///
    /// Unfiltered reads come straight from the stored event log; filtered reads go through
    /// the restored engine.
    ///
    /// # Errors
    /// Returns an error when the learner cannot be loaded.
    pub fn recent_activity(
        &self,
        learner_id: &LearnerId,
        filter: &ActivityFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ProgressEvent>> {
        let store = self.open_migrated_store()?;
        let limit = limit.unwrap_or(self.config.recent_activity_limit);
        if filter.is_unrestricted() {
            load_profile(&store, learner_id)?;
            return store.recent_events(learner_id, limit);
        }
        let engine = self.load_engine(&store, learner_id)?;
        Ok(engine.recent_activity(filter, limit).into_iter().cloned().collect())
    }

    /// # Errors
    /// Returns an error when the learner cannot be loaded.
    pub fn learner_report(&self, learner_id: &LearnerId) -> Result<LearnerReport> {
        let store = self.open_migrated_store()?;
        let profile = load_profile(&store, learner_id)?;
        let engine = self.load_engine(&store, learner_id)?;
        Ok(LearnerReport::build(&engine, &profile))
    }

    /// Reports for every enrolled learner plus the class summary.
    ///
    /// # Errors
    /// Returns an error when any learner cannot be loaded.
    pub fn class_overview(&self) -> Result<ClassReport> {
        let store = self.open_migrated_store()?;
        let mut learners = Vec::new();
        for profile in store.list_learners()? {
            let engine = self.load_engine(&store, &profile.learner_id)?;
            learners.push(LearnerReport::build(&engine, &profile));
        }
        Ok(ClassReport { overview: class_overview(&learners), learners })
    }

    /// Load, run `step`, apply the XP award to the profile, then persist.
    ///
    /// A failed write does not undo the transaction result handed back to the caller.
    fn transact<T>(
        &self,
        learner_id: &LearnerId,
        at: OffsetDateTime,
        step: impl FnOnce(
            &mut ProgressEngine,
            &mut LearnerProfile,
        ) -> std::result::Result<(mathquest_core::XpAward, T), EngineError>,
    ) -> Result<Applied<T>> {
        let mut store = self.open_migrated_store()?;
        let mut profile = load_profile(&store, learner_id)?;
        let mut engine = self.load_engine(&store, learner_id)?;

        let (xp, outcome) = step(&mut engine, &mut profile)?;
        let level_change = profile.apply_award(&xp, &self.config.levels);
        if level_change.leveled_up() {
            info!(
                learner_id = %learner_id,
                level = level_change.level_after,
                xp = level_change.xp_after,
                "learner leveled up"
            );
        }

        let persisted = match store.save_learner(&profile, &engine.snapshot(at)) {
            Ok(_) => true,
            Err(err) => {
                warn!(learner_id = %learner_id, error = %err, "failed to persist learner progress");
                false
            }
        };

        Ok(Applied { outcome, profile, level_change, persisted })
    }

    fn load_engine(&self, store: &SqliteStore, learner_id: &LearnerId) -> Result<ProgressEngine> {
        let Some(snapshot) = store.load_snapshot(learner_id)? else {
            return Err(EngineError::UnknownEntity(format!("learner {learner_id}")).into());
        };
        Ok(ProgressEngine::restore(Arc::clone(&self.catalog), snapshot, self.config.clone())?)
    }

    fn profile_view(&self, profile: LearnerProfile) -> ProfileView {
        ProfileView {
            level: profile.level(&self.config.levels),
            xp_to_next_level: self.config.levels.xp_to_next_level(profile.xp),
            profile,
        }
    }
}

fn load_profile(store: &SqliteStore, learner_id: &LearnerId) -> Result<LearnerProfile> {
    store
        .load_profile(learner_id)?
        .ok_or_else(|| EngineError::UnknownEntity(format!("learner {learner_id}")).into())
}

fn progress_view(engine: &ProgressEngine) -> ProgressView {
    let state = engine.state();
    ProgressView {
        learner_id: engine.learner_id().clone(),
        topics: engine.topic_views(),
        achievements: state.achievements.clone(),
        unlocked_rewards: state.unlocked_rewards.iter().cloned().collect(),
        mini_games: state.mini_games.values().cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mathquest_core::{ActivityId, CpaStage, UnlockStatus};
    use time::Duration;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mathquest-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn api_at(db_path: PathBuf) -> MathQuestApi {
        MathQuestApi::new(db_path, Arc::new(Catalog::grade_one()), EngineConfig::default())
    }

    fn attempt(activity: &str, raw_score: u32) -> Attempt {
        Attempt {
            activity_id: ActivityId::from(activity),
            raw_score,
            max_score: 10,
            time_spent_secs: 30,
            errors: Vec::new(),
        }
    }

    #[test]
    fn enroll_record_and_reload_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(db_path.clone());
        let learner = LearnerId::from("1");

        let enrolled = api.enroll(learner.clone(), "Emma", fixture_time())?;
        assert_eq!(enrolled.profile.level, 1);
        assert!(enrolled.progress.topics[0].unlocked);
        assert!(api.enroll(learner.clone(), "Emma", fixture_time()).is_err());

        let applied = api.record_attempt(&learner, &attempt("count-blocks-1", 9), fixture_time())?;
        assert!(applied.persisted);
        assert!(applied.outcome.level.completed);
        assert_eq!(applied.profile.streak, 1);
        // 9 attempt XP, 20 first-completion bonus, 50 for the first-activity badge.
        assert_eq!(applied.profile.xp, 79);

        let profile = api.profile(&learner)?;
        assert_eq!(profile.profile, applied.profile);
        let progress = api.progress(&learner)?;
        assert!(progress.topics[0].levels[1].unlocked);
        assert_eq!(progress.achievements.len(), 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn schema_status_and_migrate_report_pending_versions() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(db_path.clone());

        let status = api.schema_status()?;
        assert_eq!(status.current_version, 0);
        assert_eq!(status.pending_versions, vec![1, 2]);

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(planned.after_version, None);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert!(!applied.dry_run);
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.migrate(false)?.would_apply_versions.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn failed_write_keeps_transaction_result_and_reports_not_persisted() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(db_path.clone());
        let learner = LearnerId::from("1");
        api.enroll(learner.clone(), "Emma", fixture_time())?;

        let conn = rusqlite::Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TRIGGER progress_events_frozen BEFORE INSERT ON progress_events
             BEGIN
               SELECT RAISE(ABORT, 'progress_events is frozen');
             END;",
        )?;
        drop(conn);

        let applied = api.record_attempt(&learner, &attempt("count-blocks-1", 9), fixture_time())?;
        assert!(!applied.persisted);
        assert!(applied.outcome.level.completed);
        assert!(applied.outcome.unlocks.levels.contains(&LevelId::from("pictorial-1")));
        assert_eq!(applied.profile.xp, 79);

        assert_eq!(api.profile(&learner)?.profile.xp, 0);
        assert!(api.recent_activity(&learner, &ActivityFilter::default(), None)?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn recent_activity_reads_stored_log_and_filters_through_engine() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(db_path.clone());
        let learner = LearnerId::from("1");
        api.enroll(learner.clone(), "Emma", fixture_time())?;
        api.record_attempt(&learner, &attempt("count-blocks-1", 9), fixture_time())?;
        api.record_attempt(
            &learner,
            &attempt("match-pictures-1", 8),
            fixture_time() + Duration::minutes(5),
        )?;

        let all = api.recent_activity(&learner, &ActivityFilter::default(), None)?;
        let ids: Vec<&str> = all.iter().map(|event| event.activity_id.as_str()).collect();
        assert_eq!(ids, vec!["match-pictures-1", "count-blocks-1"]);
        assert_eq!(api.recent_activity(&learner, &ActivityFilter::default(), Some(1))?.len(), 1);

        let concrete =
            ActivityFilter { cpa_stage: Some(CpaStage::Concrete), ..ActivityFilter::default() };
        let filtered = api.recent_activity(&learner, &concrete, None)?;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0], all[1]);

        let nobody = LearnerId::from("nobody");
        let missing = match api.recent_activity(&nobody, &ActivityFilter::default(), None) {
            Ok(events) => panic!("unknown learner should be rejected: {events:?}"),
            Err(err) => err,
        };
        assert!(matches!(missing.downcast_ref::<EngineError>(), Some(EngineError::UnknownEntity(_))));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn engine_rejections_surface_as_typed_errors() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(db_path.clone());
        let learner = LearnerId::from("1");
        api.enroll(learner.clone(), "Emma", fixture_time())?;

        let err = match api.record_attempt(&learner, &attempt("number-symbols-1", 5), fixture_time())
        {
            Ok(applied) => panic!("locked activity should be rejected: {:?}", applied.outcome),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::LockedActivity { .. })
        ));

        let missing = match api.profile(&LearnerId::from("nobody")) {
            Ok(view) => panic!("unknown learner should be rejected: {view:?}"),
            Err(err) => err,
        };
        assert!(matches!(missing.downcast_ref::<EngineError>(), Some(EngineError::UnknownEntity(_))));

        assert!(api.recent_activity(&learner, &ActivityFilter::default(), None)?.is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn streak_advances_across_days_and_unlocks_streak_badge() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(db_path.clone());
        let learner = LearnerId::from("1");
        api.enroll(learner.clone(), "Emma", fixture_time())?;

        let mut last = None;
        for day in 0..3 {
            let at = fixture_time() + Duration::days(day);
            last = Some(api.record_attempt(&learner, &attempt("count-blocks-1", 4), at)?);
        }
        let Some(last) = last else {
            panic!("three attempts were recorded");
        };
        assert_eq!(last.profile.streak, 3);
        let badges: Vec<&str> = last
            .outcome
            .unlocks
            .achievements
            .iter()
            .map(|unlock| unlock.achievement_id.as_str())
            .collect();
        assert_eq!(badges, vec!["streak-3"]);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn admin_unlocks_and_mini_games_persist() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(db_path.clone());
        let learner = LearnerId::from("1");
        api.enroll(learner.clone(), "Emma", fixture_time())?;

        let unlocked = api.unlock_reward(&learner, &RewardId::from("number-race"), fixture_time())?;
        assert_eq!(unlocked.outcome.status, UnlockStatus::Unlocked);
        let again = api.unlock_reward(&learner, &RewardId::from("number-race"), fixture_time())?;
        assert_eq!(again.outcome.status, UnlockStatus::AlreadyUnlocked);

        let played =
            api.record_mini_game(&learner, &RewardId::from("number-race"), 42, fixture_time())?;
        assert_eq!(played.outcome.record.high_score, 42);
        assert_eq!(played.profile.xp, 50);

        let level = api.unlock_level(&learner, &LevelId::from("abstract-1"), fixture_time())?;
        assert_eq!(level.outcome.status, UnlockStatus::Unlocked);
        let topic = api.unlock_topic(&learner, &TopicId::from("nonexistent"), fixture_time())?;
        assert_eq!(topic.outcome.status, UnlockStatus::UnknownId);

        let badge =
            api.unlock_achievement(&learner, &AchievementId::from("mastery-1"), fixture_time())?;
        assert_eq!(badge.outcome.xp.achievement_xp, 200);
        assert_eq!(api.profile(&learner)?.profile.xp, 250);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn class_overview_covers_every_enrolled_learner() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = api_at(db_path.clone());
        api.enroll(LearnerId::from("1"), "Emma", fixture_time())?;
        api.enroll(LearnerId::from("2"), "Liam", fixture_time())?;
        for _ in 0..3 {
            api.record_attempt(&LearnerId::from("2"), &attempt("count-blocks-1", 3), fixture_time())?;
        }

        let report = api.class_overview()?;
        assert_eq!(report.overview.learner_count, 2);
        assert_eq!(report.overview.needs_help, vec![LearnerId::from("2")]);
        assert_eq!(report.learners.len(), 2);

        let single = api.learner_report(&LearnerId::from("2"))?;
        assert!(single.needs_help);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
