use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use mathquest_core::{
    ActivityId, CpaStage, EventId, LearnerId, LearnerProfile, LevelId, ProgressEvent,
    ProgressSnapshot, TopicId,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const PROFILES_FILE: &str = "learner_profiles.ndjson";
const SNAPSHOTS_FILE: &str = "learner_snapshots.ndjson";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS learner_profiles (
  learner_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  xp INTEGER NOT NULL CHECK (xp >= 0),
  streak INTEGER NOT NULL CHECK (streak >= 0),
  last_active_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS learner_snapshots (
  learner_id TEXT PRIMARY KEY REFERENCES learner_profiles(learner_id),
  schema_version INTEGER NOT NULL CHECK (schema_version > 0),
  catalog_version INTEGER NOT NULL,
  saved_at TEXT NOT NULL,
  snapshot_json TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS progress_events (
  event_id TEXT PRIMARY KEY,
  learner_id TEXT NOT NULL REFERENCES learner_profiles(learner_id),
  seq INTEGER NOT NULL CHECK (seq >= 0),
  topic_id TEXT NOT NULL,
  level_id TEXT NOT NULL,
  activity_id TEXT NOT NULL,
  score INTEGER NOT NULL CHECK (score >= 0),
  max_score INTEGER NOT NULL CHECK (max_score > 0),
  time_spent_secs INTEGER NOT NULL CHECK (time_spent_secs >= 0),
  attempts INTEGER NOT NULL CHECK (attempts > 0),
  cpa_stage TEXT NOT NULL CHECK (cpa_stage IN ('concrete', 'pictorial', 'abstract')),
  completed_at TEXT NOT NULL,
  UNIQUE (learner_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_progress_events_learner_seq ON progress_events(learner_id, seq);

CREATE TRIGGER IF NOT EXISTS progress_events_no_update
BEFORE UPDATE ON progress_events
BEGIN
  SELECT RAISE(ABORT, 'progress_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS progress_events_no_delete
BEFORE DELETE ON progress_events
BEGIN
  SELECT RAISE(ABORT, 'progress_events is append-only');
END;
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveSummary {
    pub learner_id: LearnerId,
    pub appended_events: usize,
    pub total_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_learners: usize,
    pub skipped_existing_learners: usize,
    pub imported_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// A learner whose snapshot log and `progress_events` rows disagree in length.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventLogMismatch {
    pub learner_id: LearnerId,
    pub snapshot_events: usize,
    pub stored_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub event_log_mismatches: Vec<EventLogMismatch>,
    pub schema_status: SchemaStatus,
}

struct EventRow {
    event_id: String,
    topic_id: String,
    level_id: String,
    activity_id: String,
    score: i64,
    max_score: i64,
    time_spent_secs: i64,
    attempts: i64,
    cpa_stage: String,
    completed_at: String,
}

struct ProfileRow {
    learner_id: String,
    display_name: String,
    xp: i64,
    streak: i64,
    last_active_at: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed progress store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            apply_migration_1(&self.conn)?;
            info!(version = 1, "applied schema migration");
            version = 1;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        tx.execute_batch(MIGRATION_002_SQL).context("failed to create progress_events table")?;

        let snapshots = {
            let mut stmt = tx.prepare(
                "SELECT learner_id, snapshot_json FROM learner_snapshots ORDER BY learner_id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut snapshots = Vec::new();
            for row in rows {
                snapshots.push(row?);
            }
            snapshots
        };

        let mut backfilled = 0_usize;
        for (learner_id, snapshot_json) in snapshots {
            let snapshot: ProgressSnapshot = serde_json::from_str(&snapshot_json)
                .with_context(|| format!("failed to parse stored snapshot for {learner_id}"))?;
            backfilled += append_events(&tx, &snapshot.learner_id, &snapshot.state.events, 0)?;
        }

        let now = now_rfc3339()?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        info!(version = 2, backfilled_events = backfilled, "applied schema migration");
        Ok(())
    }

    /// Persist a learner's profile and snapshot, appending any events not yet stored.
    ///
    /// # Errors
    /// Returns an error when the profile and snapshot disagree on the learner, when the
    /// snapshot's event log no longer extends the stored one, or when any write fails.
    pub fn save_learner(
        &mut self,
        profile: &LearnerProfile,
        snapshot: &ProgressSnapshot,
    ) -> Result<SaveSummary> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        let summary = write_learner(&tx, profile, snapshot)?;
        tx.commit().context("failed to commit learner save")?;

        debug!(
            learner_id = %summary.learner_id,
            appended = summary.appended_events,
            "saved learner snapshot"
        );
        Ok(summary)
    }

    /// Load the latest snapshot for a learner.
    ///
    /// # Errors
    /// Returns an error when the query fails or stored JSON cannot be parsed.
    pub fn load_snapshot(&self, learner_id: &LearnerId) -> Result<Option<ProgressSnapshot>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT snapshot_json FROM learner_snapshots WHERE learner_id = ?1",
                params![learner_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load snapshot for {learner_id}"))?;

        raw.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("failed to parse stored snapshot for {learner_id}"))
        })
        .transpose()
    }

    /// # Errors
    /// Returns an error when the query fails or a stored column is malformed.
    pub fn load_profile(&self, learner_id: &LearnerId) -> Result<Option<LearnerProfile>> {
        let row = self
            .conn
            .query_row(
                "SELECT learner_id, display_name, xp, streak, last_active_at
                 FROM learner_profiles WHERE learner_id = ?1",
                params![learner_id.as_str()],
                map_profile_row,
            )
            .optional()
            .with_context(|| format!("failed to load profile for {learner_id}"))?;

        row.map(profile_from_row).transpose()
    }

    /// All enrolled learners ordered by id.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored column is malformed.
    pub fn list_learners(&self) -> Result<Vec<LearnerProfile>> {
        let mut stmt = self.conn.prepare(
            "SELECT learner_id, display_name, xp, streak, last_active_at
             FROM learner_profiles ORDER BY learner_id ASC",
        )?;
        let rows = stmt.query_map([], map_profile_row)?;

        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(profile_from_row(row?)?);
        }
        Ok(profiles)
    }

    /// Most recent stored events for a learner, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or a stored row is malformed.
    pub fn recent_events(&self, learner_id: &LearnerId, limit: usize) -> Result<Vec<ProgressEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT event_id, topic_id, level_id, activity_id, score, max_score,
                    time_spent_secs, attempts, cpa_stage, completed_at
             FROM progress_events
             WHERE learner_id = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![learner_id.as_str(), limit], |row| {
            Ok(EventRow {
                event_id: row.get(0)?,
                topic_id: row.get(1)?,
                level_id: row.get(2)?,
                activity_id: row.get(3)?,
                score: row.get(4)?,
                max_score: row.get(5)?,
                time_spent_secs: row.get(6)?,
                attempts: row.get(7)?,
                cpa_stage: row.get(8)?,
                completed_at: row.get(9)?,
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(event_from_row(row?)?);
        }
        Ok(events)
    }

    /// Export profiles and snapshots as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let profiles = self.list_learners()?;
        let mut snapshots = Vec::new();
        for profile in &profiles {
            if let Some(snapshot) = self.load_snapshot(&profile.learner_id)? {
                snapshots.push(snapshot);
            }
        }

        let profile_digest = write_ndjson_file(&out_dir.join(PROFILES_FILE), &profiles)?;
        let snapshot_digest = write_ndjson_file(&out_dir.join(SNAPSHOTS_FILE), &snapshots)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: PROFILES_FILE.to_string(),
                    sha256: profile_digest.0,
                    records: profile_digest.1,
                },
                ExportFileDigest {
                    path: SNAPSHOTS_FILE.to_string(),
                    sha256: snapshot_digest.0,
                    records: snapshot_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, duplicate handling, or writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let profiles = read_ndjson_file::<LearnerProfile>(&in_dir.join(PROFILES_FILE))?;
        let mut snapshots: BTreeMap<LearnerId, ProgressSnapshot> = BTreeMap::new();
        for snapshot in read_ndjson_file::<ProgressSnapshot>(&in_dir.join(SNAPSHOTS_FILE))? {
            let learner_id = snapshot.learner_id.clone();
            if snapshots.insert(learner_id.clone(), snapshot).is_some() {
                return Err(anyhow!("export contains two snapshots for learner {learner_id}"));
            }
        }

        let mut pending = Vec::new();
        let mut skipped_existing_learners = 0_usize;
        for profile in profiles {
            let snapshot = snapshots.remove(&profile.learner_id);
            if self.load_profile(&profile.learner_id)?.is_some() {
                if skip_existing {
                    skipped_existing_learners += 1;
                    continue;
                }

                return Err(anyhow!("learner already exists: {}", profile.learner_id));
            }
            pending.push((profile, snapshot));
        }

        if let Some(orphan) = snapshots.keys().next() {
            return Err(anyhow!("export contains a snapshot without a profile: {orphan}"));
        }

        let tx = self.conn.transaction().context("failed to start import transaction")?;
        let mut imported_events = 0_usize;
        for (profile, snapshot) in &pending {
            match snapshot {
                Some(snapshot) => {
                    imported_events += write_learner(&tx, profile, snapshot)?.appended_events;
                }
                None => upsert_profile(&tx, profile)?,
            }
        }
        tx.commit().context("failed to commit import")?;

        info!(
            imported_learners = pending.len(),
            skipped_existing_learners,
            imported_events,
            "imported export"
        );
        Ok(ImportSummary {
            imported_learners: pending.len(),
            skipped_existing_learners,
            imported_events,
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, event-log and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let event_log_mismatches = if schema_status.current_version >= 2 {
            self.event_log_mismatches()?
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            event_log_mismatches,
            schema_status,
        })
    }

    fn event_log_mismatches(&self) -> Result<Vec<EventLogMismatch>> {
        let mut mismatches = Vec::new();
        for profile in self.list_learners()? {
            let Some(snapshot) = self.load_snapshot(&profile.learner_id)? else {
                continue;
            };
            let stored_events = stored_event_count(&self.conn, &profile.learner_id)?;
            if stored_events != snapshot.state.events.len() {
                mismatches.push(EventLogMismatch {
                    learner_id: profile.learner_id,
                    snapshot_events: snapshot.state.events.len(),
                    stored_events,
                });
            }
        }
        Ok(mismatches)
    }
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    record_schema_version(conn, 1)
}

/// Write one learner inside `tx`: profile, snapshot, then the events the store lacks.
fn write_learner(
    tx: &Transaction<'_>,
    profile: &LearnerProfile,
    snapshot: &ProgressSnapshot,
) -> Result<SaveSummary> {
    if profile.learner_id != snapshot.learner_id {
        return Err(anyhow!(
            "profile {} and snapshot {} belong to different learners",
            profile.learner_id,
            snapshot.learner_id
        ));
    }

    upsert_profile(tx, profile)?;

    let snapshot_json =
        serde_json::to_string(snapshot).context("failed to serialize progress snapshot")?;
    tx.execute(
        "INSERT INTO learner_snapshots(
            learner_id, schema_version, catalog_version, saved_at, snapshot_json
        ) VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(learner_id) DO UPDATE SET
            schema_version = excluded.schema_version,
            catalog_version = excluded.catalog_version,
            saved_at = excluded.saved_at,
            snapshot_json = excluded.snapshot_json",
        params![
            snapshot.learner_id.as_str(),
            i64::from(snapshot.schema_version),
            i64::from(snapshot.catalog_version),
            rfc3339(snapshot.saved_at)?,
            snapshot_json,
        ],
    )
    .context("failed to upsert learner snapshot")?;

    let events = &snapshot.state.events;
    let stored = stored_event_count(tx, &snapshot.learner_id)?;
    if stored > events.len() {
        return Err(anyhow!(
            "event log for {} shrank from {stored} to {} entries",
            snapshot.learner_id,
            events.len()
        ));
    }
    if let Some(last_stored) = stored.checked_sub(1) {
        let stored_id = last_event_id(tx, &snapshot.learner_id)?;
        let expected = events.get(last_stored).map(|event| event.event_id.to_string());
        if stored_id != expected {
            return Err(anyhow!(
                "event log for {} diverges from stored history at entry {last_stored}",
                snapshot.learner_id
            ));
        }
    }

    let appended = append_events(tx, &snapshot.learner_id, events, stored)?;
    Ok(SaveSummary {
        learner_id: snapshot.learner_id.clone(),
        appended_events: appended,
        total_events: events.len(),
    })
}

fn upsert_profile(tx: &Transaction<'_>, profile: &LearnerProfile) -> Result<()> {
    let now = now_rfc3339()?;
    let last_active_at = profile.last_active_at.map(rfc3339).transpose()?;
    tx.execute(
        "INSERT INTO learner_profiles(
            learner_id, display_name, xp, streak, last_active_at, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        ON CONFLICT(learner_id) DO UPDATE SET
            display_name = excluded.display_name,
            xp = excluded.xp,
            streak = excluded.streak,
            last_active_at = excluded.last_active_at,
            updated_at = excluded.updated_at",
        params![
            profile.learner_id.as_str(),
            profile.display_name,
            i64::try_from(profile.xp).context("learner xp exceeds sqlite integer range")?,
            i64::from(profile.streak),
            last_active_at,
            now,
        ],
    )
    .context("failed to upsert learner profile")?;
    Ok(())
}

fn append_events(
    tx: &Transaction<'_>,
    learner_id: &LearnerId,
    events: &[ProgressEvent],
    from: usize,
) -> Result<usize> {
    let mut appended = 0_usize;
    for (seq, event) in events.iter().enumerate().skip(from) {
        tx.execute(
            "INSERT INTO progress_events(
                event_id, learner_id, seq, topic_id, level_id, activity_id,
                score, max_score, time_spent_secs, attempts, cpa_stage, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                event.event_id.to_string(),
                learner_id.as_str(),
                i64::try_from(seq).context("event sequence exceeds sqlite integer range")?,
                event.topic_id.as_str(),
                event.level_id.as_str(),
                event.activity_id.as_str(),
                i64::from(event.score),
                i64::from(event.max_score),
                i64::try_from(event.time_spent_secs)
                    .context("time spent exceeds sqlite integer range")?,
                i64::from(event.attempts),
                event.cpa_stage.as_str(),
                rfc3339(event.completed_at)?,
            ],
        )
        .with_context(|| format!("failed to append progress event {}", event.event_id))?;
        appended += 1;
    }
    Ok(appended)
}

fn stored_event_count(conn: &Connection, learner_id: &LearnerId) -> Result<usize> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM progress_events WHERE learner_id = ?1",
            params![learner_id.as_str()],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to count progress events for {learner_id}"))?;
    usize::try_from(count).context("negative progress event count")
}

fn last_event_id(conn: &Connection, learner_id: &LearnerId) -> Result<Option<String>> {
    conn.query_row(
        "SELECT event_id FROM progress_events WHERE learner_id = ?1 ORDER BY seq DESC LIMIT 1",
        params![learner_id.as_str()],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .with_context(|| format!("failed to read last progress event for {learner_id}"))
}

fn map_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileRow> {
    Ok(ProfileRow {
        learner_id: row.get(0)?,
        display_name: row.get(1)?,
        xp: row.get(2)?,
        streak: row.get(3)?,
        last_active_at: row.get(4)?,
    })
}

fn profile_from_row(row: ProfileRow) -> Result<LearnerProfile> {
    Ok(LearnerProfile {
        learner_id: LearnerId::new(row.learner_id),
        display_name: row.display_name,
        xp: u64::try_from(row.xp).context("stored xp is negative")?,
        streak: u32::try_from(row.streak).context("stored streak is out of range")?,
        last_active_at: row.last_active_at.as_deref().map(parse_rfc3339).transpose()?,
    })
}

fn event_from_row(row: EventRow) -> Result<ProgressEvent> {
    let cpa_stage = CpaStage::parse(&row.cpa_stage)
        .ok_or_else(|| anyhow!("invalid cpa_stage in progress_events: {}", row.cpa_stage))?;
    Ok(ProgressEvent {
        event_id: parse_event_id(&row.event_id)?,
        topic_id: TopicId::new(row.topic_id),
        level_id: LevelId::new(row.level_id),
        activity_id: ActivityId::new(row.activity_id),
        score: u32::try_from(row.score).context("stored score is out of range")?,
        max_score: u32::try_from(row.max_score).context("stored max_score is out of range")?,
        time_spent_secs: u64::try_from(row.time_spent_secs)
            .context("stored time spent is negative")?,
        attempts: u32::try_from(row.attempts).context("stored attempts is out of range")?,
        cpa_stage,
        completed_at: parse_rfc3339(&row.completed_at)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_event_id(raw: &str) -> Result<EventId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(EventId(parsed))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [PROFILES_FILE, SNAPSHOTS_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {actual_sha256}",
                expected.sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {actual_records}",
                expected.records
            ));
        }
    }

    Ok(())
}
