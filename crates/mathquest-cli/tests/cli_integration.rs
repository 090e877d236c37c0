use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_mq<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_mq"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute mq binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_mq(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "mq command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_mq(args);
    assert!(
        !output.status.success(),
        "mq command unexpectedly succeeded:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn enroll(db: &str, learner: &str, name: &str) -> Value {
    run_json([
        "--db",
        db,
        "learner",
        "enroll",
        "--learner",
        learner,
        "--name",
        name,
        "--at",
        "2026-03-02T08:00:00Z",
    ])
}

fn attempt(db: &str, learner: &str, activity: &str, score: &str, at: &str) -> Value {
    run_json([
        "--db",
        db,
        "attempt",
        "--learner",
        learner,
        "--activity",
        activity,
        "--score",
        score,
        "--max-score",
        "10",
        "--time-spent",
        "40",
        "--at",
        at,
    ])
}

#[test]
fn fresh_database_reports_pending_migrations_then_migrates() {
    let root = unique_temp_dir("mq-cli-migrate");
    let db = root.join("mq.sqlite3");
    let db = path_str(&db);

    let status = run_json(["--db", db, "db", "schema-version"]);
    assert_eq!(as_str(&status, "contract_version"), "cli.v1");
    assert_eq!(as_i64(&status, "current_version"), 0);
    assert_eq!(as_i64(&status, "target_version"), 2);
    assert!(!as_bool(&status, "up_to_date"));

    let dry_run = run_json(["--db", db, "db", "migrate", "--dry-run"]);
    assert!(as_bool(&dry_run, "dry_run"));
    assert_eq!(as_array(&dry_run, "would_apply_versions").len(), 2);

    let migrated = run_json(["--db", db, "db", "migrate"]);
    assert_eq!(as_i64(&migrated, "after_version"), 2);
    assert!(as_bool(&migrated, "up_to_date"));

    let again = run_json(["--db", db, "db", "schema-version"]);
    assert!(as_bool(&again, "up_to_date"));
}

#[test]
fn attempt_unlocks_next_level_and_awards_xp() {
    let root = unique_temp_dir("mq-cli-attempt");
    let db = root.join("mq.sqlite3");
    let db = path_str(&db);

    let enrolled = enroll(db, "emma", "Emma");
    assert_eq!(as_i64(&enrolled["profile"]["profile"], "xp"), 0);

    let applied = attempt(db, "emma", "count-blocks-1", "9", "2026-03-02T09:00:00Z");
    assert!(as_bool(&applied, "persisted"));
    assert_eq!(as_i64(&applied["profile"], "xp"), 79);
    assert!(as_bool(&applied["outcome"], "first_completion"));
    let unlocks = &applied["outcome"]["unlocks"];
    assert_eq!(as_array(unlocks, "completed_levels")[0], "concrete-1");
    assert_eq!(as_array(unlocks, "levels")[0], "pictorial-1");
    assert_eq!(as_array(unlocks, "achievements")[0]["achievement_id"], "first-activity");

    let progress = run_json(["--db", db, "progress", "show", "--learner", "emma"]);
    let first_topic = &as_array(&progress, "topics")[0];
    assert_eq!(as_str(first_topic, "topic_id"), "numbers-to-20");
    let levels = as_array(first_topic, "levels");
    assert!(as_bool(&levels[0], "completed"));
    assert!(as_bool(&levels[1], "unlocked"));
    assert!(!as_bool(&levels[2], "unlocked"));

    let recent = run_json(["--db", db, "progress", "recent", "--learner", "emma", "--limit", "5"]);
    let events = as_array(&recent, "events");
    assert_eq!(events.len(), 1);
    assert_eq!(as_str(&events[0], "activity_id"), "count-blocks-1");
    assert_eq!(as_i64(&events[0], "score"), 9);
}

#[test]
fn rejected_attempts_exit_non_zero_and_leave_state_unchanged() {
    let root = unique_temp_dir("mq-cli-rejected");
    let db = root.join("mq.sqlite3");
    let db = path_str(&db);
    enroll(db, "liam", "Liam");

    let locked = run_failure([
        "--db",
        db,
        "attempt",
        "--learner",
        "liam",
        "--activity",
        "number-symbols-1",
        "--score",
        "10",
        "--max-score",
        "10",
    ]);
    assert!(locked.contains("is locked"), "unexpected stderr: {locked}");

    let over_max = run_failure([
        "--db",
        db,
        "attempt",
        "--learner",
        "liam",
        "--activity",
        "count-blocks-1",
        "--score",
        "11",
        "--max-score",
        "10",
    ]);
    assert!(over_max.contains("invalid score"), "unexpected stderr: {over_max}");

    let unknown = run_failure(["--db", db, "progress", "show", "--learner", "nobody"]);
    assert!(unknown.contains("unknown entity"), "unexpected stderr: {unknown}");

    let recent = run_json(["--db", db, "progress", "recent", "--learner", "liam"]);
    assert!(as_array(&recent, "events").is_empty());
    let profile = run_json(["--db", db, "learner", "show", "--learner", "liam"]);
    assert_eq!(as_i64(&profile["profile"], "xp"), 0);
}

#[test]
fn admin_unlock_reports_status_per_call() {
    let root = unique_temp_dir("mq-cli-unlock");
    let db = root.join("mq.sqlite3");
    let db = path_str(&db);
    enroll(db, "emma", "Emma");

    let first = run_json(["--db", db, "unlock", "reward", "--learner", "emma", "--id", "cat"]);
    assert_eq!(as_str(&first, "status"), "unlocked");
    let second = run_json(["--db", db, "unlock", "reward", "--learner", "emma", "--id", "cat"]);
    assert_eq!(as_str(&second, "status"), "already_unlocked");
    let unknown =
        run_json(["--db", db, "unlock", "topic", "--learner", "emma", "--id", "calculus"]);
    assert_eq!(as_str(&unknown, "status"), "unknown_id");

    let level = run_json(["--db", db, "unlock", "level", "--learner", "emma", "--id", "abstract-1"]);
    assert_eq!(as_str(&level, "status"), "unlocked");
    let applied = attempt(db, "emma", "number-symbols-1", "10", "2026-03-02T10:00:00Z");
    assert!(as_bool(&applied["outcome"], "first_completion"));
}

#[test]
fn locked_mini_game_is_rejected() {
    let root = unique_temp_dir("mq-cli-minigame");
    let db = root.join("mq.sqlite3");
    let db = path_str(&db);
    enroll(db, "emma", "Emma");

    let stderr = run_failure([
        "--db",
        db,
        "minigame",
        "play",
        "--learner",
        "emma",
        "--game",
        "number-race",
        "--score",
        "40",
    ]);
    assert!(stderr.contains("number-race is locked"), "unexpected stderr: {stderr}");

    run_json(["--db", db, "unlock", "reward", "--learner", "emma", "--id", "number-race"]);
    let played = run_json([
        "--db",
        db,
        "minigame",
        "play",
        "--learner",
        "emma",
        "--game",
        "number-race",
        "--score",
        "40",
    ]);
    assert!(as_bool(&played["outcome"], "new_high_score"));
    assert_eq!(as_i64(&played["outcome"]["record"], "high_score"), 40);
}

#[test]
fn learner_report_surfaces_misconceptions_and_class_needs_help() {
    let root = unique_temp_dir("mq-cli-report");
    let db = root.join("mq.sqlite3");
    let db = path_str(&db);
    enroll(db, "emma", "Emma");
    enroll(db, "liam", "Liam");
    attempt(db, "emma", "count-blocks-1", "10", "2026-03-02T09:00:00Z");

    for at in ["2026-03-02T09:00:00Z", "2026-03-02T09:05:00Z", "2026-03-02T09:10:00Z"] {
        run_json([
            "--db",
            db,
            "attempt",
            "--learner",
            "liam",
            "--activity",
            "count-blocks-1",
            "--score",
            "3",
            "--max-score",
            "10",
            "--error",
            "off-by-one:Counted a block twice",
            "--at",
            at,
        ]);
    }

    let report = run_json(["--db", db, "report", "learner", "--learner", "liam"]);
    assert!(as_bool(&report, "needs_help"));
    let misconceptions = as_array(&report, "misconceptions");
    assert_eq!(misconceptions.len(), 1);
    assert_eq!(as_str(&misconceptions[0], "kind"), "off-by-one");
    assert_eq!(as_i64(&misconceptions[0], "frequency"), 3);

    let class = run_json(["--db", db, "report", "class"]);
    assert_eq!(as_i64(&class["overview"], "learner_count"), 2);
    assert_eq!(as_array(&class["overview"], "needs_help")[0], "liam");
}

#[test]
fn malformed_error_flag_is_rejected() {
    let root = unique_temp_dir("mq-cli-error-flag");
    let db = root.join("mq.sqlite3");
    let db = path_str(&db);
    enroll(db, "emma", "Emma");

    let stderr = run_failure([
        "--db",
        db,
        "attempt",
        "--learner",
        "emma",
        "--activity",
        "count-blocks-1",
        "--score",
        "3",
        "--max-score",
        "10",
        "--error",
        "no separator here",
    ]);
    assert!(stderr.contains("kind:description"), "unexpected stderr: {stderr}");
}

#[test]
fn export_import_moves_learners_between_databases() {
    let root = unique_temp_dir("mq-cli-export");
    let source = root.join("source.sqlite3");
    let target = root.join("target.sqlite3");
    let export_dir = root.join("export");
    let source = path_str(&source);
    let target = path_str(&target);

    enroll(source, "emma", "Emma");
    attempt(source, "emma", "count-blocks-1", "9", "2026-03-02T09:00:00Z");
    attempt(source, "emma", "match-pictures-1", "8", "2026-03-02T09:10:00Z");

    let exported = run_json(["--db", source, "db", "export", "--out", path_str(&export_dir)]);
    assert_eq!(as_array(&exported["manifest"], "files").len(), 2);

    let imported =
        run_json(["--db", target, "db", "import", "--in", path_str(&export_dir)]);
    assert_eq!(as_i64(&imported["summary"], "imported_learners"), 1);
    assert_eq!(as_i64(&imported["summary"], "imported_events"), 2);

    let duplicate = run_failure(["--db", target, "db", "import", "--in", path_str(&export_dir)]);
    assert!(duplicate.contains("learner already exists"), "unexpected stderr: {duplicate}");

    let skipped = run_json([
        "--db",
        target,
        "db",
        "import",
        "--in",
        path_str(&export_dir),
        "--skip-existing",
    ]);
    assert_eq!(as_i64(&skipped["summary"], "skipped_existing_learners"), 1);

    let recent = run_json(["--db", target, "progress", "recent", "--learner", "emma"]);
    let events = as_array(&recent, "events");
    assert_eq!(events.len(), 2);
    assert_eq!(as_str(&events[0], "activity_id"), "match-pictures-1");

    let integrity = run_json(["--db", target, "db", "integrity-check"]);
    assert!(as_bool(&integrity, "quick_check_ok"));
    assert!(as_array(&integrity, "event_log_mismatches").is_empty());
}

#[test]
fn backup_and_restore_round_trip_database() {
    let root = unique_temp_dir("mq-cli-backup");
    let db = root.join("mq.sqlite3");
    let restored = root.join("restored.sqlite3");
    let backup = root.join("backups").join("mq.bak");
    let db = path_str(&db);
    let restored = path_str(&restored);

    enroll(db, "emma", "Emma");
    attempt(db, "emma", "count-blocks-1", "10", "2026-03-02T09:00:00Z");

    let backed_up = run_json(["--db", db, "db", "backup", "--out", path_str(&backup)]);
    assert_eq!(as_str(&backed_up, "status"), "ok");

    let restore = run_json(["--db", restored, "db", "restore", "--in", path_str(&backup)]);
    assert_eq!(as_i64(&restore, "current_version"), 2);

    let profile = run_json(["--db", restored, "learner", "show", "--learner", "emma"]);
    assert_eq!(as_i64(&profile["profile"], "xp"), 80);
}

#[test]
fn custom_catalog_file_drives_the_curriculum() {
    let root = unique_temp_dir("mq-cli-catalog");
    let db = root.join("mq.sqlite3");
    let db = path_str(&db);
    let catalog_path = root.join("tiny.yaml");
    fs::write(
        &catalog_path,
        "catalog_version: 3
topics:
  - id: shapes
    title: Shapes
    order: 1
    levels:
      - id: shapes-concrete
        title: Build shapes
        cpa_stage: concrete
        order: 1
        mastery_threshold: 50
        activities:
          - id: build-triangle
            title: Build a triangle
            type: shapes
            scoring:
              max_score: 4
",
    )
    .unwrap_or_else(|err| panic!("failed to write catalog fixture: {err}"));
    let catalog = path_str(&catalog_path);

    let validated = run_json(["catalog", "validate", "--path", catalog]);
    assert!(as_bool(&validated, "valid"));
    assert_eq!(as_i64(&validated["summary"], "activities"), 1);

    run_json([
        "--db",
        db,
        "--catalog",
        catalog,
        "learner",
        "enroll",
        "--learner",
        "kai",
        "--name",
        "Kai",
    ]);
    let applied = run_json([
        "--db",
        db,
        "--catalog",
        catalog,
        "attempt",
        "--learner",
        "kai",
        "--activity",
        "build-triangle",
        "--score",
        "2",
        "--max-score",
        "4",
    ]);
    assert_eq!(as_array(&applied["outcome"]["unlocks"], "completed_topics")[0], "shapes");

    let broken_path = root.join("broken.json");
    fs::write(&broken_path, r#"{"catalog_version": 1, "topics": "nope"}"#)
        .unwrap_or_else(|err| panic!("failed to write broken catalog: {err}"));
    let stderr = run_failure(["catalog", "validate", "--path", path_str(&broken_path)]);
    assert!(stderr.contains("invalid catalog"), "unexpected stderr: {stderr}");
}
