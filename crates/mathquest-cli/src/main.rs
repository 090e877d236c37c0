use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mathquest_api::MathQuestApi;
use mathquest_core::{
    AchievementId, ActivityFilter, ActivityId, Attempt, Catalog, CpaStage, EngineConfig,
    ErrorObservation, LearnerId, LevelId, RewardId, TopicId,
};
use mathquest_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "mq")]
#[command(about = "MathQuest progress engine CLI")]
struct Cli {
    #[arg(long, default_value = "./mathquest.sqlite3")]
    db: PathBuf,

    /// Curriculum catalog (YAML or JSON); the built-in grade 1 catalog when omitted.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Engine config (YAML or JSON); defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Catalog {
        #[command(subcommand)]
        command: Box<CatalogCommand>,
    },
    Learner {
        #[command(subcommand)]
        command: Box<LearnerCommand>,
    },
    Attempt(AttemptArgs),
    Unlock {
        #[command(subcommand)]
        command: Box<UnlockCommand>,
    },
    Minigame {
        #[command(subcommand)]
        command: Box<MinigameCommand>,
    },
    Progress {
        #[command(subcommand)]
        command: Box<ProgressCommand>,
    },
    Report {
        #[command(subcommand)]
        command: Box<ReportCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum CatalogCommand {
    Show,
    Validate(CatalogValidateArgs),
}

#[derive(Debug, Args)]
struct CatalogValidateArgs {
    #[arg(long)]
    path: PathBuf,
}

#[derive(Debug, Subcommand)]
enum LearnerCommand {
    Enroll(EnrollArgs),
    Show(LearnerArgs),
}

#[derive(Debug, Args)]
struct EnrollArgs {
    #[arg(long)]
    learner: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct LearnerArgs {
    #[arg(long)]
    learner: String,
}

#[derive(Debug, Args)]
struct AttemptArgs {
    #[arg(long)]
    learner: String,
    #[arg(long)]
    activity: String,
    #[arg(long)]
    score: u32,
    #[arg(long)]
    max_score: u32,
    #[arg(long, default_value_t = 0)]
    time_spent: u64,
    /// Observed mistake as `kind:description`; repeatable.
    #[arg(long = "error")]
    errors: Vec<String>,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum UnlockCommand {
    Topic(UnlockArgs),
    Level(UnlockArgs),
    Achievement(UnlockArgs),
    Reward(UnlockArgs),
}

#[derive(Debug, Args)]
struct UnlockArgs {
    #[arg(long)]
    learner: String,
    #[arg(long)]
    id: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum MinigameCommand {
    Play(MinigamePlayArgs),
}

#[derive(Debug, Args)]
struct MinigamePlayArgs {
    #[arg(long)]
    learner: String,
    #[arg(long)]
    game: String,
    #[arg(long)]
    score: u32,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ProgressCommand {
    Show(LearnerArgs),
    Recent(RecentArgs),
}

#[derive(Debug, Args)]
struct RecentArgs {
    #[arg(long)]
    learner: String,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    topic: Option<String>,
    #[arg(long)]
    level: Option<String>,
    #[arg(long, value_enum)]
    stage: Option<StageArg>,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    Learner(LearnerArgs),
    Class,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StageArg {
    Concrete,
    Pictorial,
    Abstract,
}

impl StageArg {
    fn into_stage(self) -> CpaStage {
        match self {
            Self::Concrete => CpaStage::Concrete,
            Self::Pictorial => CpaStage::Pictorial,
            Self::Abstract => CpaStage::Abstract,
        }
    }
}

#[derive(Debug, Serialize)]
struct CatalogSummary {
    catalog_version: u32,
    topics: usize,
    levels: usize,
    activities: usize,
    achievements: usize,
    rewards: usize,
}

impl CatalogSummary {
    fn of(catalog: &Catalog) -> Self {
        let levels = catalog.topics.iter().map(|topic| topic.levels.len()).sum();
        let activities = catalog
            .topics
            .iter()
            .flat_map(|topic| &topic.levels)
            .map(|level| level.activities.len())
            .sum();
        Self {
            catalog_version: catalog.catalog_version,
            topics: catalog.topics.len(),
            levels,
            activities,
            achievements: catalog.achievements.len(),
            rewards: catalog.rewards.len(),
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to serialize command output")?)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let Cli { db, catalog, config, command } = Cli::parse();
    match command {
        Command::Catalog { command } => run_catalog(*command, catalog.as_deref()),
        command => {
            let catalog = load_catalog(catalog.as_deref())?;
            let config = load_config(config.as_deref())?;
            let api = MathQuestApi::new(db.clone(), Arc::new(catalog), config);
            match command {
                Command::Db { command } => run_db(*command, &api, &db),
                command => run_learning(command, &api),
            }
        }
    }
}

fn run_db(command: DbCommand, api: &MathQuestApi, db_path: &Path) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(api),
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        command => {
            let mut store = SqliteStore::open(db_path)?;
            match command {
                DbCommand::Export(args) => run_db_export(&args, &mut store),
                DbCommand::Import(args) => run_db_import(&args, &mut store),
                DbCommand::Backup(args) => run_db_backup(&args, &mut store),
                DbCommand::Restore(args) => run_db_restore(&args, &mut store),
                DbCommand::IntegrityCheck => run_db_integrity_check(&store),
                DbCommand::SchemaVersion | DbCommand::Migrate(_) => {
                    Err(anyhow!("schema commands run through the api"))
                }
            }
        }
    }
}

fn run_db_schema_version(api: &MathQuestApi) -> Result<()> {
    let status = api.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit(&report)
}

fn run_catalog(command: CatalogCommand, catalog_path: Option<&Path>) -> Result<()> {
    match command {
        CatalogCommand::Show => {
            let catalog = load_catalog(catalog_path)?;
            emit_json(serde_json::json!({
                "summary": CatalogSummary::of(&catalog),
                "catalog": catalog
            }))
        }
        CatalogCommand::Validate(args) => {
            let catalog = load_catalog(Some(&args.path))?;
            emit_json(serde_json::json!({
                "path": args.path,
                "valid": true,
                "summary": CatalogSummary::of(&catalog)
            }))
        }
    }
}

fn run_learning(command: Command, api: &MathQuestApi) -> Result<()> {
    match command {
        Command::Learner { command } => match *command {
            LearnerCommand::Enroll(args) => {
                let at = parse_optional_rfc3339(args.at.as_deref())?;
                emit(&api.enroll(LearnerId::new(args.learner), &args.name, at)?)
            }
            LearnerCommand::Show(args) => emit(&api.profile(&LearnerId::new(args.learner))?),
        },
        Command::Attempt(args) => run_attempt(args, api),
        Command::Unlock { command } => run_unlock(*command, api),
        Command::Minigame { command } => match *command {
            MinigameCommand::Play(args) => {
                let at = parse_optional_rfc3339(args.at.as_deref())?;
                emit(&api.record_mini_game(
                    &LearnerId::new(args.learner),
                    &RewardId::new(args.game),
                    args.score,
                    at,
                )?)
            }
        },
        Command::Progress { command } => match *command {
            ProgressCommand::Show(args) => emit(&api.progress(&LearnerId::new(args.learner))?),
            ProgressCommand::Recent(args) => {
                let filter = ActivityFilter {
                    topic_id: args.topic.map(TopicId::new),
                    level_id: args.level.map(LevelId::new),
                    cpa_stage: args.stage.map(StageArg::into_stage),
                };
                let events =
                    api.recent_activity(&LearnerId::new(args.learner.clone()), &filter, args.limit)?;
                emit_json(serde_json::json!({
                    "learner_id": args.learner,
                    "events": events
                }))
            }
        },
        Command::Report { command } => match *command {
            ReportCommand::Learner(args) => {
                emit(&api.learner_report(&LearnerId::new(args.learner))?)
            }
            ReportCommand::Class => emit(&api.class_overview()?),
        },
        Command::Db { .. } | Command::Catalog { .. } => {
            Err(anyhow!("command does not operate on learner progress"))
        }
    }
}

fn run_attempt(args: AttemptArgs, api: &MathQuestApi) -> Result<()> {
    let at = parse_optional_rfc3339(args.at.as_deref())?;
    let errors =
        args.errors.iter().map(String::as_str).map(parse_error_observation).collect::<Result<_>>()?;
    let attempt = Attempt {
        activity_id: ActivityId::new(args.activity),
        raw_score: args.score,
        max_score: args.max_score,
        time_spent_secs: args.time_spent,
        errors,
    };
    let applied = api.record_attempt(&LearnerId::new(args.learner), &attempt, at)?;
    debug!(persisted = applied.persisted, "attempt applied");
    emit(&applied)
}

fn run_unlock(command: UnlockCommand, api: &MathQuestApi) -> Result<()> {
    let (kind, args) = match &command {
        UnlockCommand::Topic(args) => ("topic", args),
        UnlockCommand::Level(args) => ("level", args),
        UnlockCommand::Achievement(args) => ("achievement", args),
        UnlockCommand::Reward(args) => ("reward", args),
    };
    let at = parse_optional_rfc3339(args.at.as_deref())?;
    let learner_id = LearnerId::new(args.learner.clone());
    let applied = match &command {
        UnlockCommand::Topic(args) => api.unlock_topic(&learner_id, &TopicId::new(&args.id), at)?,
        UnlockCommand::Level(args) => api.unlock_level(&learner_id, &LevelId::new(&args.id), at)?,
        UnlockCommand::Achievement(args) => {
            api.unlock_achievement(&learner_id, &AchievementId::new(&args.id), at)?
        }
        UnlockCommand::Reward(args) => {
            api.unlock_reward(&learner_id, &RewardId::new(&args.id), at)?
        }
    };

    emit_json(serde_json::json!({
        "kind": kind,
        "id": args.id,
        "status": applied.outcome.status.as_str(),
        "result": applied
    }))
}

fn load_catalog(path: Option<&Path>) -> Result<Catalog> {
    let Some(path) = path else {
        return Ok(Catalog::grade_one());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog file {}", path.display()))?;
    let catalog = if is_json(path) { Catalog::from_json_str(&raw) } else { Catalog::from_yaml_str(&raw) };
    catalog.with_context(|| format!("failed to load catalog {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config =
        if is_json(path) { EngineConfig::from_json_str(&raw) } else { EngineConfig::from_yaml_str(&raw) };
    config.with_context(|| format!("failed to load config {}", path.display()))
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn parse_error_observation(raw: &str) -> Result<ErrorObservation> {
    let Some((kind, description)) = raw.split_once(':') else {
        return Err(anyhow!("--error MUST be formatted as kind:description (received: {raw})"));
    };
    if kind.trim().is_empty() {
        return Err(anyhow!("--error kind MUST be non-empty (received: {raw})"));
    }
    Ok(ErrorObservation {
        kind: kind.trim().to_string(),
        description: description.trim().to_string(),
        remediation: None,
    })
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
