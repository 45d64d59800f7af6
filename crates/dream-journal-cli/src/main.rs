use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dream_journal_api::{
    validate_storage_key, DreamJournal, DreamRepository, JournalConfig, MaintenanceApi,
};
use dream_journal_core::{
    parse_rating, segment_hashtags, DreamDraft, DreamFilter, DreamId, FilterInput, SortOrder,
    TAG_CATALOG,
};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "DJ_LOG";

#[derive(Debug, Parser)]
#[command(name = "dj")]
#[command(about = "Dream Journal CLI")]
struct Cli {
    #[arg(long, env = "DREAM_JOURNAL_DB", default_value = "./dream_journal.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "DREAM_JOURNAL_KEY", default_value = "dreams")]
    storage_key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Dream {
        #[command(subcommand)]
        command: Box<DreamCommand>,
    },
    Stats,
    Tags,
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
enum DreamCommand {
    Add(DraftArgs),
    Edit(EditArgs),
    Delete(IdArgs),
    Show(IdArgs),
    List(ListArgs),
}

#[derive(Debug, Args)]
struct DraftArgs {
    #[arg(long)]
    text: String,
    #[arg(long)]
    date: Option<String>,
    #[arg(long, default_value_t = false)]
    lucid: bool,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, default_value = "")]
    location: String,
    #[arg(long, default_value = "")]
    characters: String,
    #[arg(long, default_value = "")]
    emotion: String,
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    intensity: i32,
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    clarity: i32,
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    sleep_quality: i32,
}

#[derive(Debug, Args)]
struct EditArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    draft: DraftArgs,
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, default_value = "")]
    emotion: String,
    #[arg(long, default_value = "")]
    location: String,
    #[arg(long, default_value = "")]
    characters: String,
    #[arg(long)]
    lucid: Option<bool>,
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    intensity: String,
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    clarity: String,
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    sleep_quality: String,
    #[arg(long, default_value = "asc")]
    sort: String,
}

impl DraftArgs {
    fn into_draft(self) -> DreamDraft {
        DreamDraft {
            text: self.text,
            date: self.date,
            is_lucid: self.lucid,
            tags: self.tags,
            location: self.location,
            characters: self.characters,
            emotion: self.emotion,
            intensity: self.intensity,
            clarity: self.clarity,
            sleep_quality: self.sleep_quality,
        }
    }
}

impl ListArgs {
    fn into_filter(self) -> DreamFilter {
        for (field, raw) in [
            ("intensity", &self.intensity),
            ("clarity", &self.clarity),
            ("sleep-quality", &self.sleep_quality),
        ] {
            if !raw.is_empty() && parse_rating(raw).is_none() {
                tracing::warn!(field, value = %raw, "ignoring malformed numeric filter");
            }
        }
        if SortOrder::parse(&self.sort).is_none() {
            tracing::warn!(value = %self.sort, "unknown sort order; using ascending");
        }

        DreamFilter::from_input(&FilterInput {
            emotion: self.emotion,
            location: self.location,
            characters: self.characters,
            is_lucid: self.lucid,
            intensity: self.intensity,
            clarity: self.clarity,
            sleep_quality: self.sleep_quality,
            sort_order: self.sort,
        })
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

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // Logs go to stderr so stdout stays a single JSON document.
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    validate_storage_key(&cli.storage_key)?;

    match cli.command {
        Command::Db { command } => {
            let api = MaintenanceApi::with_storage_key(cli.db, &cli.storage_key);
            run_db(*command, &api)
        }
        Command::Dream { command } => {
            let mut journal = DreamJournal::sqlite(cli.db, journal_config(&cli.storage_key));
            run_dream(*command, &mut journal)
        }
        Command::Stats => {
            let journal = DreamJournal::sqlite(cli.db, journal_config(&cli.storage_key));
            let report = journal.stats();
            emit_json(serde_json::json!({
                "stats": report.stats,
                "notice": report.notice
            }))
        }
        Command::Tags => emit_json(serde_json::json!({ "tags": TAG_CATALOG })),
    }
}

fn journal_config(storage_key: &str) -> JournalConfig {
    JournalConfig { storage_key: storage_key.to_string(), ..JournalConfig::default() }
}

fn run_db(command: DbCommand, api: &MaintenanceApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Export(args) => {
            let manifest = api.export(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let summary = api.import(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_dream<R: DreamRepository>(command: DreamCommand, journal: &mut DreamJournal<R>) -> Result<()> {
    match command {
        DreamCommand::Add(args) => {
            let record = journal.add_dream(args.into_draft())?;
            emit_json(serde_json::json!({ "dream": record }))
        }
        DreamCommand::Edit(args) => {
            let id = DreamId::from(args.id.as_str());
            let record = journal.edit_dream(&id, args.draft.into_draft())?;
            emit_json(serde_json::json!({ "dream": record }))
        }
        DreamCommand::Delete(args) => {
            let removed = journal.delete_dream(&DreamId::from(args.id.as_str()))?;
            emit_json(serde_json::json!({ "deleted": removed.id }))
        }
        DreamCommand::Show(args) => {
            let record = journal.get_dream(&DreamId::from(args.id.as_str()))?;
            let segments = segment_hashtags(&record.text);
            emit_json(serde_json::json!({
                "dream": record,
                "segments": segments
            }))
        }
        DreamCommand::List(args) => {
            let filter = args.into_filter();
            let listing = journal.list_dreams(&filter);
            emit_json(serde_json::json!({
                "filter": filter,
                "count": listing.dreams.len(),
                "dreams": listing.dreams,
                "notice": listing.notice
            }))
        }
    }
}
