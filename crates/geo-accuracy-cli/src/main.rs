use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use geo_accuracy_api::{
    AccuracyApi, AccuracySettings, CheckInRequest, SampleInput, StaticCeilings,
};
use geo_accuracy_core::{ContextKey, ContextType};
use geo_accuracy_store_sqlite::SqliteStatStore;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

type SqliteApi = AccuracyApi<SqliteStatStore, StaticCeilings>;

#[derive(Debug, Parser)]
#[command(name = "gac")]
#[command(about = "Geo accuracy controller CLI")]
struct Cli {
    #[arg(long, default_value = "./geo_accuracy.sqlite3")]
    db: PathBuf,

    /// YAML file with controller tuning and tenant ceilings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    CheckIn(CheckInArgs),
    Stat {
        #[command(subcommand)]
        command: StatCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ContextArgs {
    #[arg(long, value_parser = parse_context_type)]
    context_type: ContextType,
    #[arg(long)]
    context_id: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
}

impl ContextArgs {
    fn key(&self) -> ContextKey {
        ContextKey::new(self.context_type, self.context_id.as_deref(), self.user_id.as_deref())
    }
}

#[derive(Debug, Args)]
struct CheckInArgs {
    #[command(flatten)]
    context: ContextArgs,
    #[arg(long)]
    accuracy: f64,
    #[arg(long)]
    altitude: Option<f64>,
    #[arg(long)]
    heading: Option<f64>,
    #[arg(long)]
    speed: Option<f64>,
    /// RFC3339 timestamp of the fix; defaults to now.
    #[arg(long, value_parser = parse_rfc3339)]
    observed_at: Option<OffsetDateTime>,
    /// Ceiling in meters; only tightens a configured ceiling.
    #[arg(long)]
    ceiling: Option<f64>,
}

#[derive(Debug, Subcommand)]
enum StatCommand {
    Show(ContextArgs),
    List,
}

fn parse_context_type(raw: &str) -> Result<ContextType, String> {
    ContextType::parse(raw)
        .ok_or_else(|| format!("unsupported context type `{raw}` (company|office|mission|user)"))
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
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
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let settings = AccuracySettings::load(cli.config.as_deref())
        .context("failed to load accuracy settings")?;
    debug!(db = %cli.db.display(), "opening accuracy database");
    let api = AccuracyApi::open_sqlite(&cli.db, &settings, settings.ceilings.clone())?;

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::CheckIn(args) => run_check_in(args, &api),
        Command::Stat { command } => run_stat(&command, &api),
    }
}

fn run_db(command: DbCommand, api: &SqliteApi) -> Result<()> {
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
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
    }
}

fn run_check_in(args: CheckInArgs, api: &SqliteApi) -> Result<()> {
    api.migrate(false)?;
    let request = CheckInRequest {
        context: args.context.key(),
        sample: SampleInput {
            accuracy: args.accuracy,
            altitude: args.altitude,
            heading: args.heading,
            speed: args.speed,
            observed_at: args.observed_at,
        },
        ceiling: args.ceiling,
    };
    let outcome = api.check_in(request)?;
    emit_json(serde_json::to_value(&outcome).context("failed to serialize check-in outcome")?)
}

fn run_stat(command: &StatCommand, api: &SqliteApi) -> Result<()> {
    api.migrate(false)?;
    match command {
        StatCommand::Show(context) => {
            let key = context.key();
            let stat = api.stat_show(&key)?;
            emit_json(serde_json::json!({
                "context": key,
                "found": stat.is_some(),
                "stat": stat
            }))
        }
        StatCommand::List => {
            let stats = api.list_stats()?;
            emit_json(serde_json::json!({
                "count": stats.len(),
                "stats": stats
            }))
        }
    }
}
