use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use quotebook_api::{AddQuoteRequest, QuotebookApi};
use quotebook_core::MergeKey;
use quotebook_remote::{RemoteConfig, DEFAULT_FETCH_LIMIT, DEFAULT_REMOTE_URL, DEFAULT_TIMEOUT_SECS};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "qb")]
#[command(about = "Local-first quote manager")]
struct Cli {
    #[arg(long, env = "QUOTEBOOK_DB", default_value = "./quotebook.sqlite3")]
    db: PathBuf,

    #[command(flatten)]
    remote: RemoteArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct RemoteArgs {
    #[arg(long, env = "QUOTEBOOK_REMOTE_URL", default_value = DEFAULT_REMOTE_URL)]
    remote_url: String,
    #[arg(long, default_value_t = DEFAULT_FETCH_LIMIT)]
    remote_limit: usize,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    remote_timeout_secs: u64,
}

impl RemoteArgs {
    fn config(&self) -> RemoteConfig {
        RemoteConfig {
            base_url: self.remote_url.clone(),
            limit: self.remote_limit,
            timeout: Duration::from_secs(self.remote_timeout_secs),
            ..RemoteConfig::default()
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Quote {
        #[command(subcommand)]
        command: Box<QuoteCommand>,
    },
    Category {
        #[command(subcommand)]
        command: CategoryCommand,
    },
    /// Merge a JSON array file into the store.
    Import(ImportArgs),
    /// Write the full list as a pretty JSON array.
    Export(ExportArgs),
    /// Run one reconciliation against the remote source.
    Sync,
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

#[derive(Debug, Subcommand)]
enum QuoteCommand {
    Add(AddQuoteArgs),
    List(CategoryFilterArgs),
    Random(CategoryFilterArgs),
}

#[derive(Debug, Args)]
struct AddQuoteArgs {
    #[arg(long)]
    text: String,
    #[arg(long, default_value = "")]
    category: String,
    /// Do not send the new quote to the remote sink.
    #[arg(long, default_value_t = false)]
    offline: bool,
}

#[derive(Debug, Args)]
struct CategoryFilterArgs {
    /// Filter for this call only; defaults to the persisted selection.
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Subcommand)]
enum CategoryCommand {
    List,
    Select { value: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MergeKeyArg {
    Text,
    #[value(name = "text_and_category")]
    TextAndCategory,
}

impl From<MergeKeyArg> for MergeKey {
    fn from(value: MergeKeyArg) -> Self {
        match value {
            MergeKeyArg::Text => Self::Text,
            MergeKeyArg::TextAndCategory => Self::TextAndCategory,
        }
    }
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, value_enum, default_value_t = MergeKeyArg::TextAndCategory)]
    merge_key: MergeKeyArg,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long, default_value = "quotes.json")]
    out: PathBuf,
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
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = QuotebookApi::with_remote_config(cli.db, cli.remote.config());
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Quote { command } => run_quote(*command, &api),
        Command::Category { command } => run_category(command, &api),
        Command::Import(args) => run_import(&args, &api),
        Command::Export(args) => run_export(&args, &api),
        Command::Sync => run_sync(&api),
    }
}

fn run_db(command: DbCommand, api: &QuotebookApi) -> Result<()> {
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
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_quote(command: QuoteCommand, api: &QuotebookApi) -> Result<()> {
    match command {
        QuoteCommand::Add(args) => {
            let result = api.add_quote(AddQuoteRequest {
                text: args.text,
                category: args.category,
                push: !args.offline,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize added quote")?)
        }
        QuoteCommand::List(args) => {
            let listing = api.list_quotes(args.category.as_deref())?;
            emit_json(serde_json::to_value(&listing).context("failed to serialize quote listing")?)
        }
        QuoteCommand::Random(args) => {
            let picked = api.random_quote(args.category.as_deref())?;
            let message = if picked.is_none() { Some("No quotes in this category") } else { None };
            emit_json(serde_json::json!({
                "random": picked,
                "message": message
            }))
        }
    }
}

fn run_category(command: CategoryCommand, api: &QuotebookApi) -> Result<()> {
    match command {
        CategoryCommand::List => {
            let categories = api.categories()?;
            emit_json(serde_json::json!({ "categories": categories }))
        }
        CategoryCommand::Select { value } => {
            let result = api.select_category(&value)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize selection")?)
        }
    }
}

fn run_import(args: &ImportArgs, api: &QuotebookApi) -> Result<()> {
    let raw = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read import file {}", args.input.display()))?;
    let result = api.import_json(&raw, args.merge_key.into())?;
    emit_json(serde_json::json!({
        "in_file": args.input,
        "summary": result
    }))
}

fn run_export(args: &ExportArgs, api: &QuotebookApi) -> Result<()> {
    let export = api.export()?;
    fs::write(&args.out, export.body.as_bytes())
        .with_context(|| format!("failed to write export file {}", args.out.display()))?;
    emit_json(serde_json::json!({
        "out_file": args.out,
        "quote_count": export.quote_count,
        "sha256": export.sha256
    }))
}

fn run_sync(api: &QuotebookApi) -> Result<()> {
    let report = api.sync()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize sync report")?)
}
