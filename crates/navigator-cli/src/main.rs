use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use navigator_api::{load_taxonomy, DashboardApi, IngestConfig, UploadRequest};
use navigator_core::{BatchId, DashboardView, Taxonomy};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "fnav")]
#[command(about = "Family Navigator dashboard CLI")]
struct Cli {
    #[arg(long, default_value = "./famnav.sqlite3")]
    db: PathBuf,

    /// Taxonomy JSON document; the embedded survey is used when omitted.
    #[arg(long)]
    taxonomy: Option<PathBuf>,

    #[arg(long, default_value_t = 0.2)]
    max_invalid_ratio: f64,

    #[arg(long, default_value_t = 30)]
    upload_timeout_secs: u64,

    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    max_upload_bytes: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Upload(UploadArgs),
    View(ViewArgs),
    Batches(OrganizationArgs),
    Reaggregate(OrganizationArgs),
    Taxonomy {
        #[command(subcommand)]
        command: TaxonomyCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct OrganizationArgs {
    #[arg(long)]
    org: String,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[arg(long)]
    org: String,
    #[arg(long)]
    csv: PathBuf,
    #[arg(long)]
    delimiter: Option<char>,
}

#[derive(Debug, Args)]
struct ViewArgs {
    #[arg(long)]
    org: String,
    #[arg(long, value_enum)]
    view: ViewArg,
    #[arg(long)]
    batch: Option<String>,
}

#[derive(Debug, Subcommand)]
enum TaxonomyCommand {
    /// Print the active taxonomy with its fingerprint.
    Show(TaxonomyFileArgs),
    /// Validate a taxonomy document without touching the database.
    Check(TaxonomyFileArgs),
}

#[derive(Debug, Args)]
struct TaxonomyFileArgs {
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ViewArg {
    Heatmap,
    Subsections,
    Questions,
    CompetencyChart,
    Constituencies,
    Definitions,
}

impl ViewArg {
    fn into_view(self) -> DashboardView {
        match self {
            Self::Heatmap => DashboardView::Heatmap,
            Self::Subsections => DashboardView::Subsections,
            Self::Questions => DashboardView::Questions,
            Self::CompetencyChart => DashboardView::CompetencyChart,
            Self::Constituencies => DashboardView::Constituencies,
            Self::Definitions => DashboardView::Definitions,
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

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Db { command } => run_db(command, &build_api(&cli)?),
        Command::Upload(args) => run_upload(args, &build_api(&cli)?),
        Command::View(args) => run_view(args, &build_api(&cli)?),
        Command::Batches(args) => run_batches(args, &build_api(&cli)?),
        Command::Reaggregate(args) => run_reaggregate(args, &build_api(&cli)?),
        Command::Taxonomy { command } => run_taxonomy(command, cli.taxonomy.as_deref()),
    }
}

fn build_api(cli: &Cli) -> Result<DashboardApi> {
    let taxonomy = load_taxonomy(cli.taxonomy.as_deref())?;
    let config = IngestConfig {
        max_invalid_ratio: cli.max_invalid_ratio,
        upload_timeout: Duration::from_secs(cli.upload_timeout_secs),
        max_upload_bytes: cli.max_upload_bytes,
        ..IngestConfig::default()
    };
    Ok(DashboardApi::new(cli.db.clone(), Arc::new(taxonomy), config))
}

fn run_db(command: &DbCommand, api: &DashboardApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
    }
}

fn run_upload(args: &UploadArgs, api: &DashboardApi) -> Result<()> {
    let bytes = fs::read(&args.csv)
        .with_context(|| format!("failed to read csv file {}", args.csv.display()))?;
    let delimiter = args
        .delimiter
        .map(|delimiter| {
            u8::try_from(delimiter).map_err(|_| anyhow!("delimiter must be a single-byte character"))
        })
        .transpose()?;
    let filename = args
        .csv
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let outcome = api.upload_csv(UploadRequest {
        organization_id: args.org.clone(),
        filename,
        bytes,
        delimiter,
    })?;
    emit_json(serde_json::to_value(outcome)?)
}

fn run_view(args: &ViewArgs, api: &DashboardApi) -> Result<()> {
    let batch = args
        .batch
        .as_deref()
        .map(|raw| BatchId::parse(raw).ok_or_else(|| anyhow!("invalid batch id: {raw}")))
        .transpose()?;
    let view = args.view.into_view();
    let payload = api.view(&args.org, view, batch)?;
    emit_json(serde_json::json!({
        "organization": args.org,
        "view": view.as_str(),
        "data": payload
    }))
}

fn run_batches(args: &OrganizationArgs, api: &DashboardApi) -> Result<()> {
    let batches = api.list_batches(&args.org)?;
    emit_json(serde_json::json!({
        "organization": args.org,
        "batches": batches
    }))
}

fn run_reaggregate(args: &OrganizationArgs, api: &DashboardApi) -> Result<()> {
    let outcome = api.reaggregate(&args.org)?;
    emit_json(serde_json::to_value(outcome)?)
}

fn run_taxonomy(command: &TaxonomyCommand, global: Option<&Path>) -> Result<()> {
    match command {
        TaxonomyCommand::Show(args) => {
            let taxonomy = load_taxonomy(args.file.as_deref().or(global))?;
            emit_json(serde_json::json!({
                "fingerprint": taxonomy.fingerprint(),
                "taxonomy": taxonomy
            }))
        }
        TaxonomyCommand::Check(args) => {
            let taxonomy = load_taxonomy(args.file.as_deref().or(global))?;
            emit_json(taxonomy_summary(&taxonomy))
        }
    }
}

fn taxonomy_summary(taxonomy: &Taxonomy) -> Value {
    serde_json::json!({
        "valid": true,
        "version": taxonomy.version,
        "fingerprint": taxonomy.fingerprint(),
        "constituencies": taxonomy.constituencies.len(),
        "focus_areas": taxonomy.focus_areas.len(),
        "competencies": taxonomy.competency_count(),
        "questions": taxonomy.questions.len(),
        "required_questions": taxonomy.questions.iter().filter(|question| !question.optional).count()
    })
}
