//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use futures::StreamExt;
use horizon_core::{PipelineEvent, PipelineService, PipelineStage, curation};
use horizon_llm::OpenRouterClient;
use horizon_retrieval::SourceRegistry;
use horizon_shared::{
    AppConfig, DateRange, ExecutionConfig, StreamConfig, WipArticle, expand_home, init_config,
    load_config, validate_api_key,
};
use horizon_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Knowledge Horizon: scheduled literature surveillance reports.
#[derive(Parser)]
#[command(
    name = "horizon",
    version,
    about = "Run research streams into curated, AI-enriched literature reports.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Acting user id.
    #[arg(long, env = "HORIZON_USER", default_value = "local", global = true)]
    pub user: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Research stream management.
    Stream {
        #[command(subcommand)]
        action: StreamAction,
    },

    /// Create an execution for a stream and run the pipeline.
    Run {
        /// Stream ID.
        stream: String,

        /// Last day of the retrieval window (defaults to today).
        #[arg(long)]
        end: Option<NaiveDate>,

        /// Length of the retrieval window in days.
        #[arg(long, default_value = "7")]
        days: u32,

        /// Report name (defaults to the date range).
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List executions, newest first.
    Executions {
        /// Only show executions of this stream.
        #[arg(long)]
        stream: Option<String>,
    },

    /// Report inspection.
    Report {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// Curator overrides on staged articles.
    Curate {
        #[command(subcommand)]
        action: CurateAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Stream subcommands.
#[derive(Subcommand)]
pub(crate) enum StreamAction {
    /// Register a stream from a TOML config file.
    Add {
        /// Stream name.
        name: String,

        /// Path to the stream's TOML config.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Replace a stream's config. Past executions keep their snapshot.
    Edit {
        /// Stream ID.
        stream: String,

        /// Path to the new TOML config.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// List registered streams.
    List,
}

/// Report subcommands.
#[derive(Subcommand)]
pub(crate) enum ReportAction {
    /// Print the report produced by an execution.
    Show {
        /// Execution ID.
        execution: String,

        /// Also list hidden articles.
        #[arg(long)]
        all: bool,
    },
}

/// Curation subcommands.
#[derive(Subcommand)]
pub(crate) enum CurateAction {
    /// Force a staged article into the report.
    Include {
        /// Staged article ID.
        wip_article: String,

        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove a staged article from the report.
    Exclude {
        /// Staged article ID.
        wip_article: String,

        #[arg(long)]
        notes: Option<String>,
    },
    /// Undo an override and restore the pipeline verdict.
    Reset {
        /// Staged article ID.
        wip_article: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "horizon=info",
        1 => "horizon=debug",
        _ => "horizon=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let user = cli.user;
    match cli.command {
        Command::Stream { action } => match action {
            StreamAction::Add { name, config } => cmd_stream_add(&name, &config, &user).await,
            StreamAction::Edit { stream, config } => cmd_stream_edit(&stream, &config).await,
            StreamAction::List => cmd_stream_list().await,
        },
        Command::Run {
            stream,
            end,
            days,
            name,
        } => cmd_run(&stream, end, days, name, &user).await,
        Command::Executions { stream } => cmd_executions(stream.as_deref()).await,
        Command::Report { action } => match action {
            ReportAction::Show { execution, all } => cmd_report_show(&execution, all).await,
        },
        Command::Curate { action } => {
            let storage = open_storage(&load_config()?).await?;
            let updated = match action {
                CurateAction::Include { wip_article, notes } => {
                    curation::include_article(&storage, &wip_article, &user, notes.as_deref())
                        .await?
                }
                CurateAction::Exclude { wip_article, notes } => {
                    curation::exclude_article(&storage, &wip_article, &user, notes.as_deref())
                        .await?
                }
                CurateAction::Reset { wip_article } => {
                    curation::reset_curation(&storage, &wip_article, &user).await?
                }
            };
            print_curation(&updated);
            Ok(())
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = expand_home(&config.defaults.database_path)?;
    Ok(Storage::open(&path).await?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

/// Read a stream config file and reject configs that could never run.
fn read_stream_config(config_path: &Path) -> Result<StreamConfig> {
    let content = std::fs::read_to_string(config_path)
        .map_err(|e| eyre!("cannot read '{}': {e}", config_path.display()))?;
    let stream_config: StreamConfig = toml::from_str(&content)
        .map_err(|e| eyre!("invalid stream config '{}': {e}", config_path.display()))?;

    let today = Utc::now().date_naive();
    ExecutionConfig::snapshot(&stream_config, DateRange::last_days(today, 7), None).validate()?;
    Ok(stream_config)
}

async fn cmd_stream_add(name: &str, config_path: &Path, user: &str) -> Result<()> {
    let stream_config = read_stream_config(config_path)?;

    let storage = open_storage(&load_config()?).await?;
    let stream = storage.insert_stream(name, user, &stream_config).await?;

    println!("  Stream created: {}", stream.id);
    println!("  Queries:        {}", stream_config.retrieval.queries.len());
    println!("  Categories:     {}", stream_config.presentation.categories.len());
    Ok(())
}

async fn cmd_stream_edit(stream_id: &str, config_path: &Path) -> Result<()> {
    let stream_config = read_stream_config(config_path)?;

    let storage = open_storage(&load_config()?).await?;
    storage.update_stream_config(stream_id, &stream_config).await?;

    println!("  Stream updated: {stream_id}");
    println!("  Queries:        {}", stream_config.retrieval.queries.len());
    Ok(())
}

async fn cmd_stream_list() -> Result<()> {
    let storage = open_storage(&load_config()?).await?;
    let streams = storage.list_streams().await?;
    if streams.is_empty() {
        println!("No streams registered. Add one with `horizon stream add`.");
        return Ok(());
    }
    for stream in streams {
        println!(
            "{}  {:<32}  {} queries",
            stream.id,
            stream.name,
            stream.config.retrieval.queries.len()
        );
    }
    Ok(())
}

async fn cmd_run(
    stream_id: &str,
    end: Option<NaiveDate>,
    days: u32,
    report_name: Option<String>,
    user: &str,
) -> Result<()> {
    let config = load_config()?;
    let api_key = validate_api_key(&config)?;
    let storage = Arc::new(open_storage(&config).await?);

    let stream = storage
        .get_stream(stream_id)
        .await?
        .ok_or_else(|| eyre!("stream '{stream_id}' not found"))?;
    let range = DateRange::last_days(end.unwrap_or_else(|| Utc::now().date_naive()), days);
    let snapshot = ExecutionConfig::snapshot(&stream.config, range, report_name);
    let execution = storage.create_execution(&stream.id, user, &snapshot).await?;

    info!(
        execution_id = %execution.id,
        stream = %stream.name,
        start = %snapshot.date_range.start,
        end = %snapshot.date_range.end,
        "running execution"
    );

    let service = PipelineService::new(
        storage.clone(),
        Arc::new(SourceRegistry::with_defaults(&config)?),
        Arc::new(OpenRouterClient::from_config(&config.openrouter, api_key)?),
        config.pipeline.clone(),
        config.openrouter.default_model.clone(),
    );

    let progress = CliProgress::new();
    let mut completion = None;
    let events = service.run_pipeline(&execution.id);
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if event.stage == PipelineStage::Complete {
                    completion = Some(event.data.clone());
                }
                progress.event(&event);
            }
            Err(e) => {
                progress.spinner.abandon_with_message(format!("Execution failed: {e}"));
                storage.fail_execution(&execution.id, &e.to_string()).await?;
                return Err(e.into());
            }
        }
    }
    progress.spinner.finish_and_clear();

    let data = completion.unwrap_or_default();
    let metrics = &data["metrics"];
    println!();
    println!("  Execution complete!");
    println!("  Execution: {}", execution.id);
    println!("  Report:    {}", data["report_id"].as_str().unwrap_or("-"));
    println!("  Articles:  {}", metrics["associations"]);
    println!("  Filter:    {}", metrics["filter"]);
    println!(
        "  Time:      {:.1}s",
        metrics["duration_ms"].as_u64().unwrap_or(0) as f64 / 1000.0
    );
    println!();
    Ok(())
}

async fn cmd_executions(stream_id: Option<&str>) -> Result<()> {
    let storage = open_storage(&load_config()?).await?;
    for execution in storage.list_executions(stream_id).await? {
        println!(
            "{}  {:<9}  {} to {}  report={}{}",
            execution.id,
            execution.status.as_str(),
            execution.config.date_range.start,
            execution.config.date_range.end,
            execution.report_id.as_deref().unwrap_or("-"),
            execution
                .error
                .as_deref()
                .map(|e| format!("  error={e}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

async fn cmd_report_show(execution_id: &str, include_hidden: bool) -> Result<()> {
    let storage = open_storage(&load_config()?).await?;
    let report = storage
        .get_report_for_execution(execution_id)
        .await?
        .ok_or_else(|| eyre!("execution '{execution_id}' has no report"))?;
    let articles = storage.get_report_articles(&report.id, include_hidden).await?;

    println!("# {}", report.report_name);
    println!();
    if let Some(summary) = &report.executive_summary {
        println!("{summary}");
        println!();
    }
    for (category, summary) in &report.category_summaries {
        println!("## {category}");
        println!("{summary}");
        println!();
    }
    println!("## Articles ({})", articles.len());
    for entry in &articles {
        let association = &entry.association;
        let score = association
            .relevance_score
            .map(|s| format!("{s:.2}"))
            .unwrap_or_else(|| "-".into());
        let hidden = if association.is_hidden { " [hidden]" } else { "" };
        println!(
            "{:>3}. {} ({score}){hidden}",
            association.ranking, entry.article.title
        );
        if !association.presentation_categories.is_empty() {
            println!("     categories: {}", association.presentation_categories.join(", "));
        }
        if let Some(summary) = &association.ai_summary {
            println!("     {summary}");
        }
    }
    Ok(())
}

fn print_curation(wip: &WipArticle) {
    println!("  {}", wip.title);
    println!("  Included:  {}", wip.included_in_report);
    println!(
        "  Override:  {}",
        if wip.curator_included {
            "included"
        } else if wip.curator_excluded {
            "excluded"
        } else {
            "none"
        }
    );
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Renders pipeline events on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn event(&self, event: &PipelineEvent) {
        if event.is_heartbeat() {
            return;
        }
        if event.data.get("completed").is_none() && event.stage != PipelineStage::Init {
            self.spinner.println(format!("  [{}] {}", event.stage, event.message));
        }
        self.spinner
            .set_message(format!("[{}] {}", event.stage, event.message));
    }
}
