use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use newsloom_client::{ReqwestFetcher, build_all};
use newsloom_core::models::{Article, Category, LoadPriority, ScrapeOptions, ScrapingResult};
use newsloom_core::progressive::{ProgressEvent, ProgressiveConfig, ProgressiveLoader};
use newsloom_core::proxy::{ProxiedFetcher, ProxyConfig};
use newsloom_core::relevance::{GateMode, KeywordPolicy};
use newsloom_core::{ManagerConfig, ScraperManager, SourcesFile};

#[derive(Parser)]
#[command(name = "newsloom", version, about = "Aggregate news from feeds, APIs and web pages")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Path to the JSON sources file
    #[arg(
        short,
        long,
        global = true,
        env = "NEWSLOOM_SOURCES",
        default_value = "sources.json"
    )]
    sources: PathBuf,

    /// Allow sources on private or loopback addresses
    #[arg(long, global = true, env = "NEWSLOOM_ALLOW_PRIVATE", default_value_t = false)]
    allow_private: bool,

    /// Passthrough proxy prefix; the target URL is appended percent-encoded
    #[arg(long, global = true, env = "NEWSLOOM_PROXY")]
    proxy: Option<String>,

    /// Keep off-topic items with this score penalty instead of dropping them
    #[arg(long, global = true, env = "NEWSLOOM_DOWNRANK")]
    downrank: Option<f64>,
}

#[derive(Args)]
struct Filters {
    /// Only query sources serving this category (repeatable)
    #[arg(short, long = "category")]
    categories: Vec<Category>,

    /// Maximum number of articles to return
    #[arg(short, long)]
    max_articles: Option<usize>,

    /// Per-source timeout in seconds
    #[arg(short, long)]
    timeout_secs: Option<u64>,
}

impl Filters {
    fn options(&self) -> ScrapeOptions {
        let mut options = ScrapeOptions::new();
        options.categories = self.categories.iter().copied().collect();
        options.max_articles = self.max_articles;
        options.timeout = self.timeout_secs.map(Duration::from_secs);
        options
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    Quick,
    Quality,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape every eligible source once and print the merged articles
    Scrape {
        #[command(flatten)]
        filters: Filters,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Favor speed: failing sources are not retried
        #[arg(long, default_value_t = false)]
        fast: bool,
    },

    /// Load sources progressively, printing each partial batch as it lands
    Stream {
        #[command(flatten)]
        filters: Filters,

        #[arg(short, long, value_enum, default_value_t = Preset::Quality)]
        preset: Preset,
    },

    /// Re-scrape on an interval until interrupted
    Watch {
        #[command(flatten)]
        filters: Filters,

        /// Seconds between runs
        #[arg(short, long, default_value_t = 300)]
        interval_secs: u64,
    },

    /// Probe every source and report its health
    Health,

    /// List the configured sources
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("newsloom=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Sources => cmd_sources(&cli.global.sources)?,
        Commands::Health => cmd_health(&build_manager(&cli.global)?).await?,
        Commands::Scrape {
            filters,
            format,
            fast,
        } => {
            let mut options = filters.options();
            if fast {
                options.priority = LoadPriority::Speed;
            }
            let manager = build_manager(&cli.global)?;
            cmd_scrape(&manager, &options, format).await?;
        }
        Commands::Stream { filters, preset } => {
            let manager = Arc::new(build_manager(&cli.global)?);
            cmd_stream(manager, &filters.options(), preset).await?;
        }
        Commands::Watch {
            filters,
            interval_secs,
        } => {
            let manager = Arc::new(build_manager(&cli.global)?);
            cmd_watch(&manager, filters.options(), interval_secs).await?;
        }
    }

    Ok(())
}

fn load_sources(path: &Path) -> Result<SourcesFile> {
    SourcesFile::load(path)
        .with_context(|| format!("Failed to load sources from {}", path.display()))
}

/// Build the fetcher stack, every adapter and the manager.
fn build_manager(cli: &GlobalArgs) -> Result<ScraperManager> {
    let sources = load_sources(&cli.sources)?;

    let mut http = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    if cli.allow_private {
        tracing::warn!("SSRF protection disabled for private addresses");
        http = http.allow_private_urls();
    }
    let fetcher = ProxiedFetcher::new(http, cli.proxy.clone().map(ProxyConfig::new));

    let gate = match cli.downrank {
        Some(penalty) if !(0.0..=1.0).contains(&penalty) => {
            bail!("--downrank must be within 0.0 and 1.0, got {penalty}")
        }
        Some(penalty) => GateMode::Downrank(penalty),
        None => GateMode::Exclude,
    };

    let configured = sources.sources.len();
    let adapters = build_all(sources.sources, fetcher, Arc::new(KeywordPolicy::new(gate)));
    let manager = ScraperManager::new(ManagerConfig::default());
    for adapter in adapters {
        manager
            .register(adapter)
            .context("Failed to register adapter")?;
    }
    tracing::info!(
        configured,
        registered = manager.adapters().len(),
        "Sources loaded"
    );
    Ok(manager)
}

async fn cmd_scrape(
    manager: &ScraperManager,
    options: &ScrapeOptions,
    format: OutputFormat,
) -> Result<()> {
    let result = manager.scrape_all(options).await;
    log_summary(&result);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Csv => write_csv(&result.articles)?,
    }
    Ok(())
}

fn write_csv(articles: &[Article]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record([
        "id",
        "title",
        "url",
        "source",
        "category",
        "published_at",
        "relevance",
        "tags",
    ])?;
    for article in articles {
        let published = article
            .published_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let relevance = format!("{:.3}", article.relevance);
        let tags: Vec<&str> = article.tags.iter().map(String::as_str).collect();
        let tags = tags.join(";");
        writer.write_record([
            article.id.as_str(),
            article.title.as_str(),
            article.url.as_str(),
            article.source.id.as_str(),
            article.category.as_str(),
            published.as_str(),
            relevance.as_str(),
            tags.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

async fn cmd_stream(
    manager: Arc<ScraperManager>,
    options: &ScrapeOptions,
    preset: Preset,
) -> Result<()> {
    let config = match preset {
        Preset::Quick => ProgressiveConfig::quick(),
        Preset::Quality => ProgressiveConfig::quality(),
    };
    let loader = Arc::new(ProgressiveLoader::new(manager, config));

    let canceller = Arc::clone(&loader);
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling load");
            canceller.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::Partial(update) = event {
                println!(
                    "[{}/{}] {} settled, {} articles so far, {} errors",
                    update.completed,
                    update.total,
                    update.source_id,
                    update.articles.len(),
                    update.errors
                );
            }
        }
    });

    let outcome = loader.load(options, &tx).await;
    drop(tx);
    interrupt.abort();
    printer.await.context("Progress printer failed")?;

    match outcome {
        Ok(result) => {
            log_summary(&result);
            println!("{}", serde_json::to_string_pretty(&result.articles)?);
        }
        Err(e) => {
            let partial = loader.partial();
            tracing::warn!(
                error = %e,
                articles = partial.articles.len(),
                "Load did not finish, printing partial results"
            );
            println!("{}", serde_json::to_string_pretty(&partial.articles)?);
        }
    }
    Ok(())
}

async fn cmd_watch(
    manager: &Arc<ScraperManager>,
    options: ScrapeOptions,
    interval_secs: u64,
) -> Result<()> {
    if interval_secs == 0 {
        bail!("--interval-secs must be positive");
    }
    let cancel = CancellationToken::new();
    let handle = manager.spawn_refresh(
        options,
        Duration::from_secs(interval_secs),
        cancel.clone(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    cancel.cancel();
    handle.await.context("Refresh task failed")?;

    println!("{}", serde_json::to_string_pretty(&manager.get_stats())?);
    Ok(())
}

async fn cmd_health(manager: &ScraperManager) -> Result<()> {
    let results = manager.health_check_all().await;
    if results.is_empty() {
        println!("No sources registered");
        return Ok(());
    }

    for result in &results {
        let status = &result.status;
        println!(
            "  [{:<11}] {:<24} {:>6}ms {}",
            status.state.to_string(),
            result.adapter_id,
            status.response_time.as_millis(),
            status.errors.join("; ")
        );
    }
    let healthy = results.iter().filter(|r| r.status.healthy).count();
    println!("\n{healthy}/{} sources healthy", results.len());
    Ok(())
}

fn cmd_sources(path: &Path) -> Result<()> {
    let sources = load_sources(path)?;
    let mut configs = sources.sources;
    configs.sort_by_key(|c| c.priority);

    for config in &configs {
        let categories: Vec<&str> = config.categories.iter().map(Category::as_str).collect();
        println!(
            "  {:>3} {:<20} {:<5} {:<8} {} {}",
            config.priority,
            config.id,
            config.kind.as_str(),
            if config.enabled { "enabled" } else { "disabled" },
            config.urls().join(", "),
            if categories.is_empty() {
                String::new()
            } else {
                format!("[{}]", categories.join(","))
            }
        );
    }
    println!("\nTotal: {} sources", configs.len());
    Ok(())
}

fn log_summary(result: &ScrapingResult) {
    tracing::info!(
        sources = result.processed_count,
        succeeded = result.success_count,
        failed = result.error_count,
        articles = result.articles.len(),
        duration_ms = result.duration.as_millis() as u64,
        "Scrape complete"
    );
    for error in &result.errors {
        tracing::warn!(
            source = %error.source_id,
            kind = %error.kind,
            retryable = error.retryable,
            "{}",
            error.message
        );
    }
}
