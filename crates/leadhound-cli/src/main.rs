mod output;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use leadhound_client::{
    HttpSessionFactory, JsonFileStore, ListingCollector, RelaySourcesConfig, SeedListCollector,
    WebsiteLeadExtractor,
};
use leadhound_core::error::AppError;
use leadhound_core::job::SearchParams;
use leadhound_core::traits::{Collector, PageSession, SessionFactory};
use leadhound_core::{
    CrawlInvestigator, FieldSet, InvestigatorConfig, JobConfig, JobHandle, JobManager,
    JobOrchestrator, JobReport, JobStatus, LeadField, OrchestratorConfig, SessionCookie, WorkUnit,
};

#[derive(Parser)]
#[command(name = "leadhound", version, about = "Relay-aware lead collection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a collection job until the target is reached or the sources dry up
    Run(RunArgs),

    /// Crawl one website for contact details and print what was found
    Investigate {
        /// Website to investigate
        url: String,

        /// Fields to look for (defaults to all)
        #[arg(short, long, value_delimiter = ',', value_parser = parse_field)]
        fields: Vec<LeadField>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Fetch and rank relay candidates from the configured sources
    Relays {
        /// Number of candidates to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Also probe candidates until one is reachable
        #[arg(long, default_value_t = false)]
        check: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Search query passed to the collector
    #[arg(short, long)]
    query: String,

    /// Location qualifier for the search
    #[arg(short, long)]
    location: Option<String>,

    /// File with one seed URL per line
    #[arg(long, conflicts_with = "listing", required_unless_present = "listing")]
    seeds: Option<PathBuf>,

    /// Listing URL template using {query}, {location} and {page}
    #[arg(long, env = "LEADHOUND_LISTING_URL")]
    listing: Option<String>,

    /// Number of leads wanted
    #[arg(short, long, default_value_t = 20)]
    target: usize,

    /// Skip leads missing any of these fields
    #[arg(short, long, value_delimiter = ',', value_parser = parse_field)]
    require: Vec<LeadField>,

    /// Route traffic through relays from LEADHOUND_* sources
    #[arg(long, default_value_t = false)]
    relays: bool,

    /// Fail instead of running direct when no relay is reachable
    #[arg(long, default_value_t = false)]
    no_direct: bool,

    /// JSON file with cookies to supply when a login wall is hit
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// Directory for saved job records
    #[arg(short, long, env = "LEADHOUND_OUTPUT_DIR", default_value = "results")]
    output_dir: PathBuf,

    /// Also write the leads as CSV
    #[arg(long)]
    csv: Option<PathBuf>,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Engine {
    /// Plain HTTP, no JavaScript
    Http,
    /// Headless Chromium
    Browser,
}

#[derive(Args)]
struct EngineArgs {
    /// Page engine
    #[arg(long, value_enum, env = "LEADHOUND_ENGINE", default_value_t = Engine::Http)]
    engine: Engine,

    /// Chrome/Chromium executable (browser engine)
    #[arg(long, env = "CHROME_PATH")]
    chrome: Option<PathBuf>,

    /// Show the browser window (browser engine)
    #[arg(long, default_value_t = false)]
    headful: bool,
}

fn parse_field(raw: &str) -> Result<LeadField, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("leadhound=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => match args.engine.engine {
            Engine::Http => cmd_run(HttpSessionFactory::new(), &args).await,
            Engine::Browser => {
                #[cfg(feature = "browser")]
                {
                    cmd_run(browser_factory(&args.engine), &args).await
                }
                #[cfg(not(feature = "browser"))]
                {
                    bail!("This build has no browser support; use --engine http")
                }
            }
        },
        Commands::Investigate {
            url,
            fields,
            engine,
        } => {
            let fields: FieldSet = if fields.is_empty() {
                LeadField::ALL.into_iter().collect()
            } else {
                fields.into_iter().collect()
            };
            match engine.engine {
                Engine::Http => cmd_investigate(&HttpSessionFactory::new(), &url, &fields).await,
                Engine::Browser => {
                    #[cfg(feature = "browser")]
                    {
                        cmd_investigate(&browser_factory(&engine), &url, &fields).await
                    }
                    #[cfg(not(feature = "browser"))]
                    {
                        bail!("This build has no browser support; use --engine http")
                    }
                }
            }
        }
        Commands::Relays { limit, check } => cmd_relays(limit, check).await,
    }
}

#[cfg(feature = "browser")]
fn browser_factory(args: &EngineArgs) -> leadhound_client::BrowserSessionFactory {
    let mut factory = leadhound_client::BrowserSessionFactory::new();
    if let Some(path) = &args.chrome {
        factory = factory.with_executable(path.clone());
    }
    if args.headful {
        factory = factory.headful();
    }
    factory
}

/// Where the producer lane gets its work units.
#[derive(Clone)]
enum Source {
    Seeds(SeedListCollector),
    Listing(ListingCollector),
}

impl Collector for Source {
    async fn collect<S: PageSession>(
        &self,
        session: &S,
        params: &SearchParams,
        pass: u32,
        wanted: usize,
    ) -> Result<Vec<WorkUnit>, AppError> {
        match self {
            Source::Seeds(c) => c.collect(session, params, pass, wanted).await,
            Source::Listing(c) => c.collect(session, params, pass, wanted).await,
        }
    }
}

fn load_source(args: &RunArgs) -> Result<Source> {
    if let Some(path) = &args.seeds {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file: {}", path.display()))?;
        let seeds = SeedListCollector::new(text.lines());
        if seeds.is_empty() {
            bail!("Seed file {} has no URLs", path.display());
        }
        tracing::info!(seeds = seeds.len(), "Loaded seed list");
        return Ok(Source::Seeds(seeds));
    }
    match &args.listing {
        Some(template) => Ok(Source::Listing(ListingCollector::new(template.clone()))),
        None => bail!("Either --seeds or --listing is required"),
    }
}

fn load_cookies(path: &Path) -> Result<Vec<SessionCookie>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cookie file: {}", path.display()))?;
    serde_json::from_str(&text).context("Invalid JSON in cookie file")
}

async fn cmd_run<F>(factory: F, args: &RunArgs) -> Result<()>
where
    F: SessionFactory + 'static,
{
    let source = load_source(args)?;

    let mut params = SearchParams::new(args.query.clone());
    if let Some(location) = &args.location {
        params = params.with_location(location.clone());
    }
    let job = JobConfig::new(params, args.target)
        .with_required_fields(args.require.iter().map(|f| f.as_str()))
        .with_relays(args.relays)
        .with_allow_direct(!args.no_direct);

    // The extractor only has to look for what the job requires, but a lead
    // is more useful with everything it can find.
    let extractor = WebsiteLeadExtractor::all_fields(CrawlInvestigator::default());
    let store = JsonFileStore::new(&args.output_dir);

    let orchestrator = JobOrchestrator::new(
        job,
        OrchestratorConfig::default(),
        factory,
        source,
        extractor,
        store,
    );

    let manager = JobManager::new(1);
    let handle = if args.relays {
        let config = RelaySourcesConfig::from_env()?;
        if config.is_empty() {
            bail!(
                "--relays needs at least one of LEADHOUND_RELAY_LIST_URLS, \
                 LEADHOUND_GEONODE_URL or LEADHOUND_FALLBACK_RELAYS"
            );
        }
        let sources = config.build()?;
        manager.submit(orchestrator.with_relay_pool(sources.pool()))
    } else {
        manager.submit(orchestrator)
    };

    let report = supervise(&manager, &handle, args.cookies.as_deref()).await?;

    tracing::info!(
        job_id = %report.job_id,
        status = %report.status,
        leads = report.results.len(),
        errors = report.progress.error_count,
        skipped = report.progress.skipped_count,
        "Job finished"
    );
    if let Some(location) = &report.location {
        tracing::info!("Job record saved to {location}");
    }

    if let Some(path) = &args.csv {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        output::write_csv(file, &report.results)?;
        tracing::info!("Wrote {} leads to {}", report.results.len(), path.display());
    }

    println!("{}", serde_json::to_string_pretty(&report.results)?);

    if report.status == JobStatus::Failed {
        bail!(
            "Job failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Wait for the job, cancelling it on Ctrl-C and answering login walls with
/// the cookie file when one was given.
async fn supervise(
    manager: &JobManager,
    handle: &JobHandle,
    cookies: Option<&Path>,
) -> Result<JobReport> {
    let wait = manager.wait(handle.id());
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut interrupted = false;
    let mut auth_answered = false;

    loop {
        tokio::select! {
            report = &mut wait => return Ok(report?),
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Interrupt received, cancelling job");
                handle.cancel();
                interrupted = true;
            }
            _ = ticker.tick() => {
                if handle.status() != JobStatus::PausedForAuth {
                    auth_answered = false;
                    continue;
                }
                if auth_answered {
                    continue;
                }
                auth_answered = true;
                let url = handle.auth_challenge().map(|c| c.url).unwrap_or_default();
                match cookies {
                    Some(path) => {
                        let jar = load_cookies(path)?;
                        tracing::info!(%url, cookies = jar.len(), "Login wall hit, supplying cookies");
                        if let Err(e) = handle.supply_credentials(jar) {
                            tracing::warn!(error = %e, "Could not supply cookies");
                        }
                    }
                    None => {
                        tracing::warn!(%url, "Login wall hit and no --cookies file given; waiting for the auth timeout");
                    }
                }
            }
        }
    }
}

async fn cmd_investigate<F: SessionFactory>(factory: &F, url: &str, fields: &FieldSet) -> Result<()> {
    let investigator = CrawlInvestigator::new(InvestigatorConfig::default());
    let session = factory.open(None).await?;

    tracing::info!("Investigating {}", url);
    let result = investigator.investigate(&session, url, fields).await;
    session.close().await;
    let result = result?;

    let missing = result.missing(fields);
    if !missing.is_empty() {
        let names: Vec<_> = missing.iter().map(|f| f.as_str()).collect();
        tracing::info!("Not found: {}", names.join(", "));
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_relays(limit: usize, check: bool) -> Result<()> {
    let config = RelaySourcesConfig::from_env()?;
    if config.is_empty() {
        println!("No relay sources configured. Set LEADHOUND_RELAY_LIST_URLS, LEADHOUND_GEONODE_URL or LEADHOUND_FALLBACK_RELAYS.");
        return Ok(());
    }
    let pool = config.build()?.pool();
    let total = pool.refresh().await;

    println!("{total} candidates (showing top {})\n", limit.min(total));
    for candidate in pool.snapshot().candidates.iter().take(limit) {
        println!(
            "  {:>6.1}  {:<8} {:<24} uptime {:>5.1}%  latency {:>5} ms  ({})",
            candidate.score,
            candidate.protocol.scheme(),
            candidate.address,
            candidate.uptime,
            candidate.latency_ms,
            candidate.source_id,
        );
    }

    if check {
        match pool.acquire(false).await {
            Ok(Some(relay)) => println!("\nFirst reachable relay: {relay}"),
            Ok(None) | Err(AppError::PoolExhausted) => println!("\nNo relay reachable"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
