use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wdmetrics_core::client::{ActionApi, MediaWikiClient, MediaWikiClientConfig};
use wdmetrics_core::config::{DEFAULT_CONFIG_FILENAME, MetricsConfig, load_config};
use wdmetrics_core::model::{Credentials, TimeWindow};
use wdmetrics_core::pageviews::PageviewsClient;
use wdmetrics_core::retry::{RetryPolicy, RetryingClient};
use wdmetrics_core::session::MetricsSession;
use wdmetrics_core::sparql::{ChunkedQuery, SparqlEndpoint};
use wdmetrics_core::table::MetricsTable;

const BOT_USER_ENV: &str = "WDMETRICS_BOT_USER";
const BOT_PASS_ENV: &str = "WDMETRICS_BOT_PASS";

#[derive(Debug, Parser)]
#[command(
    name = "wdmetrics",
    version,
    about = "Contribution and demand metrics for Wikidata items"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Log at debug level unless RUST_LOG is set")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run a SPARQL query in OFFSET/LIMIT chunks and merge the results")]
    Sparql(SparqlArgs),
    #[command(about = "Append contribution and demand metrics to a table of item ids")]
    Metrics(MetricsArgs),
}

#[derive(Debug, Args)]
struct SparqlArgs {
    #[arg(long, value_name = "PATH", help = "File holding the query template")]
    query_file: PathBuf,
    #[arg(long, help = "Text in the query replaced by OFFSET/LIMIT for each chunk")]
    placeholder: String,
    #[arg(long, help = "Base name for the written files")]
    description: String,
    #[arg(long, value_name = "N", help = "Rows per chunk (default from config)")]
    chunk_size: Option<usize>,
    #[arg(long, value_name = "DIR", default_value = ".")]
    out_dir: PathBuf,
}

#[derive(Debug, Args)]
struct MetricsArgs {
    #[arg(long, value_name = "CSV", help = "CSV file listing item ids")]
    input: PathBuf,
    #[arg(long, value_name = "NAME", help = "Id column in the input (default: first column)")]
    id_column: Option<String>,
    #[arg(long, value_name = "CSV")]
    output: PathBuf,
    #[arg(long, value_name = "TIMESTAMP", help = "Window start, e.g. 2020-01-01T00:00:00Z")]
    start: String,
    #[arg(long, value_name = "TIMESTAMP", help = "Window end, e.g. 2021-12-31T23:59:59Z")]
    end: String,
    #[arg(long = "lang", value_name = "CODE", help = "Wikipedia language (repeatable)")]
    languages: Vec<String>,
    #[arg(long, help = "Only compute contribution metrics")]
    contribution: bool,
    #[arg(long, help = "Only compute demand metrics")]
    demand: bool,
}

impl MetricsArgs {
    /// Both stages run unless exactly one was asked for.
    fn stages(&self) -> (bool, bool) {
        if !self.contribution && !self.demand {
            return (true, true);
        }
        (self.contribution, self.demand)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILENAME));
    let config = load_config(&config_path)?.resolved();

    match cli.command {
        Some(Commands::Sparql(args)) => run_sparql(&config, args),
        Some(Commands::Metrics(args)) => run_metrics(&config, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_sparql(config: &MetricsConfig, args: SparqlArgs) -> Result<()> {
    let query = fs::read_to_string(&args.query_file)
        .with_context(|| format!("failed to read {}", args.query_file.display()))?;
    let chunk_size = args.chunk_size.unwrap_or(config.sparql.chunk_size);
    let chunked = ChunkedQuery::new(
        &query,
        &args.placeholder,
        &args.description,
        chunk_size,
        &args.out_dir,
    )
    .context("invalid chunked query")?;
    let mut endpoint = SparqlEndpoint::new(
        &config.sparql.endpoint,
        &config.api.user_agent,
        config.api.timeout_ms,
    )?;

    let report = chunked.run(&mut endpoint).context("chunked query failed")?;
    let rows = report.rows_per_chunk.iter().sum::<usize>();
    println!("chunked query");
    println!("description: {}", chunked.description());
    println!("chunks: {}", report.merged_chunks);
    println!("rows: {rows}");
    println!("output: {}", normalize_path(&report.output));
    Ok(())
}

fn run_metrics(config: &MetricsConfig, args: MetricsArgs) -> Result<()> {
    let (contribution, demand) = args.stages();
    let window = TimeWindow::new(&args.start, &args.end)?;
    let languages = if args.languages.is_empty() {
        config.metrics.languages.clone()
    } else {
        args.languages.clone()
    };
    if demand && languages.is_empty() {
        bail!("demand metrics need at least one --lang or [metrics].languages entry");
    }

    let mut table = MetricsTable::read_csv(&args.input, args.id_column.as_deref())
        .with_context(|| format!("failed to load ids from {}", args.input.display()))?;
    info!(entities = table.len(), input = %args.input.display(), "loaded entity table");

    let credentials = load_credentials()?;
    let api = MediaWikiClient::new(MediaWikiClientConfig::from_section(&config.api), credentials)?;
    let retry = RetryPolicy::from_section(&config.retry).context("invalid [retry] settings")?;
    let pageview_retry = RetryPolicy::from_section(&config.pageview_retry)
        .context("invalid [pageview_retry] settings")?;
    let client = RetryingClient::new(api, retry);
    let mut session = MetricsSession::open(
        client,
        window,
        languages,
        config.metrics.sitelink_chunk_size,
        pageview_retry,
    )
    .context("failed to open wiki session")?;

    if contribution {
        session
            .append_contribution_metrics(&mut table)
            .context("contribution metrics failed")?;
    }
    if demand {
        let mut pageviews =
            PageviewsClient::new(&config.pageviews, &config.api.user_agent, config.api.timeout_ms)?;
        session
            .append_demand_metrics(&mut table, &mut pageviews)
            .context("demand metrics failed")?;
    }

    table
        .write_csv(&args.output)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    println!("metrics");
    println!("entities: {}", table.len());
    println!("columns: {}", table.column_names().count());
    println!("requests: {}", session.client().api().request_count());
    println!("output: {}", normalize_path(&args.output));
    Ok(())
}

fn load_credentials() -> Result<Credentials> {
    let login_name = env::var(BOT_USER_ENV).unwrap_or_default();
    let password = env::var(BOT_PASS_ENV).unwrap_or_default();
    Credentials::new(login_name.trim(), &password)
        .with_context(|| format!("set {BOT_USER_ENV} and {BOT_PASS_ENV} (or a .env file)"))
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands};

    #[test]
    fn metrics_runs_both_stages_by_default() {
        let cli = Cli::parse_from([
            "wdmetrics",
            "metrics",
            "--input",
            "ids.csv",
            "--output",
            "out.csv",
            "--start",
            "2020-01-01T00:00:00Z",
            "--end",
            "2021-12-31T23:59:59Z",
            "--lang",
            "en",
            "--lang",
            "de",
        ]);
        let Some(Commands::Metrics(args)) = cli.command else {
            panic!("expected metrics command");
        };
        assert_eq!(args.languages, vec!["en", "de"]);
        assert_eq!(args.stages(), (true, true));
    }

    #[test]
    fn metrics_stage_flags_select_one_stage() {
        let cli = Cli::parse_from([
            "wdmetrics",
            "--verbose",
            "metrics",
            "--input",
            "ids.csv",
            "--output",
            "out.csv",
            "--start",
            "2020-01-01T00:00:00Z",
            "--end",
            "2021-12-31T23:59:59Z",
            "--demand",
        ]);
        assert!(cli.verbose);
        let Some(Commands::Metrics(args)) = cli.command else {
            panic!("expected metrics command");
        };
        assert_eq!(args.stages(), (false, true));
    }

    #[test]
    fn sparql_chunk_size_is_optional() {
        let cli = Cli::parse_from([
            "wdmetrics",
            "sparql",
            "--query-file",
            "q.rq",
            "--placeholder",
            "#CHUNK#",
            "--description",
            "humans",
        ]);
        let Some(Commands::Sparql(args)) = cli.command else {
            panic!("expected sparql command");
        };
        assert_eq!(args.chunk_size, None);
        assert_eq!(args.out_dir.to_string_lossy(), ".");
    }
}
