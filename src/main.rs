use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;

use pollq::logging::init_logging;
use pollq::sync_client::run_sequential;
use pollq::{Config, Dispatcher, ResultSet, TcpDriver};

#[derive(Parser)]
#[command(about = "Run queries concurrently over one control thread")]
struct Args {
    /// TOML config file with [connect] and [dispatch] tables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend host
    #[arg(long)]
    host: Option<String>,

    /// Backend port
    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    user: Option<String>,

    #[arg(long)]
    passwd: Option<String>,

    #[arg(short, long)]
    dbname: Option<String>,

    /// Max queued requests per batch
    #[arg(short, long)]
    limit: Option<usize>,

    /// Batch deadline in seconds
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Max block time of one readiness poll, in seconds
    #[arg(short, long)]
    block: Option<f64>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs)]
struct Queries {
    /// Queries to run
    queries: Vec<String>,

    /// Read one query per line from this file (`-` for stdin)
    #[arg(short, long)]
    file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Dispatch every query concurrently, one connection each
    Run(Queries),
    /// Run the queries one after another on a single connection
    Sync(Queries),
    /// Run both ways and print both timings
    Compare(Queries),
}

impl Queries {
    fn load(self) -> Result<Vec<String>> {
        let mut queries = self.queries;
        if let Some(path) = self.file {
            let text = if path.as_os_str() == "-" {
                let mut text = String::new();
                io::stdin()
                    .read_to_string(&mut text)
                    .context("failed to read queries from stdin")?;
                text
            } else {
                fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?
            };
            queries.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
        }
        if queries.is_empty() {
            bail!("no queries given");
        }
        Ok(queries)
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let connect = &mut config.connect;
    if let Some(host) = &args.host {
        connect.host = host.clone();
    }
    if let Some(port) = args.port {
        connect.port = port;
    }
    if let Some(user) = &args.user {
        connect.user = user.clone();
    }
    if let Some(passwd) = &args.passwd {
        connect.passwd = passwd.clone();
    }
    if let Some(dbname) = &args.dbname {
        connect.dbname = dbname.clone();
    }

    let mut dispatch = config.dispatch;
    if let Some(limit) = args.limit {
        dispatch = dispatch.with_limit(limit);
    }
    if let Some(timeout) = args.timeout {
        dispatch = dispatch.with_timeout_secs(timeout);
    }
    if let Some(block) = args.block {
        dispatch = dispatch.with_block_secs(block);
    }
    config.dispatch = dispatch;
    Ok(config)
}

fn print_result(query: &str, result: &ResultSet) {
    match result.first_row() {
        Some(row) => println!("[{}] {query} => {}", result.conn(), row.join(" | ")),
        None => println!("[{}] {query} => (no rows)", result.conn()),
    }
}

fn run_concurrent(config: &Config, queries: &[String]) -> Result<u128> {
    let driver = TcpDriver::new(config.connect.clone());
    let mut dispatcher = Dispatcher::try_new(config.dispatch, driver)?;
    for query in queries {
        let q = query.clone();
        dispatcher.enqueue_with(query.as_str(), move |result: &ResultSet| print_result(&q, result))?;
    }

    let start = Instant::now();
    let stats = dispatcher.run()?;
    let elapsed = start.elapsed().as_millis();
    info!(
        submitted = stats.submitted,
        completed = stats.completed,
        polls = stats.polls,
        "concurrent run finished"
    );
    Ok(elapsed)
}

fn run_sync(config: &Config, queries: &[String]) -> Result<u128> {
    let start = Instant::now();
    run_sequential(&config.connect, queries, print_result)?;
    Ok(start.elapsed().as_millis())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    let config = load_config(&args)?;
    info!(addr = %config.connect.addr_string(), "pollq");

    match args.command {
        Command::Run(queries) => {
            let queries = queries.load()?;
            let ms = run_concurrent(&config, &queries)?;
            println!("concurrent: {} queries in {ms} ms", queries.len());
        }
        Command::Sync(queries) => {
            let queries = queries.load()?;
            let ms = run_sync(&config, &queries)?;
            println!("sequential: {} queries in {ms} ms", queries.len());
        }
        Command::Compare(queries) => {
            let queries = queries.load()?;
            let sync_ms = run_sync(&config, &queries)?;
            let async_ms = run_concurrent(&config, &queries)?;
            println!("sequential: {} queries in {sync_ms} ms", queries.len());
            println!("concurrent: {} queries in {async_ms} ms", queries.len());
        }
    }
    Ok(())
}
