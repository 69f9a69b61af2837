use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use pollq::backend::BackendServer;
use pollq::constants::DEFAULT_PORT;
use pollq::logging::init_logging;
use pollq::metrics;

#[derive(Parser)]
#[command(about = "Line-protocol query backend for pollq")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Delay before answering a plain query, in milliseconds
    #[arg(short, long, default_value_t = 100)]
    delay_ms: u64,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    metrics::spawn_reporter();

    let addr = SocketAddr::new(args.bind, args.port);
    let server = BackendServer::bind(addr, Duration::from_millis(args.delay_ms))
        .with_context(|| format!("failed to bind {addr}"))?;
    server.run().context("backend poll loop failed")
}
