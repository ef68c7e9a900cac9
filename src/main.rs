use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use cacheproxy::proxy::{self, ProxyConfig};

#[derive(Parser)]
#[command(name = "cacheproxy")]
#[command(about = "Caching forward HTTP proxy", long_about = None)]
struct Args {
    /// Local port to listen on
    port: u16,

    /// Seconds a cached response stays fresh
    #[arg(default_value = "60")]
    ttl: u64,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Blocklist file, one host substring per line
    #[arg(long, default_value = "blocked.txt")]
    blocklist: PathBuf,

    /// Directory for the host store and the content cache
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Seconds an idle keep-alive connection is kept open
    #[arg(long, default_value = "10")]
    keep_alive_timeout: u64,

    /// Port used to reach every origin
    #[arg(long, default_value = "80")]
    origin_port: u16,

    /// Seconds to wait on an origin connect or read
    #[arg(long, default_value = "30")]
    origin_timeout: u64,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = std::env::var("CACHEPROXY_LOG").unwrap_or_else(|_| level.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Args::parse();
    setup_tracing(args.verbose);

    let config = ProxyConfig {
        bind_addr: SocketAddr::new(args.bind, args.port),
        ttl: Duration::from_secs(args.ttl),
        keep_alive_timeout: Duration::from_secs(args.keep_alive_timeout),
        origin_port: args.origin_port,
        origin_timeout: Duration::from_secs(args.origin_timeout),
        blocklist_path: args.blocklist,
        data_dir: args.data_dir,
        ..Default::default()
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(proxy::run(config)) {
        tracing::error!(error = %e, "Proxy failed");
        std::process::exit(1);
    }
}
