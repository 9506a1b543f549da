use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use humansize::{format_size, BINARY};
use tracing::{info, Level};

use mitm_proxy::config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_DELAY_MAX, DEFAULT_DELAY_MIN, DEFAULT_DROP_RATE,
    DEFAULT_REORDER_WINDOW,
};
use mitm_proxy::stats::StatsSnapshot;
use mitm_proxy::{AttackMode, Listener, ProxyConfig, ShaperConfig, Stats, VERSION};

#[derive(Parser, Debug)]
#[command(name = "mitm-proxy")]
#[command(version = VERSION)]
#[command(about = "TCP proxy that injects delay, loss and reordering between a client and a server")]
struct Args {
    #[arg(long, env = "PROXY_LISTEN_HOST", default_value = "0.0.0.0")]
    listen_host: String,

    #[arg(long, env = "PROXY_LISTEN_PORT", default_value_t = 9000)]
    listen_port: u16,

    #[arg(long, env = "PROXY_SERVER_HOST")]
    server_host: String,

    #[arg(long, env = "PROXY_SERVER_PORT")]
    server_port: u16,

    /// transparent, random_delay, drop or reorder
    #[arg(long, env = "PROXY_MODE", default_value = "transparent")]
    mode: String,

    /// Seconds
    #[arg(long, env = "PROXY_DELAY_MIN", default_value_t = DEFAULT_DELAY_MIN)]
    delay_min: f64,

    /// Seconds
    #[arg(long, env = "PROXY_DELAY_MAX", default_value_t = DEFAULT_DELAY_MAX)]
    delay_max: f64,

    #[arg(long, env = "PROXY_DROP_RATE", default_value_t = DEFAULT_DROP_RATE)]
    drop_rate: f64,

    #[arg(long, env = "PROXY_REORDER_WINDOW", default_value_t = DEFAULT_REORDER_WINDOW)]
    reorder_window: usize,

    /// Bytes read per receive call
    #[arg(long, env = "PROXY_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Upstream dial timeout in seconds
    #[arg(long, env = "PROXY_CONNECT_TIMEOUT", default_value_t = 5)]
    connect_timeout: u64,

    /// Unlimited when unset
    #[arg(long, env = "PROXY_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    #[arg(short, long)]
    quiet: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        let mut config = ProxyConfig::new(
            self.listen_host,
            self.listen_port,
            self.server_host,
            self.server_port,
        );
        config.shaper = ShaperConfig {
            mode: AttackMode::from_name_or_default(&self.mode),
            delay_min: self.delay_min,
            delay_max: self.delay_max,
            drop_rate: self.drop_rate,
            reorder_window: self.reorder_window,
            chunk_size: self.buffer_size,
        };
        config.connect_timeout = Duration::from_secs(self.connect_timeout);
        config.max_connections = self.max_connections;
        config
    }
}

fn print_banner(config: &ProxyConfig) {
    let shaper = &config.shaper;
    let detail = match shaper.mode {
        AttackMode::Transparent => "no impairment".to_string(),
        AttackMode::RandomDelay => format!("{}s - {}s per chunk", shaper.delay_min, shaper.delay_max),
        AttackMode::Drop => format!("drop rate {}", shaper.drop_rate),
        AttackMode::Reorder => format!("window {} chunks", shaper.reorder_window),
    };
    let limit = config
        .max_connections
        .map_or_else(|| "unlimited".to_string(), |n| n.to_string());

    println!("\n╔══════════════════════════════════════════════════════╗");
    println!("║       \x1b[92mMITM Simulation Proxy v{}\x1b[0m                  ║", VERSION);
    println!("╚══════════════════════════════════════════════════════╝\n");

    println!("\x1b[92m[CONFIG]\x1b[0m");
    println!("  \x1b[97m├─ Listen:\x1b[0m {}", config.listen_addr());
    println!("  \x1b[97m├─ Upstream:\x1b[0m {}", config.upstream_addr());
    println!("  \x1b[97m├─ Mode:\x1b[0m {} ({})", shaper.mode, detail);
    println!("  \x1b[97m├─ Chunk Size:\x1b[0m {} bytes", shaper.chunk_size);
    println!("  \x1b[97m├─ Max Connections:\x1b[0m {}", limit);
    println!("  \x1b[97m└─ Started:\x1b[0m {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!("\n\x1b[92m[INFO]\x1b[0m Press \x1b[93mCtrl+C\x1b[0m to stop the proxy\n");
}

fn print_final_stats(stats: &StatsSnapshot) {
    println!("\n╔══════════════════════════════════════════════════════╗");
    println!("║                 \x1b[92mFINAL STATISTICS\x1b[0m                    ║");
    println!("╚══════════════════════════════════════════════════════╝\n");

    println!("  \x1b[97mTotal Sessions:\x1b[0m         {}", stats.total_sessions);
    println!("  \x1b[97mStill Active:\x1b[0m           {}", stats.active_sessions);
    println!("  \x1b[97mUpstream Failures:\x1b[0m      {}", stats.failed_upstream);
    println!("  \x1b[97mChunks Forwarded:\x1b[0m       {}", stats.chunks_forwarded);
    println!("  \x1b[97mChunks Dropped:\x1b[0m         {}", stats.chunks_dropped);
    println!("  \x1b[97mChunks Reordered:\x1b[0m       {}", stats.chunks_reordered);
    println!("  \x1b[97mChunks Flushed:\x1b[0m         {}", stats.chunks_flushed);
    println!("  \x1b[97mClient → Server:\x1b[0m        {}", format_size(stats.bytes_to_server, BINARY));
    println!("  \x1b[97mServer → Client:\x1b[0m        {}", format_size(stats.bytes_to_client, BINARY));

    println!("\n\x1b[92m[SUCCESS]\x1b[0m Proxy shut down\n");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(filter_level)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let quiet = args.quiet;
    let config = args.into_config();
    config.validate().context("Invalid proxy configuration")?;
    let config = Arc::new(config);

    if !quiet {
        print_banner(&config);
    }

    let stats = Stats::new();
    let listener = Listener::bind(Arc::clone(&config), stats.clone())
        .await
        .with_context(|| format!("Failed to start proxy on {}", config.listen_addr()))?;

    listener.run().await;
    info!("Proxy closed");

    if !quiet {
        print_final_stats(&stats.snapshot());
    }

    Ok(())
}
