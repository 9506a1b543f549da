//! Traffic generator for the MITM proxy.
//!
//! Connects to the proxy and sends one `SEQ=<n>|TS=<unix_time>|DATA=<payload>`
//! line per interval until interrupted.

use std::io::ErrorKind;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::interval;
use tracing::{error, info, Level};

use mitm_proxy::message::RecordSequence;
use mitm_proxy::VERSION;

#[derive(Parser, Debug)]
#[command(name = "mitm-client")]
#[command(version = VERSION)]
#[command(about = "Periodic sender of sequenced records through the MITM proxy")]
struct Args {
    #[arg(long, env = "CLIENT_PROXY_HOST", default_value = "proxy")]
    host: String,

    #[arg(long, env = "CLIENT_PROXY_PORT", default_value_t = 9000)]
    port: u16,

    /// Seconds between records
    #[arg(long, env = "CLIENT_MESSAGE_INTERVAL", default_value_t = 1.0)]
    interval: f64,

    #[arg(long, env = "CLIENT_MESSAGE_PAYLOAD", default_value = "HELLO")]
    payload: String,

    /// Stop after this many records
    #[arg(long)]
    count: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

async fn send_records(stream: &mut TcpStream, args: &Args) -> Result<()> {
    let mut records = RecordSequence::new(args.payload.clone());
    let mut ticker = interval(Duration::from_secs_f64(args.interval));
    let mut sent = 0u64;

    loop {
        ticker.tick().await;
        let record = records.next_record(Utc::now().timestamp());
        stream
            .write_all(&record.encode())
            .await
            .context("Failed to send record")?;
        info!("Sent: {}", record.to_string().trim_end());

        sent += 1;
        if args.count.is_some_and(|limit| sent >= limit) {
            return Ok(());
        }
    }
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

    if !args.interval.is_finite() || args.interval <= 0.0 {
        bail!("interval must be a positive number of seconds");
    }
    if args.payload.contains('\n') {
        bail!("payload must not contain a newline");
    }

    let addr = format!("{}:{}", args.host, args.port);
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
            error!("Connection refused to {}", addr);
            return Ok(());
        }
        Err(e) => return Err(e).context(format!("Failed to connect to {}", addr)),
    };
    info!("Connected to proxy at {}", addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Client interrupted (Ctrl+C)");
        },
        result = send_records(&mut stream, &args) => {
            if let Err(e) = result {
                error!("Client error: {:#}", e);
            }
        }
    }

    let _ = stream.shutdown().await;
    info!("Client closed");
    Ok(())
}
