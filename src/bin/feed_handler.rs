//! Feed Handler Binary
//!
//! Connects to the exchange simulator, materializes the stream into the
//! symbol cache, and reports throughput and latency. Unless disabled, a
//! monitor thread logs a once-per-second summary built exclusively from
//! seqlock snapshots and atomic counters.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use mdfeed::client::{FeedHandler, FeedHandlerConfig};
use mdfeed::wire::symbol_name;

#[derive(Parser, Debug)]
#[command(name = "feed_handler")]
#[command(about = "Market data feed handler - consume, validate and track a tick stream")]
struct Args {
    /// Server hostname
    #[arg(long, env = "MDFEED_HOST", default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, env = "MDFEED_PORT", default_value = "9876")]
    port: u16,

    /// Connection timeout in milliseconds
    #[arg(short, long, env = "MDFEED_TIMEOUT_MS", default_value = "5000")]
    timeout: u64,

    /// Disable the periodic stats monitor
    #[arg(long)]
    no_visual: bool,

    /// Disable automatic reconnection
    #[arg(long)]
    no_reconnect: bool,

    /// Comma-separated symbol ids to subscribe to (default: all)
    #[arg(long, env = "MDFEED_SUBSCRIBE")]
    subscribe: Option<String>,

    /// Export the latency histogram to this CSV file on exit
    #[arg(long)]
    export_csv: Option<PathBuf>,
}

static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_signal(_signal: libc::c_int) {
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn parse_symbol_list(raw: &str) -> Result<Vec<u16>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<u16>()
                .with_context(|| format!("invalid symbol id: {s}"))
        })
        .collect()
}

/// Log a one-line summary each second: throughput, gaps, latency
/// percentiles, and the busiest symbols. Reads only snapshots.
fn spawn_monitor(handler: &FeedHandler, running: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    let cache = handler.cache();
    let latency = handler.latency();
    let parser_stats = handler.parser_stats();
    let messages = handler.messages_received_handle();

    std::thread::Builder::new()
        .name("feed-monitor".to_string())
        .spawn(move || {
            let mut last_messages = 0u64;
            while running.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_secs(1));

                let total = messages.load(Ordering::Relaxed);
                let rate = total.saturating_sub(last_messages);
                last_messages = total;

                let stats = latency.stats();
                let gaps = parser_stats.sequence_gaps.load(Ordering::Relaxed);
                info!(
                    "{rate} msg/s | total {total} | gaps {gaps} | \
                     latency p50={}us p99={}us max={}us",
                    stats.p50 / 1000,
                    stats.p99 / 1000,
                    stats.max / 1000,
                );

                for (id, state) in cache.top_symbols(3) {
                    if state.update_count == 0 {
                        continue;
                    }
                    info!(
                        "  {:<12} bid {:>10.2} ask {:>10.2} last {:>10.2} ({:+.2}%) x{}",
                        symbol_name(id),
                        state.best_bid,
                        state.best_ask,
                        state.last_price,
                        state.percent_change(),
                        state.update_count,
                    );
                }
            }
        })
        .expect("failed to spawn monitor thread")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let subscribe_symbols = match &args.subscribe {
        Some(raw) => parse_symbol_list(raw)?,
        None => Vec::new(),
    };

    let config = FeedHandlerConfig {
        host: args.host.clone(),
        port: args.port,
        connect_timeout: Duration::from_millis(args.timeout),
        auto_reconnect: !args.no_reconnect,
        subscribe_symbols,
        ..Default::default()
    };

    let mut handler = FeedHandler::new(config)?;
    SHUTDOWN.set(handler.running_handle()).ok();
    install_signal_handlers();

    info!("Feed Handler");
    info!("  Server:    {}:{}", args.host, args.port);
    info!("  Timeout:   {}ms", args.timeout);
    info!("  Reconnect: {}", if args.no_reconnect { "disabled" } else { "enabled" });
    info!("Press Ctrl+C to stop");

    handler.start()?;

    // Raised before the monitor spawns so it does not observe the
    // not-yet-running state and exit immediately
    handler.running_handle().store(true, Ordering::SeqCst);
    let monitor = if args.no_visual {
        None
    } else {
        Some(spawn_monitor(&handler, handler.running_handle()))
    };

    handler.run()?;

    if let Some(monitor) = monitor {
        let _ = monitor.join();
    }

    if let Some(path) = &args.export_csv {
        handler
            .latency()
            .export_csv(path)
            .with_context(|| format!("failed to export histogram to {}", path.display()))?;
        info!("latency histogram exported to {}", path.display());
    }

    let snapshot = handler.stats_snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
