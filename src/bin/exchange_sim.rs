//! Exchange Simulator Binary
//!
//! Synthesizes a market data stream over TCP for any number of
//! connected feed handlers.
//!
//! Usage:
//!   exchange_sim --port 9876 --symbols 100 --rate 100000 --market neutral

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use mdfeed::server::{ExchangeSimulator, SimulatorConfig};
use mdfeed::ticks::MarketCondition;

#[derive(Parser, Debug)]
#[command(name = "exchange_sim")]
#[command(about = "Market data exchange simulator - broadcast synthetic ticks over TCP")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "MDFEED_PORT", default_value = "9876")]
    port: u16,

    /// Number of simulated symbols
    #[arg(short, long, env = "MDFEED_SYMBOLS", default_value = "100")]
    symbols: usize,

    /// Target tick rate in messages per second
    #[arg(short, long, env = "MDFEED_RATE", default_value = "100000")]
    rate: u32,

    /// Market condition: neutral, bull, or bear
    #[arg(short, long, env = "MDFEED_MARKET", default_value = "neutral")]
    market: String,

    /// Inject sequence gaps (~1% of ticks skip a sequence number)
    #[arg(short, long)]
    fault: bool,
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

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let market = match args.market.as_str() {
        "neutral" => MarketCondition::Neutral,
        "bull" => MarketCondition::Bullish,
        "bear" => MarketCondition::Bearish,
        other => bail!("unknown market condition: {other} (expected neutral, bull, or bear)"),
    };

    let config = SimulatorConfig {
        port: args.port,
        num_symbols: args.symbols,
        tick_rate: args.rate,
        market,
        fault_injection: args.fault,
    };

    let mut simulator = ExchangeSimulator::bind(config)?;
    SHUTDOWN.set(simulator.shutdown_handle()).ok();
    install_signal_handlers();

    info!("Exchange Simulator");
    info!("  Port:         {}", simulator.local_port());
    info!("  Symbols:      {}", args.symbols);
    info!("  Tick rate:    {} msgs/sec", args.rate);
    info!("  Market:       {}", args.market);
    info!("  Fault inject: {}", if args.fault { "enabled" } else { "disabled" });
    info!("Press Ctrl+C to stop");

    let started = std::time::Instant::now();
    simulator.run()?;

    info!(
        "uptime {:?}, {} messages / {} bytes sent",
        started.elapsed(),
        simulator.messages_sent(),
        simulator.bytes_sent()
    );
    Ok(())
}
