//! arbgraph - feed price ticks in, get ranked arbitrage cycles out
//!
//! Run with: cargo run -- --input ticks.jsonl
//!
//! Each input line is one tick:
//! `{"exchange":"gemini","pair":"ETH/BTC","price":0.0873,"timestamp":1518996767361}`

use clap::Parser;
use color_eyre::eyre::Result;
use console::style;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arbgraph::cartographer::RateUpdate;
use arbgraph::config::Config;
use arbgraph::engine::{EngineStats, GraphWorker};
use arbgraph::Opportunity;

#[derive(Parser, Debug)]
#[command(name = "arbgraph", version, about = "Currency arbitrage detection over a rate graph")]
struct Args {
    /// TOML config file (defaults to environment / .env)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON-lines tick file (defaults to stdin)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Override the opportunity expiry in milliseconds
    #[arg(long)]
    expire_ms: Option<i64>,

    /// Write the final graph snapshot as JSON to this file
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn print_banner() {
    println!();
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!(
        "{}",
        style(" 🎯 ARBGRAPH - Currency Arbitrage Detection").cyan().bold()
    );
    println!(
        "{}",
        style("    Log-Weighted Graph | Bellman-Ford | Ranked Opportunities").cyan()
    );
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!();
}

fn print_opportunities(ops: &[Opportunity], top_n: usize) {
    if ops.is_empty() {
        println!("{}", style("No live opportunities").yellow());
        return;
    }

    println!(
        "{}",
        style(format!("Top {} of {} opportunities:", top_n.min(ops.len()), ops.len())).green().bold()
    );
    for (i, op) in ops.iter().take(top_n).enumerate() {
        println!(
            "  {:>2}. {:.6}x ({:+.4}%) {} hops | {}",
            i + 1,
            op.gain,
            op.gain_pct(),
            op.hop_count(),
            op.format_path()
        );
    }
}

fn print_stats(stats: &EngineStats, elapsed: std::time::Duration) {
    println!();
    println!("{}", style("═══ SUMMARY ═══").blue().bold());
    println!("   Ticks received:  {}", stats.updates_received);
    println!("   Ticks coalesced: {}", stats.updates_coalesced);
    println!("   Ticks applied:   {}", stats.updates_applied);
    println!("   Ticks rejected:  {}", stats.updates_rejected);
    println!("   Passes:          {}", stats.passes);
    println!("   Cycles found:    {}", stats.cycles_found);
    if stats.graph_resets > 0 {
        println!("   {} {}", style("Graph resets:").red(), stats.graph_resets);
    }
    println!("   Elapsed:         {:?}", elapsed);
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(expire_ms) = args.expire_ms {
        config.expire_time_ms = expire_ms;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.log_filter.parse()?),
        )
        .init();

    print_banner();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        error!("Please check your .env file or --config");
        return Err(e);
    }

    config.print_summary();
    println!();

    let start = Instant::now();
    let (handle, task) = GraphWorker::spawn(&config);

    // The signal task only gets the stop switch; a GraphHandle there would
    // keep the worker's channel open after the input ends
    let shutdown = handle.shutdown_handle();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping");
            stopper.shutdown();
        }
    });

    let input: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(input).lines();

    let mut line_no = 0usize;
    let mut bad_lines = 0usize;
    loop {
        let next = tokio::select! {
            line = lines.next_line() => line?,
            _ = shutdown.stopped() => break,
        };
        let Some(line) = next else {
            break;
        };
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if handle.is_stopped() {
            break;
        }

        let update = match RateUpdate::from_json(line) {
            Ok(update) => update,
            Err(e) => {
                bad_lines += 1;
                warn!("Line {}: unreadable tick: {}", line_no, e);
                continue;
            }
        };

        if let Err(e) = handle.send_update(update).await {
            error!("{}", e);
            break;
        }
    }

    info!("Read {} lines ({} unreadable)", line_no, bad_lines);

    if !handle.is_stopped() {
        let ops = handle.opportunities().await?;
        println!();
        print_opportunities(&ops, config.top_n);

        if let Some(path) = &args.snapshot {
            let snapshot = handle.snapshot().await?;
            std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
            println!(
                "{} Snapshot written to {} ({} nodes, {} edges)",
                style("✓").green(),
                path.display(),
                snapshot.nodes.len(),
                snapshot.edges.len()
            );
        }
    }

    drop(handle);
    let stats = task.await?;
    print_stats(&stats, start.elapsed());

    if shutdown.is_stopped() {
        // A pending stdin read would otherwise hold the runtime open
        std::process::exit(130);
    }

    Ok(())
}
