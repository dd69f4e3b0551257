//! `dashboard-tail`: follow live call updates from a gateway and print the
//! folded state of every call.

use anyhow::{Context, Result};
use clap::Parser;
use dashboard::{CallAggregate, CallBoard, ClientConfig, DashboardClient, DEFAULT_LATENCY_WEIGHT};
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "dashboard-tail", about = "Follow live call updates from a gateway")]
struct Args {
    /// Gateway WebSocket endpoint.
    #[arg(long, env = "GATEWAY_URL", default_value = "ws://localhost:8000/ws")]
    url: String,

    /// Call to follow; repeat for several. Follows every call when omitted.
    #[arg(long = "call-id")]
    call_ids: Vec<String>,

    /// Seconds between reconnect attempts.
    #[arg(long, default_value_t = 3)]
    retry_delay_secs: u64,

    /// EMA weight of new latency samples, in (0, 1].
    #[arg(long, default_value_t = DEFAULT_LATENCY_WEIGHT)]
    latency_weight: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    // Scope the connection to the first call; the rest are subscribed after connect.
    let mut url = Url::parse(&args.url).context("invalid --url")?;
    if let Some(first) = args.call_ids.first() {
        url.query_pairs_mut().append_pair("call_id", first);
    }

    let config = ClientConfig {
        retry_delay: Duration::from_secs(args.retry_delay_secs),
        latency_weight: args.latency_weight,
        calls: args.call_ids.clone(),
        ..ClientConfig::new(url.as_str())
    };
    let (client, handle) = DashboardClient::new(config)?;

    info!("Following {}", url);

    let mut board = handle.board();
    let printer = tokio::spawn(async move {
        while board.changed().await.is_ok() {
            let snapshot = board.borrow_and_update().clone();
            print_board(&snapshot);
        }
    });

    let mut run = tokio::spawn(client.run());
    tokio::select! {
        result = &mut run => result??,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C");
            let _ = handle.teardown().await;
            run.await??;
        }
    }

    printer.abort();
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn print_board(board: &CallBoard) {
    for call in board.calls() {
        println!("{}", summarize(call));
    }
}

fn summarize(call: &CallAggregate) -> String {
    let last_line = call
        .transcript
        .last()
        .map(|e| format!("{:?}: {}", e.speaker, e.text))
        .unwrap_or_default();
    let top = call
        .top_response()
        .map(|r| format!(" | top: {} ({:.2})", r.text, r.score))
        .unwrap_or_default();
    let latency = call
        .latency
        .average_ms
        .map(|ms| format!(" | {ms:.0}ms"))
        .unwrap_or_default();
    format!(
        "[{}] {:?} | {} lines | {}{}{}",
        call.call_id,
        call.status,
        call.transcript.len(),
        last_line,
        top,
        latency
    )
}
