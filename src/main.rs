use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{LimiterConfig, LoggingConfig, RateKeeperConfig};
use ratekeeper::ratelimit::{Algorithm, Decision, RateLimiter, Ticket, TicketStatus};

/// How often deferred tickets are polled while waiting for results.
const COLLECT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about = "In-process admission control")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use this algorithm with its default parameters, overriding the
    /// configured limiter unless it already uses the same algorithm
    #[arg(short, long, value_enum)]
    algorithm: Option<AlgorithmArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drive the limiter with a stream of requests and report the outcome
    Simulate {
        /// Number of requests to send
        #[arg(short, long, default_value_t = 10)]
        requests: usize,

        /// Delay between consecutive requests in milliseconds
        #[arg(short, long, default_value_t = 500)]
        spacing_ms: u64,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as YAML
    ShowConfig,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    FixedWindow,
    SlidingWindowLog,
    TokenBucket,
    LeakyBucket,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::FixedWindow => Algorithm::FixedWindow,
            AlgorithmArg::SlidingWindowLog => Algorithm::SlidingWindowLog,
            AlgorithmArg::TokenBucket => Algorithm::TokenBucket,
            AlgorithmArg::LeakyBucket => Algorithm::LeakyBucket,
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestOutcome {
    request_id: String,
    #[serde(flatten)]
    decision: Decision,
}

#[derive(Debug, Serialize)]
struct CompletedRequest {
    ticket: Ticket,
    result: String,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    algorithm: Option<Algorithm>,
    admitted: usize,
    deferred: usize,
    rejected: usize,
    requests: Vec<RequestOutcome>,
    completed: Vec<CompletedRequest>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = RateKeeperConfig::load(cli.config.as_deref())?;
    if let Some(arg) = cli.algorithm {
        let algorithm = Algorithm::from(arg);
        if config.limiter.algorithm() != algorithm {
            config.limiter = LimiterConfig::defaults_for(algorithm);
        }
    }

    init_tracing(&config.logging);

    info!("Starting Ratekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::ShowConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Simulate {
            requests,
            spacing_ms,
            json,
        } => {
            let limiter = RateLimiter::from_config(&config.limiter)?;
            let spacing = Duration::from_millis(spacing_ms);

            let mut summary = Summary {
                algorithm: Some(limiter.algorithm()),
                ..Summary::default()
            };

            tokio::select! {
                _ = simulate(&limiter, requests, spacing, &mut summary) => {}
                _ = shutdown_signal() => {
                    warn!("Simulation interrupted, reporting partial results");
                }
            }

            limiter.shutdown();
            report(&summary, json)?;
        }
    }

    info!("Ratekeeper stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Send `requests` requests `spacing` apart, then wait for every deferred
/// one to resolve.
async fn simulate(limiter: &RateLimiter, requests: usize, spacing: Duration, summary: &mut Summary) {
    let mut pending = Vec::new();

    for i in 0..requests {
        let request_id = format!("req-{i}");
        let decision = limiter.admit(&request_id);

        match decision {
            Decision::Admitted => summary.admitted += 1,
            Decision::Deferred(ticket) => {
                summary.deferred += 1;
                pending.push(ticket);
            }
            Decision::Rejected => summary.rejected += 1,
        }
        summary.requests.push(RequestOutcome {
            request_id,
            decision,
        });

        if i + 1 < requests {
            tokio::time::sleep(spacing).await;
        }
    }

    while !pending.is_empty() {
        pending.retain(|ticket| match limiter.collect(ticket) {
            Some(result) => {
                summary.completed.push(CompletedRequest {
                    ticket: *ticket,
                    result,
                });
                false
            }
            None => {
                let status = limiter.status(ticket);
                if status == TicketStatus::Unknown {
                    warn!(%ticket, "Deferred request finished without a result");
                }
                status != TicketStatus::Unknown
            }
        });

        if !pending.is_empty() {
            tokio::time::sleep(COLLECT_POLL_INTERVAL).await;
        }
    }
}

fn report(summary: &Summary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    if let Some(algorithm) = summary.algorithm {
        println!("algorithm: {algorithm}");
    }
    for outcome in &summary.requests {
        match outcome.decision {
            Decision::Admitted => println!("{}: admitted", outcome.request_id),
            Decision::Deferred(ticket) => println!("{}: deferred ({ticket})", outcome.request_id),
            Decision::Rejected => println!("{}: rejected", outcome.request_id),
        }
    }
    for completed in &summary.completed {
        println!("{}: {}", completed.ticket, completed.result);
    }
    println!(
        "admitted={} deferred={} rejected={}",
        summary.admitted, summary.deferred, summary.rejected
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
