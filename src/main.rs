use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use prometheus::Registry;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentinel::config::{LogFormat, LoggingConfig, SentinelConfig};
use sentinel::metrics::{MetricsSink, NoopMetrics, Outcome, PrometheusMetrics};
use sentinel::ratelimit::{Decision, RateLimiter};
use sentinel::storage::{MemoryStorage, Storage};

/// Drive the rate limiter against an in-memory store.
#[derive(Parser, Debug)]
#[command(name = "sentinel", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send requests one after another and print each decision
    Check {
        #[command(flatten)]
        rule: RuleArgs,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Send requests all at once and print how many got through
    Burst {
        #[command(flatten)]
        rule: RuleArgs,

        /// Number of simultaneous requests
        #[arg(long, default_value_t = 10)]
        concurrency: usize,
    },
}

#[derive(Args, Debug)]
struct RuleArgs {
    /// Client key to rate limit
    #[arg(long)]
    key: String,

    /// Requests allowed per window (defaults to the configured rule)
    #[arg(long)]
    limit: Option<u64>,

    /// Window length in seconds (defaults to the configured rule)
    #[arg(long)]
    window_secs: Option<u64>,
}

struct Rule {
    key: String,
    limit: u64,
    window: Duration,
}

impl Rule {
    fn resolve(args: RuleArgs, config: &SentinelConfig) -> Self {
        let default_rule = &config.limiter.default_rule;
        Self {
            key: args.key,
            limit: args.limit.unwrap_or(default_rule.requests_per_unit),
            window: args
                .window_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| default_rule.window()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SentinelConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);

    log_startup(cli.config.as_deref(), &config);

    let store = Arc::new(MemoryStorage::new());
    if let Some(interval) = config.storage.sweep_interval() {
        store.start_sweeper(interval)?;
    }

    let registry = Registry::new();
    let prometheus = if config.metrics.enabled {
        Some(Arc::new(PrometheusMetrics::new(&registry)?))
    } else {
        None
    };
    let sink: Arc<dyn MetricsSink> = match &prometheus {
        Some(metrics) => metrics.clone(),
        None => Arc::new(NoopMetrics),
    };

    let limiter = config.limiter.build(store.clone(), sink);

    let outcome = match cli.command {
        Command::Check { rule, count } => {
            let rule = Rule::resolve(rule, &config);
            run_check(limiter.as_ref(), &rule, count).await
        }
        Command::Burst { rule, concurrency } => {
            let rule = Rule::resolve(rule, &config);
            run_burst(limiter.as_ref(), &rule, concurrency, prometheus.as_deref()).await
        }
    };

    store.close().await?;
    info!("Sentinel stopped");
    outcome
}

/// Startup banner. Runs after `init_tracing`, since loading the configuration
/// happens before any subscriber exists.
fn log_startup(path: Option<&str>, config: &SentinelConfig) {
    info!("Starting Sentinel");
    if let Some(path) = path {
        info!(path = %path, "Loaded configuration file");
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        algorithm = ?config.limiter.algorithm,
        over_limit = ?config.limiter.over_limit,
        "Configuration loaded"
    );
}

/// Sequential allows followed by a final status read.
async fn run_check(limiter: &dyn RateLimiter, rule: &Rule, count: u32) -> anyhow::Result<()> {
    for _ in 0..count {
        let decision = limiter.allow(&rule.key, rule.limit, rule.window).await?;
        println!("{}", decision_json("allow", &rule.key, &decision));
    }

    let status = limiter.status(&rule.key, rule.limit, rule.window).await?;
    println!("{}", decision_json("status", &rule.key, &status));
    Ok(())
}

/// Concurrent allows on one key, summarized.
async fn run_burst(
    limiter: &dyn RateLimiter,
    rule: &Rule,
    concurrency: usize,
    metrics: Option<&PrometheusMetrics>,
) -> anyhow::Result<()> {
    let calls = (0..concurrency).map(|_| limiter.allow(&rule.key, rule.limit, rule.window));
    let results = futures::future::join_all(calls).await;

    let mut allowed = 0u64;
    let mut denied = 0u64;
    let mut failed = 0u64;
    for result in results {
        match result {
            Ok(decision) if decision.allowed => allowed += 1,
            Ok(_) => denied += 1,
            Err(err) => {
                warn!(error = %err, "Request left undecided");
                failed += 1;
            }
        }
    }

    let mut summary = json!({
        "key": rule.key,
        "limit": rule.limit,
        "window_ms": rule.window.as_millis() as u64,
        "allowed": allowed,
        "denied": denied,
        "failed": failed,
    });
    if let Some(metrics) = metrics {
        summary["allowed_requests"] = json!(metrics.count(&rule.key, Outcome::Allowed));
        summary["blocked_requests"] = json!(metrics.count(&rule.key, Outcome::Blocked));
    }

    println!("{}", summary);
    Ok(())
}

fn decision_json(op: &str, key: &str, decision: &Decision) -> serde_json::Value {
    json!({
        "op": op,
        "key": key,
        "allowed": decision.allowed,
        "remaining": decision.remaining,
        "reset_at": decision.reset_at.to_rfc3339(),
        "retry_after_ms": decision.retry_after.as_millis() as u64,
    })
}

/// Initialize tracing; `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}
