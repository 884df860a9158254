//! CLI command definitions for taskq.
//!
//! The binary is an operator tool: it enqueues ad-hoc tasks, prints queue
//! statistics, and runs the lease recovery role. Task processing itself
//! needs handlers and therefore lives in user programs built on
//! [`Processor`](crate::processor::Processor).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, Utc};
use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;

use crate::broker::{Broker, BrokerConfig, QueueStats, RedisBroker};
use crate::client::{Client, ClientConfig};
use crate::metrics::{export_metrics, MetricsCollector};
use crate::monitor::{Forwarder, Recoverer};
use crate::task::{Task, TaskInfo, TaskOption};

/// Operator tool for the taskq distributed task queue.
#[derive(Parser)]
#[command(name = "taskq")]
#[command(about = "Operate a Redis-backed distributed task queue")]
#[command(version)]
#[command(
    long_about = "taskq enqueues tasks, inspects queues, and recovers tasks whose lease expired.\n\nExample usage:\n  taskq enqueue send_email --payload '{\"to\":\"a@example.com\"}' --queue critical\n  taskq stats\n  taskq recover"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL.
    #[arg(long, global = true, env = "TASKQ_REDIS_URL")]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Enqueue or schedule a task.
    Enqueue(EnqueueArgs),

    /// Print per-queue statistics and live servers.
    Stats(StatsArgs),

    /// Run the recovery role: recover expired leases and forward due
    /// scheduled tasks until Ctrl-C.
    Recover(RecoverArgs),
}

#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Task type name.
    pub type_name: String,

    /// JSON payload.
    #[arg(short, long, default_value = "{}")]
    pub payload: String,

    /// Queue name.
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Retry budget; negative values mean no retries.
    #[arg(long, allow_negative_numbers = true)]
    pub max_retry: Option<i32>,

    /// Per-attempt timeout in seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Absolute deadline (RFC 3339).
    #[arg(long)]
    pub deadline: Option<DateTime<Utc>>,

    /// Delay before the task becomes pending, in seconds.
    #[arg(long)]
    pub process_in_secs: Option<u64>,

    /// Reject duplicates of this task for this many seconds.
    #[arg(long)]
    pub unique_secs: Option<u64>,

    /// Keep the task this many seconds after it completes.
    #[arg(long)]
    pub retention_secs: Option<u64>,

    /// Use this task ID instead of a generated one.
    #[arg(long)]
    pub task_id: Option<String>,

    /// Output the task info as JSON.
    #[arg(long)]
    pub json: bool,
}

impl EnqueueArgs {
    fn options(&self) -> Vec<TaskOption> {
        let mut opts = Vec::new();
        if let Some(queue) = &self.queue {
            opts.push(TaskOption::Queue(queue.clone()));
        }
        if let Some(n) = self.max_retry {
            opts.push(TaskOption::MaxRetry(n));
        }
        if let Some(secs) = self.timeout_secs {
            opts.push(TaskOption::Timeout(Duration::from_secs(secs)));
        }
        if let Some(deadline) = self.deadline {
            opts.push(TaskOption::Deadline(deadline));
        }
        if let Some(secs) = self.unique_secs {
            opts.push(TaskOption::Unique(Duration::from_secs(secs)));
        }
        if let Some(secs) = self.retention_secs {
            opts.push(TaskOption::Retention(Duration::from_secs(secs)));
        }
        if let Some(id) = &self.task_id {
            opts.push(TaskOption::TaskId(id.clone()));
        }
        opts
    }
}

#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Only show this queue.
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,

    /// Output queue depth gauges in Prometheus text format.
    #[arg(long, conflicts_with = "json")]
    pub metrics: bool,
}

#[derive(Parser, Debug)]
pub struct RecoverArgs {
    /// Run a single pass and exit.
    #[arg(long)]
    pub once: bool,

    /// Seconds between recovery passes.
    #[arg(long, default_value = "10")]
    pub interval_secs: u64,

    /// Milliseconds between forwarding passes.
    #[arg(long, default_value = "1000")]
    pub forward_interval_millis: u64,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let broker = connect(cli.redis_url.as_deref()).await?;

    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(broker, args).await,
        Commands::Stats(args) => run_stats_command(broker, args).await,
        Commands::Recover(args) => run_recover_command(broker, args).await,
    }
}

async fn connect(redis_url: Option<&str>) -> anyhow::Result<Arc<dyn Broker>> {
    let mut config = BrokerConfig::from_env()?;
    if let Some(url) = redis_url {
        config = config.with_redis_url(url);
    }
    config.validate()?;

    let broker = RedisBroker::connect(config).await?;
    Ok(Arc::new(broker))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_enqueue_command(broker: Arc<dyn Broker>, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&args.payload)
        .map_err(|e| anyhow::anyhow!("--payload is not valid JSON: {}", e))?;
    let task = Task::from_json(args.type_name.clone(), &payload)?;
    let opts = args.options();

    let client = Client::with_config(broker, ClientConfig::from_env()?);
    let info = match args.process_in_secs {
        Some(secs) => {
            let at = process_at(Utc::now(), secs)?;
            client.schedule(&task, at, &opts).await?
        }
        None => client.enqueue(&task, &opts).await?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&task_info_json(&info))?);
    } else {
        println!("Enqueued task {}", info.id);
        println!("  type:     {}", info.type_name);
        println!("  queue:    {}", info.queue);
        println!("  state:    {}", info.state);
        println!("  process:  {}", info.next_process_at.to_rfc3339());
    }

    Ok(())
}

/// Returns `now` plus `secs` seconds, failing instead of overflowing.
fn process_at(now: DateTime<Utc>, secs: u64) -> anyhow::Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .with_context(|| format!("--process-in-secs {} is out of range", secs))
}

fn task_info_json(info: &TaskInfo) -> serde_json::Value {
    serde_json::json!({
        "id": info.id,
        "queue": info.queue,
        "type": info.type_name,
        "state": info.state,
        "max_retry": info.max_retry,
        "retried": info.retried,
        "timeout_secs": info.timeout.as_secs(),
        "deadline": info.deadline,
        "next_process_at": info.next_process_at,
    })
}

async fn run_stats_command(broker: Arc<dyn Broker>, args: StatsArgs) -> anyhow::Result<()> {
    let queues = match args.queue {
        Some(queue) => vec![crate::task::normalize_queue_name(&queue)],
        None => broker.queues().await?,
    };

    let metrics = MetricsCollector::new();
    let mut stats: Vec<QueueStats> = Vec::with_capacity(queues.len());
    for queue in &queues {
        let queue_stats = broker.queue_stats(queue).await?;
        metrics.update_queue_depth(&queue_stats);
        stats.push(queue_stats);
    }
    let servers = broker.servers().await?;

    if args.metrics {
        print!("{}", export_metrics());
        return Ok(());
    }

    if args.json {
        let output = serde_json::json!({
            "queues": stats,
            "servers": servers,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if stats.is_empty() {
        println!("No queues found");
    } else {
        println!(
            "{:<20} {:>9} {:>9} {:>9} {:>9} {:>9} {:>10} {:>9}",
            "QUEUE", "PENDING", "ACTIVE", "SCHEDULED", "ARCHIVED", "COMPLETED", "PROCESSED", "FAILED"
        );
        for s in &stats {
            println!(
                "{:<20} {:>9} {:>9} {:>9} {:>9} {:>9} {:>10} {:>9}",
                s.queue, s.pending, s.active, s.scheduled, s.archived, s.completed, s.processed, s.failed
            );
        }
    }

    println!();
    println!("{} live server(s)", servers.len());
    for server in &servers {
        println!(
            "  {}  queues={}  workers={}/{}  since {}",
            server.server_id,
            server.queues.join(","),
            server.active_workers,
            server.concurrency,
            server.started_at.to_rfc3339()
        );
    }

    Ok(())
}

async fn run_recover_command(broker: Arc<dyn Broker>, args: RecoverArgs) -> anyhow::Result<()> {
    let recoverer = Recoverer::new(Arc::clone(&broker), Duration::from_secs(args.interval_secs.max(1)));
    let forwarder = Forwarder::new(
        Arc::clone(&broker),
        Duration::from_millis(args.forward_interval_millis.max(1)),
    );

    if args.once {
        let report = recoverer.recover_once().await?;
        let forwarded = forwarder.forward_once().await?;
        println!(
            "Recovered {} task(s): {} requeued, {} archived; forwarded {} scheduled task(s)",
            report.total(),
            report.requeued,
            report.archived,
            forwarded
        );
        return Ok(());
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = vec![
        tokio::spawn(recoverer.run(shutdown_tx.subscribe())),
        tokio::spawn(forwarder.run(shutdown_tx.subscribe())),
    ];

    info!("Recovery role running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Stopping recovery role");

    let _ = shutdown_tx.send(());
    for handle in handles {
        handle.await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_enqueue_command_defaults() {
        let cli = Cli::try_parse_from(["taskq", "enqueue", "send_email"]).expect("should parse");

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.type_name, "send_email");
                assert_eq!(args.payload, "{}");
                assert!(args.options().is_empty());
                assert!(args.process_in_secs.is_none());
                assert!(!args.json);
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_enqueue_command_with_options() {
        let cli = Cli::try_parse_from([
            "taskq",
            "enqueue",
            "send_email",
            "--queue",
            "Critical",
            "--max-retry",
            "-2",
            "--timeout-secs",
            "30",
            "--unique-secs",
            "60",
            "--task-id",
            "order-1",
            "--redis-url",
            "redis://cache:6380",
        ])
        .expect("should parse");

        assert_eq!(cli.redis_url.as_deref(), Some("redis://cache:6380"));
        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(
                    args.options(),
                    vec![
                        TaskOption::Queue("Critical".to_string()),
                        TaskOption::MaxRetry(-2),
                        TaskOption::Timeout(Duration::from_secs(30)),
                        TaskOption::Unique(Duration::from_secs(60)),
                        TaskOption::TaskId("order-1".to_string()),
                    ]
                );
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_recover_command() {
        let cli = Cli::try_parse_from(["taskq", "recover", "--once"]).expect("should parse");

        match cli.command {
            Commands::Recover(args) => {
                assert!(args.once);
                assert_eq!(args.interval_secs, 10);
                assert_eq!(args.forward_interval_millis, 1000);
            }
            _ => panic!("Expected Recover command"),
        }
    }

    #[test]
    fn test_stats_command() {
        let cli = Cli::try_parse_from(["taskq", "stats", "-q", "high", "--json", "-l", "debug"])
            .expect("should parse");

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Stats(args) => {
                assert_eq!(args.queue.as_deref(), Some("high"));
                assert!(args.json);
                assert!(!args.metrics);
            }
            _ => panic!("Expected Stats command"),
        }

        let cli = Cli::try_parse_from(["taskq", "stats", "--metrics"]).expect("should parse");
        match cli.command {
            Commands::Stats(args) => assert!(args.metrics),
            _ => panic!("Expected Stats command"),
        }

        assert!(Cli::try_parse_from(["taskq", "stats", "--metrics", "--json"]).is_err());
    }

    #[test]
    fn test_process_at_rejects_out_of_range_delay() {
        let now = Utc::now();

        assert_eq!(
            process_at(now, 90).expect("in range"),
            now + TimeDelta::seconds(90)
        );
        assert!(process_at(now, u64::MAX).is_err());
        assert!(process_at(now, i64::MAX as u64).is_err());

        let err = process_at(now, u64::MAX).expect_err("out of range");
        assert!(err.to_string().contains("--process-in-secs"));
    }
}
