//! topicscope CLI
//!
//! Consume Kafka topics into a local record cache and browse the cache.
//!
//! ## Quick Start
//!
//! ```bash
//! # List topics of a configured cluster
//! topicscope topics --cluster local
//!
//! # Consume a topic from the beginning, Ctrl-C to stop
//! topicscope consume --cluster local --topic orders --from earliest
//!
//! # Consume a time window
//! topicscope consume --cluster local --topic orders --from custom \
//!     --start-ms 1700000000000 --stop-ms 1700003600000
//!
//! # Page through cached records (no broker needed)
//! topicscope records --cluster local --topic orders --offset 0 --limit 20
//!
//! # Only records whose payload mentions "failed"
//! topicscope records -c local -t orders --contains failed
//! ```
//!
//! ## Configuration
//!
//! Clusters are declared in `topicscope.toml`, located with `--config`,
//! `TOPICSCOPE_CONFIG`, or the platform config directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use topicscope_core::config::{Authentication, Config, LogFormat};
use topicscope_core::error::format_error_with_remediation;
use topicscope_core::job::JobState;
use topicscope_core::logging::{LogConfig, init_logging};
use topicscope_core::store::{ConsumedRecord, RecordFilter};
use topicscope_core::{ConsumptionPolicy, Engine};
use tracing::debug;

#[derive(Parser)]
#[command(name = "topicscope", version)]
#[command(about = "Consume Kafka topics into a local cache and browse them", long_about = None)]
struct Cli {
    /// Config file (default: <config_dir>/topicscope/topicscope.toml)
    #[arg(long, global = true, env = "TOPICSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TopicArgs {
    /// Cluster id from the config file
    #[arg(short, long)]
    cluster: String,
    /// Topic name
    #[arg(short, long)]
    topic: String,
}

/// Narrow cached records. Flags combine; without any, every row matches.
#[derive(Args, Default)]
struct FilterArgs {
    /// Only this partition
    #[arg(long)]
    partition: Option<i32>,
    /// Key contains this text
    #[arg(long)]
    key: Option<String>,
    /// Payload contains this text
    #[arg(long)]
    contains: Option<String>,
    /// Timestamp at or after, epoch milliseconds
    #[arg(long)]
    from_ms: Option<i64>,
    /// Timestamp at or before, epoch milliseconds
    #[arg(long)]
    to_ms: Option<i64>,
}

impl FilterArgs {
    fn into_filter(self) -> RecordFilter {
        RecordFilter {
            partition: self.partition,
            key_contains: self.key,
            payload_contains: self.contains,
            from_timestamp_ms: self.from_ms,
            to_timestamp_ms: self.to_ms,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StartFrom {
    Earliest,
    Latest,
    Custom,
}

#[derive(Subcommand)]
enum Commands {
    /// List topics of a cluster with partition metadata
    Topics {
        /// Cluster id from the config file
        #[arg(short, long)]
        cluster: String,
    },
    /// Show partitions, watermarks and configuration of a topic
    Info(TopicArgs),
    /// Consume a topic into the local cache
    Consume {
        #[command(flatten)]
        target: TopicArgs,
        /// Where to start reading
        #[arg(long, value_enum, default_value = "earliest")]
        from: StartFrom,
        /// Start timestamp in epoch milliseconds (with --from custom)
        #[arg(long)]
        start_ms: Option<i64>,
        /// Inclusive stop timestamp in epoch milliseconds (with --from custom)
        #[arg(long)]
        stop_ms: Option<i64>,
        /// Stop the consumer after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Page through cached records
    Records {
        #[command(flatten)]
        target: TopicArgs,
        #[command(flatten)]
        filter: FilterArgs,
        /// First row to show (first match when filtering)
        #[arg(long, default_value_t = 0)]
        offset: i64,
        /// Maximum rows to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Number of cached records of a topic
    Count {
        #[command(flatten)]
        target: TopicArgs,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Drop the cached records of a topic
    Clear(TopicArgs),
    /// List locally cached topics
    Cached,
    /// Show the effective configuration
    Config,
}

fn policy(from: StartFrom, start_ms: Option<i64>, stop_ms: Option<i64>) -> Result<ConsumptionPolicy> {
    match from {
        StartFrom::Earliest | StartFrom::Latest if start_ms.is_some() || stop_ms.is_some() => {
            bail!("--start-ms and --stop-ms require --from custom")
        }
        StartFrom::Earliest => Ok(ConsumptionPolicy::Earliest),
        StartFrom::Latest => Ok(ConsumptionPolicy::Latest),
        StartFrom::Custom => {
            let start = start_ms.context("--from custom requires --start-ms")?;
            Ok(ConsumptionPolicy::Custom {
                start_timestamp_ms: start,
                stop_timestamp_ms: stop_ms,
            })
        }
    }
}

fn format_timestamp(ts: Option<i64>) -> String {
    ts.and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map_or_else(
            || "-".to_string(),
            |dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        )
}

fn preview(text: Option<&str>, max: usize) -> String {
    let Some(text) = text else {
        return "<null>".to_string();
    };
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max || line.len() < text.len() {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

fn print_records(records: &[ConsumedRecord]) {
    println!(
        "{:>8}  {:>4}  {:>10}  {:<23}  {:<16}  PAYLOAD",
        "ROW", "PART", "OFFSET", "TIMESTAMP", "KEY"
    );
    for record in records {
        let payload = match &record.decode_error {
            Some(err) => format!("{} ({err})", preview(record.payload.as_deref(), 40)),
            None => preview(record.payload.as_deref(), 80),
        };
        println!(
            "{:>8}  {:>4}  {:>10}  {:<23}  {:<16}  {}",
            record.insertion_seq,
            record.partition,
            record.offset,
            format_timestamp(record.timestamp_ms),
            preview(record.key.as_deref(), 16),
            payload
        );
    }
}

async fn consume(
    engine: &Engine,
    target: &TopicArgs,
    policy: ConsumptionPolicy,
    timeout: Option<Duration>,
) -> Result<()> {
    let (cluster, topic) = (target.cluster.as_str(), target.topic.as_str());
    engine.start_consumer(cluster, topic, policy).await?;
    println!("Consuming {cluster}/{topic} from {policy} (Ctrl-C to stop)");

    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_count = -1;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("Stopping...");
                engine.stop_consumer(cluster, topic).await?;
                break;
            }
            _ = ticker.tick() => {
                let status = engine.consumer_status(cluster, topic).await?;
                if status.record_count != last_count {
                    println!("  {} records", status.record_count);
                    last_count = status.record_count;
                }
                if !status.is_running {
                    break;
                }
                if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    println!("Timeout reached, stopping...");
                    engine.stop_consumer(cluster, topic).await?;
                    break;
                }
            }
        }
    }

    let state = engine
        .wait_for_consumer(cluster, topic, Duration::from_secs(30))
        .await?;
    let count = engine.record_count(cluster, topic).await?;
    if let Some(snapshot) = engine.consumer_snapshot(cluster, topic).await? {
        for cursor in &snapshot.partitions {
            debug!(
                partition = cursor.partition,
                next_offset = cursor.next_offset,
                done = cursor.done,
                "Partition cursor"
            );
        }
    }
    match state {
        JobState::Failed(reason) => bail!("consumer failed after {count} records: {reason}"),
        state => println!("Consumer {state}: {count} records cached"),
    }
    Ok(())
}

fn show_config(config: &Config, path: Option<&PathBuf>) {
    match path {
        Some(path) => println!("Config file:   {}", path.display()),
        None => println!("Config file:   (defaults)"),
    }
    println!("Data dir:      {}", config.data_dir().display());
    println!("Record store:  {}", config.db_path().display());
    println!(
        "Consumer:      poll {} ms, batch {} records, decoder {:?}",
        config.consumer.poll_timeout_ms, config.consumer.max_batch_records, config.consumer.decoder
    );
    if config.clusters.is_empty() {
        println!("Clusters:      none");
        return;
    }
    println!("Clusters:");
    for cluster in &config.clusters {
        let auth = match cluster.authentication {
            Authentication::None => "none",
            Authentication::Sasl { .. } => "sasl",
            Authentication::Ssl { .. } => "ssl",
        };
        println!(
            "  {:<12} {:<30} auth={auth} {}",
            cluster.id, cluster.endpoint, cluster.name
        );
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| Config::default_path().filter(|p| p.exists()));
    let config = Config::load(config_path.as_deref())?;

    let log = LogConfig {
        level: cli
            .log_level
            .clone()
            .unwrap_or_else(|| config.general.log_level.clone()),
        format: cli.log_format.unwrap_or(config.general.log_format),
        file: None,
    };
    init_logging(&log).context("failed to initialize logging")?;

    if let Commands::Config = cli.command {
        show_config(&config, config_path.as_ref());
        return Ok(());
    }

    let engine = Engine::open(config)?;
    match cli.command {
        Commands::Topics { cluster } => {
            let topics = engine.list_topics(&cluster).await?;
            println!("{:<40} {:>10} {:>8} {:>8}", "TOPIC", "PARTITIONS", "REPL", "ISR");
            for topic in topics {
                let replicas = topic.partitions.iter().map(|p| p.replicas).max().unwrap_or(0);
                let isr = topic.partitions.iter().map(|p| p.isr).min().unwrap_or(0);
                println!(
                    "{:<40} {:>10} {:>8} {:>8}",
                    topic.name,
                    topic.partitions.len(),
                    replicas,
                    isr
                );
            }
        }
        Commands::Info(target) => {
            let details = engine.topic_info(&target.cluster, &target.topic).await?;
            println!("{} ({} records retained)", details.name, details.retained_records());
            println!("{:>6} {:>8} {:>8} {:>12} {:>12}", "PART", "REPL", "ISR", "LOW", "HIGH");
            for p in &details.partitions {
                println!(
                    "{:>6} {:>8} {:>8} {:>12} {:>12}",
                    p.id, p.replicas, p.isr, p.low_watermark, p.high_watermark
                );
            }
            if !details.configurations.is_empty() {
                println!();
                println!("{:<40} VALUE", "CONFIG");
                for (name, value) in &details.configurations {
                    println!("{:<40} {}", name, value.as_deref().unwrap_or("<hidden>"));
                }
            }
        }
        Commands::Consume {
            target,
            from,
            start_ms,
            stop_ms,
            timeout_secs,
        } => {
            let policy = policy(from, start_ms, stop_ms)?;
            consume(&engine, &target, policy, timeout_secs.map(Duration::from_secs)).await?;
        }
        Commands::Records {
            target,
            filter,
            offset,
            limit,
            json,
        } => {
            let filter = filter.into_filter();
            let records = if filter.is_empty() {
                engine
                    .fetch_records(&target.cluster, &target.topic, offset, limit)
                    .await?
            } else {
                engine
                    .query_records(&target.cluster, &target.topic, filter, offset, limit)
                    .await?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No records at row {offset}");
            } else {
                print_records(&records);
            }
        }
        Commands::Count { target, filter } => {
            let filter = filter.into_filter();
            let count = if filter.is_empty() {
                engine.record_count(&target.cluster, &target.topic).await?
            } else {
                engine
                    .count_matching(&target.cluster, &target.topic, filter)
                    .await?
            };
            println!("{count}");
        }
        Commands::Clear(target) => {
            let removed = engine.clear_records(&target.cluster, &target.topic).await?;
            println!("Removed {removed} records");
        }
        Commands::Cached => {
            let topics = engine.cached_topics().await?;
            if topics.is_empty() {
                println!("No cached topics");
            }
            for topic in topics {
                println!("{}/{} {}", topic.cluster_id, topic.topic, topic.records);
            }
        }
        Commands::Config => {}
    }

    engine.shutdown().await;
    Ok(())
}

fn report(err: &anyhow::Error) {
    if let Some(core) = err.downcast_ref::<topicscope_core::Error>() {
        eprintln!("{}", format_error_with_remediation(core));
    } else {
        eprintln!("Error: {err:#}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}
