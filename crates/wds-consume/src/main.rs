//! WDS Consume - webdataset shard consumer for training hosts

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use wds_common::aws::load_clients;
use wds_common::logging::{init_logging, LogConfig, LogLevel};
use wds_common::queue::SqsQueue;
use wds_common::storage::S3Store;

use wds_consume::config::ConsumeConfig;
use wds_consume::puller::ShardPuller;
use wds_consume::stream::ShardStream;

#[derive(Parser, Debug)]
#[command(name = "wds-consume")]
#[command(author, version, about = "Pulls and streams webdataset shards")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Keep the local shard cache topped up from the shard queue
    Pull,

    /// Stream decoded samples from the local cache, printing a summary
    Drain {
        /// Stop after this many samples
        #[arg(short, long)]
        limit: Option<usize>,

        /// Seconds between cache scans while waiting for shards
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env()
        .unwrap_or_default()
        .with_file_prefix("wds-consume");
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    init_logging(&log_config)?;

    let config = ConsumeConfig::load()?;

    match cli.command {
        Command::Pull => {
            let clients = load_clients(config.aws_endpoint.as_deref()).await;
            let queue = Arc::new(SqsQueue::new(
                clients.sqs.clone(),
                config.shard_queue_url.clone(),
            ));
            let store = Arc::new(S3Store::new(clients.s3.clone(), config.bucket.clone()));

            let puller = ShardPuller::new(queue, store, config);

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                    let _ = shutdown_tx.send(true);
                }
            });

            puller.run(shutdown_rx).await?;
        }
        Command::Drain { limit, poll_secs } => {
            let shard_dir = config.shard_dir.clone();
            let samples = tokio::task::spawn_blocking(move || {
                let mut stream = ShardStream::new(shard_dir, Duration::from_secs(poll_secs));
                let stop = stream.stop_handle();
                let mut count = 0usize;

                for sample in &mut stream {
                    count += 1;
                    info!(
                        name = sample.name,
                        width = sample.image.width(),
                        height = sample.image.height(),
                        has_metadata = sample.metadata.is_some(),
                        "Sample"
                    );
                    if limit.is_some_and(|limit| count >= limit) {
                        stop.store(true, std::sync::atomic::Ordering::SeqCst);
                        break;
                    }
                }

                count
            })
            .await?;

            info!(samples, "Drain finished");
        }
    }

    Ok(())
}
