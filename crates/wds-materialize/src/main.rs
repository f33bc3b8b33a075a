//! WDS Materialize - webdataset shard producer

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use wds_common::aws::load_clients;
use wds_common::ledger::DynamoLedger;
use wds_common::logging::{init_logging, LogConfig, LogLevel};
use wds_common::queue::SqsQueue;
use wds_common::storage::S3Store;

use wds_materialize::bundler::Bundler;
use wds_materialize::config::MaterializeConfig;
use wds_materialize::dispatcher::{DispatchConfig, Dispatcher};
use wds_materialize::fetcher::BatchFetcher;
use wds_materialize::guard::SpotInstanceProbe;
use wds_materialize::seed;

#[derive(Parser, Debug)]
#[command(name = "wds-materialize")]
#[command(author, version, about = "Materializes tabular rows into webdataset shards")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run a materialize worker until the queue drains or the quota fills
    Run,

    /// Publish tabular-shard URLs from a manifest file onto the work queue
    SeedWork {
        /// Manifest file with one shard URL per line
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Rebuild the downstream shard queue from the archives in storage
    RebuildShardQueue,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env()
        .unwrap_or_default()
        .with_file_prefix("wds-materialize");
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    init_logging(&log_config)?;

    let config = MaterializeConfig::load()?;
    let clients = load_clients(config.queues.aws_endpoint.as_deref()).await;

    let work_queue = Arc::new(SqsQueue::new(
        clients.sqs.clone(),
        config.queues.work_queue_url.clone(),
    ));
    let shard_queue = Arc::new(SqsQueue::new(
        clients.sqs.clone(),
        config.queues.shard_queue_url.clone(),
    ));
    let ledger = Arc::new(DynamoLedger::new(
        clients.dynamodb.clone(),
        config.queues.ledger_table.clone(),
    ));
    let store = Arc::new(S3Store::new(
        clients.s3.clone(),
        config.storage.bucket.clone(),
    ));

    match cli.command {
        Command::Run => {
            let fetcher = BatchFetcher::new(
                Arc::clone(&ledger) as _,
                config.storage.staging_dir.clone(),
                config.fetch.clone(),
            );

            let mut bundler = Bundler::new(
                config.storage.staging_dir.clone(),
                Arc::clone(&store) as _,
                Arc::clone(&ledger) as _,
                Arc::clone(&shard_queue) as _,
                config.storage.shard_prefix.clone(),
                config.bundle.clone(),
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let bundler_task = tokio::spawn(async move { bundler.run(shutdown_rx).await });

            let dispatcher = Dispatcher::new(
                Arc::clone(&work_queue) as _,
                Arc::clone(&ledger) as _,
                Arc::new(SpotInstanceProbe::new()),
                DispatchConfig::from(&config.dispatch),
            );
            let reason = dispatcher.run(&fetcher).await?;
            info!(?reason, "Dispatcher stopped");

            // Let the bundler ship anything already over the threshold.
            let _ = shutdown_tx.send(true);
            bundler_task.await??;
        }
        Command::SeedWork { manifest } => {
            let published = seed::seed_work_queue(work_queue, &manifest).await?;
            info!(published, "Work queue seeded");
        }
        Command::RebuildShardQueue => {
            let published = seed::rebuild_shard_queue(
                shard_queue,
                store,
                &config.storage.shard_prefix,
            )
            .await?;
            info!(published, "Shard queue rebuilt");
        }
    }

    Ok(())
}
