//! Producer side of the webdataset pipeline
//!
//! A materialize worker pulls tabular-shard URLs off the work queue, fetches
//! each row's remote asset into a staging directory, and bundles quiescent
//! batches into tar archives that are uploaded, recorded in the dedup
//! ledger, and announced on the downstream shard queue.
//!
//! Module map:
//! - [`dispatcher`]: the queue loop tying everything together
//! - [`fetcher`]: tabular-shard download and per-row asset fetching
//! - [`bundler`]: quiescence detection, tar packaging, upload
//! - [`guard`]: one-shot requeue of in-progress work on spot preemption
//! - [`seed`]: operator commands that fill or rebuild queues

pub mod bundler;
pub mod config;
pub mod dispatcher;
pub mod fetcher;
pub mod guard;
pub mod seed;
