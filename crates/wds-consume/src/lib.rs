//! Consumer side of the webdataset pipeline
//!
//! Runs on training hosts. The [`puller`] keeps a bounded local cache of
//! shard archives topped up from the shard queue; the [`stream`] module
//! turns those archives into an iterator of decoded samples, claiming each
//! archive exclusively so co-located readers never hand out the same row
//! twice.

pub mod config;
pub mod puller;
pub mod stream;
