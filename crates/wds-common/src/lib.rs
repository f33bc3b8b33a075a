//! WDS Common Library
//!
//! Shared contracts and clients for the WDS shard pipeline.
//!
//! # Overview
//!
//! This crate provides the pieces every pipeline stage agrees on:
//!
//! - **Error Handling**: the shared error type and result alias
//! - **Logging**: tracing subscriber setup, env-driven
//! - **Types**: batch keys, the staged-file naming contract, shard locators
//! - **Queue / Ledger / Storage**: trait seams plus the SQS, DynamoDB and S3
//!   implementations used in production
//! - **Testing**: in-memory queue/ledger/store fakes for tests
//!
//! # Example
//!
//! ```no_run
//! use wds_common::types::BatchKey;
//!
//! let key = BatchKey::from_rows("00042", 0, 500);
//! assert_eq!(key.prefix(), "00042-0-500");
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod aws;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod queue;
pub mod storage;
pub mod testing;
pub mod types;

// Re-export commonly used types
pub use error::{Result, WdsError};
