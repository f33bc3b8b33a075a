//! Core types shared by every pipeline stage
//!
//! The staged-file naming convention defined here is the contract between the
//! fetcher (writer) and the bundler (reader). Version it carefully: both
//! sides parse names produced by the other.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, WdsError};

/// Separator between a batch prefix and the row index in staged file names.
///
/// A staged pair for row 17 of batch `00042-0-500` is named
/// `00042-0-500--17.jpg` / `00042-0-500--17.json`. Files without this
/// separator in their name (temp files, the downloaded tabular shard, tar
/// archives under construction) are invisible to the bundler's scan.
pub const STAGED_SEPARATOR: &str = "--";

/// Identifies one logical batch of rows within a source shard.
///
/// `batch_id` encodes the half-open row range the batch covers, so
/// `BatchKey { source_id: "00042", batch_id: "0-500" }` renders as the
/// prefix `00042-0-500`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub source_id: String,
    pub batch_id: String,
}

impl BatchKey {
    pub fn new(source_id: impl Into<String>, batch_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            batch_id: batch_id.into(),
        }
    }

    /// Build the key for the batch covering rows `[start, end)`.
    pub fn from_rows(source_id: &str, start: usize, end: usize) -> Self {
        Self {
            source_id: source_id.to_string(),
            batch_id: format!("{start}-{end}"),
        }
    }

    /// The staged-file and archive prefix: `{source_id}-{batch_id}`.
    pub fn prefix(&self) -> String {
        format!("{}-{}", self.source_id, self.batch_id)
    }

    /// Parse a prefix back into its key. The source id is everything before
    /// the first `-`; the batch id is the remainder.
    pub fn parse_prefix(prefix: &str) -> Result<Self> {
        match prefix.split_once('-') {
            Some((source_id, batch_id)) if !source_id.is_empty() && !batch_id.is_empty() => {
                Ok(Self::new(source_id, batch_id))
            }
            _ => Err(WdsError::InvalidPrefix(prefix.to_string())),
        }
    }

    /// Object-storage key for this batch's archive.
    pub fn archive_key(&self, shard_prefix: &str) -> String {
        format!("{}/{}.tar", shard_prefix, self.prefix())
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Name of a staged asset file.
pub fn staged_file_name(prefix: &str, row_index: usize, ext: &str) -> String {
    format!("{prefix}{STAGED_SEPARATOR}{row_index}.{ext}")
}

/// Name of a staged metadata sidecar.
pub fn sidecar_name(prefix: &str, row_index: usize) -> String {
    staged_file_name(prefix, row_index, "json")
}

/// The batch prefix of a staged file name, if it follows the contract.
pub fn prefix_of(file_name: &str) -> Option<&str> {
    file_name.split_once(STAGED_SEPARATOR).map(|(p, _)| p)
}

/// Fully-qualified location of an uploaded shard archive.
///
/// Rendered as `s3://{bucket}/{key}`; this string form is what travels on
/// the downstream queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardLocator {
    pub bucket: String,
    pub key: String,
}

impl ShardLocator {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Base file name of the archive (e.g. `00042-0-500.tar`).
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for ShardLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for ShardLocator {
    type Err = WdsError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("s3://")
            .ok_or_else(|| WdsError::InvalidLocator(s.to_string()))?;
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::new(bucket, key))
            }
            _ => Err(WdsError::InvalidLocator(s.to_string())),
        }
    }
}
