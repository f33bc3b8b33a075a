//! Batch fetcher
//!
//! Turns one tabular shard (a remote parquet file of `(URL, metadata)` rows)
//! into staged asset/sidecar pairs on local disk. Rows are grouped into
//! fixed-size batches by position; a batch whose id is already in the dedup
//! ledger is skipped wholesale. Asset downloads run under a bounded
//! concurrency window so one shard's 30k-row chunks do not open 30k sockets.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wds_common::ledger::DedupLedger;
use wds_common::types::{sidecar_name, staged_file_name, BatchKey};

use crate::config::FetchConfig;
use crate::dispatcher::WorkHandler;

/// Progress log interval, in completed downloads.
const PROGRESS_EVERY: u64 = 500;

/// Extensions passed through from the asset URL; everything else is staged
/// as jpg.
const KNOWN_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Outcome of materializing one tabular shard.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub rows_seen: u64,
    /// Rows skipped because their batch was already uploaded.
    pub rows_skipped: u64,
    pub fetched: u64,
    /// Rows with no usable URL or whose download failed.
    pub dropped: u64,
}

/// Fetches a tabular shard's assets into the staging directory.
pub struct BatchFetcher {
    client: reqwest::Client,
    ledger: Arc<dyn DedupLedger>,
    staging: PathBuf,
    config: FetchConfig,
}

impl BatchFetcher {
    pub fn new(ledger: Arc<dyn DedupLedger>, staging: PathBuf, config: FetchConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            ledger,
            staging,
            config,
        }
    }

    /// Materialize every non-deduplicated row of the shard at `url`.
    pub async fn materialize(&self, url: &str) -> Result<FetchStats> {
        let source_id = parse_source_id(url)?;
        info!(source_id, url, "Materializing tabular shard");

        let shard_path = self.staging.join(format!("{source_id}.parquet"));
        self.download_shard(url, &shard_path).await?;

        let uploaded = self.ledger.uploaded_batches(&source_id).await;
        if !uploaded.is_empty() {
            info!(
                source_id,
                already_uploaded = uploaded.len(),
                "Resuming partially materialized shard"
            );
        }

        let result = self.fetch_rows(&source_id, &shard_path, &uploaded).await;

        // The shard is consumed either way; keep staging free of parquet
        // files so disk pressure tracks staged pairs only.
        if let Err(e) = tokio::fs::remove_file(&shard_path).await {
            warn!("Failed to remove {}: {e}", shard_path.display());
        }

        result
    }

    async fn download_shard(&self, url: &str, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.staging)
            .await
            .context("Failed to create staging directory")?;

        let mut request = self
            .client
            .get(url)
            .timeout(Duration::from_secs(self.config.request_timeout_secs));

        if let Some(ref token) = self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to fetch tabular shard {url}"))?
            .error_for_status()
            .with_context(|| format!("Tabular shard host rejected {url}"))?;

        let data = response
            .bytes()
            .await
            .context("Failed to read tabular shard body")?;

        tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        debug!(bytes = data.len(), path = %path.display(), "Downloaded tabular shard");

        Ok(())
    }

    async fn fetch_rows(
        &self,
        source_id: &str,
        shard_path: &Path,
        uploaded: &HashSet<String>,
    ) -> Result<FetchStats> {
        let file = std::fs::File::open(shard_path)
            .with_context(|| format!("Failed to open {}", shard_path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .context("Failed to read parquet metadata")?
            .with_batch_size(self.config.chunk_size)
            .build()
            .context("Failed to build parquet reader")?;

        let mut stats = FetchStats::default();
        let mut in_flight: FuturesUnordered<JoinHandle<bool>> = FuturesUnordered::new();
        let started = Instant::now();
        let mut row_index: usize = 0;

        for chunk in reader {
            let chunk = chunk.context("Failed to decode parquet chunk")?;
            let rows = record_batch_rows(&chunk)?;

            for row in rows {
                let index = row_index;
                row_index += 1;
                stats.rows_seen += 1;

                let batch_start = (index / self.config.batch_size) * self.config.batch_size;
                let batch_end = batch_start + self.config.batch_size;
                let key = BatchKey::from_rows(source_id, batch_start, batch_end);

                if uploaded.contains(&key.batch_id) {
                    stats.rows_skipped += 1;
                    continue;
                }

                let Some(asset_url) = row_url(&row) else {
                    stats.dropped += 1;
                    continue;
                };

                while in_flight.len() >= self.config.concurrency {
                    if let Some(done) = in_flight.next().await {
                        tally(&mut stats, done, started);
                    }
                }

                let client = self.client.clone();
                let staging = self.staging.clone();
                let prefix = key.prefix();
                let timeout = Duration::from_secs(self.config.request_timeout_secs);

                in_flight.push(tokio::spawn(async move {
                    match fetch_one(&client, &asset_url, &staging, &prefix, index, &row, timeout)
                        .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(row = index, "Dropping row: {e:#}");
                            false
                        }
                    }
                }));
            }
        }

        while let Some(done) = in_flight.next().await {
            tally(&mut stats, done, started);
        }

        info!(
            source_id,
            rows = stats.rows_seen,
            skipped = stats.rows_skipped,
            fetched = stats.fetched,
            dropped = stats.dropped,
            elapsed_secs = started.elapsed().as_secs(),
            "Finished materializing tabular shard"
        );

        Ok(stats)
    }
}

#[async_trait]
impl WorkHandler for BatchFetcher {
    async fn process(&self, body: &str) -> Result<()> {
        self.materialize(body.trim()).await?;
        Ok(())
    }
}

fn tally(stats: &mut FetchStats, done: Result<bool, tokio::task::JoinError>, started: Instant) {
    match done {
        Ok(true) => stats.fetched += 1,
        Ok(false) => stats.dropped += 1,
        Err(e) => {
            warn!("Fetch task panicked: {e}");
            stats.dropped += 1;
        }
    }

    let completed = stats.fetched + stats.dropped;
    if completed % PROGRESS_EVERY == 0 {
        let rate = completed as f64 / started.elapsed().as_secs_f64().max(0.001);
        info!(
            fetched = stats.fetched,
            dropped = stats.dropped,
            rows_per_sec = format!("{rate:.1}"),
            "Fetch progress"
        );
    }
}

/// Download one asset and write its pair. Files land under temporary names
/// first and are renamed into place, so the bundler never sees half-written
/// pairs.
async fn fetch_one(
    client: &reqwest::Client,
    url: &str,
    staging: &Path,
    prefix: &str,
    row_index: usize,
    row: &Value,
    timeout: Duration,
) -> Result<()> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .context("Request failed")?
        .error_for_status()
        .context("Host rejected request")?;

    let data = response.bytes().await.context("Failed to read body")?;
    if data.is_empty() {
        bail!("Empty response body");
    }

    let ext = asset_extension(url);
    let asset_tmp = staging.join(format!(".tmp-{row_index}.{ext}"));
    let sidecar_tmp = staging.join(format!(".tmp-{row_index}.json"));

    tokio::fs::write(&asset_tmp, &data).await?;
    tokio::fs::write(&sidecar_tmp, serde_json::to_vec(row)?).await?;

    // Sidecar first: the bundler treats an asset without its sidecar as an
    // incomplete pair, but never the reverse.
    tokio::fs::rename(&sidecar_tmp, staging.join(sidecar_name(prefix, row_index))).await?;
    tokio::fs::rename(&asset_tmp, staging.join(staged_file_name(prefix, row_index, ext))).await?;

    Ok(())
}

/// Derive a stable source id from the tabular shard URL.
///
/// Hive-style `part-NNNNN-...` names yield the part number; anything else
/// falls back to the file stem.
pub fn parse_source_id(url: &str) -> Result<String> {
    let name = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .ok_or_else(|| anyhow!("No file name in shard URL: {url}"))?;
    let name = name.split('?').next().unwrap_or(name);

    if name.is_empty() {
        bail!("No file name in shard URL: {url}");
    }

    if let Some(rest) = name.split("part-").nth(1) {
        let id: String = rest.chars().take_while(|c| c.is_ascii_alphanumeric()).collect();
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let stem = name.split('.').next().unwrap_or(name);
    if stem.is_empty() {
        bail!("No usable source id in shard URL: {url}");
    }

    Ok(stem.to_string())
}

/// Convert one arrow record batch into per-row JSON objects.
fn record_batch_rows(batch: &arrow::record_batch::RecordBatch) -> Result<Vec<Value>> {
    let mut buf = Vec::new();
    {
        let mut writer = arrow::json::LineDelimitedWriter::new(&mut buf);
        writer
            .write_batches(&[batch])
            .context("Failed to serialize parquet rows")?;
        writer.finish().context("Failed to flush row serializer")?;
    }

    let mut rows = Vec::with_capacity(batch.num_rows());
    for line in buf.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        rows.push(serde_json::from_slice(line).context("Malformed row JSON")?);
    }

    Ok(rows)
}

/// The asset URL of a row, if present and non-empty.
fn row_url(row: &Value) -> Option<String> {
    let object = row.as_object()?;
    let url = object
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("url"))
        .and_then(|(_, v)| v.as_str())?
        .trim();

    if url.is_empty() || !url.starts_with("http") {
        return None;
    }

    Some(url.to_string())
}

fn asset_extension(url: &str) -> &'static str {
    let path = url.split('?').next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    KNOWN_EXTENSIONS
        .iter()
        .find(|known| **known == ext)
        .copied()
        .unwrap_or("jpg")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_source_id_part_naming() {
        let url = "https://example.com/data/part-00042-c9a1f2.snappy.parquet";
        assert_eq!(parse_source_id(url).unwrap(), "00042");
    }

    #[test]
    fn test_parse_source_id_plain_stem() {
        assert_eq!(
            parse_source_id("https://example.com/shards/train_0017.parquet").unwrap(),
            "train_0017"
        );
    }

    #[test]
    fn test_parse_source_id_ignores_query() {
        let url = "https://example.com/part-00003-xyz.parquet?X-Amz-Signature=abc";
        assert_eq!(parse_source_id(url).unwrap(), "00003");
    }

    #[test]
    fn test_row_url_extraction() {
        assert_eq!(
            row_url(&json!({"URL": "https://img.example/1.jpg", "TEXT": "a photo"})),
            Some("https://img.example/1.jpg".to_string())
        );
        assert_eq!(
            row_url(&json!({"url": " https://img.example/2.png "})),
            Some("https://img.example/2.png".to_string())
        );
        assert_eq!(row_url(&json!({"URL": ""})), None);
        assert_eq!(row_url(&json!({"URL": "ftp://img.example/3.jpg"})), None);
        assert_eq!(row_url(&json!({"TEXT": "no url column"})), None);
    }

    #[test]
    fn test_asset_extension() {
        assert_eq!(asset_extension("https://x/y.png"), "png");
        assert_eq!(asset_extension("https://x/y.JPEG?sig=1"), "jpeg");
        assert_eq!(asset_extension("https://x/y.bin"), "jpg");
        assert_eq!(asset_extension("https://x/y"), "jpg");
    }

    #[test]
    fn test_record_batch_rows() {
        use arrow::array::StringArray;
        use arrow::datatypes::{DataType, Field, Schema};
        use arrow::record_batch::RecordBatch;
        use std::sync::Arc;

        let schema = Arc::new(Schema::new(vec![
            Field::new("URL", DataType::Utf8, false),
            Field::new("TEXT", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec!["https://a/1.jpg", "https://a/2.jpg"])),
                Arc::new(StringArray::from(vec![Some("one"), None])),
            ],
        )
        .unwrap();

        let rows = record_batch_rows(&batch).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["URL"], "https://a/1.jpg");
        assert_eq!(rows[0]["TEXT"], "one");
        assert!(rows[1].get("TEXT").is_none() || rows[1]["TEXT"].is_null());
    }
}
