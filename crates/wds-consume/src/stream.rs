//! Streaming sample reader
//!
//! A synchronous iterator over the samples inside locally cached shard
//! archives, meant to be driven from a training loop's data thread. Each
//! archive is claimed with an atomic rename before it is opened, so any
//! number of reader processes can share one cache directory without
//! double-serving rows. Consumed archives are deleted; a crash mid-archive
//! loses at most that one shard, which the producer side can re-ship.

use anyhow::{Context, Result};
use image::DynamicImage;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Suffix of archives ready to be claimed.
pub const READY_SUFFIX: &str = ".ready.tar";

/// Suffix an archive gets once a reader owns it.
pub const CLAIMED_SUFFIX: &str = ".claimed.tar";

/// One decoded training sample.
pub struct Sample {
    /// Row name inside the archive, e.g. `00042-0-500--17`.
    pub name: String,
    pub image: DynamicImage,
    pub metadata: Option<Value>,
}

struct PendingSample {
    name: String,
    asset: Vec<u8>,
    sidecar: Option<Vec<u8>>,
}

/// Iterator over samples in a shard cache directory.
///
/// Blocks (sleeping `poll` between scans) when no archive is available, on
/// the assumption that the puller is refilling the cache. Call
/// [`ShardStream::stop_handle`] and flip the flag to end the stream; the
/// samples of an already-claimed archive are drained first.
pub struct ShardStream {
    dir: PathBuf,
    poll: Duration,
    stop: Arc<AtomicBool>,
    pending: VecDeque<PendingSample>,
    current: Option<PathBuf>,
}

impl ShardStream {
    pub fn new(dir: impl Into<PathBuf>, poll: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll,
            stop: Arc::new(AtomicBool::new(false)),
            pending: VecDeque::new(),
            current: None,
        }
    }

    /// Flag that ends the stream when set to true.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn finish_current(&mut self) {
        if let Some(path) = self.current.take() {
            debug!(path = %path.display(), "Shard fully consumed, deleting");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove {}: {e}", path.display());
            }
        }
    }
}

impl Iterator for ShardStream {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        loop {
            while let Some(pending) = self.pending.pop_front() {
                match image::load_from_memory(&pending.asset) {
                    Ok(image) => {
                        let metadata = pending.sidecar.as_deref().and_then(|raw| {
                            match serde_json::from_slice(raw) {
                                Ok(value) => Some(value),
                                Err(e) => {
                                    warn!(name = pending.name, "Unreadable sidecar: {e}");
                                    None
                                }
                            }
                        });
                        return Some(Sample {
                            name: pending.name,
                            image,
                            metadata,
                        });
                    }
                    Err(e) => {
                        warn!(name = pending.name, "Skipping undecodable sample: {e}");
                    }
                }
            }

            self.finish_current();

            if self.stopped() {
                return None;
            }

            match claim_ready_shard(&self.dir) {
                Ok(Some(path)) => match load_shard(&path) {
                    Ok(pending) => {
                        info!(path = %path.display(), samples = pending.len(), "Claimed shard");
                        self.pending = pending;
                        self.current = Some(path);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), "Unreadable shard, discarding: {e:#}");
                        if let Err(rm) = std::fs::remove_file(&path) {
                            warn!("Failed to remove {}: {rm}", path.display());
                        }
                    }
                },
                Ok(None) => {
                    if self.stopped() {
                        return None;
                    }
                    std::thread::sleep(self.poll);
                }
                Err(e) => {
                    warn!("Failed to scan shard cache: {e:#}");
                    std::thread::sleep(self.poll);
                }
            }
        }
    }
}

impl Drop for ShardStream {
    fn drop(&mut self) {
        // An abandoned claimed archive would otherwise be stranded.
        self.finish_current();
    }
}

/// Claim the first available ready archive via atomic rename.
///
/// A rename that fails means another reader got there first; the scan just
/// moves on to the next candidate.
pub fn claim_ready_shard(dir: &Path) -> Result<Option<PathBuf>> {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to scan {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(READY_SUFFIX) {
            candidates.push(entry.path());
        }
    }
    candidates.sort();

    for path in candidates {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(READY_SUFFIX) else {
            continue;
        };
        let claimed = dir.join(format!("{stem}{CLAIMED_SUFFIX}"));

        match std::fs::rename(&path, &claimed) {
            Ok(()) => return Ok(Some(claimed)),
            // Lost the race to a sibling reader.
            Err(_) => continue,
        }
    }

    Ok(None)
}

/// Read every entry of a claimed archive into memory, pairing assets with
/// their JSON sidecars by stem.
fn load_shard(path: &Path) -> Result<VecDeque<PendingSample>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = tar::Archive::new(file);

    let mut assets: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut sidecars: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    for entry in archive.entries().context("Failed to read archive")? {
        let mut entry = entry.context("Failed to read archive entry")?;
        let entry_path = entry.path().context("Malformed entry path")?;
        let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((stem, ext)) = name.rsplit_once('.') else {
            continue;
        };
        let stem = stem.to_string();
        let is_sidecar = ext == "json";

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        if is_sidecar {
            sidecars.insert(stem, data);
        } else {
            assets.insert(stem, data);
        }
    }

    Ok(assets
        .into_iter()
        .map(|(name, asset)| {
            let sidecar = sidecars.remove(&name);
            PendingSample {
                name,
                asset,
                sidecar,
            }
        })
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;

    fn jpeg_bytes() -> Vec<u8> {
        let image = RgbImage::from_pixel(3, 3, image::Rgb([5, 10, 15]));
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
        buf.into_inner()
    }

    fn append_bytes(builder: &mut tar::Builder<std::fs::File>, name: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
    }

    fn write_ready_archive(dir: &Path, stem: &str, rows: &[(&str, bool)]) -> PathBuf {
        let path = dir.join(format!("{stem}{READY_SUFFIX}"));
        let file = std::fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);

        for (row, valid) in rows {
            let asset = if *valid { jpeg_bytes() } else { b"garbage".to_vec() };
            append_bytes(&mut builder, &format!("{row}.jpg"), &asset);
            append_bytes(
                &mut builder,
                &format!("{row}.json"),
                format!("{{\"name\":\"{row}\"}}").as_bytes(),
            );
        }

        builder.finish().unwrap();
        path
    }

    #[test]
    fn test_claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        write_ready_archive(dir.path(), "00042-0-500", &[("00042-0-500--0", true)]);

        let first = claim_ready_shard(dir.path()).unwrap();
        assert!(first.is_some());
        assert!(first.unwrap().to_string_lossy().ends_with(CLAIMED_SUFFIX));

        // Second claimant finds nothing.
        assert!(claim_ready_shard(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_stream_yields_samples_and_deletes_archive() {
        let dir = tempfile::tempdir().unwrap();
        write_ready_archive(
            dir.path(),
            "00042-0-500",
            &[("00042-0-500--0", true), ("00042-0-500--1", true)],
        );

        let mut stream = ShardStream::new(dir.path(), Duration::from_millis(1));
        let stop = stream.stop_handle();

        let first = stream.next().unwrap();
        assert_eq!(first.name, "00042-0-500--0");
        assert_eq!(first.metadata.unwrap()["name"], "00042-0-500--0");
        assert_eq!(first.image.width(), 3);

        let second = stream.next().unwrap();
        assert_eq!(second.name, "00042-0-500--1");

        // Stop after the archive drains; the stream ends and cleans up.
        stop.store(true, Ordering::SeqCst);
        assert!(stream.next().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_stream_skips_undecodable_samples() {
        let dir = tempfile::tempdir().unwrap();
        write_ready_archive(
            dir.path(),
            "b-0-500",
            &[("b-0-500--0", false), ("b-0-500--1", true)],
        );

        let mut stream = ShardStream::new(dir.path(), Duration::from_millis(1));
        let stop = stream.stop_handle();

        let sample = stream.next().unwrap();
        assert_eq!(sample.name, "b-0-500--1");

        stop.store(true, Ordering::SeqCst);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_stream_moves_across_archives_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_ready_archive(dir.path(), "a-0-500", &[("a-0-500--0", true)]);
        write_ready_archive(dir.path(), "b-0-500", &[("b-0-500--0", true)]);

        let mut stream = ShardStream::new(dir.path(), Duration::from_millis(1));
        let stop = stream.stop_handle();

        assert_eq!(stream.next().unwrap().name, "a-0-500--0");
        assert_eq!(stream.next().unwrap().name, "b-0-500--0");

        stop.store(true, Ordering::SeqCst);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_stopped_stream_ends_without_archives() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = ShardStream::new(dir.path(), Duration::from_millis(1));
        stream.stop_handle().store(true, Ordering::SeqCst);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_asset_without_sidecar_still_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("c-0-500{READY_SUFFIX}"));
        let file = std::fs::File::create(&path).unwrap();
        let mut builder = tar::Builder::new(file);
        append_bytes(&mut builder, "c-0-500--0.jpg", &jpeg_bytes());
        builder.finish().unwrap();

        let mut stream = ShardStream::new(dir.path(), Duration::from_millis(1));
        let stop = stream.stop_handle();

        let sample = stream.next().unwrap();
        assert_eq!(sample.name, "c-0-500--0");
        assert!(sample.metadata.is_none());

        stop.store(true, Ordering::SeqCst);
        assert!(stream.next().is_none());
    }
}
