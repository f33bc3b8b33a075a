//! End-to-end fetcher tests against a mock HTTP host

use arrow::array::StringArray;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use image::{ImageFormat, RgbImage};
use parquet::arrow::ArrowWriter;
use std::io::Cursor;
use std::sync::Arc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wds_common::ledger::DedupLedger;
use wds_common::testing::MemoryLedger;
use wds_common::types::BatchKey;
use wds_materialize::config::FetchConfig;
use wds_materialize::fetcher::BatchFetcher;

fn parquet_bytes(urls: &[String], captions: &[&str]) -> Vec<u8> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("URL", DataType::Utf8, true),
        Field::new("TEXT", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(
                urls.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(captions.to_vec())),
        ],
    )
    .unwrap();

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    buf
}

fn jpeg_bytes() -> Vec<u8> {
    let image = RgbImage::from_pixel(4, 4, image::Rgb([10, 200, 90]));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
    buf.into_inner()
}

fn fetch_config(batch_size: usize) -> FetchConfig {
    FetchConfig {
        batch_size,
        chunk_size: 8,
        concurrency: 4,
        request_timeout_secs: 5,
        bearer_token: None,
    }
}

#[tokio::test]
async fn materializes_rows_into_staged_pairs() {
    let server = MockServer::start().await;

    // Ten rows: five in the already-uploaded batch 0-5, one with no URL.
    let mut urls: Vec<String> = (0..10).map(|i| format!("{}/img/{i}", server.uri())).collect();
    urls[7] = String::new();
    let captions: Vec<&str> = (0..10).map(|_| "a caption").collect();

    Mock::given(method("GET"))
        .and(path("/shard.parquet"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(parquet_bytes(&urls, &captions)))
        .mount(&server)
        .await;

    for i in 0..10 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{i}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_bytes()))
            .mount(&server)
            .await;
    }

    let staging = tempfile::tempdir().unwrap();
    let fetcher = BatchFetcher::new(
        Arc::new(MemoryLedger::new()) as Arc<dyn DedupLedger>,
        staging.path().to_path_buf(),
        fetch_config(5),
    );

    let stats = fetcher
        .materialize(&format!("{}/shard.parquet", server.uri()))
        .await
        .unwrap();

    assert_eq!(stats.rows_seen, 10);
    assert_eq!(stats.rows_skipped, 0);
    assert_eq!(stats.fetched, 9);
    assert_eq!(stats.dropped, 1);

    let names: Vec<String> = std::fs::read_dir(staging.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();

    // 9 pairs staged, parquet cleaned up.
    assert_eq!(names.len(), 18);
    assert!(names.contains(&"shard-0-5--0.jpg".to_string()));
    assert!(names.contains(&"shard-0-5--0.json".to_string()));
    assert!(names.contains(&"shard-5-10--9.jpg".to_string()));
    assert!(!names.iter().any(|n| n.ends_with(".parquet")));
}

#[tokio::test]
async fn skips_rows_of_already_uploaded_batches() {
    let server = MockServer::start().await;

    let urls: Vec<String> = (0..10).map(|i| format!("{}/img/{i}", server.uri())).collect();
    let captions: Vec<&str> = (0..10).map(|_| "c").collect();

    Mock::given(method("GET"))
        .and(path("/part-00042-abc.parquet"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(parquet_bytes(&urls, &captions)))
        .mount(&server)
        .await;

    for i in 0..10 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{i}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_bytes()))
            .mount(&server)
            .await;
    }

    let ledger = Arc::new(MemoryLedger::new());
    ledger.insert(&BatchKey::new("00042", "0-5"));

    let staging = tempfile::tempdir().unwrap();
    let fetcher = BatchFetcher::new(
        Arc::clone(&ledger) as Arc<dyn DedupLedger>,
        staging.path().to_path_buf(),
        fetch_config(5),
    );

    let stats = fetcher
        .materialize(&format!("{}/part-00042-abc.parquet", server.uri()))
        .await
        .unwrap();

    assert_eq!(stats.rows_seen, 10);
    assert_eq!(stats.rows_skipped, 5);
    assert_eq!(stats.fetched, 5);
    assert_eq!(stats.dropped, 0);

    let names: Vec<String> = std::fs::read_dir(staging.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();

    // Only the second batch was staged.
    assert_eq!(names.len(), 10);
    assert!(names.iter().all(|n| n.starts_with("00042-5-10--")));
}

#[tokio::test]
async fn failed_asset_downloads_are_dropped_not_fatal() {
    let server = MockServer::start().await;

    let urls: Vec<String> = (0..4).map(|i| format!("{}/img/{i}", server.uri())).collect();
    let captions: Vec<&str> = (0..4).map(|_| "c").collect();

    Mock::given(method("GET"))
        .and(path("/part-00001-x.parquet"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(parquet_bytes(&urls, &captions)))
        .mount(&server)
        .await;

    for i in 0..3 {
        Mock::given(method("GET"))
            .and(path(format!("/img/{i}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_bytes()))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/img/3"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let staging = tempfile::tempdir().unwrap();
    let fetcher = BatchFetcher::new(
        Arc::new(MemoryLedger::new()),
        staging.path().to_path_buf(),
        fetch_config(5),
    );

    let stats = fetcher
        .materialize(&format!("{}/part-00001-x.parquet", server.uri()))
        .await
        .unwrap();

    assert_eq!(stats.fetched, 3);
    assert_eq!(stats.dropped, 1);
}

#[tokio::test]
async fn sends_bearer_token_to_gated_shard_hosts() {
    let server = MockServer::start().await;

    let urls = vec![String::new()];
    Mock::given(method("GET"))
        .and(path("/part-00002-y.parquet"))
        .and(header("authorization", "Bearer sekrit"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(parquet_bytes(&urls, &["c"])))
        .expect(1)
        .mount(&server)
        .await;

    let staging = tempfile::tempdir().unwrap();
    let mut config = fetch_config(5);
    config.bearer_token = Some("sekrit".to_string());
    let fetcher = BatchFetcher::new(
        Arc::new(MemoryLedger::new()),
        staging.path().to_path_buf(),
        config,
    );

    let stats = fetcher
        .materialize(&format!("{}/part-00002-y.parquet", server.uri()))
        .await
        .unwrap();

    assert_eq!(stats.rows_seen, 1);
    assert_eq!(stats.dropped, 1);
}
