/// HTTP tests for the block stream server, driven through `BlockStreamClient`.
use blockfeed::blockstream::BlockStreamClient;
use blockfeed::codec::FireConsoleDecoder;
use blockfeed::config::types::Config;
use blockfeed::ingestor::{Ingestor, ShutdownReason};
use blockfeed::source::LineSource;
use blockfeed::storage::OneBlockStore;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

fn ingestor(dir: &TempDir) -> (Ingestor, tokio::io::DuplexStream) {
    let mut config = Config::default();
    config.ingestor.working_dir = dir.path().join("work");
    config.store.path = dir.path().join("blocks");
    config.server.listen = "127.0.0.1:0".to_string();
    config.server.drain_timeout = Duration::from_secs(2);

    let (stdin, pipe) = tokio::io::duplex(16 * 1024);
    let store = OneBlockStore::new(dir.path().join("blocks"), dir.path().join("work"), "");
    let ingestor = Ingestor::with_parts(
        config,
        LineSource::from_reader("stdin", pipe, 1024),
        Box::new(FireConsoleDecoder::new()),
        Arc::new(store),
    )
    .unwrap();
    (ingestor, stdin)
}

#[tokio::test]
async fn test_head_info_and_stream_over_http() {
    let dir = TempDir::new().unwrap();
    let (ingestor, mut stdin) = ingestor(&dir);
    let server = ingestor.stream_server();
    let run = tokio::spawn(ingestor.run());
    assert!(server.wait_ready().await);

    let addr = server.local_addr().unwrap();
    let client = BlockStreamClient::new(format!("http://{}", addr));

    assert!(client.ready().await.unwrap());
    assert!(client.head_info().await.unwrap().is_none());

    let mut stream = client.subscribe().await.unwrap();

    stdin
        .write_all(b"FIRE BLOCK 1 one\nFIRE BLOCK_BEGIN 2\nFIRE BLOCK_DATA a\nFIRE BLOCK_DATA b\nFIRE BLOCK_END 2\nFIRE BLOCK 3 three\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        let block = tokio::time::timeout(STEP_TIMEOUT, stream.next())
            .await
            .expect("stream stalled")
            .expect("stream ended early")
            .unwrap();
        received.push(block);
    }
    assert_eq!(
        received.iter().map(|b| b.number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(received[1].payload, "a\nb");

    let head = client.head_info().await.unwrap().unwrap();
    assert_eq!(head.number, 3);
    assert_eq!(head.hash, received[2].hash);

    // Closing the source ends the run, which ends the stream
    drop(stdin);
    let reason = tokio::time::timeout(STEP_TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(reason, ShutdownReason::SourceExhausted);

    let end = tokio::time::timeout(STEP_TIMEOUT, stream.next()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_liveness_endpoint() {
    let dir = TempDir::new().unwrap();
    let (ingestor, stdin) = ingestor(&dir);
    let server = ingestor.stream_server();
    let handle = ingestor.shutdown_handle();
    let run = tokio::spawn(ingestor.run());
    assert!(server.wait_ready().await);

    let url = format!("http://{}/health", server.local_addr().unwrap());
    let body = reqwest::get(&url).await.unwrap().text().await.unwrap();
    assert_eq!(body, "OK");

    handle.shutdown();
    let reason = tokio::time::timeout(STEP_TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(reason, ShutdownReason::Signal);
    drop(stdin);
}

#[tokio::test]
async fn test_many_http_subscribers_see_the_same_order() {
    let dir = TempDir::new().unwrap();
    let (ingestor, mut stdin) = ingestor(&dir);
    let server = ingestor.stream_server();
    let run = tokio::spawn(ingestor.run());
    assert!(server.wait_ready().await);

    let client = BlockStreamClient::new(format!("http://{}", server.local_addr().unwrap()));
    let mut streams = Vec::new();
    for _ in 0..3 {
        streams.push(client.subscribe().await.unwrap());
    }
    assert_eq!(server.subscriber_count(), 3);

    let input: String = (1..=20).map(|n| format!("FIRE BLOCK {} p{}\n", n, n)).collect();
    stdin.write_all(input.as_bytes()).await.unwrap();
    drop(stdin);

    for stream in streams {
        let numbers: Vec<u64> = tokio::time::timeout(
            STEP_TIMEOUT,
            stream.map(|b| b.unwrap().number).collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        assert_eq!(numbers, (1..=20).collect::<Vec<_>>());
    }

    tokio::time::timeout(STEP_TIMEOUT, run).await.unwrap().unwrap().unwrap();
}
