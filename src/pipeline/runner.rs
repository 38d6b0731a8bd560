use super::channel::{Receiver, Sender};
use super::head::HeadTracker;
use super::range::{BatchRange, RangeDecision};
use crate::blockstream::BlockStreamServer;
use crate::codec::{Block, BlockRef, ConsoleDecoder, DecodeError};
use crate::source::{LineSource, RawLine, SourceError};
use crate::storage::{BlockSink, SinkError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors that end a pipeline stage
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("block {got} arrived after block {last}")]
    OutOfOrder { last: u64, got: u64 },

    #[error("conflicting block {number}: already forwarded {existing}, got {conflicting}")]
    ConflictingBlock {
        number: u64,
        existing: String,
        conflicting: String,
    },

    #[error("failed to persist block {number}: {source}")]
    Persist {
        number: u64,
        #[source]
        source: SinkError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderOutcome {
    /// The source has no more lines
    Exhausted,
    /// Stopped by cancellation or because the decoder went away
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderOutcome {
    /// The line channel closed
    InputClosed,
    /// The window's stop block was reached
    StopReached(u64),
    /// The fan-out stage went away
    DownstreamClosed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub forwarded: u64,
    pub persist_failures: u64,
    pub last: Option<BlockRef>,
}

/// Run the line reader task.
///
/// Pulls lines from `source` into `output` until the source is exhausted or
/// `cancel` fires. A full channel suspends the loop, so the source is only
/// read as fast as the decoder consumes. The source is shut down on every
/// exit path.
pub async fn run_reader(
    mut source: LineSource,
    output: Sender<RawLine>,
    cancel: CancellationToken,
    shutdown_grace: Duration,
) -> Result<ReaderOutcome, PipelineError> {
    info!(source = %source.name(), "Line reader started");
    let mut lines = 0u64;

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(ReaderOutcome::Cancelled),
            next = source.next_line() => next,
        };

        match next {
            Ok(Some(line)) => {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Ok(ReaderOutcome::Cancelled),
                    sent = output.send(line) => sent,
                };
                if sent.is_err() {
                    debug!("Line channel closed");
                    break Ok(ReaderOutcome::Cancelled);
                }
                lines += 1;
            }
            Ok(None) => break Ok(ReaderOutcome::Exhausted),
            Err(SourceError::LineTooLong { seq, limit }) => {
                break Err(PipelineError::Decode(DecodeError::LineTooLong { seq, limit }))
            }
            Err(e) => break Err(e.into()),
        }
    };

    drop(output);
    source.shutdown(shutdown_grace).await;

    match &result {
        Ok(outcome) => info!(lines, outcome = ?outcome, "Line reader stopped"),
        Err(e) => error!(lines, error = %e, "Line reader failed"),
    }
    result
}

/// Run the decoder task.
///
/// Decodes lines in arrival order, applies the block window and the
/// ordering rules, and hands forwarded blocks to `output`. Cancels `cancel`
/// when it stops early so the reader stops too.
pub async fn run_decoder(
    mut input: Receiver<RawLine>,
    output: Sender<Block>,
    mut decoder: Box<dyn ConsoleDecoder>,
    range: BatchRange,
    cancel: CancellationToken,
) -> Result<DecoderOutcome, PipelineError> {
    info!(start = range.start, stop = range.stop, "Decoder started");
    let mut last: Option<BlockRef> = None;

    let result = loop {
        let Some(line) = input.recv().await else {
            // A cancelled run may end mid-block; only a natural end is checked
            if !cancel.is_cancelled() {
                if let Err(e) = decoder.finish() {
                    break Err(e.into());
                }
            }
            break Ok(DecoderOutcome::InputClosed);
        };

        let block = match decoder.decode(&line) {
            Ok(Some(block)) => block,
            Ok(None) => continue,
            Err(e) if !e.is_fatal() => {
                warn!(source = %line.source, seq = line.seq, error = %e, "Skipping undecodable line");
                continue;
            }
            Err(e) => break Err(e.into()),
        };

        if let Some(prev) = &last {
            if block.number < prev.number {
                break Err(PipelineError::OutOfOrder {
                    last: prev.number,
                    got: block.number,
                });
            }
            if block.number == prev.number {
                if block.hash == prev.hash {
                    debug!(block_num = block.number, "Dropping duplicate block");
                    continue;
                }
                break Err(PipelineError::ConflictingBlock {
                    number: block.number,
                    existing: prev.hash.clone(),
                    conflicting: block.hash,
                });
            }
        }

        let decision = range.check(block.number);
        match decision {
            RangeDecision::Skip => {
                debug!(block_num = block.number, start = range.start, "Skipping block before start");
                continue;
            }
            RangeDecision::Stop => {
                info!(block_num = block.number, stop = range.stop, "Block past stop, ending ingestion");
                break Ok(DecoderOutcome::StopReached(range.stop));
            }
            RangeDecision::Forward | RangeDecision::ForwardAndStop => {}
        }

        let number = block.number;
        last = Some(block.block_ref());
        if output.send(block).await.is_err() {
            warn!(block_num = number, "Block channel closed");
            break Ok(DecoderOutcome::DownstreamClosed);
        }

        if decision == RangeDecision::ForwardAndStop {
            info!(block_num = number, "Stop block reached");
            break Ok(DecoderOutcome::StopReached(number));
        }
    };

    if !matches!(result, Ok(DecoderOutcome::InputClosed)) {
        cancel.cancel();
    }
    match &result {
        Ok(outcome) => info!(outcome = ?outcome, last = ?last.map(|b| b.number), "Decoder stopped"),
        Err(e) => error!(error = %e, "Decoder failed"),
    }
    result
}

/// Run the fan-out task.
///
/// For each block, in order: persist it, move the head, publish it to
/// stream subscribers. Persistence failures are logged and skipped unless
/// `halt_on_error` is set. Runs until the block channel closes, so blocks
/// already queued are delivered even during shutdown.
pub async fn run_fanout(
    mut input: Receiver<Block>,
    sink: Arc<dyn BlockSink>,
    head: HeadTracker,
    server: Arc<BlockStreamServer>,
    halt_on_error: bool,
    cancel: CancellationToken,
) -> Result<FanoutStats, PipelineError> {
    info!(halt_on_error, "Fan-out started");
    let mut stats = FanoutStats::default();

    while let Some(block) = input.recv().await {
        if let Err(e) = sink.persist(&block).await {
            if halt_on_error {
                error!(block_num = block.number, error = %e, "Failed to persist block, halting");
                cancel.cancel();
                return Err(PipelineError::Persist {
                    number: block.number,
                    source: e,
                });
            }
            error!(block_num = block.number, error = %e, "Failed to persist block");
            stats.persist_failures += 1;
        }

        if let Err(e) = head.update_head(&block) {
            warn!(block_num = block.number, error = %e, "Head not updated");
        }

        stats.forwarded += 1;
        stats.last = Some(block.block_ref());
        let number = block.number;
        let subscribers = server.publish(Arc::new(block)).await;
        debug!(block_num = number, subscribers, "Block forwarded");
    }

    info!(
        forwarded = stats.forwarded,
        persist_failures = stats.persist_failures,
        "Fan-out stopped"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::console::block_hash;
    use crate::codec::FireConsoleDecoder;
    use crate::config::types::ServerConfig;
    use crate::pipeline::channel::create_channel;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::time::timeout;

    fn raw(seq: u64, text: &str) -> RawLine {
        RawLine {
            source: Arc::from("test"),
            seq,
            text: text.to_string(),
        }
    }

    fn block(number: u64) -> Block {
        Block {
            number,
            hash: block_hash(number, ""),
            parent_hash: None,
            payload: String::new(),
        }
    }

    /// Feeds `lines` through a decoder and returns its outcome plus the
    /// forwarded block numbers.
    async fn decode(
        lines: &[&str],
        range: BatchRange,
    ) -> (Result<DecoderOutcome, PipelineError>, Vec<u64>, bool) {
        let (line_tx, line_rx) = create_channel(lines.len() + 1);
        let (block_tx, mut block_rx) = create_channel(lines.len() + 1);
        for (i, text) in lines.iter().enumerate() {
            line_tx.send(raw(i as u64, text)).await.unwrap();
        }
        drop(line_tx);

        let cancel = CancellationToken::new();
        let outcome = run_decoder(
            line_rx,
            block_tx,
            Box::new(FireConsoleDecoder::new()),
            range,
            cancel.clone(),
        )
        .await;

        let mut numbers = Vec::new();
        while let Some(block) = block_rx.recv().await {
            numbers.push(block.number);
        }
        (outcome, numbers, cancel.is_cancelled())
    }

    #[derive(Default)]
    struct MemorySink {
        blocks: Mutex<Vec<u64>>,
        fail_on: Option<u64>,
    }

    #[async_trait]
    impl BlockSink for MemorySink {
        async fn persist(&self, block: &Block) -> Result<(), SinkError> {
            if Some(block.number) == self.fail_on {
                return Err(SinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.blocks.lock().unwrap().push(block.number);
            Ok(())
        }
    }

    fn stream_server(head: &HeadTracker) -> Arc<BlockStreamServer> {
        Arc::new(BlockStreamServer::new(head.reader(), &ServerConfig::default()))
    }

    #[tokio::test]
    async fn test_reader_stalls_on_full_channel_without_loss() {
        let input: String = (0..10).map(|i| format!("line {}\n", i)).collect();
        let source = LineSource::from_reader("test", std::io::Cursor::new(input.into_bytes()), 1024);
        let (tx, mut rx) = create_channel(2);

        let reader = tokio::spawn(run_reader(
            source,
            tx,
            CancellationToken::new(),
            Duration::from_millis(10),
        ));

        // Nobody is consuming: the reader fills the channel and waits
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());
        assert_eq!(rx.len(), 2);

        let mut received = Vec::new();
        while let Some(line) = rx.recv().await {
            received.push(line.text);
        }
        let expected: Vec<String> = (0..10).map(|i| format!("line {}", i)).collect();
        assert_eq!(received, expected);
        assert_eq!(reader.await.unwrap().unwrap(), ReaderOutcome::Exhausted);
    }

    #[tokio::test]
    async fn test_reader_stops_on_cancel() {
        let (_writer, pipe) = tokio::io::duplex(64);
        let source = LineSource::from_reader("pipe", pipe, 1024);
        let (tx, _rx) = create_channel(4);
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(run_reader(source, tx, cancel.clone(), Duration::from_millis(10)));
        cancel.cancel();

        let outcome = timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap(), ReaderOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_reader_reports_line_too_long_as_decode_error() {
        let source = LineSource::from_reader("test", std::io::Cursor::new(b"ok\nway too long\n".to_vec()), 4);
        let (tx, mut rx) = create_channel(4);

        let result = run_reader(source, tx, CancellationToken::new(), Duration::from_millis(10)).await;
        assert!(matches!(
            result,
            Err(PipelineError::Decode(DecodeError::LineTooLong { seq: 1, limit: 4 }))
        ));
        assert_eq!(rx.recv().await.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn test_decoder_applies_window() {
        let lines = [
            "FIRE BLOCK 1 a",
            "FIRE BLOCK 2 b",
            "FIRE BLOCK 3 c",
            "FIRE BLOCK 4 d",
            "FIRE BLOCK 5 e",
        ];
        let (outcome, numbers, cancelled) = decode(&lines, BatchRange::new(2, 4)).await;

        assert_eq!(outcome.unwrap(), DecoderOutcome::StopReached(4));
        assert_eq!(numbers, vec![2, 3, 4]);
        assert!(cancelled);
    }

    #[tokio::test]
    async fn test_decoder_stops_when_source_skips_past_stop() {
        let lines = ["FIRE BLOCK 1 a", "FIRE BLOCK 9 b"];
        let (outcome, numbers, _) = decode(&lines, BatchRange::new(0, 5)).await;

        assert_eq!(outcome.unwrap(), DecoderOutcome::StopReached(5));
        assert_eq!(numbers, vec![1]);
    }

    #[tokio::test]
    async fn test_decoder_skips_malformed_lines() {
        let lines = [
            "FIRE BLOCK 1 a",
            "FIRE BLOCK nope",
            "FIRE WHATEVER",
            "FIRE BLOCK 2 b",
        ];
        let (outcome, numbers, cancelled) = decode(&lines, BatchRange::default()).await;

        assert_eq!(outcome.unwrap(), DecoderOutcome::InputClosed);
        assert_eq!(numbers, vec![1, 2]);
        assert!(!cancelled);
    }

    #[tokio::test]
    async fn test_decoder_fails_on_corruption() {
        let lines = ["FIRE BLOCK 1 a", "FIRE BLOCK_DATA orphan", "FIRE BLOCK 2 b"];
        let (outcome, numbers, cancelled) = decode(&lines, BatchRange::default()).await;

        assert!(matches!(
            outcome,
            Err(PipelineError::Decode(DecodeError::Corrupted { seq: 1, .. }))
        ));
        assert_eq!(numbers, vec![1]);
        assert!(cancelled);
    }

    #[tokio::test]
    async fn test_decoder_reports_unfinished_block() {
        let lines = ["FIRE BLOCK_BEGIN 1", "FIRE BLOCK_DATA x"];
        let (outcome, _, _) = decode(&lines, BatchRange::default()).await;
        assert!(matches!(
            outcome,
            Err(PipelineError::Decode(DecodeError::Corrupted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_block_is_fatal() {
        let lines = ["FIRE BLOCK 5 a", "FIRE BLOCK 4 b"];
        let (outcome, numbers, _) = decode(&lines, BatchRange::default()).await;

        assert!(matches!(
            outcome,
            Err(PipelineError::OutOfOrder { last: 5, got: 4 })
        ));
        assert_eq!(numbers, vec![5]);
    }

    #[tokio::test]
    async fn test_duplicate_block_is_dropped_and_conflict_is_fatal() {
        let lines = ["FIRE BLOCK 1 a", "FIRE BLOCK 1 a", "FIRE BLOCK 2 b"];
        let (outcome, numbers, _) = decode(&lines, BatchRange::default()).await;
        assert_eq!(outcome.unwrap(), DecoderOutcome::InputClosed);
        assert_eq!(numbers, vec![1, 2]);

        let lines = ["FIRE BLOCK 1 a", "FIRE BLOCK 1 other"];
        let (outcome, _, _) = decode(&lines, BatchRange::default()).await;
        assert!(matches!(
            outcome,
            Err(PipelineError::ConflictingBlock { number: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_fanout_persists_then_moves_head() {
        let head = HeadTracker::new();
        let reader = head.reader();
        let server = stream_server(&head);
        let sink = Arc::new(MemorySink::default());
        let (tx, rx) = create_channel(8);

        for n in 1..=3 {
            tx.send(block(n)).await.unwrap();
        }
        drop(tx);

        let stats = run_fanout(rx, sink.clone(), head, server, false, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.forwarded, 3);
        assert_eq!(*sink.blocks.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(reader.current_head().unwrap().number, 3);
    }

    #[tokio::test]
    async fn test_fanout_skips_persist_failure_by_default() {
        let head = HeadTracker::new();
        let reader = head.reader();
        let server = stream_server(&head);
        let sink = Arc::new(MemorySink {
            fail_on: Some(2),
            ..MemorySink::default()
        });
        let (tx, rx) = create_channel(8);
        for n in 1..=3 {
            tx.send(block(n)).await.unwrap();
        }
        drop(tx);

        let stats = run_fanout(rx, sink.clone(), head, server, false, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.persist_failures, 1);
        assert_eq!(*sink.blocks.lock().unwrap(), vec![1, 3]);
        assert_eq!(reader.current_head().unwrap().number, 3);
    }

    #[tokio::test]
    async fn test_fanout_halts_on_persist_failure_when_configured() {
        let head = HeadTracker::new();
        let reader = head.reader();
        let server = stream_server(&head);
        let sink = Arc::new(MemorySink {
            fail_on: Some(2),
            ..MemorySink::default()
        });
        let (tx, rx) = create_channel(8);
        for n in 1..=3 {
            tx.send(block(n)).await.unwrap();
        }
        drop(tx);

        let cancel = CancellationToken::new();
        let result = run_fanout(rx, sink.clone(), head, server, true, cancel.clone()).await;

        assert!(matches!(result, Err(PipelineError::Persist { number: 2, .. })));
        assert!(cancel.is_cancelled());
        assert_eq!(reader.current_head().unwrap().number, 1);
    }
}
