use super::{IngestError, IngestorState, ShutdownHandle, ShutdownReason};
use crate::blockstream::BlockStreamServer;
use crate::codec::{ConsoleDecoder, FireConsoleDecoder};
use crate::config::{check_mode_preconditions, validate_config, Config};
use crate::pipeline::{
    create_channel, run_decoder, run_fanout, run_reader, BatchRange, DecoderOutcome, HeadReader,
    HeadTracker,
};
use crate::source::LineSource;
use crate::storage::{BlockSink, OneBlockStore};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Owns one ingestion run: line source, decoder, block sink, head and the
/// block stream server.
pub struct Ingestor {
    config: Config,
    source: LineSource,
    decoder: Box<dyn ConsoleDecoder>,
    sink: Arc<dyn BlockSink>,
    head: HeadTracker,
    server: Arc<BlockStreamServer>,
    shutdown: CancellationToken,
    state: watch::Sender<IngestorState>,
}

impl Ingestor {
    /// Builds an ingestor from configuration. Validation and mode
    /// preconditions are checked before any source is created, so a bad
    /// config never starts a node process or opens a log file.
    pub fn new(config: Config) -> Result<Self, IngestError> {
        validate_config(&config)?;
        check_mode_preconditions(&config)?;

        let source = LineSource::from_config(&config)?;
        let store = OneBlockStore::new(
            config.store.path.clone(),
            config.ingestor.working_dir.clone(),
            &config.store.suffix,
        );

        Self::with_parts(config, source, Box::new(FireConsoleDecoder::new()), Arc::new(store))
    }

    /// Builds an ingestor around caller-provided parts.
    pub fn with_parts(
        config: Config,
        source: LineSource,
        decoder: Box<dyn ConsoleDecoder>,
        sink: Arc<dyn BlockSink>,
    ) -> Result<Self, IngestError> {
        validate_config(&config)?;

        let head = HeadTracker::new();
        let server = Arc::new(BlockStreamServer::new(head.reader(), &config.server));
        let (state, _rx) = watch::channel(IngestorState::Configuring);

        Ok(Self {
            config,
            source,
            decoder,
            sink,
            head,
            server,
            shutdown: CancellationToken::new(),
            state,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.shutdown.clone())
    }

    pub fn stream_server(&self) -> Arc<BlockStreamServer> {
        Arc::clone(&self.server)
    }

    pub fn head(&self) -> HeadReader {
        self.head.reader()
    }

    pub fn state(&self) -> IngestorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<IngestorState> {
        self.state.subscribe()
    }

    /// Runs until the stop block, the end of the source, a fatal error or a
    /// shutdown request. Every stage is stopped before this returns.
    pub async fn run(self) -> Result<ShutdownReason, IngestError> {
        let Ingestor {
            config,
            source,
            decoder,
            sink,
            head,
            server,
            shutdown,
            state,
        } = self;

        state.send_replace(IngestorState::Running);
        info!(
            mode = %config.ingestor.mode,
            source = %source.name(),
            start_block = config.ingestor.start_block_num,
            stop_block = config.ingestor.stop_block_num,
            "Starting ingestor"
        );

        if let Err(e) = sink.init().await {
            state.send_replace(IngestorState::Stopped);
            return Err(e.into());
        }

        let listener = match BlockStreamServer::bind(&config.server.listen).await {
            Ok(listener) => listener,
            Err(e) => {
                state.send_replace(IngestorState::Stopped);
                return Err(e.into());
            }
        };

        let server_token = CancellationToken::new();
        let server_handle = tokio::spawn(Arc::clone(&server).serve(listener, server_token.clone()));
        if !server.wait_ready().await {
            let served = joined(server_handle.await);
            state.send_replace(IngestorState::Stopped);
            served?;
            return Err(IngestError::ServerNotReady);
        }

        let pipeline = shutdown.child_token();
        let (line_tx, line_rx) = create_channel(config.ingestor.lines_chan_capacity);
        let (block_tx, block_rx) = create_channel(config.ingestor.blocks_chan_capacity);
        let range = BatchRange::new(config.ingestor.start_block_num, config.ingestor.stop_block_num);

        info!("Starting line reader task");
        let reader_handle = tokio::spawn(run_reader(
            source,
            line_tx,
            pipeline.clone(),
            config.node.shutdown_grace,
        ));

        info!("Starting decoder task");
        let mut decoder_handle = tokio::spawn(run_decoder(
            line_rx,
            block_tx,
            decoder,
            range,
            pipeline.clone(),
        ));

        info!("Starting fan-out task");
        let mut fanout_handle = tokio::spawn(run_fanout(
            block_rx,
            sink,
            head,
            Arc::clone(&server),
            config.store.halt_on_error,
            pipeline.clone(),
        ));

        info!("Ingestor running");

        let reader = joined(reader_handle.await);
        state.send_replace(IngestorState::ShuttingDown);
        server.begin_drain();
        info!("Line reader finished, draining pipeline");

        // Queued blocks get until the drain deadline to reach subscribers
        let deadline = Instant::now() + config.server.drain_timeout;
        let decoder = joined(join_by(&mut decoder_handle, deadline, &server).await);
        let fanout = joined(join_by(&mut fanout_handle, deadline, &server).await);

        server_token.cancel();
        let served = joined(server_handle.await);
        state.send_replace(IngestorState::Stopped);

        for (task, failure) in [
            ("line reader", reader.as_ref().err()),
            ("decoder", decoder.as_ref().err()),
            ("fan-out", fanout.as_ref().err()),
            ("block stream server", served.as_ref().err()),
        ] {
            if let Some(e) = failure {
                error!(task, error = %e, "Task failed");
            }
        }

        reader?;
        let outcome = decoder?;
        let stats = fanout?;
        served?;

        let reason = match outcome {
            DecoderOutcome::StopReached(number) => ShutdownReason::StopBlockReached(number),
            _ if shutdown.is_cancelled() => ShutdownReason::Signal,
            _ => ShutdownReason::SourceExhausted,
        };

        info!(
            reason = ?reason,
            forwarded = stats.forwarded,
            last_block = ?stats.last.map(|b| b.number),
            "Ingestor stopped"
        );
        Ok(reason)
    }
}

/// Waits for a pipeline stage. Past `deadline` the subscriptions are closed
/// so a stalled subscriber cannot hold the stage.
async fn join_by<T>(
    handle: &mut JoinHandle<T>,
    deadline: Instant,
    server: &BlockStreamServer,
) -> Result<T, JoinError> {
    match timeout_at(deadline, &mut *handle).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Pipeline did not drain before the deadline, closing subscriptions");
            server.close_subscriptions();
            handle.await
        }
    }
}

fn joined<T, E>(result: Result<Result<T, E>, JoinError>) -> Result<T, IngestError>
where
    E: Into<IngestError>,
{
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}
