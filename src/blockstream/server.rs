use super::api::{get_head, health_check, readiness, stream_blocks};
use crate::codec::Block;
use crate::config::types::ServerConfig;
use crate::pipeline::head::{HeadInfo, HeadReader};
use axum::{routing::get, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Registry = Arc<Mutex<HashMap<Uuid, mpsc::Sender<Arc<Block>>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Initializing,
    Ready,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server task failed: {0}")]
    Join(String),
}

#[derive(Debug, Error)]
#[error("block stream is not accepting subscribers (state: {0:?})")]
pub struct SubscribeError(pub ServerState);

/// Serves head-info, the live block stream and the readiness probe.
///
/// Blocks handed to [`BlockStreamServer::publish`] go to every subscriber
/// registered at that moment; nothing is replayed to later subscribers.
pub struct BlockStreamServer {
    head: HeadReader,
    subscriber_buffer: usize,
    drain_timeout: Duration,
    state: watch::Sender<ServerState>,
    subscribers: Registry,
    closing: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl BlockStreamServer {
    pub fn new(head: HeadReader, config: &ServerConfig) -> Self {
        let (state, _rx) = watch::channel(ServerState::Initializing);
        Self {
            head,
            subscriber_buffer: config.subscriber_buffer.max(1),
            drain_timeout: config.drain_timeout,
            state,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            closing: CancellationToken::new(),
            local_addr: OnceLock::new(),
        }
    }

    pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Resolves once the server is Ready. Returns false if it stopped first.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.state.subscribe();
        rx.wait_for(|s| *s != ServerState::Initializing)
            .await
            .map(|s| *s == ServerState::Ready)
            .unwrap_or(false)
    }

    /// Address the listener is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn current_head(&self) -> Option<HeadInfo> {
        self.head.current_head()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn subscribe(&self) -> Result<Subscription, SubscribeError> {
        let state = self.state();
        if state != ServerState::Ready {
            return Err(SubscribeError(state));
        }

        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let id = Uuid::new_v4();
        lock(&self.subscribers).insert(id, tx);
        debug!(subscriber = %id, "Subscriber registered");

        Ok(Subscription {
            id,
            rx,
            registry: Arc::clone(&self.subscribers),
        })
    }

    /// Delivers `block` to every current subscriber, waiting for queue space
    /// on each in turn. Subscribers that went away are dropped. Returns the
    /// number of subscribers that received the block.
    ///
    /// A wait on a full queue ends as soon as subscriptions are closed.
    pub async fn publish(&self, block: Arc<Block>) -> usize {
        let targets: Vec<(Uuid, mpsc::Sender<Arc<Block>>)> = lock(&self.subscribers)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            let sent = tokio::select! {
                sent = tx.send(Arc::clone(&block)) => sent.is_ok(),
                _ = self.closing.cancelled() => {
                    debug!(subscriber = %id, block_num = block.number, "Delivery abandoned, subscriptions closed");
                    break;
                }
            };
            if sent {
                delivered += 1;
            } else {
                lock(&self.subscribers).remove(&id);
                debug!(subscriber = %id, "Removed closed subscriber");
            }
        }
        delivered
    }

    /// Runs the HTTP server on `listener` until `shutdown` fires, then drains.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/healthz", get(readiness))
            .route("/v1/head", get(get_head))
            .route("/v1/blocks", get(stream_blocks))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self));

        self.state.send_replace(ServerState::Ready);
        info!(addr = %addr, "Block stream server ready");

        let drain = Arc::clone(&self);
        let signal = shutdown.clone();
        let mut serve_task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    signal.cancelled().await;
                    drain.begin_drain();
                    drain.close_subscriptions();
                })
                .await
        });

        let result = tokio::select! {
            res = &mut serve_task => res,
            _ = shutdown.cancelled() => match timeout(self.drain_timeout, &mut serve_task).await {
                Ok(res) => res,
                Err(_) => {
                    warn!(timeout = ?self.drain_timeout, "Drain timeout elapsed, closing remaining connections");
                    serve_task.abort();
                    Ok(Ok(()))
                }
            },
        };

        // Covers the server ending on its own as well
        self.begin_drain();
        self.close_subscriptions();
        self.state.send_replace(ServerState::Stopped);
        info!("Block stream server stopped");

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ServerError::Io(e)),
            Err(e) => Err(ServerError::Join(e.to_string())),
        }
    }

    /// Moves to Draining: new subscribers are refused, existing ones keep
    /// receiving until [`BlockStreamServer::close_subscriptions`].
    pub fn begin_drain(&self) {
        let drained = self.state.send_if_modified(|state| {
            if *state == ServerState::Ready || *state == ServerState::Initializing {
                *state = ServerState::Draining;
                true
            } else {
                false
            }
        });
        if drained {
            info!("Block stream server draining");
        }
    }

    /// Closes every subscriber queue and releases any publish waiting on one.
    /// Streams end after delivering what is already queued.
    pub fn close_subscriptions(&self) {
        self.closing.cancel();
        let closed = {
            let mut subscribers = lock(&self.subscribers);
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        if closed > 0 {
            info!(subscribers = closed, "Closed block stream subscriptions");
        }
    }
}

/// A live feed of blocks. Dropping it unregisters the subscriber.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Arc<Block>>,
    registry: Registry,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next block, or `None` once the server stops streaming.
    pub async fn recv(&mut self) -> Option<Arc<Block>> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = Arc<Block>> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let block = sub.recv().await?;
            Some((block, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
