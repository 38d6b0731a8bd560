use super::api::HeadInfoResponse;
use crate::codec::Block;
use crate::pipeline::head::HeadInfo;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use std::pin::Pin;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("block stream returned error status {status}: {message}")]
    ServerError { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// HTTP client for a block stream server.
#[derive(Debug, Clone)]
pub struct BlockStreamClient {
    base_url: String,
    client: reqwest::Client,
}

impl BlockStreamClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current head, `None` before the first block.
    pub async fn head_info(&self) -> Result<Option<HeadInfo>> {
        let url = format!("{}/v1/head", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        let body: HeadInfoResponse = response.json().await?;
        Ok(body.head)
    }

    /// Whether the server reports itself ready.
    pub async fn ready(&self) -> Result<bool> {
        let url = format!("{}/healthz", self.base_url);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::SERVICE_UNAVAILABLE => Ok(false),
            _ => Err(error_from(response).await),
        }
    }

    /// Opens the live block stream. Blocks published before this call
    /// returns are not included.
    pub async fn subscribe(&self) -> Result<BoxStream<'static, Result<Block>>> {
        let url = format!("{}/v1/blocks", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        Ok(ndjson_blocks(response.bytes_stream()).boxed())
    }
}

async fn error_from(response: reqwest::Response) -> ClientError {
    ClientError::ServerError {
        status: response.status().as_u16(),
        message: response.text().await.unwrap_or_default(),
    }
}

struct LineState<S> {
    chunks: Pin<Box<S>>,
    buf: Vec<u8>,
    done: bool,
}

/// Splits a byte stream into newline-delimited JSON blocks.
fn ndjson_blocks<S>(chunks: S) -> impl Stream<Item = Result<Block>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = LineState {
        chunks: Box::pin(chunks),
        buf: Vec::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let block = serde_json::from_slice(&line).map_err(ClientError::from);
                return Some((block, state));
            }

            if state.done {
                if state.buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut state.buf);
                let block = serde_json::from_slice(&line).map_err(ClientError::from);
                return Some((block, state));
            }

            match state.chunks.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    state.buf.clear();
                    return Some((Err(e.into()), state));
                }
                None => state.done = true,
            }
        }
    })
}
