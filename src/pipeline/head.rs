use crate::codec::{Block, BlockRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

/// The most recently forwarded block and when it became the head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadInfo {
    pub number: u64,
    pub hash: String,
    pub updated_at: DateTime<Utc>,
}

impl HeadInfo {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number,
            hash: self.hash.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("head regression: current head is {current}, refused update to {attempted}")]
    Regression { current: u64, attempted: u64 },
}

/// Single writer of the head. Hand out [`HeadReader`]s for everyone else.
#[derive(Debug)]
pub struct HeadTracker {
    tx: watch::Sender<Option<HeadInfo>>,
}

/// Cheap, cloneable view of the head.
#[derive(Debug, Clone)]
pub struct HeadReader {
    rx: watch::Receiver<Option<HeadInfo>>,
}

impl HeadTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Moves the head to `block`. The head never goes backwards: an update
    /// below the current number is refused and the head left untouched.
    pub fn update_head(&self, block: &Block) -> Result<(), HeadError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|head| {
            if let Some(current) = head {
                if block.number < current.number {
                    result = Err(HeadError::Regression {
                        current: current.number,
                        attempted: block.number,
                    });
                    return false;
                }
            }
            *head = Some(HeadInfo {
                number: block.number,
                hash: block.hash.clone(),
                updated_at: Utc::now(),
            });
            true
        });
        result
    }

    pub fn current_head(&self) -> Option<HeadInfo> {
        self.tx.borrow().clone()
    }

    pub fn reader(&self) -> HeadReader {
        HeadReader {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for HeadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadReader {
    pub fn current_head(&self) -> Option<HeadInfo> {
        self.rx.borrow().clone()
    }

    /// Waits for the next head change and returns it. `None` once the
    /// tracker is gone.
    pub async fn changed(&mut self) -> Option<HeadInfo> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }
}
