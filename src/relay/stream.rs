//! Consumer side of a streaming command.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use super::envelope::EventMessage;
use super::{CorrelationKey, RelayError, RelayInner};

/// Item queued for a stream consumer.
pub(super) type StreamItem = Result<EventMessage, RelayError>;

/// Ordered chunks of one streaming command.
///
/// Finite and non-restartable: once [`next`](Self::next) returns `None` or an
/// error, every later call returns `None`. Dropping the stream discards its
/// relay channel.
pub struct CommandStream {
    key: CorrelationKey,
    generation: u64,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    depth: Arc<AtomicUsize>,
    inactivity: Duration,
    relay: Arc<RelayInner>,
    done: bool,
}

impl std::fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStream")
            .field("session_id", &self.key.0)
            .field("message_id", &self.key.1)
            .field("queued", &self.depth.load(Ordering::Relaxed))
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl CommandStream {
    pub(super) fn new(
        key: CorrelationKey,
        generation: u64,
        rx: mpsc::UnboundedReceiver<StreamItem>,
        depth: Arc<AtomicUsize>,
        inactivity: Duration,
        relay: Arc<RelayInner>,
    ) -> Self {
        Self {
            key,
            generation,
            rx,
            depth,
            inactivity,
            relay,
            done: false,
        }
    }

    /// Message id of the streaming command.
    pub fn message_id(&self) -> &str {
        &self.key.1
    }

    /// Session the stream belongs to.
    pub fn session_id(&self) -> &str {
        &self.key.0
    }

    /// Whether the stream has finished.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Wait for the next chunk.
    ///
    /// Returns `None` after the terminal chunk. Silence longer than the
    /// inactivity timeout ends the stream with [`RelayError::Timeout`].
    pub async fn next(&mut self) -> Option<Result<EventMessage, RelayError>> {
        if self.done {
            return None;
        }
        match tokio::time::timeout(self.inactivity, self.rx.recv()).await {
            Ok(Some(Ok(chunk))) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Some(Ok(chunk))
            }
            Ok(Some(Err(err))) => {
                self.done = true;
                Some(Err(err))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(_) => {
                self.done = true;
                debug!(
                    session_id = %self.key.0,
                    message_id = %self.key.1,
                    "stream inactivity timeout"
                );
                self.relay.discard_stream(&self.key, self.generation);
                Some(Err(RelayError::Timeout))
            }
        }
    }

    /// Drain the stream into a vector, stopping at the first error.
    ///
    /// # Errors
    ///
    /// The first error the stream yields.
    pub async fn collect(mut self) -> Result<Vec<EventMessage>, RelayError> {
        let mut chunks = Vec::new();
        while let Some(item) = self.next().await {
            chunks.push(item?);
        }
        Ok(chunks)
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        self.relay.discard_stream(&self.key, self.generation);
    }
}
