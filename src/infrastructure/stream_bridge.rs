//! Stream Bridge
//!
//! Hands backend chunks from a dispatcher worker to the client response
//! that is waiting on the same task ID.

use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Default per-task channel capacity, in chunks.
pub const DEFAULT_STREAM_BUFFER: usize = 256;

/// Event observed by the client side of a task stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Raw backend bytes, relayed unchanged
    Chunk(Bytes),
    /// Terminal error; no further events follow
    Error(String),
}

#[derive(Debug)]
enum Frame {
    Event(StreamEvent),
    End,
}

/// Result of delivering one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Delivered,
    /// No client is attached to this task (e.g. a recovered task)
    NoChannel,
    /// The client went away; the channel has been removed
    Disconnected,
}

/// Registry of per-task client channels.
///
/// At most one channel exists per task ID. Channels are bounded, so a slow
/// client applies backpressure to the worker feeding it.
pub struct StreamBridge {
    sinks: DashMap<String, mpsc::Sender<Frame>>,
    buffer: usize,
}

impl StreamBridge {
    pub fn new(buffer: usize) -> Self {
        Self {
            sinks: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Register the client side for `task_id`, replacing any previous one.
    pub fn open(&self, task_id: &str) -> TaskStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.sinks.insert(task_id.to_string(), tx);
        TaskStream { rx, finished: false }
    }

    /// Deliver one chunk, waiting for buffer space if the client is slow.
    pub async fn emit(&self, task_id: &str, chunk: Bytes) -> EmitOutcome {
        let Some(tx) = self.sender(task_id) else {
            return EmitOutcome::NoChannel;
        };

        match tx.send(Frame::Event(StreamEvent::Chunk(chunk))).await {
            Ok(()) => EmitOutcome::Delivered,
            Err(_) => {
                self.sinks.remove_if(task_id, |_, s| s.same_channel(&tx));
                EmitOutcome::Disconnected
            }
        }
    }

    /// Signal normal end of stream and remove the channel.
    pub async fn complete(&self, task_id: &str) {
        if let Some((_, tx)) = self.sinks.remove(task_id) {
            let _ = tx.send(Frame::End).await;
        }
    }

    /// Deliver a terminal error and remove the channel.
    pub async fn error(&self, task_id: &str, message: impl Into<String>) {
        if let Some((_, tx)) = self.sinks.remove(task_id) {
            let _ = tx.send(Frame::Event(StreamEvent::Error(message.into()))).await;
        }
    }

    /// Remove the channel without signalling.
    pub fn discard(&self, task_id: &str) {
        self.sinks.remove(task_id);
    }

    pub fn has_channel(&self, task_id: &str) -> bool {
        self.sinks.contains_key(task_id)
    }

    /// Number of attached clients.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Resolves when the client of `task_id` drops its stream.
    ///
    /// Never resolves when no client is attached.
    pub fn disconnected(&self, task_id: &str) -> impl Future<Output = ()> + Send + 'static {
        let tx = self.sender(task_id);
        async move {
            match tx {
                Some(tx) => tx.closed().await,
                None => std::future::pending::<()>().await,
            }
        }
    }

    fn sender(&self, task_id: &str) -> Option<mpsc::Sender<Frame>> {
        self.sinks.get(task_id).map(|s| s.value().clone())
    }
}

impl Default for StreamBridge {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_BUFFER)
    }
}

/// Client side of a task channel.
///
/// Yields chunks in order and ends after completion or the first error.
/// Dropping it tells the worker the client has gone.
#[derive(Debug)]
pub struct TaskStream {
    rx: mpsc::Receiver<Frame>,
    finished: bool,
}

impl Stream for TaskStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Frame::Event(StreamEvent::Error(msg)))) => {
                self.finished = true;
                Poll::Ready(Some(StreamEvent::Error(msg)))
            }
            Poll::Ready(Some(Frame::Event(event))) => Poll::Ready(Some(event)),
            Poll::Ready(Some(Frame::End)) | Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
