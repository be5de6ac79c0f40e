//! Single-value output streams and the registry they are published to.
//!
//! A [`ValueStream`] is the observable result of one pipeline run: it yields
//! exactly one terminal outcome (a value or an error) to any number of
//! subscribers. Each run is also announced to a [`StreamRegistry`] as a
//! [`StreamInfo`] so the rest of the host can pick it up by name.

use crate::error::BusError;
use chrono::{DateTime, Local};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::stream::{self, Stream};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Aborts the producing task once the last stream clone is gone.
struct TaskGuard(AbortHandle);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A hot, replayable stream of exactly one terminal outcome.
///
/// The producing future runs on its own task from the moment the stream is
/// created. Cloning is cheap; all clones observe the same outcome.
///
/// Cancellation: [`ValueStream::cancel`], or dropping every clone, aborts
/// the task. Anything the task holds is dropped with it, and subscribers
/// still waiting receive [`BusError::Cancelled`].
pub struct ValueStream<T> {
    outcome: Shared<BoxFuture<'static, Result<T, BusError>>>,
    task: Option<Arc<TaskGuard>>,
}

impl<T> Clone for ValueStream<T> {
    fn clone(&self) -> Self {
        Self {
            outcome: self.outcome.clone(),
            task: self.task.clone(),
        }
    }
}

impl<T> ValueStream<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Run `producer` on a new task. Must be called inside a tokio runtime.
    pub fn spawn<F>(producer: F) -> Self
    where
        F: Future<Output = Result<T, BusError>> + Send + 'static,
    {
        let handle = tokio::spawn(producer);
        let guard = TaskGuard(handle.abort_handle());

        let outcome = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(BusError::Cancelled),
                Err(e) => std::panic::resume_unwind(e.into_panic()),
            }
        }
        .boxed()
        .shared();

        Self {
            outcome,
            task: Some(Arc::new(guard)),
        }
    }

    /// A stream that has already terminated with `result`.
    pub fn completed(result: Result<T, BusError>) -> Self {
        let outcome = futures_util::future::ready(result).boxed().shared();
        // `Shared` only records its output once polled.
        let _ = outcome.clone().now_or_never();
        Self {
            outcome,
            task: None,
        }
    }

    /// Wait for the terminal outcome.
    pub async fn value(&self) -> Result<T, BusError> {
        self.outcome.clone().await
    }

    /// The terminal outcome, if already available.
    ///
    /// A spawned stream reports `None` until some subscriber has observed
    /// the outcome through [`value`](Self::value) or [`subscribe`](Self::subscribe).
    pub fn peek(&self) -> Option<Result<T, BusError>> {
        self.outcome.peek().cloned()
    }

    /// Abort the producing task if it is still running.
    pub fn cancel(&self) {
        if let Some(task) = &self.task {
            if !task.0.is_finished() {
                debug!("Cancelling stream producer");
            }
            task.0.abort();
        }
    }

    /// Observe the outcome as a `Stream` yielding one item, then ending.
    ///
    /// The returned stream does not keep the producer alive on its own.
    pub fn subscribe(&self) -> impl Stream<Item = Result<T, BusError>> + Send + 'static {
        stream::once(self.outcome.clone())
    }
}

/// Descriptor published to a [`StreamRegistry`].
#[derive(Clone)]
pub struct StreamInfo<T> {
    pub component: String,
    pub stream_name: String,
    pub stream_type: String,
    pub action: String,
    pub stream: ValueStream<T>,
}

impl<T> fmt::Debug for StreamInfo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamInfo")
            .field("component", &self.component)
            .field("stream_name", &self.stream_name)
            .field("stream_type", &self.stream_type)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Receives published streams. The registry owns what it is given.
pub trait StreamRegistry: Send + Sync {
    fn register(&self, info: StreamInfo<String>);
}

/// A stream descriptor with the time it was mounted.
#[derive(Clone, Debug)]
pub struct MountedStream {
    pub info: StreamInfo<String>,
    pub mounted_at: DateTime<Local>,
}

/// In-process registry: append-only list of mounted streams plus a
/// broadcast channel for listeners that want to hear about new ones.
pub struct Dispatcher {
    mounted: Mutex<Vec<MountedStream>>,
    events: broadcast::Sender<StreamInfo<String>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            mounted: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Listen for streams mounted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamInfo<String>> {
        self.events.subscribe()
    }

    /// Snapshot of everything mounted so far.
    pub fn mounted(&self) -> Vec<MountedStream> {
        self.mounted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Streams mounted under `stream_name`, oldest first.
    pub fn find(&self, stream_name: &str) -> Vec<StreamInfo<String>> {
        self.mounted()
            .into_iter()
            .filter(|m| m.info.stream_name == stream_name)
            .map(|m| m.info)
            .collect()
    }
}

impl StreamRegistry for Dispatcher {
    fn register(&self, info: StreamInfo<String>) {
        info!(
            "Mounted stream {}/{} ({}, {})",
            info.component, info.stream_name, info.stream_type, info.action
        );
        self.mounted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MountedStream {
                info: info.clone(),
                mounted_at: Local::now(),
            });
        if self.events.send(info).is_err() {
            debug!("No listeners for mounted streams");
        }
    }
}
