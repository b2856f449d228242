//! Task queue between host threads and the drive loop
//!
//! Every piece of work that must run on the owner thread travels as a boxed
//! task over a bounded channel. Producers on other threads block while the
//! channel is full. The owner thread, and any thread inside an async runtime,
//! gets [`Error::QueueFull`] instead; async code can wait for room with
//! [`Value::queue_call`]. A single-worker clock runtime hosts timer sleeps
//! and the idle wait of the drive loop, and never touches the engine.

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::value::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{mpsc as std_mpsc, Arc};
use std::task::{Context, Poll};
use std::time::Duration;
use tether_core::CancelToken;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Unit of work executed by the drive loop on the owner thread.
pub(crate) type Task = Box<dyn FnOnce() -> Result<()> + Send>;

pub(crate) struct Scheduler {
    tx: mpsc::Sender<Task>,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    clock: Option<tokio::runtime::Runtime>,
    handle: Handle,
}

impl Scheduler {
    pub(crate) fn new(config: &RuntimeConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel(config.task_queue_capacity);
        let clock = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(config.timer_thread_name.clone())
            .enable_time()
            .build()
            .map_err(Error::host)?;
        let handle = clock.handle().clone();
        Ok(Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            clock: Some(clock),
            handle,
        })
    }

    /// Queues `task`. The owner thread and threads inside an async runtime
    /// never block here.
    pub(crate) fn submit(&self, task: Task, on_owner: bool) -> Result<()> {
        if on_owner || Handle::try_current().is_ok() {
            self.tx.try_send(task).map_err(|err| match err {
                TrySendError::Full(_) => Error::QueueFull,
                TrySendError::Closed(_) => Error::QueueClosed,
            })
        } else {
            self.tx.blocking_send(task).map_err(|_| Error::QueueClosed)
        }
    }

    /// Queues `task`, waiting asynchronously while the queue is full.
    pub(crate) async fn submit_async(&self, task: Task) -> Result<()> {
        self.tx.send(task).await.map_err(|_| Error::QueueClosed)
    }

    /// Runs `task` on the drive loop once `delay` has elapsed.
    pub(crate) fn schedule(&self, delay: Duration, task: Task) -> JoinHandle<()> {
        let tx = self.tx.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(task).await.is_err() {
                tracing::trace!("task queue closed before timer fired");
            }
        })
    }

    pub(crate) fn try_next(&self) -> Option<Task> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Blocks until a task arrives. Returns `None` once `cancel` fires.
    ///
    /// The wait itself runs on the clock thread, so the caller may sit
    /// inside an async runtime of its own.
    pub(crate) fn wait_next(&self, cancel: &CancelToken) -> Result<Option<Task>> {
        let rx = Arc::clone(&self.rx);
        let cancel = cancel.clone();
        let (reply, outcome) = std_mpsc::sync_channel(1);
        self.handle.spawn(async move {
            let mut rx = rx.lock().await;
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(None),
                task = rx.recv() => task.map(Some).ok_or(Error::QueueClosed),
            };
            drop(rx);
            let _ = reply.send(next);
        });
        outcome.recv().unwrap_or(Err(Error::QueueClosed))
    }

    pub(crate) fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub(crate) fn shutdown(&mut self) {
        if let Some(clock) = self.clock.take() {
            clock.shutdown_background();
        }
    }

}

/// Result of a call queued for the drive loop.
///
/// Either block on it with [`AsyncResult::wait`] from a thread that is not
/// driving the loop, or `.await` it.
#[derive(Debug)]
#[must_use = "the call result is lost if the AsyncResult is dropped"]
pub struct AsyncResult {
    rx: oneshot::Receiver<Result<Value>>,
}

impl AsyncResult {
    /// Blocks the current thread until the call has run.
    ///
    /// Must not be called from the thread that drives the loop. Inside an
    /// async runtime it fails with [`Error::AsyncContext`]; `.await` the
    /// result there instead.
    pub fn wait(self) -> Result<Value> {
        if Handle::try_current().is_ok() {
            return Err(Error::AsyncContext);
        }
        self.rx.blocking_recv().unwrap_or(Err(Error::Abandoned))
    }

    /// Result if the call has already run.
    pub fn try_take(&mut self) -> Option<Result<Value>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Abandoned)),
        }
    }
}

impl Future for AsyncResult {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Abandoned)))
    }
}

/// Wraps `job` into a task that reports through the returned result.
fn call_task<F>(job: F) -> (Task, AsyncResult)
where
    F: FnOnce() -> Result<Value> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let task: Task = Box::new(move || match tx.send(job()) {
        Ok(()) => Ok(()),
        Err(Ok(_)) => Ok(()),
        Err(Err(err)) => {
            tracing::warn!(error = %err, "async call failed with nobody waiting");
            Err(err)
        }
    });
    (task, AsyncResult { rx })
}

impl Runtime {
    /// Queues `job` for the drive loop and hands back its result channel.
    pub(crate) fn submit_call<F>(&self, job: F) -> Result<AsyncResult>
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        let (task, result) = call_task(job);
        self.submit(task)?;
        Ok(result)
    }

    /// Like [`Runtime::submit_call`], waiting asynchronously for queue room.
    pub(crate) async fn submit_call_async<F>(&self, job: F) -> Result<AsyncResult>
    where
        F: FnOnce() -> Result<Value> + Send + 'static,
    {
        let (task, result) = call_task(job);
        self.inner().scheduler.submit_async(task).await?;
        Ok(result)
    }

    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        self.inner().scheduler.submit(task, self.is_owner_thread())
    }

    /// Tasks waiting in the queue.
    pub fn queued_tasks(&self) -> usize {
        self.inner().scheduler.queued()
    }
}
