//! Operation scheduler
//!
//! Runs units of work against a piece of state one at a time, in submission
//! order. The state is owned by a worker task and lent to each unit as
//! `&mut S`, so units never need locks to touch it and no two units can
//! observe each other half-way through.
//!
//! Submitting is synchronous: [`Scheduler::schedule`] fixes the unit's queue
//! position before returning a [`Scheduled`] future for its result. Dropping
//! that future does not cancel the unit; it still runs to completion.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use crate::error::CacheStorageError;

type Unit<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send>;

fn into_unit<S, F>(f: F) -> Unit<S>
where
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// Pending result of a scheduled unit
#[must_use = "the operation runs regardless; await this to observe its result"]
pub struct Scheduled<T> {
    rx: oneshot::Receiver<Result<T, CacheStorageError>>,
}

impl<T> Scheduled<T> {
    /// A result that is already known, e.g. a rejected submission
    pub(crate) fn ready(result: Result<T, CacheStorageError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl<T> Future for Scheduled<T> {
    type Output = Result<T, CacheStorageError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(CacheStorageError::storage("operation dropped")))
        })
    }
}

/// FIFO single-writer scheduler over state `S`
pub struct Scheduler<S> {
    tx: mpsc::UnboundedSender<Unit<S>>,
    pending: Arc<AtomicUsize>,
}

impl<S: Send + 'static> Scheduler<S> {
    /// Spawn the worker owning `state`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(state: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Unit<S>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();

        tokio::spawn(async move {
            let mut state = state;
            while let Some(unit) = rx.recv().await {
                unit(&mut state).await;
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Self { tx, pending }
    }

    /// Queue a unit of work. It starts once every earlier unit has finished.
    ///
    /// A unit that panics resolves to `Storage("operation aborted")`; the
    /// queue keeps advancing either way.
    pub fn schedule<T, F>(&self, op: F) -> Scheduled<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<T, CacheStorageError>> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let unit = into_unit(move |state: &mut S| {
            async move {
                let outcome = AssertUnwindSafe(async move { op(state).await })
                    .catch_unwind()
                    .await;
                let result = match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!("Scheduled operation panicked; advancing queue");
                        Err(CacheStorageError::storage("operation aborted"))
                    }
                };
                // The caller may have stopped listening
                let _ = result_tx.send(result);
            }
            .boxed()
        });

        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(unit).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Scheduled::ready(Err(CacheStorageError::Closed));
        }
        Scheduled { rx: result_rx }
    }

    /// Units queued or running
    pub fn pending_operations(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}
