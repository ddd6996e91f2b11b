//! The rendezvous abstraction.
//!
//! A rendezvous is a table of one-shot channels keyed by [`ParsedKey`]. The
//! producer calls [`Rendezvous::send`]; the consumer calls
//! [`Rendezvous::recv_async`] with a callback, or awaits
//! [`RendezvousExt::recv`]. Either side may arrive first. A producer never
//! blocks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{Args, Array, CancellationManager, Error, ErrorCode, ParsedKey, Result};

/// What a receiver gets once its key is matched.
#[derive(Debug)]
pub struct Delivery {
    pub send_args: Args,
    pub recv_args: Args,
    pub value: Array,
    pub is_dead: bool,
}

/// Invoked exactly once per [`Rendezvous::recv_async`] call.
pub type DoneCallback = Box<dyn FnOnce(Result<Delivery>) + Send>;

/// Invoked exactly once per [`RendezvousExt::fuse_recv_async`] call.
pub type FuseDoneCallback = Box<dyn FnOnce(Result<Vec<Delivery>>) + Send>;

/// A table of channels between producers and consumers.
///
/// Tables are shared behind an `Arc`; the last reference going away tears
/// the table down.
pub trait Rendezvous: Send + Sync {
    /// Register `value` under `key`, or hand it to a receiver already waiting
    /// on `key`. Never blocks.
    ///
    /// Fails with the abort status once [`start_abort`](Self::start_abort)
    /// has been called.
    fn send(&self, key: &ParsedKey, args: &Args, value: Array, is_dead: bool) -> Result<()>;

    /// Ask for the value under `key`.
    ///
    /// `done` runs exactly once: inline if a value is already there, otherwise
    /// on whichever thread later sends the value, aborts the table, or cancels
    /// `args.cancellation`. Implementations must honor `args.cancellation`.
    fn recv_async(&self, key: &ParsedKey, args: &Args, done: DoneCallback);

    /// Fail every pending and future operation with `status`.
    ///
    /// Does not wait for callbacks already running on other threads.
    fn start_abort(&self, status: Error);
}

impl<R: Rendezvous + ?Sized> Rendezvous for Arc<R> {
    fn send(&self, key: &ParsedKey, args: &Args, value: Array, is_dead: bool) -> Result<()> {
        (**self).send(key, args, value, is_dead)
    }

    fn recv_async(&self, key: &ParsedKey, args: &Args, done: DoneCallback) {
        (**self).recv_async(key, args, done)
    }

    fn start_abort(&self, status: Error) {
        (**self).start_abort(status)
    }
}

/// Helpers built on top of [`Rendezvous::recv_async`].
pub trait RendezvousExt: Rendezvous {
    /// Wait for the value under `key`.
    ///
    /// With a `timeout`, a receive that is not matched in time fails with
    /// `DeadlineExceeded` and its interest is withdrawn from the table, so a
    /// later send on the same key stays available for the next receiver.
    fn recv(
        &self,
        key: &ParsedKey,
        args: &Args,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Delivery>> + Send {
        async move {
            // Each receive gets its own cancellation scope so a timeout can
            // retract exactly this waiter. The caller's manager, if any,
            // cancels the scope too.
            let scope = Arc::new(CancellationManager::new());
            let parent = match &args.cancellation {
                Some(parent) => {
                    let child = Arc::clone(&scope);
                    match parent.register_callback(move || child.start_cancel()) {
                        Some(token) => Some((Arc::clone(parent), token)),
                        None => {
                            return Err(Error::canceled(format!("receive of {key} was cancelled")));
                        }
                    }
                }
                None => None,
            };

            let mut scoped_args = args.clone();
            scoped_args.cancellation = Some(Arc::clone(&scope));

            let (tx, mut rx) = oneshot::channel();
            self.recv_async(
                key,
                &scoped_args,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );

            let outcome = match timeout {
                None => (&mut rx).await,
                Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        scope.start_cancel();
                        // The waiter is now resolved one way or another. If a
                        // send matched it before the retraction, keep the value;
                        // an abort that got there first wins over the timeout.
                        match rx.await {
                            Ok(Ok(delivery)) => Ok(Ok(delivery)),
                            Ok(Err(err)) if err.code() == ErrorCode::Aborted => Ok(Err(err)),
                            _ => {
                                tracing::warn!(%key, ?limit, "receive timed out");
                                Ok(Err(Error::deadline_exceeded(format!(
                                    "timed out after {limit:?} waiting for {key}"
                                ))))
                            }
                        }
                    }
                },
            };

            if let Some((parent, token)) = parent {
                parent.deregister_callback(token);
            }

            match outcome {
                Ok(Ok(mut delivery)) => {
                    delivery.recv_args.cancellation = args.cancellation.clone();
                    Ok(delivery)
                }
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::internal(format!(
                    "rendezvous dropped the receive callback for {key}"
                ))),
            }
        }
    }

    /// Receive a batch of keys at once.
    ///
    /// `done` runs once, with every delivery in key order, or with the first
    /// error any of the receives reports.
    fn fuse_recv_async(&self, keys: &[ParsedKey], args: &Args, done: FuseDoneCallback) {
        if keys.is_empty() {
            done(Ok(Vec::new()));
            return;
        }

        struct Fused {
            slots: Vec<Option<Delivery>>,
            remaining: usize,
            done: Option<FuseDoneCallback>,
        }

        let fused = Arc::new(Mutex::new(Fused {
            slots: (0..keys.len()).map(|_| None).collect(),
            remaining: keys.len(),
            done: Some(done),
        }));

        for (index, key) in keys.iter().enumerate() {
            let fused = Arc::clone(&fused);
            self.recv_async(
                key,
                args,
                Box::new(move |result| {
                    let mut state = fused.lock();
                    let finished = match result {
                        Ok(delivery) => {
                            state.slots[index] = Some(delivery);
                            state.remaining -= 1;
                            if state.remaining > 0 {
                                return;
                            }
                            let values: Vec<Delivery> = state.slots.drain(..).flatten().collect();
                            state.done.take().map(|done| (done, Ok(values)))
                        }
                        Err(err) => state.done.take().map(|done| (done, Err(err))),
                    };
                    drop(state);
                    if let Some((done, result)) = finished {
                        done(result);
                    }
                }),
            );
        }
    }
}

impl<R: Rendezvous + ?Sized> RendezvousExt for R {}
