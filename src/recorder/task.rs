//! Worker thread plumbing: cancellation tokens, joinable tasks and the
//! one-shot auto-stop timer.
//!
//! Every thread the recorder starts is represented by a handle that the
//! controller eventually joins. Nothing is detached.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

struct CancelInner {
    cancelled: AtomicBool,
    // Never sent on; dropping the sender wakes every sleeper.
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

/// Cooperative cancellation flag with an interruptible sleep.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                wake_tx: Mutex::new(Some(wake_tx)),
                wake_rx,
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner
            .wake_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns true if the token
    /// is cancelled when the sleep ends.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.inner.wake_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_cancelled(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased thread handle that can be reaped later.
pub trait Joinable: Send {
    fn is_finished(&self) -> bool;
    fn join_boxed(self: Box<Self>);
}

impl<T: Send + 'static> Joinable for JoinHandle<T> {
    fn is_finished(&self) -> bool {
        JoinHandle::is_finished(self)
    }

    fn join_boxed(self: Box<Self>) {
        if (*self).join().is_err() {
            tracing::warn!(target: "recorder", "[TASK] Retired thread had panicked");
        }
    }
}

/// A named OS thread paired with the token that asks it to stop.
pub struct WorkerTask<T> {
    id: u64,
    token: CancelToken,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> WorkerTask<T> {
    pub fn spawn<F>(name: &str, id: u64, body: F) -> io::Result<Self>
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let token = CancelToken::new();
        let worker_token = token.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{}", name, id))
            .spawn(move || body(worker_token))?;

        Ok(Self { id, token, handle })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn join(self) -> thread::Result<T> {
        self.handle.join()
    }

    /// Gives up the result; the thread is joined later by whoever reaps it.
    pub fn into_joinable(self) -> Box<dyn Joinable> {
        Box::new(self.handle)
    }
}

/// Fires a callback once after a delay unless disarmed first.
pub struct OneShotTimer {
    disarm_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl OneShotTimer {
    pub fn arm<F>(delay: Duration, on_fire: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (disarm_tx, disarm_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("auto-stop".to_string())
            .spawn(move || match disarm_rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => on_fire(),
                _ => {
                    tracing::debug!(target: "recorder", "[TASK] Auto-stop timer disarmed");
                }
            })?;

        Ok(Self { disarm_tx, handle })
    }

    /// Stops the timer if it has not fired yet. The returned handle must be
    /// joined by the caller, but never from inside the callback itself.
    pub fn disarm(self) -> Box<dyn Joinable> {
        let _ = self.disarm_tx.try_send(());
        drop(self.disarm_tx);
        Box::new(self.handle)
    }
}
