//! Background-task lifecycle primitives.
//!
//! The upstream workspace wires long-lived tasks to a `GracefulShutdown`
//! future pinned into a `tokio::select! { biased; ... }` loop (see
//! `discovery::run_peer_store_consumer` in the teacher crate). That type
//! itself lives in a path dependency whose source was never retrieved, so
//! this module reimplements the same shape directly on `tokio::sync::watch`:
//! a cheap, clonable controller and a one-shot future that resolves after
//! `shutdown()` is called, usable the same way inside `select!`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Producer half: call `shutdown()` to signal every outstanding [`Shutdown`]
/// future created via `subscribe()`.
#[derive(Clone)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> (Self, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Shutdown::new(rx))
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.tx.subscribe())
    }

    /// Idempotent: sending to an already-shutdown channel is a no-op.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Resolves exactly once, when the owning [`ShutdownController`] signals.
/// Meant to be `tokio::pin!`'d and raced against other branches in a
/// `select!`, the same way the teacher races `GracefulShutdown`.
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    inner: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Shutdown {
    fn new(rx: watch::Receiver<bool>) -> Self {
        let mut inner_rx = rx.clone();
        let inner = Box::pin(async move {
            loop {
                if *inner_rx.borrow() {
                    return;
                }
                if inner_rx.changed().await.is_err() {
                    // Sender dropped without signaling; treat as shutdown.
                    return;
                }
            }
        });
        Self { rx, inner }
    }

    /// Non-blocking: true once shutdown has been signaled. Lets a long
    /// synchronous pass (e.g. the trimmer's candidate loop) check for
    /// cancellation between iterations without needing to be the polled
    /// branch of a `select!`.
    pub fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Future for Shutdown {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.inner.as_mut().poll(cx)
    }
}

/// Bundles a spawned task with the plumbing to stop it idempotently: an
/// atomic one-shot guard, the shutdown controller, and the join handle.
/// Every owner of a background loop in this crate (trimmer, jitter monitor,
/// subnet-limiter GC, manager reapers) goes through this type so `stop()` is
/// implemented once and is uniformly idempotent and join-on-stop.
pub struct BackgroundTask {
    controller: ShutdownController,
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl BackgroundTask {
    /// Spawns `make_future(shutdown)` on the current tokio runtime.
    pub fn spawn<F, Fut>(make_future: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (controller, shutdown) = ShutdownController::new();
        let handle = tokio::spawn(make_future(shutdown));
        Self {
            controller,
            handle: Mutex::new(Some(handle)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signals shutdown and awaits the task. Calling this more than once is
    /// a no-op after the first call returns.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.controller.shutdown();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
