//! Interruptible waiting
//!
//! Replaces sleep-and-recheck loops with a poll that can be broken by a
//! shutdown signal at any point, including while a check is in flight.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Owner side of a shutdown signal
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, ShutdownSignal { rx })
    }

    /// Fire the signal for every subscriber
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver side of a shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal has fired
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Owner dropped without firing
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Sleep for `duration`. Returns `false` if `shutdown` fired first.
pub async fn pause(duration: Duration, shutdown: &mut ShutdownSignal) -> bool {
    if shutdown.is_triggered() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.triggered() => false,
    }
}

/// Run `check` every `interval` until it yields a value.
///
/// There is no attempt cap. Returns `Ok(None)` if `shutdown` fires first,
/// including while a check is still running.
pub async fn poll_until<F, Fut, T, E>(
    interval: Duration,
    shutdown: &mut ShutdownSignal,
    mut check: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    loop {
        if shutdown.is_triggered() {
            return Ok(None);
        }

        let outcome = tokio::select! {
            outcome = check() => outcome?,
            _ = shutdown.triggered() => return Ok(None),
        };
        if let Some(value) = outcome {
            return Ok(Some(value));
        }

        if !pause(interval, shutdown).await {
            return Ok(None);
        }
    }
}
