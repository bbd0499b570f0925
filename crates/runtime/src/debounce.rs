use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

#[derive(Debug, Copy, Clone)]
enum Signal {
    Trigger,
    Clear,
}

/// Trailing-edge debouncer driven by a background timer task.
///
/// Every `trigger()` pushes the deadline `window` into the future; the action
/// runs once the input has been quiet for a full window. Dropping the
/// debouncer (or calling `shutdown`) ends the timer task, so no timer outlives
/// its owner.
#[derive(Debug)]
pub struct Debouncer {
    tx: mpsc::UnboundedSender<Signal>,
    task: JoinHandle<()>,
}

impl Debouncer {
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(window: Duration, mut on_quiet: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal>();
        let task = tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(Signal::Trigger) => deadline = Some(Instant::now() + window),
                        Some(Signal::Clear) => deadline = None,
                        None => break,
                    },
                    () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        on_quiet();
                    }
                }
            }
            tracing::trace!("debounce timer task stopped");
        });
        Self { tx, task }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(Signal::Trigger);
    }

    /// Drops a pending deadline without firing.
    pub fn clear(&self) {
        let _ = self.tx.send(Signal::Clear);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
