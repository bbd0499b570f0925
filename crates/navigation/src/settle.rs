use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use runtime::debounce::Debouncer;
use tokio::sync::watch;
use tracing::debug;

type Listener = Box<dyn FnMut() + Send>;

/// Fires its listeners once the camera has stopped moving for a full window.
///
/// Built on a trailing-edge [`Debouncer`]; every `notify_moved` restarts the
/// window. Shutting down (or dropping) ends the timer task and forgets all
/// listeners. Listeners run on the timer task without the listener lock held,
/// so they may register listeners or shut the tracker down.
pub struct CameraSettlementTracker {
    debouncer: Mutex<Option<Debouncer>>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    closed: Arc<AtomicBool>,
    settled: Arc<watch::Sender<u64>>,
}

impl std::fmt::Debug for CameraSettlementTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraSettlementTracker")
            .field("listeners", &self.listeners.lock().len())
            .field("settled", &*self.settled.borrow())
            .finish()
    }
}

impl CameraSettlementTracker {
    /// Must be called from within a tokio runtime.
    pub fn new(window: Duration) -> Self {
        let listeners: Arc<Mutex<Vec<Listener>>> = Arc::new(Mutex::new(Vec::new()));
        let (tx, _) = watch::channel(0u64);
        let settled = Arc::new(tx);

        let closed = Arc::new(AtomicBool::new(false));

        let fire_listeners = listeners.clone();
        let fire_closed = closed.clone();
        let fire_settled = settled.clone();
        let debouncer = Debouncer::spawn(window, move || {
            fire_settled.send_modify(|n| *n += 1);
            let mut running = std::mem::take(&mut *fire_listeners.lock());
            debug!(listeners = running.len(), "camera settled");
            for listener in running.iter_mut() {
                listener();
            }
            if fire_closed.load(Ordering::SeqCst) {
                return;
            }
            // Keep registration order: earlier listeners, then any added meanwhile.
            let mut listeners = fire_listeners.lock();
            running.append(&mut listeners);
            *listeners = running;
        });

        Self {
            debouncer: Mutex::new(Some(debouncer)),
            listeners,
            closed,
            settled,
        }
    }

    pub fn on_settled(&self, listener: impl FnMut() + Send + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    /// Camera moved; restarts the quiet window.
    pub fn notify_moved(&self) {
        if let Some(d) = self.debouncer.lock().as_ref() {
            d.trigger();
        }
    }

    /// Counts settle events; each fire bumps the value.
    pub fn settled(&self) -> watch::Receiver<u64> {
        self.settled.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.debouncer.lock().as_ref().is_some_and(Debouncer::is_running)
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listeners.lock().clear();
        if let Some(d) = self.debouncer.lock().take() {
            d.shutdown();
        }
    }
}

impl Drop for CameraSettlementTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
