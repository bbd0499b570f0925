use std::sync::Arc;

use parking_lot::Mutex;
use runtime::work_queue::WorkQueue;
use tokio::sync::oneshot;

use crate::request::Priority;

#[derive(Debug)]
struct SlotState {
    active: usize,
    max: usize,
    waiting: WorkQueue<oneshot::Sender<FetchSlot>>,
}

/// Bounded set of network fetch slots.
///
/// Waiters are ordered by the deterministic `runtime::WorkQueue`: priority
/// class first, FIFO within a class. A released slot is handed straight to
/// the next waiter, so a newly arriving caller cannot overtake the queue.
#[derive(Debug, Clone)]
pub struct FetchQueue {
    state: Arc<Mutex<SlotState>>,
}

/// Held for the duration of one network fetch (all attempts).
#[derive(Debug)]
pub struct FetchSlot {
    state: Option<Arc<Mutex<SlotState>>>,
}

impl FetchQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState {
                active: 0,
                max: max_concurrent.max(1),
                waiting: WorkQueue::new(),
            })),
        }
    }

    pub fn active(&self) -> usize {
        self.state.lock().active
    }

    /// Live waiters; callers whose task went away are pruned first.
    pub fn queued(&self) -> usize {
        let mut s = self.state.lock();
        s.waiting.retain(|tx| !tx.is_closed());
        s.waiting.len()
    }

    pub async fn acquire(&self, priority: Priority) -> FetchSlot {
        loop {
            let rx = {
                let mut s = self.state.lock();
                if s.active < s.max {
                    s.active += 1;
                    return FetchSlot {
                        state: Some(self.state.clone()),
                    };
                }
                let (tx, rx) = oneshot::channel();
                s.waiting.push(priority.rank(), tx);
                rx
            };
            // A dropped sender means the waiter list was discarded; queue again.
            if let Ok(slot) = rx.await {
                return slot;
            }
        }
    }
}

fn release(state: &Arc<Mutex<SlotState>>) {
    loop {
        let next = {
            let mut s = state.lock();
            match s.waiting.pop_next() {
                Some((_, _, tx)) => tx,
                None => {
                    s.active = s.active.saturating_sub(1);
                    return;
                }
            }
        };
        match next.send(FetchSlot {
            state: Some(state.clone()),
        }) {
            Ok(()) => return,
            // Waiter went away; offer the same slot to the next one.
            Err(mut slot) => slot.state = None,
        }
    }
}

impl Drop for FetchSlot {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            release(&state);
        }
    }
}
