use tokio::sync::mpsc;
use tracing::debug;

use crate::machine::NavigationStateMachine;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Key {
    Escape,
    Enter,
    Char(char),
}

/// Input that may cancel an active navigation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelSignal {
    Key(Key),
    /// The on-screen cancel control.
    Control,
}

impl CancelSignal {
    pub fn requests_cancel(self) -> bool {
        matches!(self, CancelSignal::Key(Key::Escape) | CancelSignal::Control)
    }
}

/// Routes the global cancel signal to the state machine.
#[derive(Debug, Clone)]
pub struct CancellationHandler {
    machine: NavigationStateMachine,
}

impl CancellationHandler {
    pub fn new(machine: NavigationStateMachine) -> Self {
        Self { machine }
    }

    /// True when the signal actually cancelled a navigation.
    pub async fn handle(&self, signal: CancelSignal) -> bool {
        if !signal.requests_cancel() || !self.machine.can_cancel() {
            debug!(?signal, "cancel signal ignored");
            return false;
        }
        self.machine.cancel().await
    }

    /// Consumes signals until every sender is gone.
    pub async fn run(self, mut signals: mpsc::Receiver<CancelSignal>) {
        while let Some(signal) = signals.recv().await {
            self.handle(signal).await;
        }
        debug!("cancel signal channel closed");
    }
}
