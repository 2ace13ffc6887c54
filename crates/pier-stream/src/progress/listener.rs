//! Hand-off between a pipe and its one listener.
//!
//! Intermediate updates share a single slot: a newer update replaces one the
//! listener has not taken yet. The terminal update travels on its own
//! channel and is handed out only after the slot has been emptied.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use super::ProgressUpdate;

#[derive(Default)]
struct Slot {
    latest: Mutex<Option<ProgressUpdate>>,
    ready: Notify,
}

impl Slot {
    fn take(&self) -> Option<ProgressUpdate> {
        self.latest.lock().take()
    }
}

#[derive(Clone)]
pub(super) struct Publisher {
    slot: Arc<Slot>,
    terminal: mpsc::Sender<ProgressUpdate>,
}

impl Publisher {
    pub(super) fn is_closed(&self) -> bool {
        self.terminal.is_closed()
    }

    /// Returns the update that was still waiting in the slot, if any.
    pub(super) fn publish(&self, update: ProgressUpdate) -> Option<ProgressUpdate> {
        let superseded = self.slot.latest.lock().replace(update);
        self.slot.ready.notify_one();
        superseded
    }

    pub(super) async fn finish(self, update: ProgressUpdate) -> Result<(), mpsc::error::SendError<ProgressUpdate>> {
        self.terminal.send(update).await
    }
}

/// Receiving end of a [`ProgressPipe`](super::ProgressPipe).
///
/// Dropping it tells the pipe nobody is listening any more.
pub struct ProgressReceiver {
    slot: Arc<Slot>,
    terminal: mpsc::Receiver<ProgressUpdate>,
    held_terminal: Option<ProgressUpdate>,
}

impl ProgressReceiver {
    /// The newest undelivered update, or `None` once the terminal update has
    /// been handed out or the pipe went away.
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        loop {
            if let Some(update) = self.slot.take() {
                return Some(update);
            }
            if let Some(update) = self.held_terminal.take() {
                return Some(update);
            }
            tokio::select! {
                biased;
                _ = self.slot.ready.notified() => {}
                terminal = self.terminal.recv() => match terminal {
                    // Loop once more so a pending intermediate goes out first.
                    Some(update) => self.held_terminal = Some(update),
                    None => return self.slot.take(),
                },
            }
        }
    }
}

pub(super) fn channel() -> (Publisher, ProgressReceiver) {
    let slot = Arc::new(Slot::default());
    let (tx, rx) = mpsc::channel(1);
    (
        Publisher {
            slot: slot.clone(),
            terminal: tx,
        },
        ProgressReceiver {
            slot,
            terminal: rx,
            held_terminal: None,
        },
    )
}
