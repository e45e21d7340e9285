use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::warn;

use shared::domain::ChatId;

use crate::{gateway::HistoryGateway, reconciler::InboxReconciler, InboxEvent};

/// Debounces the mark-read call for the open conversation: each arrival
/// re-arms a quiescence timer, so a burst of messages costs one gateway call
/// instead of one per message. Created only when the session user owns the
/// property being discussed.
pub struct ReadStateTracker {
    gateway: Arc<dyn HistoryGateway>,
    reconciler: Arc<Mutex<InboxReconciler>>,
    events: broadcast::Sender<InboxEvent>,
    chat_id: ChatId,
    quiet: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ReadStateTracker {
    pub fn new(
        gateway: Arc<dyn HistoryGateway>,
        reconciler: Arc<Mutex<InboxReconciler>>,
        events: broadcast::Sender<InboxEvent>,
        chat_id: ChatId,
        quiet: Duration,
    ) -> Self {
        Self {
            gateway,
            reconciler,
            events,
            chat_id,
            quiet,
            timer: Mutex::new(None),
        }
    }

    /// A message landed in the open conversation: restart the quiescence
    /// window. When it elapses with no further arrivals, mark the
    /// conversation read against the backend. A failed call is logged and
    /// not retried; the next arrival re-arms the timer naturally.
    pub async fn observe_arrival(&self) {
        let mut timer = self.timer.lock().await;
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let gateway = Arc::clone(&self.gateway);
        let reconciler = Arc::clone(&self.reconciler);
        let events = self.events.clone();
        let chat_id = self.chat_id;
        let quiet = self.quiet;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            match gateway.mark_read(chat_id).await {
                Ok(()) => {
                    reconciler.lock().await.mark_open_read(chat_id);
                    let _ = events.send(InboxEvent::ReadMarked { chat_id });
                }
                Err(err) => {
                    warn!(chat_id = chat_id.0, "mark-read failed: {err}");
                }
            }
        }));
    }

    /// Deterministic teardown on conversation close.
    pub async fn cancel(&self) {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/read_state_tests.rs"]
mod tests;
