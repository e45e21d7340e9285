use super::*;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::{task::yield_now, time::advance};

use shared::domain::PropertyId;
use shared::protocol::{ChatMessage, ConversationHistory, ConversationSummary};

#[derive(Default)]
struct CountingGateway {
    mark_read_calls: Mutex<Vec<i64>>,
    fail_mark_read: bool,
}

impl CountingGateway {
    fn failing() -> Self {
        Self {
            mark_read_calls: Mutex::new(Vec::new()),
            fail_mark_read: true,
        }
    }
}

#[async_trait]
impl HistoryGateway for CountingGateway {
    async fn fetch_inbox(&self) -> Result<Vec<ConversationSummary>> {
        Err(anyhow!("not exercised"))
    }

    async fn fetch_history(&self, _property_id: PropertyId) -> Result<ConversationHistory> {
        Err(anyhow!("not exercised"))
    }

    async fn send_message(&self, _chat_id: ChatId, _text: &str) -> Result<()> {
        Err(anyhow!("not exercised"))
    }

    async fn mark_read(&self, chat_id: ChatId) -> Result<()> {
        self.mark_read_calls.lock().await.push(chat_id.0);
        if self.fail_mark_read {
            return Err(anyhow!("backend rejected mark-read"));
        }
        Ok(())
    }
}

fn open_reconciler(chat: i64) -> Arc<Mutex<InboxReconciler>> {
    let mut reconciler = InboxReconciler::new("owner@example.com");
    reconciler.open(&ConversationHistory {
        chat_id: ChatId(chat),
        property_id: PropertyId(chat * 10),
        owner: "owner@example.com".to_string(),
        messages: vec![ChatMessage {
            sender: "buyer@example.com".to_string(),
            text: "is the flat still free?".to_string(),
            sent_at: chrono::DateTime::from_timestamp(1, 0).expect("timestamp"),
            read: false,
        }],
    });
    Arc::new(Mutex::new(reconciler))
}

fn tracker_under_test(
    gateway: Arc<CountingGateway>,
    reconciler: Arc<Mutex<InboxReconciler>>,
    events: broadcast::Sender<InboxEvent>,
) -> ReadStateTracker {
    ReadStateTracker::new(
        gateway,
        reconciler,
        events,
        ChatId(1),
        Duration::from_millis(500),
    )
}

async fn settle() {
    for _ in 0..8 {
        yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn burst_collapses_to_single_mark_read_after_quiescence() {
    let gateway = Arc::new(CountingGateway::default());
    let reconciler = open_reconciler(1);
    let (events, _keep) = broadcast::channel(16);
    let mut rx = events.subscribe();
    let tracker = tracker_under_test(gateway.clone(), reconciler.clone(), events);

    // Messages land at t=0, t=100ms, t=200ms; each arrival re-arms the
    // 500ms quiescence window.
    tracker.observe_arrival().await;
    settle().await;
    advance(Duration::from_millis(100)).await;
    tracker.observe_arrival().await;
    settle().await;
    advance(Duration::from_millis(100)).await;
    tracker.observe_arrival().await;
    settle().await;

    // t=699ms: one millisecond short of the last window.
    advance(Duration::from_millis(499)).await;
    settle().await;
    assert!(gateway.mark_read_calls.lock().await.is_empty());

    advance(Duration::from_millis(2)).await;
    let event = rx.recv().await.expect("read marked event");
    assert!(matches!(event, InboxEvent::ReadMarked { chat_id } if chat_id == ChatId(1)));
    assert_eq!(*gateway.mark_read_calls.lock().await, vec![1]);

    // Quiet afterwards: no further calls without another arrival.
    advance(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(gateway.mark_read_calls.lock().await.len(), 1);

    let all_read = reconciler
        .lock()
        .await
        .open_messages()
        .iter()
        .all(|message| message.read);
    assert!(all_read);
}

#[tokio::test(start_paused = true)]
async fn failed_mark_read_is_logged_not_retried() {
    let gateway = Arc::new(CountingGateway::failing());
    let reconciler = open_reconciler(1);
    let (events, _keep) = broadcast::channel(16);
    let mut rx = events.subscribe();
    let tracker = tracker_under_test(gateway.clone(), reconciler.clone(), events);

    tracker.observe_arrival().await;
    settle().await;
    advance(Duration::from_millis(501)).await;
    settle().await;

    assert_eq!(gateway.mark_read_calls.lock().await.len(), 1);

    // No retry loop: plenty of quiet time, still one attempt.
    advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(gateway.mark_read_calls.lock().await.len(), 1);

    // The failure left local state untouched.
    let any_read = reconciler
        .lock()
        .await
        .open_messages()
        .iter()
        .any(|message| message.read);
    assert!(!any_read);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn next_arrival_rearms_after_success() {
    let gateway = Arc::new(CountingGateway::default());
    let reconciler = open_reconciler(1);
    let (events, _keep) = broadcast::channel(16);
    let tracker = tracker_under_test(gateway.clone(), reconciler, events);

    tracker.observe_arrival().await;
    settle().await;
    advance(Duration::from_millis(501)).await;
    settle().await;
    assert_eq!(gateway.mark_read_calls.lock().await.len(), 1);

    tracker.observe_arrival().await;
    settle().await;
    advance(Duration::from_millis(501)).await;
    settle().await;
    assert_eq!(gateway.mark_read_calls.lock().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_aborts_pending_timer() {
    let gateway = Arc::new(CountingGateway::default());
    let reconciler = open_reconciler(1);
    let (events, _keep) = broadcast::channel(16);
    let tracker = tracker_under_test(gateway.clone(), reconciler, events);

    tracker.observe_arrival().await;
    settle().await;
    tracker.cancel().await;

    advance(Duration::from_secs(2)).await;
    settle().await;
    assert!(gateway.mark_read_calls.lock().await.is_empty());
}
