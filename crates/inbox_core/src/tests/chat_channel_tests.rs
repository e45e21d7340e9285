use super::*;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ChannelError;

struct RecordingLink {
    sent: tokio::sync::Mutex<Vec<String>>,
    fail_from: Option<usize>,
    frames: broadcast::Sender<LinkEvent>,
}

impl RecordingLink {
    fn new() -> Arc<Self> {
        Self::with_failure(None)
    }

    fn failing_from(index: usize) -> Arc<Self> {
        Self::with_failure(Some(index))
    }

    fn with_failure(fail_from: Option<usize>) -> Arc<Self> {
        let (frames, _) = broadcast::channel(16);
        Arc::new(Self {
            sent: tokio::sync::Mutex::new(Vec::new()),
            fail_from,
            frames,
        })
    }
}

#[async_trait]
impl ChannelLink for RecordingLink {
    async fn transmit(&self, text: String) -> Result<()> {
        let mut sent = self.sent.lock().await;
        if let Some(fail_from) = self.fail_from {
            if sent.len() >= fail_from {
                return Err(ChannelError::Transmit("link went away".into()).into());
            }
        }
        sent.push(text);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.frames.subscribe()
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn send_while_closed_queues_in_order() {
    let mut channel = ChatChannel::new();

    channel.send("first".into()).await;
    channel.send("second".into()).await;

    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(channel.pending_len(), 2);
}

#[tokio::test]
async fn attach_flushes_queue_fifo_exactly_once() {
    let link = RecordingLink::new();
    let mut channel = ChatChannel::new();
    channel.begin_open();
    channel.send("one".into()).await;
    channel.send("two".into()).await;
    channel.send("three".into()).await;
    assert_eq!(channel.state(), ChannelState::Connecting);

    channel.attach(link.clone()).await;

    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(channel.pending_len(), 0);
    assert_eq!(
        *link.sent.lock().await,
        vec!["one".to_string(), "two".to_string(), "three".to_string()]
    );

    channel.send("four".into()).await;
    assert_eq!(link.sent.lock().await.len(), 4);
    assert_eq!(channel.pending_len(), 0);
}

#[tokio::test]
async fn failed_open_keeps_queue_and_reports_closed() {
    let mut channel = ChatChannel::new();
    channel.begin_open();
    channel.send("held back".into()).await;

    channel.fail_open();

    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(channel.pending_len(), 1);
}

#[tokio::test]
async fn transmit_failure_requeues_at_front_and_closes() {
    let link = RecordingLink::failing_from(0);
    let mut channel = ChatChannel::new();
    channel.begin_open();
    channel.attach(link.clone()).await;
    assert_eq!(channel.state(), ChannelState::Open);

    channel.send("never delivered".into()).await;

    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(channel.pending_len(), 1);
    assert!(link.sent.lock().await.is_empty());
}

#[tokio::test]
async fn drain_failure_preserves_unsent_suffix_in_order() {
    let link = RecordingLink::failing_from(1);
    let mut channel = ChatChannel::new();
    channel.begin_open();
    channel.send("a".into()).await;
    channel.send("b".into()).await;
    channel.send("c".into()).await;

    channel.attach(link.clone()).await;

    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(*link.sent.lock().await, vec!["a".to_string()]);
    assert_eq!(channel.pending_len(), 2);

    // Nothing was lost: a fresh link drains the suffix in original order.
    let retry = RecordingLink::new();
    channel.begin_open();
    channel.attach(retry.clone()).await;
    assert_eq!(
        *retry.sent.lock().await,
        vec!["b".to_string(), "c".to_string()]
    );
    assert_eq!(channel.pending_len(), 0);
}

#[tokio::test]
async fn close_releases_link() {
    let link = RecordingLink::new();
    let mut channel = ChatChannel::new();
    channel.begin_open();
    channel.attach(link).await;

    channel.close().await;

    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(channel.subscribe().is_none());
}
