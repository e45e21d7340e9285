use std::{collections::VecDeque, sync::Arc};

use tokio::sync::broadcast;
use tracing::warn;

use crate::transport::{ChannelLink, ChannelState, LinkEvent};

/// Real-time leg of one open conversation. Owns the queue of frames authored
/// while the link was not yet open; the queue is drained in FIFO order, each
/// frame exactly once, on the transition to Open.
pub struct ChatChannel {
    state: ChannelState,
    pending: VecDeque<String>,
    link: Option<Arc<dyn ChannelLink>>,
}

impl ChatChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Closed,
            pending: VecDeque::new(),
            link: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The connection attempt has started; sends from now on queue up until
    /// [`attach`](Self::attach) or [`fail_open`](Self::fail_open) resolves it.
    pub fn begin_open(&mut self) {
        self.state = ChannelState::Connecting;
    }

    /// Connection established: adopt the link and flush everything queued
    /// while it was down.
    pub async fn attach(&mut self, link: Arc<dyn ChannelLink>) {
        self.link = Some(link);
        self.state = ChannelState::Open;
        self.drain_pending().await;
    }

    /// The open attempt failed. Reported as a closed state, never an error;
    /// the caller reopens by reopening the conversation.
    pub fn fail_open(&mut self) {
        self.link = None;
        self.state = ChannelState::Closed;
    }

    /// Transmit immediately when open, queue otherwise. A failed transmit
    /// re-queues the frame at the front so order is preserved for the next
    /// open, and degrades the channel to Closed.
    pub async fn send(&mut self, frame: String) {
        if self.state != ChannelState::Open {
            self.pending.push_back(frame);
            return;
        }
        let Some(link) = self.link.as_ref() else {
            self.pending.push_back(frame);
            return;
        };
        if let Err(err) = link.transmit(frame.clone()).await {
            warn!("frame transmit failed, queueing for next open: {err}");
            self.pending.push_front(frame);
            self.state = ChannelState::Closed;
        }
    }

    async fn drain_pending(&mut self) {
        while let Some(frame) = self.pending.pop_front() {
            let Some(link) = self.link.as_ref() else {
                self.pending.push_front(frame);
                return;
            };
            if let Err(err) = link.transmit(frame.clone()).await {
                warn!("pending flush interrupted: {err}");
                self.pending.push_front(frame);
                self.state = ChannelState::Closed;
                return;
            }
        }
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<LinkEvent>> {
        self.link.as_ref().map(|link| link.subscribe())
    }

    /// The remote side went away; keep the queue for a later reopen.
    pub fn mark_closed(&mut self) {
        self.state = ChannelState::Closed;
    }

    pub async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.state = ChannelState::Closed;
    }
}

impl Default for ChatChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/chat_channel_tests.rs"]
mod tests;
