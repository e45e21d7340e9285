use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::transport::{ChannelConnector, ChannelEndpoint, ChannelLink, ChannelState, LinkEvent};

/// Session-wide notification connection. One per logged-in session, fully
/// independent of whichever conversation is open; closing a conversation
/// never touches it.
pub struct NotifyChannel {
    state: ChannelState,
    link: Option<Arc<dyn ChannelLink>>,
}

impl NotifyChannel {
    pub fn new() -> Self {
        Self {
            state: ChannelState::Closed,
            link: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Connect the session channel. Failure leaves it Closed and is not
    /// fatal; the periodic inbox poll still converges the inbox.
    pub async fn open(
        &mut self,
        connector: &dyn ChannelConnector,
        endpoint: &ChannelEndpoint,
    ) -> ChannelState {
        self.state = ChannelState::Connecting;
        match connector.connect(endpoint).await {
            Ok(link) => {
                self.link = Some(link);
                self.state = ChannelState::Open;
            }
            Err(err) => {
                warn!("notification channel open failed: {err}");
                self.link = None;
                self.state = ChannelState::Closed;
            }
        }
        self.state
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<LinkEvent>> {
        self.link.as_ref().map(|link| link.subscribe())
    }

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

impl Default for NotifyChannel {
    fn default() -> Self {
        Self::new()
    }
}
