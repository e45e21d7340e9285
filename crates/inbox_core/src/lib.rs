use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use shared::domain::{ChannelScope, ChatId, PropertyId};
use shared::protocol::{ChatFrame, ChatMessage, ConversationSummary, MessageEvent, NotifyFrame};

pub mod chat_channel;
pub mod config;
pub mod error;
pub mod gateway;
pub mod notify_channel;
pub mod read_state;
pub mod reconciler;
pub mod transport;

use chat_channel::ChatChannel;
use config::Settings;
use gateway::{HistoryGateway, HttpGateway};
use notify_channel::NotifyChannel;
use read_state::ReadStateTracker;
use reconciler::{InboxReconciler, MergeOutcome};
use transport::{ChannelConnector, ChannelEndpoint, ChannelState, LinkEvent, WsConnector};

/// Who the session runs as. `user` must match the sender identity the
/// backend stamps on this account's messages, or own-echo suppression and
/// read tracking will misfire.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    pub user: String,
    pub auth_token: String,
}

#[derive(Debug, Clone)]
pub enum InboxEvent {
    InboxRefreshed,
    ConversationOpened { chat_id: ChatId },
    MessageReceived { chat_id: ChatId, message: ChatMessage },
    ReadMarked { chat_id: ChatId },
    ChannelStateChanged { scope: ChannelScope, state: ChannelState },
    Error(String),
}

struct ActiveConversation {
    chat_id: ChatId,
    property_id: PropertyId,
    channel: ChatChannel,
    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    read_tracker: Option<Arc<ReadStateTracker>>,
}

struct SessionTasks {
    notify: NotifyChannel,
    notify_reader: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

/// The delivery and reconciliation engine behind the buyer–seller inbox.
/// Owns one notification channel per session, at most one chat channel for
/// the conversation currently on screen, and the reconciler every message
/// event funnels through.
pub struct InboxService {
    settings: Settings,
    identity: SessionIdentity,
    gateway: Arc<dyn HistoryGateway>,
    connector: Arc<dyn ChannelConnector>,
    reconciler: Arc<Mutex<InboxReconciler>>,
    active: Mutex<Option<ActiveConversation>>,
    session: Mutex<Option<SessionTasks>>,
    events: broadcast::Sender<InboxEvent>,
}

impl InboxService {
    pub fn new(settings: Settings, identity: SessionIdentity) -> Arc<Self> {
        let gateway = Arc::new(HttpGateway::new(
            settings.api_base_url.clone(),
            identity.auth_token.clone(),
        ));
        Self::new_with_dependencies(settings, identity, gateway, Arc::new(WsConnector))
    }

    pub fn new_with_dependencies(
        settings: Settings,
        identity: SessionIdentity,
        gateway: Arc<dyn HistoryGateway>,
        connector: Arc<dyn ChannelConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let reconciler = Arc::new(Mutex::new(InboxReconciler::new(identity.user.clone())));
        Arc::new(Self {
            settings,
            identity,
            gateway,
            connector,
            reconciler,
            active: Mutex::new(None),
            session: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<InboxEvent> {
        self.events.subscribe()
    }

    /// Bring the session up: notification channel, initial inbox fetch,
    /// periodic refresh. Push and poll are independent triggers into the
    /// same merge, so either alone keeps the inbox converging.
    pub async fn start_session(self: &Arc<Self>) -> Result<()> {
        self.end_session().await;

        let ws_base = config::websocket_base(&self.settings.api_base_url)?;
        let mut notify = NotifyChannel::new();
        let endpoint = ChannelEndpoint::notify(&ws_base, &self.identity.auth_token);
        let state = notify.open(self.connector.as_ref(), &endpoint).await;
        let _ = self.events.send(InboxEvent::ChannelStateChanged {
            scope: ChannelScope::Notify,
            state,
        });

        let notify_reader = notify
            .subscribe()
            .map(|frames| self.spawn_notify_reader(frames));
        {
            let mut session = self.session.lock().await;
            *session = Some(SessionTasks {
                notify,
                notify_reader,
                poll: None,
            });
        }

        self.refresh_inbox().await?;

        let poll = self.spawn_poll_task();
        if let Some(session) = self.session.lock().await.as_mut() {
            session.poll = Some(poll);
        }

        info!(user = self.identity.user.as_str(), "inbox session started");
        Ok(())
    }

    /// Tear the session down: conversation first, then the session-scoped
    /// tasks and channel, then the reconciled state.
    pub async fn end_session(&self) {
        self.close_conversation().await;

        let session = { self.session.lock().await.take() };
        if let Some(mut session) = session {
            if let Some(task) = session.poll.take() {
                task.abort();
            }
            if let Some(task) = session.notify_reader.take() {
                task.abort();
            }
            session.notify.close().await;
        }

        self.reconciler.lock().await.reset();
    }

    /// Pull the summary list and fold it in.
    pub async fn refresh_inbox(&self) -> Result<()> {
        let entries = self
            .gateway
            .fetch_inbox()
            .await
            .context("failed to fetch inbox")?;
        self.reconciler.lock().await.refresh(entries);
        let _ = self.events.send(InboxEvent::InboxRefreshed);
        Ok(())
    }

    /// Open (or get-or-create) the conversation for a property: pull its
    /// history, reset its unread count, and establish the per-chat channel.
    /// The channel connects in the background; anything sent before it opens
    /// queues and flushes in order once it does. A failed connect leaves the
    /// conversation usable over REST.
    pub async fn open_conversation(self: &Arc<Self>, property_id: PropertyId) -> Result<ChatId> {
        self.close_conversation().await;

        let history = self
            .gateway
            .fetch_history(property_id)
            .await
            .with_context(|| format!("failed to fetch history for property {}", property_id.0))?;
        let chat_id = history.chat_id;

        {
            let mut reconciler = self.reconciler.lock().await;
            reconciler.open(&history);
            reconciler.mark_opened(chat_id);
        }
        let _ = self.events.send(InboxEvent::ConversationOpened { chat_id });

        let read_tracker = if history.owner == self.identity.user {
            Some(Arc::new(ReadStateTracker::new(
                Arc::clone(&self.gateway),
                Arc::clone(&self.reconciler),
                self.events.clone(),
                chat_id,
                Duration::from_millis(self.settings.read_debounce_ms),
            )))
        } else {
            None
        };
        let has_unread_incoming = history
            .messages
            .iter()
            .any(|message| !message.read && message.sender != self.identity.user);

        let mut channel = ChatChannel::new();
        channel.begin_open();
        {
            let mut active = self.active.lock().await;
            *active = Some(ActiveConversation {
                chat_id,
                property_id,
                channel,
                connect_task: None,
                reader_task: None,
                read_tracker,
            });
            if has_unread_incoming {
                if let Some(tracker) = active.as_ref().and_then(|a| a.read_tracker.as_ref()) {
                    tracker.observe_arrival().await;
                }
            }
        }
        let _ = self.events.send(InboxEvent::ChannelStateChanged {
            scope: ChannelScope::Chat,
            state: ChannelState::Connecting,
        });

        let ws_base = config::websocket_base(&self.settings.api_base_url)?;
        let endpoint =
            ChannelEndpoint::chat(&ws_base, chat_id, property_id, &self.identity.auth_token);
        let connect = self.spawn_channel_connect(chat_id, property_id, endpoint);
        if let Some(active) = self.active.lock().await.as_mut() {
            if active.chat_id == chat_id {
                active.connect_task = Some(connect);
            }
        }

        Ok(chat_id)
    }

    /// Release the chat channel and read tracker. The notification channel
    /// stays up for the rest of the session.
    pub async fn close_conversation(&self) {
        let active = { self.active.lock().await.take() };
        if let Some(mut active) = active {
            if let Some(task) = active.connect_task.take() {
                task.abort();
            }
            if let Some(task) = active.reader_task.take() {
                task.abort();
            }
            if let Some(tracker) = active.read_tracker.as_ref() {
                tracker.cancel().await;
            }
            active.channel.close().await;
        }
        self.reconciler.lock().await.close_open();
    }

    /// Persist the message and hand it to the real-time leg. Sending
    /// requires an open conversation; there is no destination otherwise.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(anyhow!("message text must not be empty"));
        }
        let chat_id = {
            let active = self.active.lock().await;
            active
                .as_ref()
                .map(|a| a.chat_id)
                .ok_or_else(|| anyhow!("no open conversation to send into"))?
        };

        self.gateway
            .send_message(chat_id, text)
            .await
            .context("failed to persist message")?;

        let frame =
            ChatFrame::encode(&self.identity.user, text).context("failed to encode frame")?;
        {
            let mut active = self.active.lock().await;
            if let Some(active) = active.as_mut() {
                if active.chat_id == chat_id {
                    active.channel.send(frame).await;
                }
            }
        }

        let echo = ChatMessage::outgoing(self.identity.user.clone(), text);
        self.reconciler
            .lock()
            .await
            .append_local_echo(echo.clone());
        let _ = self.events.send(InboxEvent::MessageReceived {
            chat_id,
            message: echo,
        });
        Ok(())
    }

    pub async fn inbox_snapshot(&self) -> Vec<ConversationSummary> {
        self.reconciler.lock().await.snapshot()
    }

    pub async fn open_messages(&self) -> Vec<ChatMessage> {
        self.reconciler.lock().await.open_messages().to_vec()
    }

    pub async fn active_chat(&self) -> Option<ChatId> {
        self.reconciler.lock().await.open_chat()
    }

    pub async fn unread_total(&self) -> u32 {
        self.reconciler.lock().await.unread_total()
    }

    pub async fn chat_channel_state(&self) -> ChannelState {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.channel.state())
            .unwrap_or(ChannelState::Closed)
    }

    /// Single merge entry point for both channels. Contained: a bad event
    /// never aborts the reader loops.
    async fn ingest_event(self: &Arc<Self>, event: MessageEvent) {
        let chat_id = event.chat_id;
        let message = event.message.clone();
        let outcome = { self.reconciler.lock().await.apply_event(event) };
        match outcome {
            MergeOutcome::Duplicate | MergeOutcome::OwnEcho => {}
            MergeOutcome::Counted => {
                let _ = self.events.send(InboxEvent::MessageReceived { chat_id, message });
            }
            MergeOutcome::AppendedToOpen => {
                let _ = self.events.send(InboxEvent::MessageReceived { chat_id, message });
                let active = self.active.lock().await;
                if let Some(active) = active.as_ref() {
                    if active.chat_id == chat_id {
                        if let Some(tracker) = active.read_tracker.as_ref() {
                            tracker.observe_arrival().await;
                        }
                    }
                }
            }
        }
    }

    fn spawn_channel_connect(
        self: &Arc<Self>,
        chat_id: ChatId,
        property_id: PropertyId,
        endpoint: ChannelEndpoint,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = service.connector.connect(&endpoint).await;
            let frames = {
                let mut guard = service.active.lock().await;
                let Some(active) = guard.as_mut().filter(|a| a.chat_id == chat_id) else {
                    // Conversation closed while we were connecting.
                    if let Ok(link) = result {
                        link.close().await;
                    }
                    return;
                };
                match result {
                    Ok(link) => {
                        let frames = link.subscribe();
                        active.channel.attach(link).await;
                        Some(frames)
                    }
                    Err(err) => {
                        warn!(chat_id = chat_id.0, "chat channel open failed: {err}");
                        active.channel.fail_open();
                        None
                    }
                }
            };

            match frames {
                Some(frames) => {
                    let reader = service.spawn_chat_reader(chat_id, property_id, frames);
                    let mut guard = service.active.lock().await;
                    match guard.as_mut().filter(|a| a.chat_id == chat_id) {
                        Some(active) => active.reader_task = Some(reader),
                        None => reader.abort(),
                    }
                    let _ = service.events.send(InboxEvent::ChannelStateChanged {
                        scope: ChannelScope::Chat,
                        state: ChannelState::Open,
                    });
                }
                None => {
                    let _ = service.events.send(InboxEvent::ChannelStateChanged {
                        scope: ChannelScope::Chat,
                        state: ChannelState::Closed,
                    });
                }
            }
        })
    }

    fn spawn_chat_reader(
        self: &Arc<Self>,
        chat_id: ChatId,
        property_id: PropertyId,
        mut frames: broadcast::Receiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(LinkEvent::Frame(raw)) => {
                        let message = ChatFrame::decode(&raw);
                        service
                            .ingest_event(MessageEvent {
                                chat_id,
                                property_id,
                                message,
                            })
                            .await;
                    }
                    Ok(LinkEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        if let Some(active) = service.active.lock().await.as_mut() {
                            if active.chat_id == chat_id {
                                active.channel.mark_closed();
                            }
                        }
                        let _ = service.events.send(InboxEvent::ChannelStateChanged {
                            scope: ChannelScope::Chat,
                            state: ChannelState::Closed,
                        });
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            chat_id = chat_id.0,
                            skipped, "chat reader lagged; history refetch on reopen recovers"
                        );
                    }
                }
            }
        })
    }

    fn spawn_notify_reader(
        self: &Arc<Self>,
        mut frames: broadcast::Receiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(LinkEvent::Frame(raw)) => match NotifyFrame::decode(&raw) {
                        Some(event) => service.ingest_event(event).await,
                        None => warn!("dropping unroutable notification frame"),
                    },
                    Ok(LinkEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                        if let Some(session) = service.session.lock().await.as_mut() {
                            session.notify.mark_closed();
                        }
                        let _ = service.events.send(InboxEvent::ChannelStateChanged {
                            scope: ChannelScope::Notify,
                            state: ChannelState::Closed,
                        });
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification reader lagged; inbox poll will reconcile");
                    }
                }
            }
        })
    }

    fn spawn_poll_task(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let interval = Duration::from_millis(self.settings.inbox_poll_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = service.refresh_inbox().await {
                    warn!("periodic inbox refresh failed: {err}");
                    let _ = service
                        .events
                        .send(InboxEvent::Error(format!("inbox refresh failed: {err}")));
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
