use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use shared::domain::{ChatId, PropertyId};

use crate::error::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Address of one real-time connection, credential included.
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    pub url: String,
}

impl ChannelEndpoint {
    pub fn chat(ws_base: &str, chat_id: ChatId, property_id: PropertyId, token: &str) -> Self {
        Self {
            url: format!(
                "{ws_base}/ws/chat/{}/{}/?token={token}",
                chat_id.0, property_id.0
            ),
        }
    }

    pub fn notify(ws_base: &str, token: &str) -> Self {
        Self {
            url: format!("{ws_base}/ws/notifications/?token={token}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Frame(String),
    Closed,
}

#[async_trait]
pub trait ChannelLink: Send + Sync {
    async fn transmit(&self, text: String) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;
    async fn close(&self);
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, endpoint: &ChannelEndpoint) -> Result<Arc<dyn ChannelLink>>;
}

pub struct MissingConnector;

#[async_trait]
impl ChannelConnector for MissingConnector {
    async fn connect(&self, _endpoint: &ChannelEndpoint) -> Result<Arc<dyn ChannelLink>> {
        Err(ChannelError::Unavailable.into())
    }
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WsConnector;

struct WsLink {
    writer: Mutex<WsWriter>,
    frames: broadcast::Sender<LinkEvent>,
    reader_task: JoinHandle<()>,
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, endpoint: &ChannelEndpoint) -> Result<Arc<dyn ChannelLink>> {
        let (stream, _) = connect_async(&endpoint.url)
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        let (writer, mut reader) = stream.split();

        let (frames, _) = broadcast::channel(256);
        let frames_out = frames.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let _ = frames_out.send(LinkEvent::Frame(text));
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
            let _ = frames_out.send(LinkEvent::Closed);
        });

        Ok(Arc::new(WsLink {
            writer: Mutex::new(writer),
            frames,
            reader_task,
        }))
    }
}

#[async_trait]
impl ChannelLink for WsLink {
    async fn transmit(&self, text: String) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text))
            .await
            .map_err(|err| ChannelError::Transmit(err.to_string()))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.frames.subscribe()
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        let _ = writer.flush().await;
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
