use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use shared::domain::{ChatId, PropertyId};
use shared::error::{ApiError, ApiException};
use shared::protocol::{ConversationHistory, ConversationSummary};

/// REST boundary to the listing backend. It is the source of truth for
/// conversation history and the inbox list; the real-time channels only
/// augment what it reports.
#[async_trait]
pub trait HistoryGateway: Send + Sync {
    async fn fetch_inbox(&self) -> Result<Vec<ConversationSummary>>;
    /// Idempotent get-or-create of the conversation between the session user
    /// and the property's owner, plus its persisted message sequence.
    async fn fetch_history(&self, property_id: PropertyId) -> Result<ConversationHistory>;
    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<()>;
    async fn mark_read(&self, chat_id: ChatId) -> Result<()>;
}

pub struct MissingGateway;

#[async_trait]
impl HistoryGateway for MissingGateway {
    async fn fetch_inbox(&self) -> Result<Vec<ConversationSummary>> {
        Err(anyhow!("history gateway is unavailable"))
    }

    async fn fetch_history(&self, property_id: PropertyId) -> Result<ConversationHistory> {
        Err(anyhow!(
            "history gateway is unavailable for property {}",
            property_id.0
        ))
    }

    async fn send_message(&self, chat_id: ChatId, _text: &str) -> Result<()> {
        Err(anyhow!(
            "history gateway is unavailable for chat {}",
            chat_id.0
        ))
    }

    async fn mark_read(&self, chat_id: ChatId) -> Result<()> {
        Err(anyhow!(
            "history gateway is unavailable for chat {}",
            chat_id.0
        ))
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    text: &'a str,
}

pub struct HttpGateway {
    http: Client,
    base_url: String,
    auth_token: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
            auth_token: auth_token.into(),
        }
    }

    /// Failed responses carry a structured error body when the backend had a
    /// say in the failure; fall back to the bare status otherwise.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        match response.json::<ApiError>().await {
            Ok(body) => Err(ApiException::new(body.code, body.message).into()),
            Err(_) => Err(anyhow!("gateway request failed with status {status}")),
        }
    }
}

#[async_trait]
impl HistoryGateway for HttpGateway {
    async fn fetch_inbox(&self) -> Result<Vec<ConversationSummary>> {
        let response = self
            .http
            .get(format!("{}/chats/", self.base_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn fetch_history(&self, property_id: PropertyId) -> Result<ConversationHistory> {
        let response = self
            .http
            .get(format!("{}/chats/history/{}/", self.base_url, property_id.0))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/chats/{}/messages/", self.base_url, chat_id.0))
            .bearer_auth(&self.auth_token)
            .json(&SendMessageRequest { text })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn mark_read(&self, chat_id: ChatId) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/chats/{}/read/", self.base_url, chat_id.0))
            .bearer_auth(&self.auth_token)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
