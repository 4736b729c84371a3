//! ConversationStore: request/response client for durable chat history.
//!
//! Independent of any real-time channel. Each call stands alone: no retries,
//! no shared cache, no client-side timeout beyond the transport default.

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::ChatConfig;
use crate::error::{DecodeError, HistoryError};
use crate::models::{Conversation, Message, OutboundMessage};

const MESSAGE_PATH: &str = "/api/chat/message";
const CONVERSATIONS_PATH: &str = "/api/chat/conversations";
const SEARCH_PATH: &str = "/api/chat/conversations/search";

/// REST client for `/api/chat/*`. Cheap to clone; clones share one
/// connection pool.
#[derive(Clone, Debug)]
pub struct ConversationStore {
    client: reqwest::Client,
    config: ChatConfig,
}

impl ConversationStore {
    pub fn new(config: ChatConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: ChatConfig) -> Self {
        Self { client, config }
    }

    /// Persist a message and return the server's copy with `id` and
    /// `createdAt` filled in. Errors are returned as-is.
    pub async fn persist(&self, message: &Message) -> Result<Message, HistoryError> {
        let room_id = message
            .room_id
            .as_deref()
            .ok_or(HistoryError::MissingRoom)?;
        let url = self.config.api_url(MESSAGE_PATH)?;
        debug!(room = %room_id, "persisting chat message");

        let request = self
            .client
            .post(url)
            .json(&OutboundMessage::new(room_id, message));
        let body: serde_json::Value = self.execute(request).await?;
        Ok(Message::decode_value(body)?)
    }

    /// Conversations visible to the caller, or an empty list if the request
    /// fails for any reason.
    pub async fn list(&self) -> Vec<Conversation> {
        degrade("list", self.try_list().await)
    }

    /// Conversations matching `query`, or an empty list if the request fails.
    pub async fn search(&self, query: &str) -> Vec<Conversation> {
        degrade("search", self.try_search(query).await)
    }

    pub async fn try_list(&self) -> Result<Vec<Conversation>, HistoryError> {
        let url = self.config.api_url(CONVERSATIONS_PATH)?;
        debug!("listing conversations");
        let body = self.execute(self.client.get(url)).await?;
        conversations_from(body)
    }

    /// The query is passed through untouched; an empty query is the server's
    /// business.
    pub async fn try_search(&self, query: &str) -> Result<Vec<Conversation>, HistoryError> {
        let url = self.config.api_url(SEARCH_PATH)?;
        debug!(query = %query, "searching conversations");
        let body = self
            .execute(self.client.get(url).query(&[("q", query)]))
            .await?;
        conversations_from(body)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, HistoryError> {
        let request = match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let resp = request.send().await.map_err(HistoryError::from_reqwest)?;
        let resp = check_status(resp).await?;
        let bytes = resp.bytes().await.map_err(HistoryError::from_reqwest)?;
        serde_json::from_slice(&bytes).map_err(|e| HistoryError::Decode(DecodeError::Json(e)))
    }
}

async fn check_status(resp: Response) -> Result<Response, HistoryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(HistoryError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Accept a bare array, or an object wrapping it under `results` or
/// `conversations`.
fn conversations_from(body: serde_json::Value) -> Result<Vec<Conversation>, HistoryError> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut obj) => match obj
            .remove("results")
            .or_else(|| obj.remove("conversations"))
        {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Err(unexpected_shape()),
        },
        _ => return Err(unexpected_shape()),
    };
    Ok(items.into_iter().map(Conversation::new).collect())
}

fn unexpected_shape() -> HistoryError {
    HistoryError::Decode(DecodeError::Json(serde::de::Error::custom(
        "expected a list of conversations",
    )))
}

fn degrade(op: &str, result: Result<Vec<Conversation>, HistoryError>) -> Vec<Conversation> {
    result.unwrap_or_else(|e| {
        warn!(op, error = %e, "conversation request failed, showing nothing");
        Vec::new()
    })
}
