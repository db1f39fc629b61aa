use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use shared::{
    domain::RoomId,
    error::{ApiError, ErrorBody},
    protocol::{ChatMessage, CreateMessageRequest, MessageList},
};
use tracing::{info, warn};

use crate::{
    error::RequestError,
    filter::{ChatFilter, ScopeQuery},
};

/// Durable read/write channel for a room's messages.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_messages(
        &self,
        room_id: RoomId,
        filter: Option<&ChatFilter>,
    ) -> Result<Vec<ChatMessage>, RequestError>;

    async fn create_message(
        &self,
        room_id: RoomId,
        request: &CreateMessageRequest,
    ) -> Result<ChatMessage, RequestError>;
}

pub struct RestChatApi {
    http: Client,
    api_url: String,
    credential: Option<String>,
    request_timeout: Duration,
}

impl RestChatApi {
    pub fn new(
        api_url: impl Into<String>,
        credential: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            credential,
            request_timeout,
        }
    }

    fn messages_url(&self, room_id: RoomId) -> String {
        format!("{}/projects/{}/messages", self.api_url, room_id.0)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RequestError> {
        let request = match &self.credential {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| self.request_failure(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|body| body.error)
                .unwrap_or_else(|| {
                    format!(
                        "HTTP {}: {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("request failed")
                    )
                });
            warn!(status = status.as_u16(), "api: request rejected: {detail}");
            return Err(ApiError::from_status(status.as_u16(), detail).into());
        }

        response
            .json::<T>()
            .await
            .map_err(|err| self.request_failure(err))
    }

    fn request_failure(&self, err: reqwest::Error) -> RequestError {
        if err.is_timeout() {
            RequestError::Timeout(self.request_timeout)
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl ChatApi for RestChatApi {
    async fn list_messages(
        &self,
        room_id: RoomId,
        filter: Option<&ChatFilter>,
    ) -> Result<Vec<ChatMessage>, RequestError> {
        let body: MessageList = self
            .execute(
                self.http
                    .get(self.messages_url(room_id))
                    .query(&ScopeQuery::from(filter)),
            )
            .await?;
        Ok(body.into_messages())
    }

    async fn create_message(
        &self,
        room_id: RoomId,
        request: &CreateMessageRequest,
    ) -> Result<ChatMessage, RequestError> {
        let message: ChatMessage = self
            .execute(self.http.post(self.messages_url(room_id)).json(request))
            .await?;
        info!(
            room_id = room_id.0,
            message_id = message.id.0,
            "api: message stored"
        );
        Ok(message)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
