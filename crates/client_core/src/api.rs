//! REST collaborator: authentication, chat list, history, directory, and
//! private chat creation. Every endpoint answers with an [`ApiEnvelope`].

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use shared::{
    domain::{AuthSession, Chat, ChatId, Message, User, UserId},
    error::ApiError,
    protocol::{string_field, ApiEnvelope, CreatePrivateChatRequest, LoginRequest, RegisterRequest},
};
use tracing::{debug, info};

use crate::{
    error::{ClientError, ClientResult},
    normalize::{normalize_chat_value, normalize_list, normalize_message_value, normalize_user_value},
};

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> ClientResult<AuthSession>;

    async fn register(
        &self,
        full_name: &str,
        username: &str,
        password: &str,
    ) -> ClientResult<AuthSession>;

    async fn fetch_chats(&self, token: &str) -> ClientResult<Vec<Chat>>;

    async fn fetch_messages(&self, token: &str, chat_id: &ChatId) -> ClientResult<Vec<Message>>;

    async fn search_users(&self, token: &str, query: &str) -> ClientResult<Vec<User>>;

    /// The full directory is a search with an empty query.
    async fn fetch_users(&self, token: &str) -> ClientResult<Vec<User>> {
        self.search_users(token, "").await
    }

    /// Returns the id of the created (or already existing) private chat.
    async fn create_private_chat(&self, token: &str, user_id: &UserId) -> ClientResult<ChatId>;
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn authenticate(
        &self,
        request: RequestBuilder,
        failure: &str,
    ) -> ClientResult<AuthSession> {
        let response = request.send().await?;
        let status = response.status();
        let envelope: ApiEnvelope = response.json().await.unwrap_or_default();

        if !status.is_success() || envelope.success != Some(true) {
            let message = envelope
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| failure.to_string());
            return Err(ClientError::Auth(message));
        }

        let data = envelope
            .data
            .as_ref()
            .and_then(Value::as_object)
            .ok_or_else(|| ClientError::MalformedResponse("missing data".into()))?;
        let user = data
            .get("user")
            .and_then(normalize_user_value)
            .filter(|user| !user.id.is_empty())
            .ok_or_else(|| ClientError::MalformedResponse("missing user".into()))?;
        let token = string_field(data, &["token", "accessToken"])
            .ok_or_else(|| ClientError::MalformedResponse("missing token".into()))?;

        info!(user_id = %user.id, username = %user.username, "auth: session established");
        Ok(AuthSession { user, token })
    }

    /// Sends an authorized request and unwraps the envelope. Non-2xx statuses
    /// and `success: false` both become an [`ApiError`].
    async fn authorized(&self, request: RequestBuilder, token: &str) -> ClientResult<ApiEnvelope> {
        let response = request.bearer_auth(token.trim()).send().await?;
        let status = response.status();

        if !status.is_success() {
            let envelope: ApiEnvelope = response.json().await.unwrap_or_default();
            return Err(ApiError::from_response(status.as_u16(), envelope.message).into());
        }

        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|err| ClientError::MalformedResponse(err.to_string()))?;
        if envelope.success == Some(false) {
            return Err(ApiError::from_response(status.as_u16(), envelope.message).into());
        }
        Ok(envelope)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn login(&self, username: &str, password: &str) -> ClientResult<AuthSession> {
        let request = self
            .http
            .post(format!("{}/auth/login", self.base_url))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            });
        self.authenticate(request, "Invalid credentials").await
    }

    async fn register(
        &self,
        full_name: &str,
        username: &str,
        password: &str,
    ) -> ClientResult<AuthSession> {
        let request = self
            .http
            .post(format!("{}/auth/register", self.base_url))
            .json(&RegisterRequest {
                full_name: full_name.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            });
        self.authenticate(request, "Registration failed").await
    }

    async fn fetch_chats(&self, token: &str) -> ClientResult<Vec<Chat>> {
        let envelope = self
            .authorized(self.http.get(format!("{}/chats", self.base_url)), token)
            .await?;
        let chats = normalize_list(envelope.data_field_or_data("chats"), normalize_chat_value);
        debug!(count = chats.len(), "api: fetched chats");
        Ok(chats)
    }

    async fn fetch_messages(&self, token: &str, chat_id: &ChatId) -> ClientResult<Vec<Message>> {
        let envelope = self
            .authorized(
                self.http
                    .get(format!("{}/chats/{chat_id}/messages", self.base_url)),
                token,
            )
            .await?;
        let messages =
            normalize_list(envelope.data_field_or_data("messages"), normalize_message_value);
        debug!(chat_id = %chat_id, count = messages.len(), "api: fetched history");
        Ok(messages)
    }

    async fn search_users(&self, token: &str, query: &str) -> ClientResult<Vec<User>> {
        let envelope = self
            .authorized(
                self.http
                    .get(format!("{}/auth/users/search", self.base_url))
                    .query(&[("query", query)]),
                token,
            )
            .await?;
        let users = envelope.data.as_ref().and_then(|data| data.get("users"));
        Ok(normalize_list(users, normalize_user_value))
    }

    async fn create_private_chat(&self, token: &str, user_id: &UserId) -> ClientResult<ChatId> {
        let envelope = self
            .authorized(
                self.http
                    .post(format!("{}/chats", self.base_url))
                    .json(&CreatePrivateChatRequest::with(user_id.clone())),
                token,
            )
            .await?;
        let chat_id = envelope
            .data
            .as_ref()
            .and_then(Value::as_object)
            .and_then(|data| string_field(data, &["chatId", "chat_id", "id"]))
            .ok_or_else(|| ClientError::MalformedResponse("missing chat id".into()))?;
        info!(%chat_id, participant = %user_id, "api: private chat ready");
        Ok(ChatId::from(chat_id))
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
