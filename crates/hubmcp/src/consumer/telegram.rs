use super::{
    ERROR_REPLY, FetchRequest, Inbound, MalformedUpdate, Messenger, Notifier, UpdateSource,
};
use crate::catch::Catch;
use crate::{ConsumerConfig, EnvConfig, HubError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type", default = "default_chat_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

fn default_chat_type() -> String {
    "private".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub date: i64,
}

/// One inbound item. Kinds other than messages and channel posts are
/// accepted and skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_post: Option<Message>,
}

impl Update {
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref().or(self.channel_post.as_ref())
    }

    pub fn is_channel_post(&self) -> bool {
        self.message.is_none() && self.channel_post.is_some()
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.message().map(|m| m.chat.id)
    }

    /// Text of the message, `None` when absent or empty
    pub fn text(&self) -> Option<&str> {
        self.message()
            .and_then(|m| m.text.as_deref())
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatAction {
    Typing,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    parse_mode: &'static str,
}

#[derive(Serialize)]
struct SendChatAction {
    chat_id: i64,
    action: ChatAction,
}

/// Minimal Bot API client: connectivity check, polling and replies
pub struct TelegramClient {
    http: reqwest::Client,
    endpoint: String,
}

impl fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramClient").finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(env: &EnvConfig, config: &ConsumerConfig) -> Result<Self, HubError> {
        Self::with_endpoint(
            &env.telegram_api_base,
            &env.bot_token,
            config.request_timeout(),
        )
    }

    pub fn with_endpoint(
        api_base: &str,
        token: &str,
        request_timeout: Duration,
    ) -> Result<Self, HubError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .catch()?;

        Ok(Self {
            http,
            endpoint: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.endpoint, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, HubError> {
        let response = request.send().await.catch()?;
        let status = response.status();
        let body = response.bytes().await.catch()?;

        let envelope: ApiResponse<T> = serde_json::from_slice(&body).map_err(|e| {
            if status.is_server_error() {
                HubError::TransportError(format!("{method} returned {status}"))
            } else {
                HubError::ApiError(format!("malformed {method} response ({status}): {e}"))
            }
        })?;

        if envelope.ok {
            return envelope
                .result
                .ok_or_else(|| HubError::ApiError(format!("{method} returned no result")));
        }

        let code = envelope.error_code.unwrap_or(status.as_u16());
        let description = envelope
            .description
            .unwrap_or_else(|| "no description".to_string());
        Err(api_failure(method, code, description))
    }

    /// Startup connectivity check; also validates the token
    pub async fn get_me(&self) -> Result<User, HubError> {
        self.call("getMe", self.http.get(self.url("getMe"))).await
    }

    /// Items are parsed one by one so a bad item cannot fail its batch
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        limit: u32,
        timeout_secs: u64,
    ) -> Result<Vec<Inbound>, HubError> {
        let mut query = vec![
            ("limit", limit.to_string()),
            ("timeout", timeout_secs.to_string()),
        ];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let raw: Vec<Value> = self
            .call(
                "getUpdates",
                self.http.get(self.url("getUpdates")).query(&query),
            )
            .await?;
        Ok(parse_batch(raw))
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<Message, HubError> {
        let body = SendMessage {
            chat_id,
            text,
            parse_mode: "HTML",
        };
        let message: Message = self
            .call("sendMessage", self.http.post(self.url("sendMessage")).json(&body))
            .await?;
        debug!(chat_id, message_id = message.message_id, "Message sent");
        Ok(message)
    }

    pub async fn send_chat_action(
        &self,
        chat_id: i64,
        action: ChatAction,
    ) -> Result<bool, HubError> {
        let body = SendChatAction { chat_id, action };
        self.call(
            "sendChatAction",
            self.http.post(self.url("sendChatAction")).json(&body),
        )
        .await
    }
}

fn parse_batch(raw: Vec<Value>) -> Vec<Inbound> {
    raw.into_iter().filter_map(parse_item).collect()
}

fn parse_item(raw: Value) -> Option<Inbound> {
    let Some(update_id) = raw.get("update_id").and_then(Value::as_i64) else {
        warn!(item = %raw, "Dropping update without an id");
        return None;
    };

    let chat_id = ["/message/chat/id", "/channel_post/chat/id"]
        .iter()
        .find_map(|pointer| raw.pointer(pointer).and_then(Value::as_i64));

    Some(match Update::deserialize(raw) {
        Ok(update) => Inbound::Update(update),
        Err(e) => Inbound::Malformed(MalformedUpdate {
            update_id,
            chat_id,
            reason: e.to_string(),
        }),
    })
}

fn api_failure(method: &str, code: u16, description: String) -> HubError {
    match StatusCode::from_u16(code) {
        Ok(StatusCode::UNAUTHORIZED) | Ok(StatusCode::NOT_FOUND) => HubError::ConfigurationError(
            format!("bot token rejected by {method}: {description}"),
        ),
        Ok(status) if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() => {
            HubError::TransportError(format!("{method} failed with {code}: {description}"))
        }
        _ => HubError::ApiError(format!("{method} failed with {code}: {description}")),
    }
}

#[async_trait]
impl UpdateSource for TelegramClient {
    async fn fetch(&self, request: FetchRequest) -> Result<Vec<Inbound>, HubError> {
        self.get_updates(request.offset, request.limit, request.timeout_secs)
            .await
    }
}

#[async_trait]
impl Messenger for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), HubError> {
        self.send_message(chat_id, text).await.map(|_| ())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), HubError> {
        self.send_chat_action(chat_id, ChatAction::Typing)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Notifier for TelegramClient {
    async fn notify_error(&self, item: &Inbound) -> Result<(), HubError> {
        match item.chat_id() {
            Some(chat_id) => self.send_text(chat_id, ERROR_REPLY).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_parsing() {
        let raw = json!([
            {"update_id": 5, "message": {"message_id": 1, "chat": {"id": 42, "type": "private"},
             "from": {"id": 7, "is_bot": false, "first_name": "Ada"}, "text": "/start", "date": 0}},
            {"update_id": 6, "channel_post": {"message_id": 2, "chat": {"id": -100, "type": "channel", "title": "news"},
             "text": "hello", "date": 0}},
            {"update_id": 7, "edited_message": {"message_id": 1}}
        ]);
        let updates: Vec<Update> = serde_json::from_value(raw).unwrap();

        assert_eq!(updates[0].text(), Some("/start"));
        assert_eq!(updates[0].chat_id(), Some(42));
        assert!(updates[1].is_channel_post());
        assert_eq!(updates[1].chat_id(), Some(-100));
        assert!(updates[2].message().is_none());
    }

    #[test]
    fn test_empty_text_is_none() {
        let update: Update = serde_json::from_value(json!({
            "update_id": 1,
            "message": {"message_id": 1, "chat": {"id": 1}, "text": ""}
        }))
        .unwrap();
        assert_eq!(update.text(), None);
    }

    #[test]
    fn test_bad_item_is_kept_as_malformed() {
        let items = parse_batch(vec![
            json!({"update_id": 5, "message": {"message_id": 1, "chat": {"id": 42}, "text": "hi"}}),
            json!({"update_id": 6, "message": {"chat": {"id": 42}, "text": "hi"}}),
            json!({"message": {"message_id": 3}}),
            json!({"update_id": 7, "message": {"message_id": 4, "chat": {"id": 42}}}),
        ]);

        let ids: Vec<i64> = items.iter().map(Inbound::update_id).collect();
        assert_eq!(ids, [5, 6, 7]);
        match &items[1] {
            Inbound::Malformed(item) => {
                assert_eq!(item.chat_id, Some(42));
                assert!(item.reason.contains("message_id"));
            }
            other => panic!("expected malformed item, got {other:?}"),
        }
        assert!(matches!(items[2], Inbound::Update(_)));
    }

    #[test]
    fn test_api_failure_classification() {
        assert!(api_failure("getMe", 401, "Unauthorized".into()).is_permanent());
        assert!(api_failure("getUpdates", 502, "Bad Gateway".into()).is_retryable());
        assert!(api_failure("getUpdates", 429, "Too Many Requests".into()).is_retryable());
        assert!(matches!(
            api_failure("sendMessage", 400, "chat not found".into()),
            HubError::ApiError(_)
        ));
    }

    #[test]
    fn test_debug_hides_token() {
        let client =
            TelegramClient::with_endpoint("https://api.example", "123:secret", Duration::from_secs(1))
                .unwrap();
        assert!(!format!("{client:?}").contains("secret"));
        assert_eq!(client.url("getMe"), "https://api.example/bot123:secret/getMe");
    }
}
