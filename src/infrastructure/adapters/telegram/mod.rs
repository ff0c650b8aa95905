//! Telegram adapter

mod poller;

pub use poller::UpdatePoller;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::application::errors::BotError;
use crate::domain::traits::{Bot, BotInfo, KeyboardButton};
use crate::infrastructure::config::DEFAULT_API_ENDPOINT;

/// Telegram update type
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

/// Bot API envelope: `{"ok": bool, "result": T, "description": "..."}`
#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct MessageResult {
    message_id: i64,
}

/// Telegram bot adapter
pub struct TelegramAdapter {
    token: String,
    endpoint: String,
    client: Client,
    info: BotInfo,
    debug: bool,
}

impl TelegramAdapter {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            endpoint: DEFAULT_API_ENDPOINT.to_string(),
            client: Client::new(),
            info: BotInfo {
                id: "unknown".to_string(),
                name: "mqtg-bot".to_string(),
                username: "mqtg_bot".to_string(),
            },
            debug: false,
        }
    }

    /// Alternate Bot API server, e.g. a local `telegram-bot-api` instance
    pub fn with_api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Log raw API traffic
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Get the API URL for a method
    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.endpoint, self.token, method)
    }

    /// POST a JSON request and unwrap the Bot API envelope.
    async fn call<Req, Res>(&self, method: &str, request: &Req, timeout: Option<Duration>) -> Result<Res, BotError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        if self.debug {
            tracing::info!("Telegram request {}: {}", method, serde_json::to_string(request).unwrap_or_default());
        }

        let mut builder = self.client.post(self.api_url(method)).json(request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BotError::Network(format!("{} failed: {}", method, e.without_url())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BotError::Network(e.without_url().to_string()))?;

        if self.debug {
            tracing::info!("Telegram response {} ({}): {}", method, status, body);
        }

        let data: ApiResponse<Res> = serde_json::from_str(&body)
            .map_err(|e| BotError::Parse(format!("{} response: {}", method, e)))?;

        if !data.ok || !status.is_success() {
            return Err(BotError::Network(format!(
                "Telegram API error ({}): {}",
                status,
                data.description.unwrap_or_default()
            )));
        }

        data.result
            .ok_or_else(|| BotError::Parse(format!("{} response without result", method)))
    }

    /// Fetch bot info from Telegram API
    pub async fn fetch_bot_info(&mut self) -> Result<(), BotError> {
        #[derive(Deserialize)]
        struct BotInfoResponse {
            id: i64,
            first_name: String,
            username: Option<String>,
        }

        let data: BotInfoResponse = self.call("getMe", &serde_json::json!({}), None).await?;

        self.info = BotInfo {
            id: data.id.to_string(),
            username: data.username.unwrap_or_else(|| data.first_name.clone()),
            name: data.first_name,
        };

        Ok(())
    }

    /// Get updates from Telegram using getUpdates long polling
    pub async fn get_updates(&self, offset: i64, timeout: u64) -> Result<Vec<Update>, BotError> {
        #[derive(Serialize)]
        struct GetUpdatesRequest {
            offset: i64,
            timeout: u64,
            allowed_updates: Vec<String>,
        }

        let request = GetUpdatesRequest {
            offset,
            timeout,
            allowed_updates: vec!["message".to_string(), "callback_query".to_string()],
        };

        // leave the server room to answer the long poll
        let http_timeout = Duration::from_secs(timeout + 10);
        self.call("getUpdates", &request, Some(http_timeout)).await
    }

    /// Get the next update offset
    pub fn get_next_offset(updates: &[Update], current: i64) -> i64 {
        updates.iter()
            .map(|u| u.update_id + 1)
            .max()
            .unwrap_or(current)
            .max(current)
    }

    /// Register bot commands with Telegram
    pub async fn register_commands(&self, commands: &[(String, String)]) -> Result<(), BotError> {
        #[derive(Serialize)]
        struct Command<'a> {
            command: &'a str,
            description: &'a str,
        }

        #[derive(Serialize)]
        struct SetMyCommandsRequest<'a> {
            commands: Vec<Command<'a>>,
        }

        let request = SetMyCommandsRequest {
            commands: commands
                .iter()
                .map(|(command, description)| Command { command, description })
                .collect(),
        };

        let _: bool = self.call("setMyCommands", &request, None).await?;
        tracing::info!("Registered {} bot commands with Telegram", commands.len());
        Ok(())
    }
}

#[async_trait]
impl Bot for TelegramAdapter {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<String, BotError> {
        #[derive(Serialize)]
        struct SendMessageRequest<'a> {
            chat_id: &'a str,
            text: &'a str,
        }

        tracing::debug!("Sending to {}: {}", chat_id, text);
        let result: MessageResult = self.call("sendMessage", &SendMessageRequest { chat_id, text }, None).await?;
        Ok(result.message_id.to_string())
    }

    async fn send_with_keyboard(&self, chat_id: &str, text: &str, buttons: Vec<Vec<KeyboardButton>>) -> Result<String, BotError> {
        tracing::debug!("Sending with keyboard to {}: {}", chat_id, text);

        #[derive(Serialize)]
        struct SendMessageRequest<'a> {
            chat_id: &'a str,
            text: &'a str,
            reply_markup: ReplyMarkup,
        }

        #[derive(Serialize)]
        struct ReplyMarkup {
            inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
        }

        #[derive(Serialize)]
        struct InlineKeyboardButton {
            text: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            callback_data: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            url: Option<String>,
        }

        let inline_keyboard = buttons
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|btn| InlineKeyboardButton {
                        text: btn.text,
                        callback_data: btn.callback_data,
                        url: btn.url,
                    })
                    .collect()
            })
            .collect();

        let request = SendMessageRequest {
            chat_id,
            text,
            reply_markup: ReplyMarkup { inline_keyboard },
        };

        let result: MessageResult = self.call("sendMessage", &request, None).await?;
        Ok(result.message_id.to_string())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<(), BotError> {
        #[derive(Serialize)]
        struct AnswerRequest<'a> {
            callback_query_id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            text: Option<&'a str>,
        }

        let _: bool = self
            .call("answerCallbackQuery", &AnswerRequest { callback_query_id: callback_id, text }, None)
            .await?;
        Ok(())
    }

    fn bot_info(&self) -> BotInfo {
        self.info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_uses_endpoint_override() {
        let adapter = TelegramAdapter::new("123:abc").with_api_endpoint("http://localhost:8081/");
        assert_eq!(adapter.api_url("getMe"), "http://localhost:8081/bot123:abc/getMe");

        let adapter = TelegramAdapter::new("t");
        assert_eq!(adapter.api_url("getUpdates"), "https://api.telegram.org/bott/getUpdates");
    }

    #[test]
    fn next_offset_never_goes_back() {
        let updates: Vec<Update> = serde_json::from_str(
            r#"[{"update_id": 10}, {"update_id": 12, "message": {"message_id": 1, "chat": {"id": 5}, "text": "hi"}}]"#,
        )
        .unwrap();
        assert_eq!(TelegramAdapter::get_next_offset(&updates, 0), 13);
        assert_eq!(TelegramAdapter::get_next_offset(&[], 13), 13);
    }

    #[test]
    fn envelope_parses_errors() {
        let data: ApiResponse<bool> =
            serde_json::from_str(r#"{"ok": false, "description": "Unauthorized"}"#).unwrap();
        assert!(!data.ok);
        assert_eq!(data.description.as_deref(), Some("Unauthorized"));
        assert!(data.result.is_none());
    }
}
