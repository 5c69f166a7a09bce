//! Bot API surface used to talk to users and operators.
//!
//! This is the public-facing bot, not a delegate: it never adds members itself.

use crate::types::UserId;
use anyhow::{Result, anyhow};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message","callback_query"]"#;
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

/// Someone talking to the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotUser {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl BotUser {
    pub fn display_name(&self) -> String {
        let full = match self.last_name.as_deref().map(str::trim) {
            Some(last) if !last.is_empty() => format!("{} {last}", self.first_name.trim()),
            _ => self.first_name.trim().to_string(),
        };
        if !full.is_empty() {
            return full;
        }
        match self.username.as_deref() {
            Some(username) if !username.trim().is_empty() => format!("@{}", username.trim()),
            _ => format!("user {}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotUpdate {
    Message {
        update_id: i64,
        chat_id: i64,
        is_private: bool,
        from: BotUser,
        text: String,
    },
    Callback {
        update_id: i64,
        callback_id: String,
        chat_id: Option<i64>,
        from: BotUser,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

#[derive(Clone)]
pub struct TelegramBot {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
}

impl TelegramBot {
    pub fn new(bot_token: &str) -> Result<Self> {
        let bot_token = bot_token.trim();
        if bot_token.is_empty() {
            return Err(anyhow!("bot token is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            api_base: TELEGRAM_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Result<Self> {
        self.api_base =
            crate::http_bridge::normalize_http_url(api_base, "bot.api_base")?
                .trim_end_matches('/')
                .to_string();
        Ok(self)
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base, self.bot_token, method
        ))?)
    }

    /// Returns the bot's own username, for `doctor`.
    pub async fn get_me(&self) -> Result<String> {
        let response = self.http.get(self.api_url("getMe")?).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            return Err(anyhow!("telegram getMe failed: status={status} body={text}"));
        }
        let parsed: TelegramEnvelope<TelegramUser> = response.json().await?;
        Ok(parsed
            .result
            .and_then(|user| user.username)
            .unwrap_or_default())
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        buttons: &[Vec<InlineButton>],
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if !buttons.is_empty() {
            body["reply_markup"] = serde_json::json!({ "inline_keyboard": buttons });
        }
        self.post("sendMessage", &body).await
    }

    pub async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = serde_json::Value::String(text.to_string());
        }
        self.post("answerCallbackQuery", &body).await
    }

    async fn post(&self, method: &str, body: &serde_json::Value) -> Result<()> {
        let resp = self
            .http
            .post(self.api_url(method)?)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow!("telegram {method} failed: status={status} body={text}"));
        }
        Ok(())
    }

    /// Spawns the long-poll loop. Updates are delivered until `tx` closes or the task is aborted.
    pub fn start(&self, tx: mpsc::Sender<BotUpdate>) -> JoinHandle<()> {
        let bot = self.clone();
        tokio::spawn(async move {
            if let Err(e) = bot.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<BotUpdate>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response
                .json::<TelegramEnvelope<Vec<TelegramUpdate>>>()
                .await
            {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion so a malformed update is never replayed.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                let Some(converted) = convert_update(update) else {
                    continue;
                };
                tx.send(converted)
                    .await
                    .map_err(|e| anyhow!("telegram update queue closed: {e}"))?;
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn convert_update(update: TelegramUpdate) -> Option<BotUpdate> {
    if let Some(callback) = update.callback_query {
        let data = callback.data.as_deref().map(str::trim).unwrap_or_default();
        if data.is_empty() {
            return None;
        }
        return Some(BotUpdate::Callback {
            update_id: update.update_id,
            callback_id: callback.id,
            chat_id: callback
                .message
                .as_ref()
                .and_then(|message| message.chat.as_ref())
                .map(|chat| chat.id),
            from: callback.from.into_bot_user(),
            data: data.to_string(),
        });
    }

    let message = update.message?;
    let chat = message.chat?;
    let from = message.from?;
    let text = message.text.as_deref().map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return None;
    }
    Some(BotUpdate::Message {
        update_id: update.update_id,
        chat_id: chat.id,
        is_private: chat.r#type == "private",
        from: from.into_bot_user(),
        text: text.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramCallbackQuery {
    id: String,
    from: TelegramUser,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
}

impl TelegramUser {
    fn into_bot_user(self) -> BotUser {
        BotUser {
            id: UserId::new(self.id),
            username: self.username,
            first_name: self.first_name,
            last_name: self.last_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: serde_json::Value) -> TelegramUpdate {
        serde_json::from_value(value).expect("update should parse")
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn transient_statuses_are_retried() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn private_text_message_converts() {
        let update = parse(serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 1,
                "from": {"id": 42, "first_name": "Ada", "username": "ada"},
                "chat": {"id": 42, "type": "private"},
                "text": " /join 1 "
            }
        }));
        let converted = convert_update(update).expect("converted");
        assert_eq!(
            converted,
            BotUpdate::Message {
                update_id: 7,
                chat_id: 42,
                is_private: true,
                from: BotUser {
                    id: UserId::new(42),
                    username: Some("ada".to_string()),
                    first_name: "Ada".to_string(),
                    last_name: None,
                },
                text: "/join 1".to_string(),
            }
        );
    }

    #[test]
    fn callback_query_converts_with_chat_from_message() {
        let update = parse(serde_json::json!({
            "update_id": 8,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": 5, "first_name": "Op"},
                "message": {"chat": {"id": -100, "type": "group"}},
                "data": "approve:12"
            }
        }));
        match convert_update(update).expect("converted") {
            BotUpdate::Callback {
                callback_id,
                chat_id,
                data,
                from,
                ..
            } => {
                assert_eq!(callback_id, "cb-1");
                assert_eq!(chat_id, Some(-100));
                assert_eq!(data, "approve:12");
                assert_eq!(from.id, UserId::new(5));
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn partial_payloads_are_skipped_without_panicking() {
        let no_text = parse(serde_json::json!({
            "update_id": 9,
            "message": {"from": {"id": 1}, "chat": {"id": 1, "type": "private"}}
        }));
        assert!(convert_update(no_text).is_none());

        let no_sender = parse(serde_json::json!({
            "update_id": 10,
            "message": {"chat": {"id": 1, "type": "channel"}, "text": "hi"}
        }));
        assert!(convert_update(no_sender).is_none());

        let empty = parse(serde_json::json!({"update_id": 11}));
        assert!(convert_update(empty).is_none());
    }

    #[test]
    fn envelopes_decode_with_and_without_result() {
        let me: TelegramEnvelope<TelegramUser> = serde_json::from_value(serde_json::json!({
            "ok": true,
            "result": {"id": 99, "is_bot": true, "first_name": "Gate", "username": "gate_bot"}
        }))
        .expect("getMe envelope");
        assert_eq!(
            me.result.and_then(|user| user.username).as_deref(),
            Some("gate_bot")
        );

        let failed: TelegramEnvelope<Vec<TelegramUpdate>> =
            serde_json::from_value(serde_json::json!({"ok": false, "description": "nope"}))
                .expect("error envelope");
        assert!(failed.result.is_none());
    }

    #[test]
    fn display_name_falls_back_to_username_then_id() {
        let mut user = BotUser {
            id: UserId::new(3),
            username: Some("neo".to_string()),
            first_name: "Thomas".to_string(),
            last_name: Some("Anderson".to_string()),
        };
        assert_eq!(user.display_name(), "Thomas Anderson");
        user.first_name.clear();
        user.last_name = None;
        assert_eq!(user.display_name(), "@neo");
        user.username = None;
        assert_eq!(user.display_name(), "user 3");
    }
}
