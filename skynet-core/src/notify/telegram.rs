//! Telegram Bot API channel
//!
//! Sends each notification as a plain-text message to one chat via
//! `POST {api_base}/bot{token}/sendMessage`.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::broadcast::Subscriber;
use crate::config::{TelegramConfig, TELEGRAM_CHANNEL};
use crate::error::{Error, Result};
use crate::types::Notification;
use async_trait::async_trait;

/// Body of `sendMessage`
#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

/// Bot API envelope; errors carry a description
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// HTTP client for one bot and chat
pub struct TelegramSubscriber {
    http_client: reqwest::Client,
    url: String,
    chat_id: String,
}

impl TelegramSubscriber {
    /// Create the channel from configuration
    ///
    /// Returns an error if the bot token or chat id is missing.
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let token = config
            .bot_token
            .as_deref()
            .ok_or_else(|| Error::Config("telegram.bot_token is required".to_string()))?;
        let chat_id = config
            .chat_id
            .clone()
            .ok_or_else(|| Error::Config("telegram.chat_id is required".to_string()))?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                token
            ),
            chat_id,
        })
    }

    fn failure(message: String, retryable: bool) -> Error {
        Error::Delivery {
            channel: TELEGRAM_CHANNEL.to_string(),
            message,
            retryable,
        }
    }
}

/// Whether a failed response is worth another attempt
fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Subscriber for TelegramSubscriber {
    fn name(&self) -> &str {
        TELEGRAM_CHANNEL
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let body = SendMessageRequest {
            chat_id: &self.chat_id,
            text: &notification.summary,
            disable_web_page_preview: true,
        };

        let response = self
            .http_client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // The token is part of the URL; keep it out of logs
                let retryable = e.is_timeout() || e.is_connect() || e.is_request();
                Self::failure(format!("HTTP request failed: {}", e.without_url()), retryable)
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let description = response
            .json::<ApiResponse>()
            .await
            .ok()
            .filter(|r| !r.ok)
            .and_then(|r| r.description)
            .unwrap_or_else(|| "unknown".to_string());
        Err(Self::failure(
            format!("API error ({}): {}", status, description),
            is_retryable_status(status),
        ))
    }
}
