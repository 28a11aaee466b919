use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::TelegramConfig;
use crate::platform::ChatPlatform;

/// Telegram rejects messages above 4096 characters.
const MAX_MESSAGE_LEN: usize = 4000;

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Bot API client speaking plain GET requests with query parameters.
pub struct TelegramClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    long_poll_secs: u64,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        // Leave headroom above the long-poll window.
        let timeout = Duration::from_secs(config.long_poll_secs + 30);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            long_poll_secs: config.long_poll_secs,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T>(&self, method: &str, params: &[(&str, String)]) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .get(self.api_url(method))
            .query(params)
            .send()
            .await
            .with_context(|| format!("Telegram {} request failed", method))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Telegram {} error ({}): {}", method, status, body);
        }

        let body: TelegramResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Telegram {} response", method))?;

        if !body.ok {
            bail!(
                "Telegram {} rejected: {}",
                method,
                body.description.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        body.result
            .with_context(|| format!("Telegram {} returned no result", method))
    }
}

/// Query parameters for `getUpdates`.
pub fn updates_query(offset: Option<i64>, long_poll_secs: u64) -> Vec<(&'static str, String)> {
    let mut params = vec![("allowed_updates", r#"["message"]"#.to_string())];
    if let Some(offset) = offset {
        params.push(("offset", offset.to_string()));
    }
    if long_poll_secs > 0 {
        params.push(("timeout", long_poll_secs.to_string()));
    }
    params
}

#[async_trait]
impl ChatPlatform for TelegramClient {
    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Value>> {
        debug!("Checking for updates (offset: {:?})", offset);
        self.call("getUpdates", &updates_query(offset, self.long_poll_secs))
            .await
    }

    async fn send_reply(&self, chat_id: i64, reply_to_message_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            let params = [
                ("chat_id", chat_id.to_string()),
                ("reply_to_message_id", reply_to_message_id.to_string()),
                ("text", chunk),
            ];
            let _: Value = self.call("sendMessage", &params).await?;
        }
        info!("Sent response to chat {}", chat_id);
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let params = [
            ("chat_id", chat_id.to_string()),
            ("action", "typing".to_string()),
        ];
        let _: Value = self.call("sendChatAction", &params).await?;
        Ok(())
    }
}

/// Split long messages for Telegram's 4096 char limit
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_poll_has_no_offset() {
        let params = updates_query(None, 0);
        assert_eq!(params, vec![("allowed_updates", r#"["message"]"#.to_string())]);
    }

    #[test]
    fn test_poll_with_offset_and_timeout() {
        let params = updates_query(Some(11), 25);
        assert!(params.contains(&("offset", "11".to_string())));
        assert!(params.contains(&("timeout", "25".to_string())));
    }

    #[test]
    fn test_api_url_strips_trailing_slash() {
        let client = TelegramClient::new(&TelegramConfig {
            token: "123:abc".to_string(),
            allowed_chat_ids: Default::default(),
            api_base: "http://localhost:8081/".to_string(),
            long_poll_secs: 0,
        })
        .unwrap();
        assert_eq!(
            client.api_url("getUpdates"),
            "http://localhost:8081/bot123:abc/getUpdates"
        );
    }

    #[test]
    fn test_short_message_is_single_chunk() {
        assert_eq!(split_message("hello", 4000), vec!["hello".to_string()]);
    }

    #[test]
    fn test_split_prefers_whitespace() {
        let chunks = split_message("aaaa bbbb cccc", 10);
        assert_eq!(chunks, vec!["aaaa bbbb ".to_string(), "cccc".to_string()]);
        assert_eq!(chunks.concat(), "aaaa bbbb cccc");
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "ééééé";
        let chunks = split_message(text, 3);
        assert!(chunks.iter().all(|c| c.len() <= 3));
        assert_eq!(chunks.concat(), text);
    }
}
