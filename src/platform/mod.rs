pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// The messaging side of the relay.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Fetch raw pending updates. `offset` is omitted when `None`.
    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Value>>;

    /// Send `text` to `chat_id` as a reply to `reply_to_message_id`.
    async fn send_reply(&self, chat_id: i64, reply_to_message_id: i64, text: &str) -> Result<()>;

    /// Show a "typing" indicator. Callers ignore failures.
    async fn send_typing(&self, _chat_id: i64) -> Result<()> {
        Ok(())
    }
}
