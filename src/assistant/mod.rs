pub mod exchange;
pub mod reader;

use anyhow::Result;
use async_trait::async_trait;

pub use exchange::{ExchangeClient, RetryLadder};

/// The web page the assistant lives on. All access goes through one
/// [`ExchangeClient`], which runs a single exchange at a time, so
/// implementations need no internal locking of their own.
#[async_trait]
pub trait AssistantSurface: Send + Sync {
    /// Focus the input, replace its content with `message`, and submit it.
    async fn submit(&self, message: &str) -> Result<()>;

    /// Text of the last message region, or `None` when there is none yet.
    async fn last_message_text(&self) -> Result<Option<String>>;
}
