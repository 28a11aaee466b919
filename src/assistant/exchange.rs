use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::reader::{ReaderError, ResponseReader};
use super::AssistantSurface;
use crate::config::RelayConfig;

/// Escalating wait before each read of a pending response.
///
/// The attempt counter starts at 1 and is multiplied on every retry; the
/// wait before a read is `base_delay * attempt`. Attempts above
/// `max_attempt` are never made. With the defaults (5 s, x1.5, 3) the reads
/// happen after 5 s, 7.5 s and 11.25 s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryLadder {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_attempt: f64,
}

impl RetryLadder {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            base_delay: config.response_delay(),
            multiplier: config.backoff_multiplier,
            max_attempt: config.max_attempt,
        }
    }

    /// Attempt values in order. The first attempt is always made.
    pub fn attempts(&self) -> impl Iterator<Item = f64> {
        let multiplier = self.multiplier;
        let max_attempt = self.max_attempt;
        std::iter::successors(Some(1.0_f64), move |attempt| Some(attempt * multiplier))
            .enumerate()
            .take_while(move |(index, attempt)| *index == 0 || *attempt <= max_attempt)
            .map(|(_, attempt)| attempt)
    }

    pub fn delay_for(&self, attempt: f64) -> Duration {
        self.base_delay.mul_f64(attempt)
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.attempts().map(|attempt| self.delay_for(attempt)).collect()
    }
}

/// Empty output, or a lone punctuation/glyph character while the page is
/// still warming up, is not an answer.
pub fn is_usable_response(response: &str) -> bool {
    let mut chars = response.chars();
    match (chars.next(), chars.next()) {
        (None, _) => false,
        (Some(c), None) => c.is_ascii_alphanumeric(),
        _ => true,
    }
}

/// Submits a message to the assistant page and waits for its answer.
///
/// Shared by every front end; only one exchange runs on the page at a time.
pub struct ExchangeClient<S> {
    surface: Arc<S>,
    turn: Mutex<()>,
    reader: ResponseReader<S>,
    ladder: RetryLadder,
    not_responding: String,
}

impl<S: AssistantSurface> ExchangeClient<S> {
    pub fn new(surface: Arc<S>, config: &RelayConfig) -> Self {
        let reader = ResponseReader::new(
            surface.clone(),
            config.settle_interval(),
            config.settle_max_samples,
        );
        Self {
            surface,
            turn: Mutex::new(()),
            reader,
            ladder: RetryLadder::from_config(config),
            not_responding: config.not_responding_text.clone(),
        }
    }

    /// Submit `message` once and return the trimmed answer, or the
    /// not-responding text when every attempt came back empty.
    pub async fn exchange(&self, message: &str) -> Result<String> {
        let _turn = self.turn.lock().await;
        info!("Sending message to assistant: '{}'", message);
        self.surface.submit(message).await?;

        for attempt in self.ladder.attempts() {
            tokio::time::sleep(self.ladder.delay_for(attempt)).await;

            let response = match self.reader.read_latest().await {
                Ok(text) => text.trim().to_string(),
                Err(e) => match e.downcast_ref::<ReaderError>() {
                    Some(unsettled) => {
                        warn!("Attempt {}: {}", attempt, unsettled);
                        continue;
                    }
                    None => return Err(e),
                },
            };

            info!("Response from assistant (attempt {}): '{}'", attempt, response);
            if is_usable_response(&response) {
                return Ok(response);
            }
            warn!("No response from assistant on attempt {}, trying again", attempt);
        }

        warn!("No response from assistant, giving up");
        Ok(self.not_responding.clone())
    }
}
