use std::fmt;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::platform::ChatPlatform;

/// Which key of the raw update carried the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    New,
    Edited,
}

/// One inbound text message, ready to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub update_id: i64,
    pub chat_id: i64,
    pub message_id: i64,
    pub text: String,
    pub origin: MessageOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoMessage,
    MissingChat,
    MissingMessageId,
    MissingText,
    Malformed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoMessage => write!(f, "neither message nor edited_message present"),
            SkipReason::MissingChat => write!(f, "missing chat id"),
            SkipReason::MissingMessageId => write!(f, "missing message id"),
            SkipReason::MissingText => write!(f, "missing text"),
            SkipReason::Malformed => write!(f, "malformed payload"),
        }
    }
}

/// A parsed entry of the feed. Skipped entries still move the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolledUpdate {
    Valid(Update),
    Skipped { update_id: i64, reason: SkipReason },
}

impl PolledUpdate {
    pub fn update_id(&self) -> i64 {
        match self {
            PolledUpdate::Valid(update) => update.update_id,
            PolledUpdate::Skipped { update_id, .. } => *update_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    edited_message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    chat: Option<RawChat>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChat {
    #[serde(default)]
    id: Option<i64>,
}

enum Envelope {
    Message(RawMessage),
    Edited(RawMessage),
}

impl RawUpdate {
    /// `message` wins when present; `edited_message` is only a fallback key.
    fn into_envelope(self) -> Option<Envelope> {
        match (self.message, self.edited_message) {
            (Some(message), _) => Some(Envelope::Message(message)),
            (None, Some(edited)) => Some(Envelope::Edited(edited)),
            (None, None) => None,
        }
    }
}

/// Parse one raw Bot API update. Returns `None` only when the value has no
/// usable `update_id`.
pub fn parse_update(raw: &Value) -> Option<PolledUpdate> {
    let raw: RawUpdate = match RawUpdate::deserialize(raw) {
        Ok(raw) => raw,
        Err(e) => {
            // A malformed message body must not hide a valid update_id.
            let update_id = raw.get("update_id").and_then(Value::as_i64)?;
            debug!("Update {} did not deserialize: {}", update_id, e);
            return Some(PolledUpdate::Skipped {
                update_id,
                reason: SkipReason::Malformed,
            });
        }
    };

    let update_id = raw.update_id;
    let skipped = |reason| Some(PolledUpdate::Skipped { update_id, reason });

    let (origin, message) = match raw.into_envelope() {
        Some(Envelope::Message(message)) => (MessageOrigin::New, message),
        Some(Envelope::Edited(message)) => (MessageOrigin::Edited, message),
        None => return skipped(SkipReason::NoMessage),
    };

    let Some(chat_id) = message.chat.and_then(|chat| chat.id) else {
        return skipped(SkipReason::MissingChat);
    };
    let Some(message_id) = message.message_id else {
        return skipped(SkipReason::MissingMessageId);
    };
    let Some(text) = message.text else {
        return skipped(SkipReason::MissingText);
    };

    Some(PolledUpdate::Valid(Update {
        update_id,
        chat_id,
        message_id,
        text,
        origin,
    }))
}

/// Highest update id processed or attempted in this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor(Option<i64>);

impl Cursor {
    pub fn last(&self) -> Option<i64> {
        self.0
    }

    /// The `offset` for the next poll: one past the last seen id.
    pub fn offset(&self) -> Option<i64> {
        self.0.map(|id| id + 1)
    }

    /// Move past `update_id`. Never moves backwards.
    pub fn advance(&mut self, update_id: i64) {
        match self.0 {
            Some(last) if last >= update_id => {}
            _ => self.0 = Some(update_id),
        }
    }
}

/// Polls the platform for updates after a cursor.
pub struct UpdateSource<P> {
    platform: P,
}

impl<P: ChatPlatform> UpdateSource<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// One request for everything after `cursor`, in feed order.
    pub async fn poll(&self, cursor: Cursor) -> Result<Vec<PolledUpdate>> {
        let raw_updates = self.platform.get_updates(cursor.offset()).await?;

        let mut updates = Vec::with_capacity(raw_updates.len());
        for raw in &raw_updates {
            match parse_update(raw) {
                Some(update) => updates.push(update),
                None => warn!("Dropping update without an update_id: {}", raw),
            }
        }
        Ok(updates)
    }
}
