use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::assistant::{AssistantSurface, ExchangeClient};
use crate::browser;
use crate::config::{AllowList, RelayConfig};
use crate::platform::ChatPlatform;
use crate::updates::{Cursor, PolledUpdate, Update, UpdateSource};

/// State that outlives a browser session. Owned by `main`, so a restarted
/// session never replays updates that were already handled.
#[derive(Debug, Default)]
pub struct RelayState {
    pub cursor: Cursor,
}

/// What a single poll-and-dispatch cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub polled: usize,
    pub relayed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Pulls updates, runs one exchange per allowed message, replies, and
/// advances the cursor. Exchanges are strictly sequential.
pub struct Relay<P, S> {
    source: UpdateSource<P>,
    exchange: Arc<ExchangeClient<S>>,
    allow_list: AllowList,
    poll_interval: Duration,
}

impl<P: ChatPlatform, S: AssistantSurface> Relay<P, S> {
    pub fn new(platform: P, surface: Arc<S>, allow_list: AllowList, config: &RelayConfig) -> Self {
        Self {
            source: UpdateSource::new(platform),
            exchange: Arc::new(ExchangeClient::new(surface, config)),
            allow_list,
            poll_interval: config.poll_interval(),
        }
    }

    /// The exchange client, for other front ends that share the page.
    pub fn exchange_client(&self) -> Arc<ExchangeClient<S>> {
        self.exchange.clone()
    }

    /// Poll forever. Returns only when the browser session is lost.
    pub async fn run(&self, state: &mut RelayState) -> Result<()> {
        info!("Relay started (cursor: {:?})", state.cursor.last());
        loop {
            let report = self.run_cycle(state).await?;
            if report.polled > 0 {
                debug!(
                    "Cycle done: {} polled, {} relayed, {} skipped, {} failed",
                    report.polled, report.relayed, report.skipped, report.failed
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One poll and the dispatch of everything it returned.
    pub async fn run_cycle(&self, state: &mut RelayState) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        debug!("Checking for updates");
        let updates = match self.source.poll(state.cursor).await {
            Ok(updates) => updates,
            Err(e) => {
                error!("Error getting updates: {:#}", e);
                return Ok(report);
            }
        };

        if updates.is_empty() {
            debug!("No new updates");
            return Ok(report);
        }
        report.polled = updates.len();

        for polled in updates {
            let update_id = polled.update_id();
            let update = match polled {
                PolledUpdate::Valid(update) => update,
                PolledUpdate::Skipped { reason, .. } => {
                    warn!("Update {} is not a valid message: {}", update_id, reason);
                    report.skipped += 1;
                    state.cursor.advance(update_id);
                    continue;
                }
            };

            if !self.allow_list.permits(update.chat_id) {
                warn!("Chat ID {} not allowed (update {})", update.chat_id, update_id);
                report.skipped += 1;
                state.cursor.advance(update_id);
                continue;
            }

            let outcome = self.relay_update(&update).await;
            state.cursor.advance(update_id);

            match outcome {
                Ok(()) => report.relayed += 1,
                Err(e) => {
                    error!("Error processing update {}: {:#}", update_id, e);
                    report.failed += 1;
                    if browser::is_session_lost(&e) {
                        return Err(e.context(format!(
                            "Browser session lost while handling update {}",
                            update_id
                        )));
                    }
                }
            }
        }

        Ok(report)
    }

    async fn relay_update(&self, update: &Update) -> Result<()> {
        info!(
            "Message {} from chat {} ({:?}): {}",
            update.message_id, update.chat_id, update.origin, update.text
        );

        let platform = self.source.platform();
        if let Err(e) = platform.send_typing(update.chat_id).await {
            debug!("Typing indicator failed: {:#}", e);
        }

        let response = self.exchange.exchange(&update.text).await?;

        // A failed send is logged by the caller and not retried.
        platform
            .send_reply(update.chat_id, update.message_id, &response)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::CdpError;
    use crate::config::Config;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeTelegram {
        polls: Mutex<VecDeque<Result<Vec<Value>>>>,
        offsets: Mutex<Vec<Option<i64>>>,
        sent: Mutex<Vec<(i64, i64, String)>>,
        fail_sends: bool,
    }

    impl FakeTelegram {
        fn with_polls(polls: Vec<Result<Vec<Value>>>) -> Self {
            Self {
                polls: Mutex::new(polls.into()),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<(i64, i64, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatPlatform for FakeTelegram {
        async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Value>> {
            self.offsets.lock().unwrap().push(offset);
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn send_reply(&self, chat_id: i64, reply_to: i64, text: &str) -> Result<()> {
            if self.fail_sends {
                anyhow::bail!("Telegram sendMessage error (400 Bad Request)");
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id, reply_to, text.to_string()));
            Ok(())
        }
    }

    /// Page whose last message follows a script; the final entry repeats.
    struct FakePage {
        submitted: Mutex<Vec<String>>,
        script: Mutex<VecDeque<String>>,
        failure: Option<fn() -> anyhow::Error>,
    }

    impl FakePage {
        fn showing(script: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                submitted: Mutex::new(Vec::new()),
                script: Mutex::new(script.iter().map(|s| s.to_string()).collect()),
                failure: None,
            })
        }

        fn failing(failure: fn() -> anyhow::Error) -> Arc<Self> {
            Arc::new(Self {
                submitted: Mutex::new(Vec::new()),
                script: Mutex::new(VecDeque::new()),
                failure: Some(failure),
            })
        }

        fn submitted(&self) -> Vec<String> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AssistantSurface for FakePage {
        async fn submit(&self, message: &str) -> Result<()> {
            self.submitted.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn last_message_text(&self) -> Result<Option<String>> {
            if let Some(failure) = self.failure {
                return Err(failure());
            }
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                Ok(script.pop_front())
            } else {
                Ok(script.front().cloned())
            }
        }
    }

    fn fast_config() -> RelayConfig {
        let mut config = Config::default().relay;
        config.poll_interval_secs = 0.0;
        config.response_delay_secs = 0.0;
        config.settle_interval_ms = 0;
        config
    }

    fn relay(
        telegram: FakeTelegram,
        page: Arc<FakePage>,
        allow_list: AllowList,
    ) -> Relay<FakeTelegram, FakePage> {
        Relay::new(telegram, page, allow_list, &fast_config())
    }

    fn message(update_id: i64, chat_id: i64, message_id: i64, text: &str) -> Value {
        json!({
            "update_id": update_id,
            "message": {"message_id": message_id, "chat": {"id": chat_id}, "text": text}
        })
    }

    #[tokio::test]
    async fn test_relays_message_and_advances_cursor() {
        let telegram = FakeTelegram::with_polls(vec![Ok(vec![message(10, 42, 7, "hi")])]);
        let page = FakePage::showing(&["hel", "hello", "hello"]);
        let relay = relay(telegram, page.clone(), AllowList::default());
        let mut state = RelayState::default();

        let report = relay.run_cycle(&mut state).await.unwrap();

        assert_eq!(page.submitted(), vec!["hi".to_string()]);
        assert_eq!(
            relay.source.platform().sent(),
            vec![(42, 7, "hello".to_string())]
        );
        assert_eq!(state.cursor.last(), Some(10));
        assert_eq!(report.relayed, 1);
    }

    #[tokio::test]
    async fn test_malformed_update_is_skipped() {
        let malformed = json!({
            "update_id": 20,
            "message": {"message_id": 1, "chat": {"id": 42}}
        });
        let telegram =
            FakeTelegram::with_polls(vec![Ok(vec![malformed, message(21, 42, 2, "second")])]);
        let page = FakePage::showing(&["answer"]);
        let relay = relay(telegram, page.clone(), AllowList::default());
        let mut state = RelayState::default();

        let report = relay.run_cycle(&mut state).await.unwrap();

        assert_eq!(page.submitted(), vec!["second".to_string()]);
        assert_eq!(state.cursor.last(), Some(21));
        assert_eq!(report.skipped, 1);
        assert_eq!(report.relayed, 1);
    }

    #[tokio::test]
    async fn test_disallowed_chat_is_skipped() {
        let telegram = FakeTelegram::with_polls(vec![Ok(vec![message(30, 99, 1, "let me in")])]);
        let page = FakePage::showing(&["nope"]);
        let relay = relay(telegram, page.clone(), AllowList::parse("42"));
        let mut state = RelayState::default();

        relay.run_cycle(&mut state).await.unwrap();

        assert!(page.submitted().is_empty());
        assert!(relay.source.platform().sent().is_empty());
        assert_eq!(state.cursor.last(), Some(30));
    }

    #[tokio::test]
    async fn test_next_poll_offset_follows_last_update() {
        let telegram = FakeTelegram::with_polls(vec![
            Ok(vec![message(10, 42, 7, "one"), message(12, 42, 8, "two")]),
            Ok(Vec::new()),
        ]);
        let page = FakePage::showing(&["ok"]);
        let relay = relay(telegram, page, AllowList::default());
        let mut state = RelayState::default();

        relay.run_cycle(&mut state).await.unwrap();
        relay.run_cycle(&mut state).await.unwrap();

        let offsets = relay.source.platform().offsets.lock().unwrap().clone();
        assert_eq!(offsets, vec![None, Some(13)]);
    }

    #[tokio::test]
    async fn test_silent_assistant_gets_sentinel_reply() {
        let telegram = FakeTelegram::with_polls(vec![Ok(vec![message(5, 1, 2, "hello?")])]);
        let page = FakePage::showing(&[""]);
        let relay = relay(telegram, page, AllowList::default());
        let mut state = RelayState::default();

        relay.run_cycle(&mut state).await.unwrap();

        assert_eq!(
            relay.source.platform().sent(),
            vec![(1, 2, "<ChatGPT is not responding.>".to_string())]
        );
    }

    #[tokio::test]
    async fn test_send_failure_still_advances() {
        let telegram = FakeTelegram {
            fail_sends: true,
            ..FakeTelegram::with_polls(vec![Ok(vec![
                message(40, 42, 1, "a"),
                message(41, 42, 2, "b"),
            ])])
        };
        let page = FakePage::showing(&["reply"]);
        let relay = relay(telegram, page.clone(), AllowList::default());
        let mut state = RelayState::default();

        let report = relay.run_cycle(&mut state).await.unwrap();

        assert_eq!(page.submitted().len(), 2);
        assert_eq!(report.failed, 2);
        assert_eq!(state.cursor.last(), Some(41));
    }

    #[tokio::test]
    async fn test_page_error_does_not_stop_the_cycle() {
        let telegram = FakeTelegram::with_polls(vec![Ok(vec![
            message(50, 42, 1, "a"),
            message(51, 42, 2, "b"),
        ])]);
        let page = FakePage::failing(|| {
            CdpError::Script("TypeError: els is undefined".to_string()).into()
        });
        let relay = relay(telegram, page.clone(), AllowList::default());
        let mut state = RelayState::default();

        let report = relay.run_cycle(&mut state).await.unwrap();

        assert_eq!(page.submitted().len(), 2);
        assert_eq!(report.failed, 2);
        assert!(relay.source.platform().sent().is_empty());
        assert_eq!(state.cursor.last(), Some(51));
    }

    #[tokio::test]
    async fn test_lost_session_ends_relay_after_advancing() {
        let telegram = FakeTelegram::with_polls(vec![Ok(vec![
            message(60, 42, 1, "a"),
            message(61, 42, 2, "b"),
        ])]);
        let page = FakePage::failing(|| CdpError::Closed.into());
        let relay = relay(telegram, page.clone(), AllowList::default());
        let mut state = RelayState::default();

        let err = relay.run_cycle(&mut state).await.unwrap_err();

        assert!(browser::is_session_lost(&err));
        assert_eq!(page.submitted(), vec!["a".to_string()]);
        assert_eq!(state.cursor.last(), Some(60));
    }

    #[tokio::test]
    async fn test_poll_error_keeps_cursor() {
        let telegram = FakeTelegram::with_polls(vec![Err(anyhow::anyhow!(
            "Telegram getUpdates error (502 Bad Gateway)"
        ))]);
        let page = FakePage::showing(&["x"]);
        let relay = relay(telegram, page, AllowList::default());
        let mut state = RelayState::default();
        state.cursor.advance(9);

        let report = relay.run_cycle(&mut state).await.unwrap();

        assert_eq!(report, CycleReport::default());
        assert_eq!(state.cursor.last(), Some(9));
    }
}
