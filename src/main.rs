mod assistant;
mod browser;
mod config;
mod http;
mod platform;
mod relay;
mod supervisor;
mod updates;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::assistant::RetryLadder;
use crate::browser::{BrowserSession, ChatPage};
use crate::config::Config;
use crate::platform::telegram::TelegramClient;
use crate::relay::{Relay, RelayState};
use crate::supervisor::{supervise, Bootstrap};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,telegram_chat_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Assistant: {}", config.browser.assistant_url);
    info!("  Profile: {}", config.browser.user_data_dir.display());
    if config.telegram.allowed_chat_ids.permits_everyone() {
        info!("  Allowed chats: all");
    } else {
        info!("  Allowed chats: {:?}", config.telegram.allowed_chat_ids);
    }
    info!(
        "  Response waits: {:?}",
        RetryLadder::from_config(&config.relay).delays()
    );
    if let Some(listen) = &config.http.listen {
        info!("  HTTP API: {}", listen);
    }

    // The cursor outlives browser restarts.
    let mut state = RelayState::default();
    let bootstrap = BrowserRelay { config: &config };

    tokio::select! {
        _ = supervise(&bootstrap, config.relay.restart_delay(), &mut state) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
        }
    }

    Ok(())
}

/// Browser, assistant page, login, then the relay and the optional HTTP API
/// on top of the same page.
struct BrowserRelay<'a> {
    config: &'a Config,
}

#[async_trait]
impl Bootstrap for BrowserRelay<'_> {
    async fn run(&self, state: &mut RelayState) -> Result<()> {
        let config = self.config;
        let session = BrowserSession::open(&config.browser)
            .await
            .context("Failed to start browser session")?;

        let page = ChatPage::new(session, &config.browser);
        page.load(
            &config.browser.assistant_url,
            Duration::from_secs(config.browser.page_load_secs),
        )
        .await?;
        page.ensure_logged_in().await?;

        let telegram = TelegramClient::new(&config.telegram)?;
        let relay = Relay::new(
            telegram,
            Arc::new(page),
            config.telegram.allowed_chat_ids.clone(),
            &config.relay,
        );

        info!("Bot is starting...");
        match &config.http.listen {
            Some(addr) => {
                let listener = http::bind(addr).await?;
                tokio::select! {
                    result = relay.run(state) => result,
                    result = http::serve(listener, relay.exchange_client()) => result,
                }
            }
            None => relay.run(state).await,
        }
    }
}
