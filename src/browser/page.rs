use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::session::BrowserSession;
use crate::assistant::AssistantSurface;
use crate::config::BrowserConfig;

/// The assistant's chat page, driven through the session's CDP connection.
pub struct ChatPage {
    session: BrowserSession,
    input_selector: String,
    message_selector: String,
}

impl ChatPage {
    pub fn new(session: BrowserSession, config: &BrowserConfig) -> Self {
        Self {
            session,
            input_selector: config.input_selector.clone(),
            message_selector: config.message_selector.clone(),
        }
    }

    /// Navigate to the assistant and give the page time to render.
    pub async fn load(&self, url: &str, settle: Duration) -> Result<()> {
        info!("Opening assistant page {}", url);
        self.session
            .cdp
            .navigate(url)
            .await
            .with_context(|| format!("Failed to open {}", url))?;
        tokio::time::sleep(settle).await;
        Ok(())
    }

    /// Logged in means the prompt input is on the page.
    pub async fn is_logged_in(&self) -> Result<bool> {
        let value = self
            .session
            .cdp
            .evaluate(&input_present_script(&self.input_selector))
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Block until the operator has logged in through the visible browser
    /// window and pressed Enter on the terminal.
    pub async fn ensure_logged_in(&self) -> Result<()> {
        if self.is_logged_in().await? {
            return Ok(());
        }

        warn!("Please log in to the assistant in the browser window");
        warn!("Press Enter when you're done");
        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .context("Failed to read from stdin")?;

        if !self.is_logged_in().await? {
            anyhow::bail!("Still not logged in: no '{}' on the page", self.input_selector);
        }
        info!("Login detected");
        Ok(())
    }
}

#[async_trait]
impl AssistantSurface for ChatPage {
    async fn submit(&self, message: &str) -> Result<()> {
        let cdp = &self.session.cdp;
        let focused = cdp
            .evaluate(&focus_input_script(&self.input_selector))
            .await?;
        if focused.as_bool() != Some(true) {
            anyhow::bail!("Prompt input '{}' not found", self.input_selector);
        }
        cdp.insert_text(message).await?;
        cdp.press_enter().await?;
        Ok(())
    }

    async fn last_message_text(&self) -> Result<Option<String>> {
        let value = self
            .session
            .cdp
            .evaluate(&last_message_script(&self.message_selector))
            .await?;
        Ok(match value {
            Value::String(text) => Some(text),
            _ => None,
        })
    }
}

/// Quote a selector as a JavaScript string literal.
fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

fn input_present_script(selector: &str) -> String {
    format!("document.querySelector({}) !== null", js_string(selector))
}

/// Focus and clear the input. Evaluates to whether it was found.
fn focus_input_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const el = document.querySelector({sel});
  if (!el) return false;
  el.click();
  el.focus();
  if ('value' in el) {{
    el.value = '';
  }} else {{
    el.textContent = '';
  }}
  el.dispatchEvent(new Event('input', {{ bubbles: true }}));
  return true;
}})()"#,
        sel = js_string(selector)
    )
}

fn last_message_script(selector: &str) -> String {
    format!(
        r#"(() => {{
  const els = document.querySelectorAll({sel});
  if (els.length === 0) return null;
  return els[els.length - 1].innerText;
}})()"#,
        sel = js_string(selector)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_is_quoted_for_js() {
        let script = last_message_script("div[class*='ConversationItem__Message']");
        assert!(script.contains(r#"querySelectorAll("div[class*='ConversationItem__Message']")"#));
    }

    #[test]
    fn test_double_quotes_are_escaped() {
        let script = input_present_script(r#"textarea[data-id="root"]"#);
        assert_eq!(
            script,
            r#"document.querySelector("textarea[data-id=\"root\"]") !== null"#
        );
    }

    #[test]
    fn test_focus_script_clears_input() {
        let script = focus_input_script("textarea");
        assert!(script.contains(r#"document.querySelector("textarea")"#));
        assert!(script.contains("el.focus()"));
        assert!(script.contains("return true;"));
    }
}
