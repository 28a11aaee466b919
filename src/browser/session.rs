//! Browser process lifecycle and the page-level CDP connection.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::info;

use super::cdp::CdpClient;
use crate::config::BrowserConfig;

const CDP_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// A browser with one page target, either launched by us or attached to.
pub struct BrowserSession {
    /// `None` when attached to a browser we did not start.
    process: Option<Child>,
    pub cdp: CdpClient,
}

impl BrowserSession {
    /// Launch (or attach to) the configured browser and connect to its
    /// first page target.
    pub async fn open(config: &BrowserConfig) -> Result<Self> {
        let (process, debug_port) = match config.debug_port {
            Some(port) => {
                info!("Attaching to running browser on port {}", port);
                (None, port)
            }
            None => {
                let (child, port) = launch(config).await?;
                (Some(child), port)
            }
        };

        wait_for_cdp_ready(debug_port, CDP_READY_TIMEOUT).await?;
        let page_ws_url = get_page_ws_url(debug_port).await?;
        let cdp = CdpClient::connect(&page_ws_url).await?;

        cdp.enable_domain("Page").await?;
        cdp.enable_domain("Runtime").await?;

        info!("CDP connection established ({})", page_ws_url);

        Ok(Self { process, cdp })
    }
}

impl Drop for BrowserSession {
    // Tear down a browser we launched; an attached one is left running.
    fn drop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            let _ = child.start_kill();
        }
    }
}

async fn launch(config: &BrowserConfig) -> Result<(Child, u16)> {
    let browser_path = match &config.executable {
        Some(path) => path.clone(),
        None => find_browser_binary().context("No Chrome/Chromium binary found on this system")?,
    };

    std::fs::create_dir_all(&config.user_data_dir).with_context(|| {
        format!(
            "Failed to create user data dir: {}",
            config.user_data_dir.display()
        )
    })?;

    let debug_port = find_free_port().await?;
    let args = build_browser_args(debug_port, &config.user_data_dir, config.headed);

    info!(
        "Launching {} (port {}, headed: {}, profile: {})",
        browser_path,
        debug_port,
        config.headed,
        config.user_data_dir.display()
    );

    let child = Command::new(&browser_path)
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to launch {}", browser_path))?;

    Ok((child, debug_port))
}

fn build_browser_args(debug_port: u16, user_data_dir: &Path, headed: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-sync".to_string(),
        "--password-store=basic".to_string(),
    ];
    if !headed {
        args.push("--headless=new".to_string());
    }
    args.push("--window-size=1280,900".to_string());
    args.push("about:blank".to_string());
    args
}

/// Find a Chromium-family binary on the system.
pub fn find_browser_binary() -> Option<String> {
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ]
    };

    for candidate in candidates {
        if Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
        if !candidate.contains('/') && !candidate.contains('\\') && which::which(candidate).is_ok()
        {
            return Some(candidate.to_string());
        }
    }
    None
}

async fn find_free_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("Failed to bind to find free port")?;
    let port = listener
        .local_addr()
        .context("Failed to get local addr")?
        .port();
    Ok(port)
}

/// Poll `/json/version` until the debugging endpoint answers.
async fn wait_for_cdp_ready(port: u16, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let url = format!("http://127.0.0.1:{}/json/version", port);

    loop {
        if let Ok(resp) = reqwest::get(&url).await {
            if let Ok(body) = resp.json::<Value>().await {
                if body.get("webSocketDebuggerUrl").is_some() {
                    return Ok(());
                }
            }
        }
        if start.elapsed() > timeout {
            bail!(
                "Browser CDP endpoint not ready after {}s on port {}",
                timeout.as_secs(),
                port
            );
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// WebSocket URL of the first "page" target listed by `/json/list`.
/// Retries a few times since the page target may not appear immediately.
async fn get_page_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let targets: Vec<Value> = match reqwest::get(&url).await {
            Ok(resp) => match resp.json().await {
                Ok(targets) => targets,
                Err(_) => continue,
            },
            Err(_) => continue,
        };
        if let Some(ws_url) = first_page_ws_url(&targets) {
            return Ok(ws_url);
        }
    }

    bail!("No page target found on port {} after retries", port)
}

fn first_page_ws_url(targets: &[Value]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.get("type").and_then(Value::as_str) == Some("page"))
        .find_map(|t| t.get("webSocketDebuggerUrl").and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_headless_flag_only_when_not_headed() {
        let dir = PathBuf::from("/tmp/profile");
        let headed = build_browser_args(9222, &dir, true);
        let headless = build_browser_args(9222, &dir, false);

        assert!(headed.contains(&"--remote-debugging-port=9222".to_string()));
        assert!(headed.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(!headed.iter().any(|a| a.starts_with("--headless")));
        assert!(headless.contains(&"--headless=new".to_string()));
        assert_eq!(headed.last().map(String::as_str), Some("about:blank"));
    }

    #[test]
    fn test_first_page_target_wins() {
        let targets = vec![
            json!({"type": "service_worker", "webSocketDebuggerUrl": "ws://sw"}),
            json!({"type": "page"}),
            json!({"type": "page", "webSocketDebuggerUrl": "ws://page-1"}),
            json!({"type": "page", "webSocketDebuggerUrl": "ws://page-2"}),
        ];
        assert_eq!(first_page_ws_url(&targets), Some("ws://page-1".to_string()));
        assert_eq!(first_page_ws_url(&[]), None);
    }
}
