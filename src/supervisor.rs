use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info};

use crate::relay::RelayState;

/// One full startup of the relay: browser, page, login, then serving until
/// the session fails.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    async fn run(&self, state: &mut RelayState) -> Result<()>;
}

/// Run `bootstrap` forever, starting over `restart_delay` after every
/// failure. `state` is shared across restarts.
pub async fn supervise<B: Bootstrap>(
    bootstrap: &B,
    restart_delay: Duration,
    state: &mut RelayState,
) {
    loop {
        match bootstrap.run(state).await {
            Ok(()) => info!("Relay stopped"),
            Err(e) => error!("Error: {:#}", e),
        }
        info!("Restarting browser session in {:?}", restart_delay);
        tokio::time::sleep(restart_delay).await;
    }
}
