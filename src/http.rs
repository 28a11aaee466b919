//! `GET /chat?q=<message>`: runs one exchange on the shared page and
//! answers with the assistant's text as the plain response body.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::assistant::{AssistantSurface, ExchangeClient};

#[derive(Debug, Deserialize)]
struct ChatQuery {
    q: Option<String>,
}

fn router<S: AssistantSurface + 'static>(exchange: Arc<ExchangeClient<S>>) -> Router {
    Router::new()
        .route("/chat", get(chat::<S>))
        .with_state(exchange)
}

async fn chat<S: AssistantSurface + 'static>(
    State(exchange): State<Arc<ExchangeClient<S>>>,
    Query(query): Query<ChatQuery>,
) -> Result<String, (StatusCode, String)> {
    let Some(message) = query.q.filter(|q| !q.trim().is_empty()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "missing query parameter 'q'".to_string(),
        ));
    };

    exchange.exchange(&message).await.map_err(|e| {
        error!("HTTP exchange failed: {:#}", e);
        (StatusCode::BAD_GATEWAY, format!("{:#}", e))
    })
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))
}

/// Serve until the listener fails. Exchanges queue behind the relay's.
pub async fn serve<S: AssistantSurface + 'static>(
    listener: TcpListener,
    exchange: Arc<ExchangeClient<S>>,
) -> Result<()> {
    let addr = listener.local_addr().context("Failed to read listen address")?;
    info!("HTTP API listening on http://{}/chat", addr);

    axum::serve(listener, router(exchange))
        .await
        .context("Server error")
}
