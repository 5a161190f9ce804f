//! The report callback channel: an HTTP endpoint in the bot process that workers push computed rows
//! to, plus the client the worker uses to call it.
//!
//! `POST /report` takes a JSON [`ReportReply`] and answers `{"response_code": 1}` when a waiter
//! received the rows or `{"response_code": 2}` when nobody was waiting. The answer comes back
//! immediately either way, so the worker can acknowledge its queue message.

use crate::error::{ErrorType, IntoResult};
use crate::model::ReportReply;
use crate::transport::{with_retry, AckCode, ReportCallback, RetryConfig};
use crate::{Error, Result};
use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const REPORT_PATH: &str = "/report";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub response_code: AckCode,
}

/// Builds the callback router. Every received reply is handed to `sink`.
pub fn router(sink: Arc<dyn ReportCallback>) -> Router {
    Router::new()
        .route(REPORT_PATH, post(receive_report))
        .with_state(sink)
}

async fn receive_report(
    State(sink): State<Arc<dyn ReportCallback>>,
    Json(reply): Json<ReportReply>,
) -> std::result::Result<Json<CallbackResponse>, (StatusCode, String)> {
    debug!(
        correlation_id = %reply.correlation_id,
        user_id = reply.user_id,
        rows = reply.expenses.len(),
        "Received report callback"
    );
    match sink.send_report(&reply).await {
        Ok(response_code) => Ok(Json(CallbackResponse { response_code })),
        Err(e) => {
            warn!(correlation_id = %reply.correlation_id, "Unable to dispatch report: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Serves the callback endpoint on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    sink: Arc<dyn ReportCallback>,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("Callback listener has no local address")
        .pub_result(ErrorType::Transport)?;
    info!("Report callback server listening on {addr}");
    axum::serve(listener, router(sink))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Report callback server failed")
        .pub_result(ErrorType::Transport)?;
    debug!("Report callback server on {addr} stopped");
    Ok(())
}

/// Binds `addr` and spawns [`serve`] in the background. Returns the bound address, which differs
/// from `addr` when port 0 was requested.
pub async fn spawn_server(
    addr: SocketAddr,
    sink: Arc<dyn ReportCallback>,
    cancel: CancellationToken,
) -> Result<(SocketAddr, tokio::task::JoinHandle<Result<()>>)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Unable to bind report callback server to {addr}"))
        .pub_result(ErrorType::Transport)?;
    let bound = listener
        .local_addr()
        .context("Callback listener has no local address")
        .pub_result(ErrorType::Transport)?;
    let handle = tokio::spawn(serve(listener, sink, cancel));
    Ok((bound, handle))
}

/// Worker-side client of the callback endpoint.
#[derive(Debug, Clone)]
pub struct HttpCallbackClient {
    client: reqwest::Client,
    url: Url,
    retry: RetryConfig,
}

impl HttpCallbackClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let url = Url::parse(&format!("http://{addr}{REPORT_PATH}"))
            .context("Invalid callback address")
            .pub_result(ErrorType::Config)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Unable to build HTTP client")
            .pub_result(ErrorType::Internal)?;
        Ok(Self {
            client,
            url,
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn post(&self, reply: &ReportReply) -> Result<AckCode> {
        let response = self
            .client
            .post(self.url.clone())
            .json(reply)
            .send()
            .await
            .with_context(|| format!("Unable to reach {}", self.url))
            .pub_result(ErrorType::Transport)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::TransportUnavailable(format!(
                "callback returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(anyhow::anyhow!(
                "callback rejected the report with {status}: {body}"
            )));
        }
        let body: CallbackResponse = response
            .json()
            .await
            .context("Invalid callback response")
            .pub_result(ErrorType::Transport)?;
        Ok(body.response_code)
    }
}

#[async_trait::async_trait]
impl ReportCallback for HttpCallbackClient {
    async fn send_report(&self, reply: &ReportReply) -> Result<AckCode> {
        with_retry(&self.retry, "report callback", || self.post(reply)).await
    }
}
