use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    error::{Error, Result},
    sender::{OutboundRequest, SmsSender},
    store::{Store, StoredMessage},
};

/// The header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// What the request handlers need.
#[derive(Clone)]
pub struct AppState {
    /// Sends SMS.
    pub sender: SmsSender,

    /// The message log.
    pub store: Arc<dyn Store>,

    /// Requests without this in [`API_KEY_HEADER`] are turned away.
    pub api_key: Arc<str>,
}

/// A stored message as shown by `GET /messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    /// Store id.
    pub id: u64,

    /// Who sent it.
    pub sender: String,

    /// Modem native timestamp.
    pub timestamp: String,

    /// The text.
    pub message: String,
}

impl From<StoredMessage> for MessageView {
    fn from(stored: StoredMessage) -> Self {
        Self {
            id: stored.id,
            sender: stored.sender,
            timestamp: stored.timestamp,
            message: stored.body,
        }
    }
}

/// The body of `POST /send_sms`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSmsRequest {
    /// Destination number.
    pub phone_number: Option<String>,

    /// The text.
    pub message: Option<String>,
}

impl SendSmsRequest {
    /// An example request.
    pub fn example() -> Self {
        Self {
            phone_number: Some("+15551234567".into()),
            message: Some("Hello there".into()),
        }
    }

    fn into_outbound(self) -> Option<OutboundRequest> {
        let recipient = self.phone_number.filter(|n| !n.trim().is_empty())?;
        let body = self.message.filter(|m| !m.is_empty())?;

        Some(OutboundRequest { recipient, body })
    }
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn authorized(headers: &HeaderMap, api_key: &str) -> bool {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |key| key == api_key)
}

fn unauthorized() -> Response {
    warn!("Request with missing or wrong API key");
    json_error(StatusCode::UNAUTHORIZED, "Unauthorized access")
}

async fn get_messages(Extension(state): Extension<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.api_key) {
        return unauthorized();
    }

    match state.store.list_all().await {
        Ok(messages) => {
            let messages = messages
                .into_iter()
                .map(MessageView::from)
                .collect::<Vec<_>>();

            Json(messages).into_response()
        }
        Err(e) => {
            error!(?e, "Could not read messages");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read messages")
        }
    }
}

async fn send_sms(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&headers, &state.api_key) {
        return unauthorized();
    }

    let request = serde_json::from_slice::<SendSmsRequest>(&body)
        .ok()
        .and_then(SendSmsRequest::into_outbound);

    let request = match request {
        Some(request) => request,
        None => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "phone_number and message are required",
            )
        }
    };

    if let Err(e) = request.validate() {
        warn!(%e, "Refusing to send");
        return json_error(StatusCode::BAD_REQUEST, &e.to_string());
    }

    match state.sender.send(&request).await {
        Ok(true) => Json(json!({
            "success": format!("Message sent to {}", request.recipient)
        }))
        .into_response(),
        Ok(false) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to send SMS"),
        Err(e @ Error::InvalidRequest(_)) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(e) => {
            error!(?e, "Modem problem while sending");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to send SMS")
        }
    }
}

async fn show_version() -> impl IntoResponse {
    format!("SMS Gateway v{}\n", env!("CARGO_PKG_VERSION"))
}

/// The HTTP routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/messages", get(get_messages))
        .route("/send_sms", post(send_sms))
        .route("/version", get(show_version))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // Each handler needs the sender and the store
                .layer(Extension(state)),
        )
}

async fn run(
    state: AppState,
    port: Option<u16>,
    allocated_port: Option<oneshot::Sender<u16>>,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(0)));

    let server = axum::Server::try_bind(&addr)
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::AddrInUse, e)))?
        .serve(router(state).into_make_service());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        if port_reply.send(addr.port()).is_err() {
            warn!("Nobody wanted to know the allocated port");
        }
    }

    info!("listening on {}", addr);

    server
        .await
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))
}

/// Start the server on an arbitrary available port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(state: AppState, allocated_port: oneshot::Sender<u16>) -> Result<()> {
    run(state, None, Some(allocated_port)).await
}

/// Start the server on the given port.
pub async fn run_on_port(state: AppState, port: u16) -> Result<()> {
    run(state, Some(port), None).await
}
