//! WebSocket endpoint.
//!
//! The country gate runs here instead of in the admission layer so that a
//! rejected client gets a readable reason over the socket: one JSON error
//! frame, then a close frame with code 1008 (policy violation). Admitted
//! sockets echo text and binary frames.

use axum::Extension;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::Uri;
use axum::response::Response;
use tracing::{debug, info, warn};

use crate::geo::GeoDecision;
use crate::middleware::ip::ClientIdentity;
use crate::models::SocketRejection;
use crate::state::AppState;

pub const SOCKET_PATH: &str = "/ws";

/// Map a gate decision to the frame sent before closing, if any.
pub fn socket_rejection(decision: &GeoDecision) -> Option<SocketRejection> {
    match decision {
        GeoDecision::Allowed(_) => None,
        GeoDecision::Rejected { ip, country } => Some(SocketRejection {
            reason: "region_restricted".to_string(),
            ip: ip.clone(),
            country: Some(country.clone()),
        }),
        GeoDecision::Blocked { ip } => Some(SocketRejection {
            reason: "ip_blocked".to_string(),
            ip: ip.clone(),
            country: None,
        }),
    }
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Extension(identity): Extension<ClientIdentity>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let decision = state.geo.allow(uri.path(), &identity.ip);
    ws.on_upgrade(move |socket| handle_socket(socket, decision, identity))
}

async fn handle_socket(mut socket: WebSocket, decision: GeoDecision, identity: ClientIdentity) {
    if let Some(rejection) = socket_rejection(&decision) {
        info!(ip = %rejection.ip, reason = %rejection.reason, "Socket rejected");
        reject_socket(&mut socket, &rejection).await;
        return;
    }

    debug!(ip = %identity.ip, "Socket connected");
    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Socket receive failed");
                break;
            }
        };
        let reply = match message {
            Message::Text(text) => Message::Text(text),
            Message::Binary(bytes) => Message::Binary(bytes),
            Message::Close(_) => break,
            // Pings are answered by the transport
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if socket.send(reply).await.is_err() {
            break;
        }
    }
    debug!(ip = %identity.ip, "Socket closed");
}

async fn reject_socket(socket: &mut WebSocket, rejection: &SocketRejection) {
    match serde_json::to_string(rejection) {
        Ok(body) => {
            if let Err(e) = socket.send(Message::Text(body.into())).await {
                warn!(error = %e, "Failed to send socket rejection frame");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode socket rejection"),
    }

    let close = CloseFrame {
        code: close_code::POLICY,
        reason: rejection.reason.clone().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(close))).await {
        debug!(error = %e, "Failed to send socket close frame");
    }
}
