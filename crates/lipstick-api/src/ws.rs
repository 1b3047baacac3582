//! WebSocket endpoints for agents
//!
//! `GET /ws` upgrades to a control link for the domain named by the request's
//! Host header. `GET /ws/{token}` upgrades to a proxy stream that serves the
//! inbound connection parked under `token`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use lipstick_control::ControlLink;
use lipstick_proto::ControlMessage;
use lipstick_router::{http::strip_port, is_valid_domain, normalize_domain};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::ws_io::WebSocketIo;
use crate::AppState;

/// Control link upgrade
pub async fn control_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Host header".to_string()))?;

    let domain = normalize_domain(strip_port(host));
    if !is_valid_domain(&domain) {
        return Err(ApiError::BadRequest(format!("Invalid Host header: {}", host)));
    }

    let authorized = state.store.is_authorized(&domain).await?;
    if !authorized {
        warn!("Control link for unauthorized domain {}", domain);
    }

    Ok(ws.on_upgrade(move |socket| serve_control_link(state, domain, authorized, socket)))
}

/// Proxy stream upgrade
pub async fn proxy_upgrade(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = Uuid::parse_str(&token)
        .map_err(|_| ApiError::BadRequest(format!("Invalid pairing token: {}", token)))?;

    Ok(ws.on_upgrade(move |socket| async move {
        debug!("Proxy stream arrived for token {}", token);
        if let Err(e) = state
            .manager
            .submit_proxy_stream(token, WebSocketIo::new(socket))
            .await
        {
            debug!("Dropped proxy stream for token {}: {}", token, e);
        }
    }))
}

async fn send_control(socket: &mut WebSocket, message: &ControlMessage) -> Result<(), String> {
    let bytes = message.encode().map_err(|e| e.to_string())?;
    socket
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| e.to_string())
}

async fn reject(mut socket: WebSocket, reason: String) {
    let _ = send_control(&mut socket, &ControlMessage::Rejected { reason }).await;
    let _ = socket.send(Message::Close(None)).await;
}

async fn serve_control_link(
    state: Arc<AppState>,
    domain: String,
    authorized: bool,
    mut socket: WebSocket,
) {
    if !authorized {
        reject(socket, format!("Domain not authorized: {}", domain)).await;
        return;
    }

    let capacity = state.manager.config().link_channel_capacity;
    let (link, mut outbound) = ControlLink::new(domain.clone(), capacity);

    if let Err(e) = state.manager.register_control_link(link.clone()).await {
        warn!("Control link for {} refused: {}", domain, e);
        reject(socket, e.to_string()).await;
        return;
    }

    if let Err(e) = send_control(
        &mut socket,
        &ControlMessage::Registered {
            domain: domain.clone(),
        },
    )
    .await
    {
        debug!("Failed to confirm control link for {}: {}", domain, e);
        state.manager.unregister_control_link(&link);
        return;
    }

    info!("Control link {} serving {}", link.id(), domain);

    loop {
        tokio::select! {
            _ = link.closed() => {
                debug!("Control link {} for {} closed by broker", link.id(), domain);
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = send_control(&mut socket, &message).await {
                    debug!("Control link {} write failed: {}", link.id(), e);
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Binary(data))) => match ControlMessage::decode(&data) {
                    Ok(ControlMessage::Ping { timestamp }) => {
                        let pong = ControlMessage::Pong { timestamp };
                        if send_control(&mut socket, &pong).await.is_err() {
                            break;
                        }
                    }
                    Ok(other) => debug!("Ignoring control message from agent: {:?}", other),
                    Err(e) => warn!("Undecodable control frame on link {}: {}", link.id(), e),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Agent closed control link {}", link.id());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Control link {} read failed: {}", link.id(), e);
                    break;
                }
            },
        }
    }

    state.manager.unregister_control_link(&link);
    let _ = socket.send(Message::Close(None)).await;
}
