//! WebSocket server handler using Axum.

use crate::connection::{ConnectionId, ConnectionState};
use crate::error::Result;
use crate::processor::CallProcessor;
use crate::queue::PushOutcome;
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use common::{decode, CallUpdate, ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub processor: Arc<dyn CallProcessor>,
    /// Producer side of the router's ingest channel.
    pub updates_tx: mpsc::Sender<CallUpdate>,
    pub ping_interval: Duration,
}

/// Query parameters accepted on `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Scope the connection to this call.
    pub call_id: Option<String>,
    /// Observe every call. Implied when no `call_id` is given.
    #[serde(default)]
    pub global: bool,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.registry.connection_count(),
        "subscriptions": state.registry.subscription_count(),
        "global_connections": state.registry.global_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let conn_id = state.registry.register();
    let Some(conn) = state.registry.get(&conn_id) else {
        return;
    };
    if let Err(e) = apply_scope(&state.registry, &conn_id, &params) {
        warn!("Failed to scope connection {}: {:?}", conn_id, e);
    }

    counter!("relay_connections_total").increment(1);
    gauge!("relay_active_connections").set(state.registry.connection_count() as f64);
    info!("Connection {} opened ({:?})", conn_id, conn.scope());

    // Forward queued frames to the socket. Ends when the queue closes or the
    // socket refuses a write.
    let queue = conn.queue.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = queue.pop().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval_at(
        Instant::now() + state.ping_interval,
        state.ping_interval,
    );
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Connection {} sent close: {:?}", conn_id, frame);
                        break;
                    }
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &conn, msg).await {
                            warn!("Error handling message from {}: {:?}", conn_id, e);
                            if e.is_client_fault() {
                                counter!("relay_invalid_messages_total").increment(1);
                            }
                            let _ = conn.send(&ServerMessage::Error {
                                message: e.to_string(),
                                code: e.code().to_string(),
                            });
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", conn_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = &mut send_task => {
                debug!("Send task for {} finished", conn_id);
                break;
            }

            _ = ping_interval.tick() => {
                if conn.push_raw(Message::Ping(Default::default())) == PushOutcome::Closed {
                    break;
                }
            }
        }
    }

    state.registry.unregister(&conn_id);
    send_task.abort();

    counter!("relay_disconnections_total").increment(1);
    gauge!("relay_active_connections").set(state.registry.connection_count() as f64);
    info!("Connection {} closed", conn_id);
}

fn apply_scope(
    registry: &ConnectionRegistry,
    conn_id: &ConnectionId,
    params: &ConnectParams,
) -> Result<()> {
    match params.call_id.as_deref().filter(|c| !c.is_empty()) {
        Some(call_id) => {
            registry.subscribe(conn_id, call_id)?;
            if params.global {
                registry.mark_global(conn_id)?;
            }
        }
        None => registry.mark_global(conn_id)?,
    }
    Ok(())
}

/// Handle a single WebSocket frame.
async fn handle_message(
    state: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let client_msg = ClientMessage::parse(text.as_str())?;
            handle_client_message(state, conn, client_msg).await
        }
        Message::Binary(data) => {
            let text = std::str::from_utf8(&data)
                .map_err(|e| common::Error::InvalidMessage(e.to_string()))?;
            let client_msg = ClientMessage::parse(text)?;
            handle_client_message(state, conn, client_msg).await
        }
        // tungstenite answers pings itself.
        Message::Ping(_) | Message::Pong(_) => {
            conn.update_ping();
            Ok(())
        }
        Message::Close(_) => Ok(()),
    }
}

/// Handle a parsed control message.
async fn handle_client_message(
    state: &Arc<AppState>,
    conn: &Arc<ConnectionState>,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::CallStart {
            call_id,
            customer_id,
        } => {
            state.processor.start_call(&call_id, &customer_id).await?;
            state.registry.subscribe(&conn.id, &call_id)?;
            state.router.publish(
                &call_id,
                &ServerMessage::CallStarted {
                    call_id: call_id.clone(),
                    customer_id: Some(customer_id),
                },
            )?;
            counter!("relay_calls_started_total").increment(1);
            Ok(())
        }
        ClientMessage::AudioChunk {
            call_id,
            audio_data,
            speaker,
        } => {
            let decoded = decode(&audio_data);
            debug!(
                "Audio chunk for {} from {:?} decoded as {:?}",
                call_id, speaker, decoded.method
            );

            let update = match state
                .processor
                .process_utterance(&call_id, &decoded.text, speaker)
                .await
            {
                Ok(update) => update,
                Err(e) => {
                    warn!("Processing failed for call {}: {:?}", call_id, e);
                    CallUpdate::failed(&call_id, e.to_string())
                }
            };
            state.updates_tx.send(update).await?;
            Ok(())
        }
        ClientMessage::SubscribeCall { call_id } => {
            state.registry.subscribe(&conn.id, &call_id)?;
            conn.send(&ServerMessage::Subscribed { call_id })?;
            counter!("relay_subscriptions_total").increment(1);
            Ok(())
        }
        ClientMessage::UnsubscribeCall { call_id } => {
            state.registry.unsubscribe(&conn.id, &call_id)?;
            conn.send(&ServerMessage::Unsubscribed { call_id })?;
            Ok(())
        }
        ClientMessage::AgentResponseSelected {
            call_id,
            response_id,
        } => {
            state
                .processor
                .record_response_selection(&call_id, &response_id)
                .await
        }
        ClientMessage::CallEnd { call_id, outcome } => {
            state.processor.end_call(&call_id, outcome.as_ref()).await?;
            state.router.publish(
                &call_id,
                &ServerMessage::CallEnded {
                    call_id: call_id.clone(),
                },
            )?;
            Ok(())
        }
        ClientMessage::Ping => {
            conn.update_ping();
            conn.send(&ServerMessage::Pong)?;
            Ok(())
        }
    }
}
