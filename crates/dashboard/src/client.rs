//! Reconnecting dashboard client.
//!
//! Owns the WebSocket and a [`ReconnectSupervisor`]. Inbound frames, control
//! commands, the in-flight handshake and the retry timer are handled on one
//! `select!` loop, so the supervisor and the [`CallBoard`] never need locking. Board snapshots and
//! connection state are published on `watch` channels.

use crate::error::{DashboardError, Result};
use crate::messages::ControlCommand;
use crate::reconciler::{CallBoard, Reconciler, DEFAULT_LATENCY_WEIGHT};
use crate::supervisor::{
    ConnectionState, ReconnectSupervisor, SupervisorAction, DEFAULT_RETRY_DELAY,
};
use common::{ClientMessage, ServerMessage};
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use metrics::counter;
use std::collections::BTreeSet;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Sleep};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handshake = BoxFuture<'static, Result<WsStream>>;

/// Configuration for the dashboard client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway WebSocket URL (`ws://host:port/ws?...`).
    pub url: String,
    /// Delay before each reconnect attempt.
    pub retry_delay: Duration,
    /// Handshake timeout.
    pub connect_timeout: Duration,
    /// EMA weight for latency samples.
    pub latency_weight: f64,
    /// Calls to subscribe to on every (re)connect.
    pub calls: Vec<String>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: Duration::from_secs(10),
            latency_weight: DEFAULT_LATENCY_WEIGHT,
            calls: Vec::new(),
        }
    }

    fn validate(&self) -> Result<Reconciler> {
        let url = Url::parse(&self.url)?;
        if url.scheme() != "ws" {
            return Err(DashboardError::UnsupportedScheme(url.scheme().to_string()));
        }
        Reconciler::new(self.latency_weight)
    }
}

/// Handle for controlling a running [`DashboardClient`].
#[derive(Debug, Clone)]
pub struct DashboardHandle {
    commands: mpsc::Sender<ControlCommand>,
    board: watch::Receiver<CallBoard>,
    state: watch::Receiver<ConnectionState>,
}

impl DashboardHandle {
    /// Follow a call. Kept across reconnects.
    pub async fn subscribe(&self, call_id: impl Into<String>) -> Result<()> {
        self.send(ControlCommand::Subscribe(call_id.into())).await
    }

    pub async fn unsubscribe(&self, call_id: impl Into<String>) -> Result<()> {
        self.send(ControlCommand::Unsubscribe(call_id.into())).await
    }

    /// Close the connection and stop reconnecting.
    pub async fn teardown(&self) -> Result<()> {
        self.send(ControlCommand::Teardown).await
    }

    /// Folded board, updated after every frame that changes it.
    pub fn board(&self) -> watch::Receiver<CallBoard> {
        self.board.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn send(&self, cmd: ControlCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| DashboardError::ClientClosed)
    }
}

/// WebSocket client that keeps a [`CallBoard`] in sync with the gateway.
pub struct DashboardClient {
    config: ClientConfig,
    supervisor: ReconnectSupervisor,
    board: CallBoard,
    subscriptions: BTreeSet<String>,
    socket: Option<WsStream>,
    /// Connection attempt in progress. Dropping it abandons the attempt.
    handshake: Option<Handshake>,
    /// The single retry timer. Armed only while a retry is pending.
    retry: Option<Pin<Box<Sleep>>>,
    command_rx: mpsc::Receiver<ControlCommand>,
    board_tx: watch::Sender<CallBoard>,
    state_tx: watch::Sender<ConnectionState>,
}

impl DashboardClient {
    /// Create a client and its control handle. Nothing connects until [`run`](Self::run).
    pub fn new(config: ClientConfig) -> Result<(Self, DashboardHandle)> {
        let reconciler = config.validate()?;
        let board = CallBoard::new(reconciler);

        let (command_tx, command_rx) = mpsc::channel(64);
        let (board_tx, board_rx) = watch::channel(board.clone());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let subscriptions = config
            .calls
            .iter()
            .filter(|c| !c.is_empty())
            .cloned()
            .collect();

        let client = Self {
            supervisor: ReconnectSupervisor::new(config.retry_delay),
            config,
            board,
            subscriptions,
            socket: None,
            handshake: None,
            retry: None,
            command_rx,
            board_tx,
            state_tx,
        };
        let handle = DashboardHandle {
            commands: command_tx,
            board: board_rx,
            state: state_rx,
        };
        Ok((client, handle))
    }

    /// Run until teardown or a normal close from the gateway.
    pub async fn run(mut self) -> Result<()> {
        info!("Dashboard client starting for {}", self.config.url);
        self.connect();

        while !self.supervisor.is_closed() {
            tokio::select! {
                frame = next_frame(&mut self.socket) => {
                    self.handle_frame(frame).await;
                }

                cmd = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                }

                result = handshake_done(&mut self.handshake) => {
                    self.handshake = None;
                    self.on_handshake(result).await;
                }

                _ = retry_elapsed(&mut self.retry) => {
                    self.retry = None;
                    let action = self.supervisor.on_retry_elapsed();
                    if self.apply(action) {
                        counter!("dashboard_reconnects_total").increment(1);
                        self.connect();
                    }
                }
            }
        }

        self.handshake = None;
        self.socket = None;
        self.publish_state();
        info!("Dashboard client stopped");
        Ok(())
    }

    /// Carry out a supervisor action. Returns true when a connect is requested.
    fn apply(&mut self, action: SupervisorAction) -> bool {
        let connect = match action {
            SupervisorAction::None => false,
            SupervisorAction::ScheduleRetry(delay) => {
                info!("Retrying in {:?}", delay);
                self.retry = Some(Box::pin(sleep(delay)));
                false
            }
            SupervisorAction::CancelRetry => {
                self.retry = None;
                false
            }
            SupervisorAction::Connect => true,
        };
        self.publish_state();
        connect
    }

    /// Start a connection attempt. It completes on the run loop.
    fn connect(&mut self) {
        self.publish_state();
        debug!("Connecting to {}", self.config.url);

        let url = self.config.url.clone();
        let limit = self.config.connect_timeout;
        self.handshake = Some(
            async move {
                match timeout(limit, connect_async(url)).await {
                    Ok(Ok((ws, response))) => {
                        debug!("Handshake complete, status: {:?}", response.status());
                        Ok(ws)
                    }
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(DashboardError::ConnectTimeout),
                }
            }
            .boxed(),
        );
    }

    async fn on_handshake(&mut self, result: Result<WsStream>) {
        match result {
            Ok(ws) => {
                self.socket = Some(ws);
                let action = self.supervisor.on_open();
                self.apply(action);
                counter!("dashboard_connections_total").increment(1);
                self.replay_subscriptions().await;
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", self.config.url, e);
                self.fail();
            }
        }
    }

    async fn replay_subscriptions(&mut self) {
        let calls: Vec<String> = self.subscriptions.iter().cloned().collect();
        for call_id in calls {
            debug!("Subscribing to {}", call_id);
            if !self.send(&ClientMessage::SubscribeCall { call_id }).await {
                return;
            }
        }
    }

    /// Transport failure: drop the socket and let the supervisor decide.
    fn fail(&mut self) {
        self.socket = None;
        let action = self.supervisor.on_error();
        self.apply(action);
    }

    /// Send a control message if connected. Returns false if the socket failed.
    async fn send(&mut self, msg: &ClientMessage) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return true;
        };
        let result = match serde_json::to_string(msg) {
            Ok(json) => socket
                .send(Message::Text(json.into()))
                .await
                .map_err(DashboardError::from),
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {:?}: {}", msg, e);
                self.fail();
                false
            }
        }
    }

    async fn handle_frame(&mut self, frame: Option<std::result::Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => self.handle_text(text),
                Err(e) => warn!("Dropping non-UTF-8 binary frame: {}", e),
            },
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Some(socket) = self.socket.as_mut() {
                    if let Err(e) = socket.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                        self.fail();
                    }
                }
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                info!("Received close frame: {:?}", frame);
                self.socket = None;
                let action = self.supervisor.on_close(frame.map(|f| u16::from(f.code)));
                self.apply(action);
            }
            Some(Err(e)) => {
                warn!("WebSocket error: {}", e);
                self.fail();
            }
            None => {
                info!("WebSocket stream ended");
                self.fail();
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        if self.supervisor.is_closed() {
            debug!("Discarding frame received after teardown");
            return;
        }
        counter!("dashboard_frames_received_total").increment(1);

        match serde_json::from_str::<ServerMessage>(text) {
            Ok(ServerMessage::Error { message, code }) => {
                warn!("Gateway rejected a message ({}): {}", code, message);
            }
            Ok(frame) => {
                if self.board.apply_frame(&frame) {
                    self.board_tx.send_replace(self.board.clone());
                }
            }
            Err(e) => {
                warn!("Malformed frame from gateway: {}", e);
                counter!("dashboard_malformed_frames_total").increment(1);
            }
        }
    }

    async fn handle_command(&mut self, cmd: Option<ControlCommand>) {
        match cmd {
            Some(ControlCommand::Subscribe(call_id)) => {
                if call_id.is_empty() {
                    warn!("Ignoring subscribe with empty call id");
                    return;
                }
                self.subscriptions.insert(call_id.clone());
                self.send(&ClientMessage::SubscribeCall { call_id }).await;
            }
            Some(ControlCommand::Unsubscribe(call_id)) => {
                self.subscriptions.remove(&call_id);
                self.send(&ClientMessage::UnsubscribeCall { call_id }).await;
            }
            Some(ControlCommand::Teardown) => self.teardown().await,
            None => {
                info!("All handles dropped");
                self.teardown().await;
            }
        }
    }

    async fn teardown(&mut self) {
        info!("Tearing down dashboard client");
        let action = self.supervisor.teardown();
        self.apply(action);
        if self.handshake.take().is_some() {
            debug!("Abandoning connection attempt");
        }

        if let Some(mut socket) = self.socket.take() {
            let close_frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "Teardown".into(),
            };
            let _ = socket.send(Message::Close(Some(close_frame))).await;
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.supervisor.state());
    }
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<std::result::Result<Message, WsError>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

async fn handshake_done(handshake: &mut Option<Handshake>) -> Result<WsStream> {
    match handshake {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn retry_elapsed(retry: &mut Option<Pin<Box<Sleep>>>) {
    match retry {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CallStatus, CallUpdate};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::accept_async;

    type ServerStream = WebSocketStream<TcpStream>;

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> ServerStream {
        let (stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_client_message(ws: &mut ServerStream) -> ClientMessage {
        loop {
            let frame = timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = frame {
                return ClientMessage::parse(text.as_str()).unwrap();
            }
        }
    }

    fn start(config: ClientConfig) -> (DashboardHandle, JoinHandle<Result<()>>) {
        let (client, handle) = DashboardClient::new(config).unwrap();
        (handle, tokio::spawn(client.run()))
    }

    fn fast(url: &str) -> ClientConfig {
        ClientConfig {
            retry_delay: Duration::from_millis(50),
            ..ClientConfig::new(url)
        }
    }

    async fn wait_state(handle: &DashboardHandle, want: ConnectionState) {
        let mut state = handle.state();
        timeout(Duration::from_secs(2), state.wait_for(|s| *s == want))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(
            DashboardClient::new(ClientConfig::new("http://localhost/ws")),
            Err(DashboardError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            DashboardClient::new(ClientConfig::new("wss://localhost/ws")),
            Err(DashboardError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            DashboardClient::new(ClientConfig::new("not a url")),
            Err(DashboardError::InvalidUrl(_))
        ));
        let config = ClientConfig {
            latency_weight: 2.0,
            ..ClientConfig::new("ws://localhost/ws")
        };
        assert!(matches!(
            DashboardClient::new(config),
            Err(DashboardError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_folds_updates_into_board() {
        let (listener, url) = bind().await;
        let (handle, run) = start(fast(&url));

        let mut server = accept(&listener).await;
        let mut update = CallUpdate::new("c1", CallStatus::Complete);
        update.transcript = Some("my bill is wrong".to_string());
        let json = serde_json::to_string(&ServerMessage::CallUpdate(update)).unwrap();
        server.send(Message::Text(json.into())).await.unwrap();

        let mut board = handle.board();
        {
            let board = timeout(
                Duration::from_secs(2),
                board.wait_for(|b| b.get("c1").is_some()),
            )
            .await
            .unwrap()
            .unwrap();
            let aggregate = board.get("c1").unwrap();
            assert_eq!(aggregate.transcript.len(), 1);
            assert_eq!(aggregate.transcript[0].text, "my bill is wrong");
        }

        handle.teardown().await.unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(*handle.state().borrow(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_resubscribes_after_abnormal_close() {
        let (listener, url) = bind().await;
        let config = ClientConfig {
            calls: vec!["c1".to_string()],
            ..fast(&url)
        };
        let (handle, run) = start(config);

        let mut first = accept(&listener).await;
        assert_eq!(
            next_client_message(&mut first).await,
            ClientMessage::SubscribeCall {
                call_id: "c1".to_string()
            }
        );
        handle.subscribe("c2").await.unwrap();
        assert_eq!(
            next_client_message(&mut first).await,
            ClientMessage::SubscribeCall {
                call_id: "c2".to_string()
            }
        );

        // Drop without a close handshake.
        drop(first);

        let mut second = accept(&listener).await;
        let mut replayed = vec![
            next_client_message(&mut second).await,
            next_client_message(&mut second).await,
        ];
        replayed.sort_by_key(|m| m.call_id().map(str::to_string));
        assert_eq!(
            replayed,
            vec![
                ClientMessage::SubscribeCall {
                    call_id: "c1".to_string()
                },
                ClientMessage::SubscribeCall {
                    call_id: "c2".to_string()
                },
            ]
        );
        wait_state(&handle, ConnectionState::Open).await;

        handle.teardown().await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_normal_close_stops_client() {
        let (listener, url) = bind().await;
        let (handle, run) = start(fast(&url));

        let mut server = accept(&listener).await;
        server
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            })))
            .await
            .unwrap();

        timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(*handle.state().borrow(), ConnectionState::Closed);
        assert!(timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_retries_until_gateway_is_up() {
        let (listener, url) = bind().await;
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (handle, run) = start(fast(&url));
        wait_state(&handle, ConnectionState::Reconnecting).await;

        let listener = TcpListener::bind(addr).await.unwrap();
        let _server = accept(&listener).await;
        wait_state(&handle, ConnectionState::Open).await;

        handle.teardown().await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_is_forwarded() {
        let (listener, url) = bind().await;
        let (handle, run) = start(fast(&url));
        let mut server = accept(&listener).await;

        handle.subscribe("c7").await.unwrap();
        handle.unsubscribe("c7").await.unwrap();
        assert_eq!(
            next_client_message(&mut server).await,
            ClientMessage::SubscribeCall {
                call_id: "c7".to_string()
            }
        );
        assert_eq!(
            next_client_message(&mut server).await,
            ClientMessage::UnsubscribeCall {
                call_id: "c7".to_string()
            }
        );

        handle.teardown().await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_teardown_abandons_stalled_handshake() {
        let (listener, url) = bind().await;
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(5),
            calls: vec!["c1".to_string()],
            ..fast(&url)
        };
        let (handle, run) = start(config);

        // Accept TCP but never answer the upgrade request.
        let (_stalled, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*handle.state().borrow(), ConnectionState::Connecting);

        handle.teardown().await.unwrap();
        timeout(Duration::from_secs(1), run)
            .await
            .expect("teardown must not wait for the handshake")
            .unwrap()
            .unwrap();
        assert_eq!(*handle.state().borrow(), ConnectionState::Closed);
    }
}
