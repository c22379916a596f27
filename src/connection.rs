//! Connection engine.
//!
//! One [`Connection`] drives one byte stream. Both peers run the same state
//! machine; the only asymmetry is which side opens the channel (the role).
//! The engine owns the state word, the shutdown signal, the conversation-id
//! counter, the correlator, and the socket adapter. A single spawned engine
//! task performs every read and every state transition; `request_response`
//! and `fire_event` run on caller tasks and only touch the write mutex and
//! the correlator; inbound dispatches are handed to detached tasks so the
//! receive loop never blocks on user code.
//!
//! # Example
//!
//! ```ignore
//! let connection = ConnectionBuilder::new()
//!     .service(MethodRegistry::new().on_request("Echo", |t: String, _| async move { Ok(t) }))
//!     .client(stream);
//!
//! connection.start().await?;
//! let reply = connection
//!     .request_response("Echo", Message::payload(payload), &CancellationToken::new())
//!     .await?;
//! connection.stop().await;
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec::MsgPackCodec;
use crate::correlator::Correlator;
use crate::error::{EpoxyError, Result};
use crate::handler::{MethodRegistry, ReceiveContext, SendContext, ServiceHost};
use crate::layer::{LayerStack, Layers};
use crate::message::{
    status, EpoxyConfig, EpoxyHeaders, Error as ErrorRecord, Message, PayloadType, ProtocolError,
    ProtocolErrorCode,
};
use crate::metrics::{ConnectionMetrics, ConnectionShutdownReason, LogMetricsSink, MetricsSink};
use crate::protocol::{
    classify, encode_frame, read_frame, Disposition, Frame, Framelet, FrameletType, FramingError,
    Inbound, DEFAULT_MAX_FRAMELET_SIZE,
};
use crate::socket::{BoxedReader, Socket};

/// Which side of the connection this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// Opened the channel; allocates odd conversation ids from 1.
    Client,
    /// Accepted the channel; allocates even conversation ids from 2.
    Server,
}

/// Connection lifecycle states.
///
/// Exactly one transition per engine step; only the engine task stores the
/// state word, other tasks observe it through [`Connection::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Constructed, engine not yet driving.
    Created = 0,
    /// Client is writing its config frame.
    ClientSendConfig = 1,
    /// Client sent config, awaiting the server's.
    ClientExpectConfig = 2,
    /// Server awaiting the client's config frame.
    ServerExpectConfig = 3,
    /// Server received config, writing its own.
    ServerSendConfig = 4,
    /// Steady-state multiplexing.
    Connected = 5,
    /// Writing a best-effort protocol error before hanging up.
    SendProtocolError = 6,
    /// Tearing down socket, hooks, and pending requests.
    Disconnecting = 7,
    /// Terminal.
    Disconnected = 8,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Created,
            1 => ConnectionState::ClientSendConfig,
            2 => ConnectionState::ClientExpectConfig,
            3 => ConnectionState::ServerExpectConfig,
            4 => ConnectionState::ServerSendConfig,
            5 => ConnectionState::Connected,
            6 => ConnectionState::SendProtocolError,
            7 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Tunables for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Per-framelet body cap enforced before allocation.
    pub max_framelet_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_framelet_size: DEFAULT_MAX_FRAMELET_SIZE,
        }
    }
}

/// Arguments to [`ConnectionObserver::on_connected`].
#[derive(Debug)]
pub struct ConnectedArgs<'a> {
    /// Connection id, for log correlation.
    pub connection_id: &'a str,
    /// The peer's endpoint label.
    pub remote_endpoint: &'a str,
}

/// Arguments to [`ConnectionObserver::on_disconnected`].
#[derive(Debug)]
pub struct DisconnectedArgs<'a> {
    /// Connection id, for log correlation.
    pub connection_id: &'a str,
    /// Rejection details, when the connection was refused at the handshake.
    pub error: Option<&'a ErrorRecord>,
}

/// Server-side lifecycle hooks.
pub trait ConnectionObserver: Send + Sync + 'static {
    /// Invoked while the connection is being established. Returning an
    /// error rejects the connection: the client's `start()` fails with
    /// these details.
    fn on_connected(&self, _args: &ConnectedArgs<'_>) -> Option<ErrorRecord> {
        None
    }

    /// Invoked during teardown, with the rejection details if any.
    fn on_disconnected(&self, _args: &DisconnectedArgs<'_>) {}
}

struct Shared {
    role: ConnectionRole,
    config: ConnectionConfig,
    state: AtomicU8,
    socket: Socket,
    correlator: Correlator,
    next_conversation_id: AtomicI64,
    layers: Arc<dyn LayerStack>,
    service: Arc<dyn ServiceHost>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    metrics_sink: Arc<dyn MetricsSink>,
    metrics: StdMutex<ConnectionMetrics>,
    started_at: Instant,
    /// Stop signal; also woken by sender-side fatal errors.
    shutdown: CancellationToken,
    /// Latch cancelled when the engine reaches `Disconnected`.
    engine_done: CancellationToken,
    /// Local protocol violation to report, set before entering
    /// `SendProtocolError`.
    pending_protocol_error: StdMutex<Option<ProtocolErrorCode>>,
    /// Rejection details from the `on_connected` hook.
    error_details: StdMutex<Option<ErrorRecord>>,
    /// Peer-reported protocol error captured during the handshake.
    handshake_error: StdMutex<Option<ProtocolError>>,
    shutdown_reason: StdMutex<ConnectionShutdownReason>,
    metrics_emitted: AtomicBool,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn ensure_state(&self, required: ConnectionState) -> Result<()> {
        let actual = self.state();
        if actual == required {
            Ok(())
        } else {
            Err(EpoxyError::InvalidState { required, actual })
        }
    }

    /// Record the first terminal cause; later causes are ignored.
    fn set_reason_once(&self, reason: ConnectionShutdownReason) {
        let mut slot = self.shutdown_reason.lock().expect("reason lock poisoned");
        if *slot == ConnectionShutdownReason::Unknown {
            *slot = reason;
        }
    }

    fn graceful_reason(&self) -> ConnectionShutdownReason {
        match self.role {
            ConnectionRole::Client => ConnectionShutdownReason::ClientGraceful,
            ConnectionRole::Server => ConnectionShutdownReason::ServerGraceful,
        }
    }

    /// A clean EOF in steady state is how the peer's graceful close looks
    /// from this side.
    fn peer_graceful_reason(&self) -> ConnectionShutdownReason {
        match self.role {
            ConnectionRole::Client => ConnectionShutdownReason::ServerGraceful,
            ConnectionRole::Server => ConnectionShutdownReason::ClientGraceful,
        }
    }

    fn capture_protocol_error(&self, code: ProtocolErrorCode) {
        let mut slot = self
            .pending_protocol_error
            .lock()
            .expect("protocol error lock poisoned");
        if slot.is_none() {
            *slot = Some(code);
        }
    }

    fn pending_protocol_error(&self) -> Option<ProtocolErrorCode> {
        *self
            .pending_protocol_error
            .lock()
            .expect("protocol error lock poisoned")
    }

    fn connection_id(&self) -> String {
        self.metrics
            .lock()
            .expect("metrics lock poisoned")
            .connection_id
            .clone()
    }

    fn metrics_snapshot(&self) -> ConnectionMetrics {
        self.metrics.lock().expect("metrics lock poisoned").clone()
    }

    fn receive_context(&self, conversation_id: u64) -> ReceiveContext {
        ReceiveContext {
            conversation_id,
            metrics: self.metrics_snapshot(),
        }
    }

    fn send_context(&self, conversation_id: u64) -> SendContext {
        SendContext {
            conversation_id,
            connection_id: self.connection_id(),
        }
    }

    /// Allocate the next conversation id for this side.
    ///
    /// Ids step by 2 so client (odd, from 1) and server (even, from 2) use
    /// disjoint parity classes. Wrapping past the signed-positive range is
    /// fatal for the connection.
    fn allocate_conversation_id(&self) -> Result<u64> {
        let id = self.next_conversation_id.fetch_add(2, Ordering::Relaxed);
        if id < 0 {
            self.capture_protocol_error(ProtocolErrorCode::InternalError);
            self.shutdown.cancel();
            return Err(EpoxyError::Protocol(
                "conversation ids exhausted".to_string(),
            ));
        }
        Ok(id as u64)
    }

    fn build_message_frame(
        &self,
        headers: &EpoxyHeaders,
        layer_data: Option<Vec<u8>>,
        message: &Message,
    ) -> Result<Frame> {
        let payload = match message {
            Message::Payload(bytes) => bytes.clone(),
            Message::Error(error) => Bytes::from(MsgPackCodec::encode(error)?),
        };

        let mut frame = Frame::new();
        frame.push(Framelet::new(
            FrameletType::EpoxyHeaders,
            MsgPackCodec::encode(headers)?,
        ));
        if let Some(blob) = layer_data {
            frame.push(Framelet::new(FrameletType::LayerData, blob));
        }
        frame.push(Framelet::new(FrameletType::PayloadData, payload));
        Ok(frame)
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        self.socket.write_frame(&encode_frame(frame)).await
    }

    /// Send a response from a detached dispatch task.
    ///
    /// Layer errors replace the outgoing response so the peer's pending
    /// slot still completes; write errors are logged, the next receive-loop
    /// I/O failure tears the connection down.
    async fn send_response(&self, conversation_id: u64, mut message: Message) {
        let ctx = self.send_context(conversation_id);
        let layer_data = match self.layers.on_send(PayloadType::Response, &ctx) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(conversation_id, %error, "layer rejected response; replying with its error");
                message = Message::Error(error);
                None
            }
        };

        let headers = EpoxyHeaders::response(conversation_id, message.error_code());
        let frame = match self.build_message_frame(&headers, layer_data, &message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "failed to encode response frame");
                return;
            }
        };
        if let Err(e) = self.write_frame(&frame).await {
            tracing::debug!(conversation_id, error = %e, "response write failed");
        }
    }

    /// Finalize teardown: resolve `start()` if it is still pending, stamp
    /// and emit metrics exactly once, release `stop()` waiters.
    fn finish(&self, connected_tx: Option<oneshot::Sender<Result<()>>>) {
        self.set_state(ConnectionState::Disconnected);

        if let Some(tx) = connected_tx {
            let _ = tx.send(Err(self.start_failure()));
        }

        if !self.metrics_emitted.swap(true, Ordering::AcqRel) {
            let metrics = {
                let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
                metrics.duration_millis = self.started_at.elapsed().as_millis() as u64;
                metrics.shutdown_reason =
                    *self.shutdown_reason.lock().expect("reason lock poisoned");
                metrics.clone()
            };
            self.metrics_sink.emit(&metrics);
        }

        self.engine_done.cancel();
    }

    /// The failure `start()` resolves with when the connection never
    /// reached `Connected`.
    fn start_failure(&self) -> EpoxyError {
        if let Some(peer_error) = self
            .handshake_error
            .lock()
            .expect("handshake error lock poisoned")
            .clone()
        {
            return EpoxyError::PeerProtocolError(peer_error);
        }
        if let Some(code) = self.pending_protocol_error() {
            return EpoxyError::Protocol(format!("handshake failed: {code:?}"));
        }
        EpoxyError::ConnectionClosed
    }
}

/// Deferred engine inputs, consumed by `start()` (or an early `stop()`).
struct Starter {
    reader: BoxedReader,
}

/// A bidirectional framed RPC connection over a single byte stream.
pub struct Connection {
    shared: Arc<Shared>,
    starter: StdMutex<Option<Starter>>,
}

impl Connection {
    /// Begin configuring a connection.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Drive the handshake.
    ///
    /// Spawns the engine task and resolves once the connection reaches
    /// `Connected`, or fails with the handshake error: the peer's protocol
    /// error details when it rejected us, the locally-detected violation,
    /// or [`EpoxyError::ConnectionClosed`] for EOF/I/O mid-handshake.
    pub async fn start(&self) -> Result<()> {
        let starter = {
            let mut slot = self.starter.lock().expect("starter lock poisoned");
            slot.take()
        };
        let starter = match starter {
            Some(starter) => starter,
            None => {
                return Err(EpoxyError::InvalidState {
                    required: ConnectionState::Created,
                    actual: self.shared.state(),
                })
            }
        };

        let (connected_tx, connected_rx) = oneshot::channel();
        let shared = self.shared.clone();
        tokio::spawn(run_engine(shared, starter.reader, connected_tx));

        connected_rx
            .await
            .unwrap_or(Err(EpoxyError::ConnectionClosed))
    }

    /// Send a request and await its correlated response.
    ///
    /// Requires `Connected`. The response message may itself be an error
    /// record: user-domain errors, layer short-circuits, and transport
    /// fan-out failures all arrive as [`Message::Error`]. Cancelling
    /// `cancel` abandons the wait and burns the conversation id; a late
    /// response is dropped as unmatched.
    pub async fn request_response(
        &self,
        method_name: &str,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        if message.is_error() {
            return Err(EpoxyError::Protocol(
                "requests cannot carry error records".to_string(),
            ));
        }
        self.shared.ensure_state(ConnectionState::Connected)?;

        let shared = &self.shared;
        let conversation_id = shared.allocate_conversation_id()?;

        let ctx = shared.send_context(conversation_id);
        let layer_data = match shared.layers.on_send(PayloadType::Request, &ctx) {
            Ok(data) => data,
            // The layer error becomes the locally-completed response.
            Err(error) => return Ok(Message::Error(error)),
        };

        let receiver = match shared.correlator.add(conversation_id) {
            Ok(receiver) => receiver,
            Err(_) => return Err(EpoxyError::ConnectionClosed),
        };

        let headers = EpoxyHeaders::request(conversation_id, method_name);
        let frame = shared.build_message_frame(&headers, layer_data, &message)?;
        if let Err(e) = shared.write_frame(&frame).await {
            tracing::debug!(conversation_id, error = %e, "request write failed");
            shared.correlator.complete(
                conversation_id,
                Message::error(ErrorRecord::transport(format!("request send failed: {e}"))),
            );
        }

        tokio::select! {
            biased;

            result = receiver => match result {
                Ok(message) => Ok(message),
                Err(_) => Ok(Message::error(ErrorRecord::transport(
                    crate::correlator::CLOSED_BEFORE_RESPONSE,
                ))),
            },
            _ = cancel.cancelled() => {
                shared.correlator.cancel(conversation_id);
                Err(EpoxyError::Cancelled)
            }
        }
    }

    /// Send a fire-and-forget event.
    ///
    /// Requires `Connected`. Resolves as soon as the frame is flushed; no
    /// response is expected or correlated. A layer error abandons the send.
    pub async fn fire_event(&self, method_name: &str, message: Message) -> Result<()> {
        if message.is_error() {
            return Err(EpoxyError::Protocol(
                "events cannot carry error records".to_string(),
            ));
        }
        self.shared.ensure_state(ConnectionState::Connected)?;

        let shared = &self.shared;
        let conversation_id = shared.allocate_conversation_id()?;

        let ctx = shared.send_context(conversation_id);
        let layer_data = match shared.layers.on_send(PayloadType::Event, &ctx) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(conversation_id, method_name, %error, "layer abandoned event send");
                return Ok(());
            }
        };

        let headers = EpoxyHeaders::event(conversation_id, method_name);
        let frame = shared.build_message_frame(&headers, layer_data, &message)?;
        shared.write_frame(&frame).await
    }

    /// Tear the connection down.
    ///
    /// Valid in any state, idempotent under concurrent callers. Signals
    /// the shutdown token, half-closes the socket, and resolves once the
    /// engine reaches `Disconnected` (pending requests have been failed and
    /// metrics emitted).
    pub async fn stop(&self) {
        self.shared.set_reason_once(self.shared.graceful_reason());

        // Never started: tear down inline, the engine task does not exist.
        let starter = {
            let mut slot = self.starter.lock().expect("starter lock poisoned");
            slot.take()
        };
        if let Some(starter) = starter {
            drop(starter);
            self.shared.shutdown.cancel();
            self.shared.socket.shutdown().await;
            self.shared.correlator.shutdown();
            self.shared.finish(None);
            return;
        }

        self.shared.shutdown.cancel();
        self.shared.socket.shutdown().await;
        self.shared.engine_done.cancelled().await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// This connection's role.
    pub fn role(&self) -> ConnectionRole {
        self.shared.role
    }

    /// Connection id, for log correlation.
    pub fn connection_id(&self) -> String {
        self.shared.connection_id()
    }

    /// Snapshot of the connection metrics. The shutdown fields are only
    /// final after `stop()` resolves.
    pub fn metrics(&self) -> ConnectionMetrics {
        self.shared.metrics_snapshot()
    }
}

/// Fluent configuration for [`Connection`].
pub struct ConnectionBuilder {
    service: Arc<dyn ServiceHost>,
    layers: Arc<dyn LayerStack>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    metrics_sink: Arc<dyn MetricsSink>,
    config: ConnectionConfig,
    local_endpoint: Option<String>,
    remote_endpoint: Option<String>,
}

impl ConnectionBuilder {
    /// A builder with an empty registry, empty layer stack, and the
    /// logging metrics sink.
    pub fn new() -> Self {
        Self {
            service: Arc::new(MethodRegistry::new()),
            layers: Arc::new(Layers::new()),
            observer: None,
            metrics_sink: Arc::new(LogMetricsSink),
            config: ConnectionConfig::default(),
            local_endpoint: None,
            remote_endpoint: None,
        }
    }

    /// Service host that receives inbound requests and events.
    pub fn service(mut self, service: impl ServiceHost) -> Self {
        self.service = Arc::new(service);
        self
    }

    /// Layer stack applied on send and receive.
    pub fn layer_stack(mut self, layers: impl LayerStack) -> Self {
        self.layers = Arc::new(layers);
        self
    }

    /// Server-side lifecycle hooks.
    pub fn observer(mut self, observer: impl ConnectionObserver) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Sink receiving the metrics record at teardown.
    pub fn metrics_sink(mut self, sink: impl MetricsSink) -> Self {
        self.metrics_sink = Arc::new(sink);
        self
    }

    /// Connection tunables.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Endpoint labels for metrics and logs (the transport glue fills
    /// these from socket addresses).
    pub fn endpoints(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.local_endpoint = Some(local.into());
        self.remote_endpoint = Some(remote.into());
        self
    }

    /// Build a client-role connection over an already-connected stream.
    pub fn client<S>(self, stream: S) -> Connection
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        self.build(ConnectionRole::Client, stream)
    }

    /// Build a server-role connection over an already-accepted stream.
    pub fn server<S>(self, stream: S) -> Connection
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        self.build(ConnectionRole::Server, stream)
    }

    fn build<S>(self, role: ConnectionRole, stream: S) -> Connection
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let local = self.local_endpoint.unwrap_or_else(|| "unknown".to_string());
        let remote = self
            .remote_endpoint
            .unwrap_or_else(|| "unknown".to_string());

        let socket = Socket::new(stream, local.clone(), remote.clone());
        let reader = socket
            .take_reader()
            .expect("freshly constructed socket has a reader");

        let first_conversation_id = match role {
            ConnectionRole::Client => 1,
            ConnectionRole::Server => 2,
        };

        let shared = Arc::new(Shared {
            role,
            config: self.config,
            state: AtomicU8::new(ConnectionState::Created as u8),
            socket,
            correlator: Correlator::new(),
            next_conversation_id: AtomicI64::new(first_conversation_id),
            layers: self.layers,
            service: self.service,
            observer: self.observer,
            metrics_sink: self.metrics_sink,
            metrics: StdMutex::new(ConnectionMetrics::new(local, remote)),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            engine_done: CancellationToken::new(),
            pending_protocol_error: StdMutex::new(None),
            error_details: StdMutex::new(None),
            handshake_error: StdMutex::new(None),
            shutdown_reason: StdMutex::new(ConnectionShutdownReason::Unknown),
            metrics_emitted: AtomicBool::new(false),
        });

        Connection {
            shared,
            starter: StdMutex::new(Some(Starter { reader })),
        }
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine task: drives the state machine from `Created` to
/// `Disconnected`, performing every read and every transition.
async fn run_engine(
    shared: Arc<Shared>,
    mut reader: BoxedReader,
    connected_tx: oneshot::Sender<Result<()>>,
) {
    let mut connected_tx = Some(connected_tx);
    let mut state = ConnectionState::Created;

    loop {
        shared.set_state(state);

        if state == ConnectionState::Connected {
            // Resolve start() only after the state word is visible, so
            // request_response/fire_event callers cannot race the guard.
            if let Some(tx) = connected_tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
        if state == ConnectionState::Disconnected {
            break;
        }

        state = match state {
            ConnectionState::Created => step_created(&shared),
            ConnectionState::ClientSendConfig | ConnectionState::ServerSendConfig => {
                step_send_config(&shared, state).await
            }
            ConnectionState::ClientExpectConfig | ConnectionState::ServerExpectConfig => {
                step_expect_config(&shared, &mut reader, state).await
            }
            ConnectionState::Connected => step_connected(&shared, &mut reader).await,
            ConnectionState::SendProtocolError => step_send_protocol_error(&shared).await,
            ConnectionState::Disconnecting => step_disconnecting(&shared).await,
            ConnectionState::Disconnected => unreachable!("loop breaks before stepping"),
        };
    }

    shared.finish(connected_tx);
}

fn step_created(shared: &Arc<Shared>) -> ConnectionState {
    match shared.role {
        ConnectionRole::Client => ConnectionState::ClientSendConfig,
        ConnectionRole::Server => {
            if let Some(observer) = &shared.observer {
                let connection_id = shared.connection_id();
                let args = ConnectedArgs {
                    connection_id: &connection_id,
                    remote_endpoint: shared.socket.remote_endpoint(),
                };
                if let Some(rejection) = observer.on_connected(&args) {
                    tracing::info!(error = %rejection, "observer rejected connection");
                    *shared.error_details.lock().expect("details lock poisoned") =
                        Some(rejection);
                    shared.capture_protocol_error(ProtocolErrorCode::ConnectionRejected);
                    shared.set_reason_once(ConnectionShutdownReason::ServerGraceful);
                    return ConnectionState::SendProtocolError;
                }
            }
            ConnectionState::ServerExpectConfig
        }
    }
}

async fn step_send_config(shared: &Arc<Shared>, state: ConnectionState) -> ConnectionState {
    let body = match MsgPackCodec::encode(&EpoxyConfig {}) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode config frame");
            shared.set_reason_once(ConnectionShutdownReason::EpoxyInternalError);
            return ConnectionState::Disconnecting;
        }
    };
    let frame = Frame::single(Framelet::new(FrameletType::EpoxyConfig, body));

    match shared.write_frame(&frame).await {
        Ok(()) => match state {
            ConnectionState::ClientSendConfig => ConnectionState::ClientExpectConfig,
            _ => ConnectionState::Connected,
        },
        Err(e) => {
            tracing::debug!(error = %e, "config write failed");
            shared.set_reason_once(ConnectionShutdownReason::NetworkError);
            ConnectionState::Disconnecting
        }
    }
}

async fn step_expect_config(
    shared: &Arc<Shared>,
    reader: &mut BoxedReader,
    state: ConnectionState,
) -> ConnectionState {
    let frame = match read_frame(reader, &shared.shutdown, shared.config.max_framelet_size).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            shared.set_reason_once(ConnectionShutdownReason::NetworkError);
            return ConnectionState::Disconnecting;
        }
        Err(FramingError::Disconnecting) => {
            shared.set_reason_once(shared.graceful_reason());
            return ConnectionState::Disconnecting;
        }
        Err(FramingError::Io(e)) => {
            tracing::debug!(error = %e, "read failed during handshake");
            shared.set_reason_once(ConnectionShutdownReason::NetworkError);
            return ConnectionState::Disconnecting;
        }
        Err(FramingError::Protocol(msg)) => {
            tracing::warn!(%msg, "framing violation during handshake");
            shared.capture_protocol_error(ProtocolErrorCode::MalformedData);
            shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
            return ConnectionState::SendProtocolError;
        }
    };

    match classify(&frame) {
        Disposition::ProcessConfig => match state {
            ConnectionState::ClientExpectConfig => ConnectionState::Connected,
            _ => ConnectionState::ServerSendConfig,
        },
        Disposition::HandleProtocolError(error) => {
            // Remember the peer's verdict as the handshake failure.
            tracing::info!(?error, "peer reported protocol error during handshake");
            *shared
                .handshake_error
                .lock()
                .expect("handshake error lock poisoned") = Some(error);
            shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
            ConnectionState::Disconnecting
        }
        Disposition::HangUp => {
            shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
            ConnectionState::Disconnecting
        }
        Disposition::SendProtocolError(code) => {
            shared.capture_protocol_error(code);
            shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
            ConnectionState::SendProtocolError
        }
        other => {
            tracing::warn!(?other, "unexpected frame during handshake");
            shared.capture_protocol_error(ProtocolErrorCode::ProtocolViolated);
            shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
            ConnectionState::SendProtocolError
        }
    }
}

async fn step_connected(shared: &Arc<Shared>, reader: &mut BoxedReader) -> ConnectionState {
    loop {
        // A sender task may have marked the connection fatally (e.g.
        // conversation-id exhaustion) and woken us via the token.
        if let Some(_code) = shared.pending_protocol_error() {
            shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
            return ConnectionState::SendProtocolError;
        }

        let frame =
            match read_frame(reader, &shared.shutdown, shared.config.max_framelet_size).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!("peer hung up");
                    shared.set_reason_once(shared.peer_graceful_reason());
                    return ConnectionState::Disconnecting;
                }
                Err(FramingError::Disconnecting) => {
                    if shared.pending_protocol_error().is_some() {
                        shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
                        return ConnectionState::SendProtocolError;
                    }
                    shared.set_reason_once(shared.graceful_reason());
                    return ConnectionState::Disconnecting;
                }
                Err(FramingError::Io(e)) => {
                    tracing::debug!(error = %e, "read failed");
                    shared.set_reason_once(ConnectionShutdownReason::NetworkError);
                    return ConnectionState::Disconnecting;
                }
                Err(FramingError::Protocol(msg)) => {
                    tracing::warn!(%msg, "framing violation");
                    shared.capture_protocol_error(ProtocolErrorCode::MalformedData);
                    shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
                    return ConnectionState::SendProtocolError;
                }
            };

        match classify(&frame) {
            Disposition::DeliverRequest(inbound) => {
                if let Some(next) = deliver_request(shared, inbound) {
                    return next;
                }
            }
            Disposition::DeliverResponse(inbound) => deliver_response(shared, inbound),
            Disposition::DeliverEvent(inbound) => {
                if let Some(next) = deliver_event(shared, inbound) {
                    return next;
                }
            }
            Disposition::SendProtocolError(code) => {
                shared.capture_protocol_error(code);
                shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
                return ConnectionState::SendProtocolError;
            }
            Disposition::HandleProtocolError(error) => {
                tracing::info!(?error, "peer reported protocol error");
                shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
                return ConnectionState::Disconnecting;
            }
            Disposition::HangUp => {
                shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
                return ConnectionState::Disconnecting;
            }
            other => {
                tracing::warn!(?other, "unexpected disposition in steady state");
                shared.capture_protocol_error(ProtocolErrorCode::InternalError);
                shared.set_reason_once(ConnectionShutdownReason::EpoxyInternalError);
                return ConnectionState::SendProtocolError;
            }
        }
    }
}

/// Hand an inbound request to the service host in a detached task.
///
/// Returns the next state when the frame is a protocol violation; `None`
/// to keep receiving.
fn deliver_request(shared: &Arc<Shared>, inbound: Inbound) -> Option<ConnectionState> {
    if inbound.headers.error_code != status::OK {
        shared.capture_protocol_error(ProtocolErrorCode::ProtocolViolated);
        shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
        return Some(ConnectionState::SendProtocolError);
    }

    let conversation_id = inbound.headers.conversation_id;
    let ctx = shared.receive_context(conversation_id);

    // A layer error replaces the dispatched result: the host never sees the
    // request and the error travels back as the response.
    let layer_verdict = shared.layers.on_receive(
        PayloadType::Request,
        &ctx,
        inbound.layer_data.as_deref(),
    );

    let shared = shared.clone();
    tokio::spawn(async move {
        let response = match layer_verdict {
            Err(error) => Message::Error(error),
            Ok(()) => {
                let fut = shared.service.dispatch_request(
                    &inbound.headers.method_name,
                    ctx,
                    Message::Payload(inbound.payload),
                );
                match tokio::spawn(fut).await {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(
                            conversation_id,
                            method_name = %inbound.headers.method_name,
                            error = %e,
                            "request dispatch failed"
                        );
                        Message::error(ErrorRecord::internal_server_error(
                            "request dispatch failed",
                        ))
                    }
                }
            }
        };
        shared.send_response(conversation_id, response).await;
    });

    None
}

fn deliver_response(shared: &Arc<Shared>, inbound: Inbound) {
    let conversation_id = inbound.headers.conversation_id;
    let ctx = shared.receive_context(conversation_id);

    let mut message = if inbound.headers.error_code == status::OK {
        Message::Payload(inbound.payload)
    } else {
        // Non-OK responses carry an Error record; an undecodable one still
        // completes the conversation with a best-effort record.
        match MsgPackCodec::decode::<ErrorRecord>(&inbound.payload) {
            Ok(error) => Message::Error(error),
            Err(_) => Message::Error(ErrorRecord::new(
                inbound.headers.error_code,
                "peer sent an undecodable error payload",
            )),
        }
    };

    if let Err(error) =
        shared
            .layers
            .on_receive(PayloadType::Response, &ctx, inbound.layer_data.as_deref())
    {
        message = Message::Error(error);
    }

    if !shared.correlator.complete(conversation_id, message) {
        tracing::warn!(conversation_id, "dropping unmatched response");
    }
}

/// Hand an inbound event to the service host in a detached task.
fn deliver_event(shared: &Arc<Shared>, inbound: Inbound) -> Option<ConnectionState> {
    if inbound.headers.error_code != status::OK {
        shared.capture_protocol_error(ProtocolErrorCode::ProtocolViolated);
        shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
        return Some(ConnectionState::SendProtocolError);
    }

    let conversation_id = inbound.headers.conversation_id;
    let ctx = shared.receive_context(conversation_id);

    if let Err(error) =
        shared
            .layers
            .on_receive(PayloadType::Event, &ctx, inbound.layer_data.as_deref())
    {
        tracing::warn!(conversation_id, %error, "layer rejected event; dropping");
        return None;
    }

    let shared = shared.clone();
    tokio::spawn(async move {
        let fut = shared.service.dispatch_event(
            &inbound.headers.method_name,
            ctx,
            Message::Payload(inbound.payload),
        );
        if let Err(e) = tokio::spawn(fut).await {
            tracing::error!(
                conversation_id,
                method_name = %inbound.headers.method_name,
                error = %e,
                "event dispatch failed"
            );
        }
    });

    None
}

async fn step_send_protocol_error(shared: &Arc<Shared>) -> ConnectionState {
    let error_code = shared
        .pending_protocol_error()
        .unwrap_or(ProtocolErrorCode::InternalError);
    let details = shared
        .error_details
        .lock()
        .expect("details lock poisoned")
        .clone();

    let report = ProtocolError {
        error_code,
        details,
    };
    match MsgPackCodec::encode(&report) {
        Ok(body) => {
            let frame = Frame::single(Framelet::new(FrameletType::ProtocolError, body));
            // Best effort: the peer may already be gone.
            if let Err(e) = shared.write_frame(&frame).await {
                tracing::debug!(error = %e, "protocol error write failed");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode protocol error frame"),
    }

    shared.set_reason_once(ConnectionShutdownReason::ClientProtocolError);
    ConnectionState::Disconnecting
}

async fn step_disconnecting(shared: &Arc<Shared>) -> ConnectionState {
    shared.shutdown.cancel();
    shared.socket.shutdown().await;

    if shared.role == ConnectionRole::Server {
        if let Some(observer) = &shared.observer {
            let connection_id = shared.connection_id();
            let details = shared
                .error_details
                .lock()
                .expect("details lock poisoned")
                .clone();
            let args = DisconnectedArgs {
                connection_id: &connection_id,
                error: details.as_ref(),
            };
            observer.on_disconnected(&args);
        }
    }

    shared.correlator.shutdown();
    ConnectionState::Disconnected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_word_roundtrip() {
        for state in [
            ConnectionState::Created,
            ConnectionState::ClientSendConfig,
            ConnectionState::ClientExpectConfig,
            ConnectionState::ServerExpectConfig,
            ConnectionState::ServerSendConfig,
            ConnectionState::Connected,
            ConnectionState::SendProtocolError,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
    }

    #[tokio::test]
    async fn test_operations_require_connected() {
        let (near, _far) = tokio::io::duplex(256);
        let connection = Connection::builder().client(near);

        let err = connection
            .request_response(
                "Echo",
                Message::payload(Bytes::from_static(b"x")),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EpoxyError::InvalidState {
                required: ConnectionState::Connected,
                actual: ConnectionState::Created,
            }
        ));

        let err = connection
            .fire_event("Ping", Message::payload(Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EpoxyError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_error_record_refused_on_request_path() {
        let (near, _far) = tokio::io::duplex(256);
        let connection = Connection::builder().client(near);

        let err = connection
            .request_response(
                "Echo",
                Message::error(ErrorRecord::new(1, "nope")),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EpoxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_stop_before_start_reaches_disconnected() {
        let (near, _far) = tokio::io::duplex(256);
        let connection = Connection::builder().client(near);

        connection.stop().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // start() after stop() is refused.
        assert!(matches!(
            connection.start().await,
            Err(EpoxyError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_conversation_id_exhaustion_is_fatal() {
        let (near, _far) = tokio::io::duplex(256);
        let connection = Connection::builder().client(near);

        connection
            .shared
            .next_conversation_id
            .store(-1, Ordering::Relaxed);
        // Pretend the handshake completed so the guard passes.
        connection.shared.set_state(ConnectionState::Connected);

        let err = connection
            .request_response(
                "Echo",
                Message::payload(Bytes::new()),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EpoxyError::Protocol(_)));
        assert_eq!(
            connection.shared.pending_protocol_error(),
            Some(ProtocolErrorCode::InternalError)
        );
        assert!(connection.shared.shutdown.is_cancelled());
    }

    #[test]
    fn test_conversation_id_parity() {
        let (near, _far) = tokio::io::duplex(256);
        let client = Connection::builder().client(near);
        let ids: Vec<u64> = (0..5)
            .map(|_| client.shared.allocate_conversation_id().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 3, 5, 7, 9]);

        let (near, _far) = tokio::io::duplex(256);
        let server = Connection::builder().server(near);
        let ids: Vec<u64> = (0..5)
            .map(|_| server.shared.allocate_conversation_id().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_first_shutdown_reason_wins() {
        let (near, _far) = tokio::io::duplex(256);
        let connection = Connection::builder().client(near);

        connection
            .shared
            .set_reason_once(ConnectionShutdownReason::NetworkError);
        connection
            .shared
            .set_reason_once(ConnectionShutdownReason::ClientGraceful);
        assert_eq!(
            *connection.shared.shutdown_reason.lock().unwrap(),
            ConnectionShutdownReason::NetworkError
        );
    }
}
