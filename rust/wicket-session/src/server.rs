//! Server transport: dispatch inbound requests to registered handlers.
//!
//! Same handle/driver split as the client. Handler registries are read
//! live on every dispatch, so methods registered after the driver starts
//! are still honored. Each request runs on its own task; a failing call
//! becomes an error response, never a transport teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use wicket_wire::{
    Frame, GRPC_MESSAGE, GRPC_STATUS, Metadata, REQUEST_ID_HEADER, RequestEnvelope,
    ResponseEnvelope, Status, StatusCode, StreamMessage, header_get,
};

use crate::errors::ServerError;
use crate::transport::DataChannel;
use crate::{BoxFuture, DEFAULT_CALL_TIMEOUT};

/// Server-side knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Advisory per-call deadline handed to handlers through [`Context`].
    /// Zero disables it. The transport never aborts a running handler.
    pub call_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Per-call context handed to handlers.
#[derive(Debug, Clone)]
pub struct Context {
    path: String,
    request_id: Option<String>,
    deadline: Option<Instant>,
}

impl Context {
    /// The method path this call was dispatched to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The caller's correlation id, when the request carried one.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Advisory deadline for this call, if the server has one configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the advisory deadline has passed. Long-running handlers
    /// are expected to poll this and bail out on their own.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Raw unary handler: full envelope in, full envelope or status out.
pub type Handler = Arc<
    dyn Fn(Context, RequestEnvelope) -> BoxFuture<'static, Result<ResponseEnvelope, Status>>
        + Send
        + Sync,
>;

/// Raw streaming handler; messages go out through the sink, the return
/// value decides the stream's terminal status.
pub type StreamingHandler = Arc<
    dyn Fn(Context, RequestEnvelope, StreamSink) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

enum ServerCommand {
    Send(Vec<u8>),
    Close,
}

struct ServerShared {
    driver_tx: mpsc::UnboundedSender<ServerCommand>,
    handlers: Mutex<HashMap<String, Handler>>,
    streaming: Mutex<HashMap<String, StreamingHandler>>,
    closed: AtomicBool,
    call_timeout: Duration,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ServerShared {
    fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), ServerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ServerError::Closed);
        }
        self.driver_tx
            .send(ServerCommand::Send(bytes))
            .map_err(|_| ServerError::Closed)
    }

    fn send_envelope(&self, envelope: &ResponseEnvelope) -> Result<(), ServerError> {
        let bytes = envelope.encode().map_err(ServerError::Encode)?;
        self.send_bytes(bytes)
    }
}

/// Outbound side of a server stream, handed to streaming handlers.
///
/// Cheap to clone; every message is framed and tagged with the call's
/// request id. The transport sends the terminating END itself once the
/// handler returns.
#[derive(Clone)]
pub struct StreamSink {
    request_id: String,
    shared: Arc<ServerShared>,
}

impl StreamSink {
    /// Send one serialized message to the caller.
    pub fn send(&self, message: Vec<u8>) -> Result<(), ServerError> {
        let frame = Frame::data(message).encode();
        let bytes = StreamMessage::data(self.request_id.clone(), frame).encode();
        self.shared.send_bytes(bytes)
    }
}

/// Handle for registering methods and controlling the transport. Cloning
/// is cheap and all clones share one transport.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Create a server over `channel` with default configuration.
    pub fn new<C: DataChannel>(channel: C) -> (Self, ServerDriver<C>) {
        Self::with_config(channel, ServerConfig::default())
    }

    /// Create a server over `channel`. The returned driver owns the
    /// channel and must be spawned.
    pub fn with_config<C: DataChannel>(channel: C, config: ServerConfig) -> (Self, ServerDriver<C>) {
        let (driver_tx, commands) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared {
            driver_tx,
            handlers: Mutex::new(HashMap::new()),
            streaming: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            call_timeout: config.call_timeout,
            on_close: Mutex::new(None),
        });
        let server = Self {
            shared: shared.clone(),
        };
        let driver = ServerDriver {
            channel,
            commands,
            shared,
        };
        (server, driver)
    }

    /// Register a unary handler for `path`, replacing any previous one.
    pub fn register_handler(&self, path: impl Into<String>, handler: Handler) {
        let path = path.into();
        debug!(%path, "registering unary handler");
        lock(&self.shared.handlers).insert(path, handler);
    }

    /// Register a streaming handler for `path`, replacing any previous
    /// one. Streaming registrations shadow a unary handler at the same
    /// path.
    pub fn register_streaming_handler(&self, path: impl Into<String>, handler: StreamingHandler) {
        let path = path.into();
        debug!(%path, "registering streaming handler");
        lock(&self.shared.streaming).insert(path, handler);
    }

    /// Remove `path` from both registries.
    pub fn unregister_handler(&self, path: &str) {
        lock(&self.shared.handlers).remove(path);
        lock(&self.shared.streaming).remove(path);
    }

    /// All registered method paths, sorted and de-duplicated.
    pub fn registered_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = lock(&self.shared.handlers)
            .keys()
            .chain(lock(&self.shared.streaming).keys())
            .cloned()
            .collect();
        methods.sort();
        methods.dedup();
        methods
    }

    /// Send a response outside the dispatch flow.
    ///
    /// Fails with [`ServerError::Closed`] once the transport is closed.
    pub fn send_response(&self, envelope: &ResponseEnvelope) -> Result<(), ServerError> {
        self.shared.send_envelope(envelope)
    }

    /// Register a callback to run when [`close`](Self::close) is called.
    /// Channel-initiated closure does not run it.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        *lock(&self.shared.on_close) = Some(Box::new(callback));
    }

    /// Close the transport. Idempotent; the close callback runs first,
    /// then the driver closes the channel and exits. Handlers already
    /// dispatched keep running but their responses no longer send.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing server transport");
        if let Some(callback) = lock(&self.shared.on_close).take() {
            callback();
        }
        let _ = self.shared.driver_tx.send(ServerCommand::Close);
    }
}

/// Owns the data channel; dispatches inbound requests and writes queued
/// responses. Run it to completion on its own task.
pub struct ServerDriver<C: DataChannel> {
    channel: C,
    commands: mpsc::UnboundedReceiver<ServerCommand>,
    shared: Arc<ServerShared>,
}

impl<C: DataChannel> ServerDriver<C> {
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ServerCommand::Send(bytes)) => {
                        if let Err(e) = self.channel.send(&bytes).await {
                            warn!(error = %e, "response send failed");
                        }
                    }
                    Some(ServerCommand::Close) | None => {
                        let _ = self.channel.close().await;
                        debug!("server driver exiting");
                        return;
                    }
                },
                inbound = self.channel.recv() => match inbound {
                    Ok(Some(bytes)) => self.dispatch(bytes),
                    Ok(None) => {
                        debug!("data channel closed by peer");
                        self.shared.closed.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "data channel receive failed");
                        self.shared.closed.store(true, Ordering::SeqCst);
                        return;
                    }
                },
            }
        }
    }

    fn dispatch(&self, bytes: Vec<u8>) {
        let envelope = match RequestEnvelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                // No request id is recoverable from a malformed request,
                // so the error response goes out uncorrelated.
                warn!(error = %e, "malformed request");
                let response = ResponseEnvelope::error(
                    StatusCode::InvalidArgument,
                    &format!("malformed request: {e}"),
                );
                if let Err(e) = self.shared.send_envelope(&response) {
                    warn!(error = %e, "could not report malformed request");
                }
                return;
            }
        };

        let request_id = header_get(&envelope.headers, REQUEST_ID_HEADER).map(str::to_string);
        let context = Context {
            path: envelope.path.clone(),
            request_id: request_id.clone(),
            deadline: (self.shared.call_timeout > Duration::ZERO)
                .then(|| Instant::now() + self.shared.call_timeout),
        };
        trace!(path = %envelope.path, request_id = ?request_id, "dispatching request");

        // Streaming registrations shadow unary ones.
        if let Some(handler) = lock(&self.shared.streaming).get(&envelope.path).cloned() {
            self.spawn_streaming(handler, context, envelope, request_id);
            return;
        }
        if let Some(handler) = lock(&self.shared.handlers).get(&envelope.path).cloned() {
            self.spawn_unary(handler, context, envelope, request_id);
            return;
        }

        debug!(path = %envelope.path, "no handler registered");
        let mut response = ResponseEnvelope::error(
            StatusCode::Unimplemented,
            &format!("Method not implemented: {}", envelope.path),
        );
        if let Some(id) = request_id {
            response.headers.insert(REQUEST_ID_HEADER.to_string(), id);
        }
        if let Err(e) = self.shared.send_envelope(&response) {
            warn!(error = %e, "could not send unimplemented response");
        }
    }

    fn spawn_unary(
        &self,
        handler: Handler,
        context: Context,
        envelope: RequestEnvelope,
        request_id: Option<String>,
    ) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut response = match handler(context, envelope).await {
                Ok(response) => response,
                Err(status) => ResponseEnvelope::error(status.code, &status.message),
            };
            if let Some(id) = request_id {
                response.headers.insert(REQUEST_ID_HEADER.to_string(), id);
            }
            response
                .trailers
                .entry(GRPC_STATUS.to_string())
                .or_insert_with(|| "0".to_string());
            if let Err(e) = shared.send_envelope(&response) {
                warn!(error = %e, "could not send response");
            }
        });
    }

    fn spawn_streaming(
        &self,
        handler: StreamingHandler,
        context: Context,
        envelope: RequestEnvelope,
        request_id: Option<String>,
    ) {
        let Some(request_id) = request_id else {
            warn!(path = %envelope.path, "streaming call without x-request-id");
            let response = ResponseEnvelope::error(
                StatusCode::InvalidArgument,
                "streaming call requires x-request-id",
            );
            if let Err(e) = self.shared.send_envelope(&response) {
                warn!(error = %e, "could not send error response");
            }
            return;
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let sink = StreamSink {
                request_id: request_id.clone(),
                shared: shared.clone(),
            };
            let result = handler(context, envelope, sink).await;

            // Exactly one END per call, success or not.
            let mut trailers = Metadata::new();
            match result {
                Ok(()) => {
                    trailers.insert(GRPC_STATUS.to_string(), "0".to_string());
                }
                Err(status) => {
                    trailers.insert(GRPC_STATUS.to_string(), status.code.code().to_string());
                    trailers.insert(GRPC_MESSAGE.to_string(), status.message);
                }
            }
            let end =
                StreamMessage::end(request_id, Frame::trailer(&trailers).encode()).encode();
            if let Err(e) = shared.send_bytes(end) {
                warn!(error = %e, "could not send stream end");
            }
        });
    }
}
