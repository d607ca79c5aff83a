//! Client transport: issue unary and server-streaming calls over one
//! data channel.
//!
//! Split into a cheap-to-clone [`Client`] handle and a [`ClientDriver`]
//! that owns the channel and must be spawned. Concurrent calls are
//! correlated purely by `x-request-id`; the driver routes each inbound
//! message to the pending call that owns its id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use wicket_wire::{
    Metadata, REQUEST_ID_HEADER, RequestEnvelope, ResponseEnvelope, StreamFlag, StreamMessage,
    decode_frames, error_from_trailers, header_get, is_stream_message, parse_trailers,
};

use crate::errors::{BoxError, CallError, CloseReason};
use crate::transport::DataChannel;
use crate::DEFAULT_CALL_TIMEOUT;

/// Client-side knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout applied to calls that don't override it.
    pub default_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Extra request headers; `x-request-id` is always set by the client
    /// and overrides any caller-supplied value.
    pub headers: Metadata,
    /// Per-call timeout override.
    pub timeout: Option<Duration>,
}

enum DriverCommand {
    Send {
        /// Request id to fail if the channel send itself errors.
        correlate: Option<String>,
        bytes: Vec<u8>,
    },
    Close,
}

enum StreamEvent {
    Headers(Metadata),
    Message(Vec<u8>),
    End { trailers: Metadata },
    Failed(CallError),
}

type PendingSender = oneshot::Sender<Result<ResponseEnvelope, CallError>>;

struct ClientShared {
    driver_tx: mpsc::UnboundedSender<DriverCommand>,
    pending: Mutex<HashMap<String, PendingSender>>,
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<StreamEvent>>>,
    next_id: AtomicU64,
    // Set exactly once, by whichever side notices closure first.
    closed: OnceLock<CloseReason>,
    default_timeout: Duration,
}

// Poisoning can only come from a panic in another holder; the maps stay
// usable, so recover the guard instead of propagating the panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ClientShared {
    fn close_reason(&self) -> CloseReason {
        self.closed.get().copied().unwrap_or(CloseReason::Channel)
    }

    /// Reject every outstanding call. Runs at most once per transport;
    /// the caller owns the `closed` flag transition.
    fn fail_all(&self, reason: CloseReason) {
        let pending: Vec<PendingSender> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(CallError::Closed(reason)));
        }
        let streams: Vec<_> = lock(&self.streams).drain().map(|(_, tx)| tx).collect();
        for tx in streams {
            let _ = tx.send(StreamEvent::Failed(CallError::Closed(reason)));
        }
    }

    /// A channel send failed; deliver the error to the call that asked
    /// for the send.
    fn fail_send(&self, correlate: Option<String>, error: std::io::Error) {
        let Some(id) = correlate else {
            warn!(error = %error, "uncorrelated channel send failed");
            return;
        };
        if let Some(tx) = lock(&self.pending).remove(&id) {
            let _ = tx.send(Err(CallError::Io(error)));
        } else if let Some(tx) = lock(&self.streams).remove(&id) {
            let _ = tx.send(StreamEvent::Failed(CallError::Io(error)));
        } else {
            warn!(request_id = %id, error = %error, "send failed for unknown call");
        }
    }
}

/// Handle for issuing calls. Cloning is cheap and all clones share one
/// transport.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Create a client over `channel` with default configuration.
    pub fn new<C: DataChannel>(channel: C) -> (Self, ClientDriver<C>) {
        Self::with_config(channel, ClientConfig::default())
    }

    /// Create a client over `channel`.
    ///
    /// The returned driver owns the channel and must be spawned; nothing
    /// moves until `driver.run()` is polled.
    pub fn with_config<C: DataChannel>(channel: C, config: ClientConfig) -> (Self, ClientDriver<C>) {
        let (driver_tx, commands) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            driver_tx,
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            closed: OnceLock::new(),
            default_timeout: config.default_timeout,
        });
        let client = Self {
            shared: shared.clone(),
        };
        let driver = ClientDriver {
            channel,
            commands,
            shared,
        };
        (client, driver)
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{n}")
    }

    /// Typed unary call: serialize the request, send, await exactly one
    /// response message, deserialize it.
    pub async fn unary<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        serialize: impl Fn(&Req) -> Result<Vec<u8>, BoxError>,
        deserialize: impl Fn(&[u8]) -> Result<Resp, BoxError>,
        options: CallOptions,
    ) -> Result<Resp, CallError> {
        let message = serialize(request).map_err(CallError::Codec)?;

        let mut headers = options.headers.clone();
        headers.insert(REQUEST_ID_HEADER.to_string(), self.next_id("req"));

        let response = self
            .call(RequestEnvelope::new(path, headers, message), options)
            .await?;
        match response.messages.len() {
            1 => deserialize(&response.messages[0]).map_err(CallError::Codec),
            n => Err(CallError::MessageCount(n)),
        }
    }

    /// Raw unary call. The envelope's headers must already carry an
    /// `x-request-id`; resolves with the correlated response, a timeout,
    /// or transport closure, whichever comes first.
    ///
    /// A response whose trailers carry a non-zero `grpc-status` resolves
    /// as [`CallError::Rpc`] rather than as a value.
    pub async fn call(
        &self,
        envelope: RequestEnvelope,
        options: CallOptions,
    ) -> Result<ResponseEnvelope, CallError> {
        if let Some(reason) = self.shared.closed.get() {
            return Err(CallError::Closed(*reason));
        }
        let id = header_get(&envelope.headers, REQUEST_ID_HEADER)
            .ok_or(CallError::MissingRequestId)?
            .to_string();
        let bytes = envelope.encode().map_err(CallError::Encode)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id.clone(), tx);

        // A close between the entry check and the insert above drains
        // the map without seeing this entry; re-check now that the
        // entry is visible.
        if let Some(reason) = self.shared.closed.get() {
            lock(&self.shared.pending).remove(&id);
            return Err(CallError::Closed(*reason));
        }

        trace!(request_id = %id, path = %envelope.path, "sending unary request");
        if self
            .shared
            .driver_tx
            .send(DriverCommand::Send {
                correlate: Some(id.clone()),
                bytes,
            })
            .is_err()
        {
            lock(&self.shared.pending).remove(&id);
            return Err(CallError::Closed(self.shared.close_reason()));
        }

        let timeout = options.timeout.unwrap_or(self.shared.default_timeout);
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?,
            // Resolver dropped without an answer: the driver is gone.
            Ok(Err(_)) => return Err(CallError::Closed(self.shared.close_reason())),
            Err(_) => {
                // Late replies for this id will now be dropped by routing.
                lock(&self.shared.pending).remove(&id);
                return Err(CallError::Timeout(timeout));
            }
        };

        match response.grpc_error() {
            Some(err) => Err(CallError::Rpc(err)),
            None => Ok(response),
        }
    }

    /// Start a server-streaming call and return a pull handle over its
    /// messages.
    pub async fn server_streaming<Req, Resp>(
        &self,
        path: &str,
        request: &Req,
        serialize: impl Fn(&Req) -> Result<Vec<u8>, BoxError>,
        deserialize: impl Fn(&[u8]) -> Result<Resp, BoxError> + Send + 'static,
        options: CallOptions,
    ) -> Result<ServerStream<Resp>, CallError> {
        if let Some(reason) = self.shared.closed.get() {
            return Err(CallError::Closed(*reason));
        }
        let message = serialize(request).map_err(CallError::Codec)?;
        let id = self.next_id("stream");

        let mut headers = options.headers.clone();
        headers.insert(REQUEST_ID_HEADER.to_string(), id.clone());
        let bytes = RequestEnvelope::new(path, headers, message)
            .encode()
            .map_err(CallError::Encode)?;

        let (tx, events) = mpsc::unbounded_channel();
        lock(&self.shared.streams).insert(id.clone(), tx);

        // Same closure race as in `call`: a concurrent close may have
        // drained the streams map before this entry landed.
        if let Some(reason) = self.shared.closed.get() {
            lock(&self.shared.streams).remove(&id);
            return Err(CallError::Closed(*reason));
        }

        trace!(request_id = %id, path, "starting server stream");
        if self
            .shared
            .driver_tx
            .send(DriverCommand::Send {
                correlate: Some(id.clone()),
                bytes,
            })
            .is_err()
        {
            lock(&self.shared.streams).remove(&id);
            return Err(CallError::Closed(self.shared.close_reason()));
        }

        Ok(ServerStream {
            request_id: id,
            shared: self.shared.clone(),
            events,
            deserialize: Box::new(deserialize),
            headers: Metadata::new(),
            trailers: None,
            failure: None,
            done: false,
            timeout: options.timeout.unwrap_or(self.shared.default_timeout),
        })
    }

    /// Close the transport.
    ///
    /// Idempotent. All outstanding calls fail with "Transport closed",
    /// then the driver closes the channel and exits.
    pub fn close(&self) {
        if self.shared.closed.set(CloseReason::Local).is_err() {
            return;
        }
        debug!("closing client transport");
        self.shared.fail_all(CloseReason::Local);
        let _ = self.shared.driver_tx.send(DriverCommand::Close);
    }
}

/// Pull handle over a server stream's messages.
///
/// Forward-only: already-buffered messages are drained first, then each
/// pull waits (bounded by the call timeout) for the next one. After the
/// terminal event the buffered remainder is still delivered before the
/// stream reports `None` or its error.
pub struct ServerStream<Resp> {
    request_id: String,
    shared: Arc<ClientShared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    deserialize: Box<dyn Fn(&[u8]) -> Result<Resp, BoxError> + Send>,
    headers: Metadata,
    trailers: Option<Metadata>,
    failure: Option<CallError>,
    done: bool,
    timeout: Duration,
}

impl<Resp> ServerStream<Resp> {
    /// Response headers. The streaming sub-protocol itself has none, so
    /// this stays empty unless the peer answered with a unary-shaped
    /// response.
    pub fn headers(&self) -> &Metadata {
        &self.headers
    }

    /// The stream's trailer mapping. `None` until the END arrives.
    pub fn trailers(&self) -> Option<&Metadata> {
        self.trailers.as_ref()
    }

    /// The next message, or `None` once the stream ended cleanly.
    ///
    /// A stream that ended with a non-zero `grpc-status` yields its
    /// [`CallError::Rpc`] exactly once, after all preceding messages.
    pub async fn recv(&mut self) -> Result<Option<Resp>, CallError> {
        loop {
            if self.done {
                return match self.failure.take() {
                    Some(err) => Err(err),
                    None => Ok(None),
                };
            }
            let event = match tokio::time::timeout(self.timeout, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    // Driver vanished without a terminal event.
                    self.done = true;
                    self.failure = Some(CallError::Closed(CloseReason::Channel));
                    continue;
                }
                Err(_) => return Err(CallError::Timeout(self.timeout)),
            };
            match event {
                StreamEvent::Headers(headers) => {
                    self.headers = headers;
                }
                StreamEvent::Message(bytes) => {
                    return (self.deserialize)(&bytes)
                        .map(Some)
                        .map_err(CallError::Codec);
                }
                StreamEvent::End { trailers } => {
                    self.trailers = Some(trailers);
                    self.done = true;
                }
                StreamEvent::Failed(err) => {
                    if let CallError::Rpc(grpc) = &err {
                        self.trailers = Some(grpc.trailers.clone());
                    }
                    self.done = true;
                    self.failure = Some(err);
                }
            }
        }
    }
}

impl<Resp> Drop for ServerStream<Resp> {
    fn drop(&mut self) {
        lock(&self.shared.streams).remove(&self.request_id);
    }
}

/// Owns the data channel; routes commands out and inbound bytes to their
/// calls. Run it to completion on its own task.
pub struct ClientDriver<C: DataChannel> {
    channel: C,
    commands: mpsc::UnboundedReceiver<DriverCommand>,
    shared: Arc<ClientShared>,
}

impl<C: DataChannel> ClientDriver<C> {
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(DriverCommand::Send { correlate, bytes }) => {
                        if let Err(e) = self.channel.send(&bytes).await {
                            self.shared.fail_send(correlate, e);
                        }
                    }
                    Some(DriverCommand::Close) | None => {
                        let _ = self.channel.close().await;
                        debug!("client driver exiting");
                        return;
                    }
                },
                inbound = self.channel.recv() => match inbound {
                    Ok(Some(bytes)) => self.route(bytes),
                    Ok(None) => {
                        debug!("data channel closed by peer");
                        self.channel_closed();
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "data channel receive failed");
                        self.channel_closed();
                        return;
                    }
                },
            }
        }
    }

    /// The channel closed underneath us. Fail everything once; do not
    /// close the channel again.
    fn channel_closed(&self) {
        if self.shared.closed.set(CloseReason::Channel).is_ok() {
            self.shared.fail_all(CloseReason::Channel);
        }
    }

    fn route(&self, bytes: Vec<u8>) {
        // The stream classifier is a heuristic: a unary response with
        // short headers also matches it. Only take the stream path when
        // the decoded id belongs to a live streaming call.
        if is_stream_message(&bytes)
            && let Ok(msg) = StreamMessage::decode(&bytes)
            && lock(&self.shared.streams).contains_key(&msg.request_id)
        {
            self.route_stream(msg);
            return;
        }

        let envelope = match ResponseEnvelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable inbound message");
                return;
            }
        };
        let Some(id) = header_get(&envelope.headers, REQUEST_ID_HEADER).map(str::to_string) else {
            warn!("dropping response without x-request-id");
            return;
        };

        if let Some(tx) = lock(&self.shared.pending).remove(&id) {
            trace!(request_id = %id, "resolving unary call");
            let _ = tx.send(Ok(envelope));
        } else if let Some(tx) = lock(&self.shared.streams).remove(&id) {
            // A unary-shaped answer to a streaming call: deliver its
            // messages, then complete with its trailers.
            trace!(request_id = %id, "completing stream from unary response");
            let _ = tx.send(StreamEvent::Headers(envelope.headers));
            for message in envelope.messages {
                let _ = tx.send(StreamEvent::Message(message));
            }
            let event = match error_from_trailers(&envelope.trailers) {
                Some(err) => StreamEvent::Failed(CallError::Rpc(err)),
                None => StreamEvent::End {
                    trailers: envelope.trailers,
                },
            };
            let _ = tx.send(event);
        } else {
            warn!(request_id = %id, "dropping response for unknown call");
        }
    }

    fn route_stream(&self, msg: StreamMessage) {
        match msg.flag {
            StreamFlag::Data => {
                let streams = lock(&self.shared.streams);
                let Some(tx) = streams.get(&msg.request_id) else {
                    return;
                };
                let (frames, remaining) = decode_frames(&msg.data);
                if !remaining.is_empty() {
                    warn!(request_id = %msg.request_id, "stream payload ends mid-frame");
                }
                for frame in frames {
                    if frame.is_data() {
                        let _ = tx.send(StreamEvent::Message(frame.data));
                    } else {
                        warn!(request_id = %msg.request_id, flag = frame.flag,
                              "ignoring non-data frame in stream payload");
                    }
                }
            }
            StreamFlag::End => {
                let Some(tx) = lock(&self.shared.streams).remove(&msg.request_id) else {
                    return;
                };
                let (frames, _) = decode_frames(&msg.data);
                let trailers = frames
                    .iter()
                    .find(|f| f.is_trailer())
                    .map(|f| parse_trailers(&f.data))
                    .unwrap_or_default();
                trace!(request_id = %msg.request_id, "stream ended");
                let event = match error_from_trailers(&trailers) {
                    Some(err) => StreamEvent::Failed(CallError::Rpc(err)),
                    None => StreamEvent::End { trailers },
                };
                let _ = tx.send(event);
            }
        }
    }
}
