//! Typed adapters bridging business functions into the raw handler shape.
//!
//! Callers pick the payload serialization; the adapters only shuttle
//! bytes through the supplied codec closures and map errors onto status
//! codes. A `Status` buried in a boxed business error passes through
//! verbatim; anything else reports as INTERNAL.

use std::sync::Arc;

use wicket_wire::{RequestEnvelope, ResponseEnvelope, Status, StatusCode};

use crate::errors::BoxError;
use crate::server::{Context, Handler, StreamSink, StreamingHandler};

fn into_status(error: BoxError) -> Status {
    match error.downcast::<Status>() {
        Ok(status) => *status,
        Err(other) => Status::new(StatusCode::Internal, other.to_string()),
    }
}

/// Wrap a typed unary function into a [`Handler`].
///
/// Deserializer failures answer INVALID_ARGUMENT, serializer failures
/// INTERNAL.
pub fn make_handler<Req, Resp, F, Fut>(
    deserialize: impl Fn(&[u8]) -> Result<Req, BoxError> + Send + Sync + 'static,
    serialize: impl Fn(&Resp) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    f: F,
) -> Handler
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, BoxError>> + Send + 'static,
{
    let deserialize = Arc::new(deserialize);
    let serialize = Arc::new(serialize);
    let f = Arc::new(f);
    Arc::new(move |context: Context, envelope: RequestEnvelope| {
        let deserialize = deserialize.clone();
        let serialize = serialize.clone();
        let f = f.clone();
        Box::pin(async move {
            let request = deserialize(&envelope.message)
                .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string()))?;
            let response = f(context, request).await.map_err(into_status)?;
            let bytes = serialize(&response)
                .map_err(|e| Status::new(StatusCode::Internal, e.to_string()))?;
            Ok(ResponseEnvelope::ok(bytes))
        })
    })
}

/// Typed view over a [`StreamSink`]: serializes each item before it goes
/// out.
pub struct TypedSink<Resp> {
    sink: StreamSink,
    serialize: Arc<dyn Fn(&Resp) -> Result<Vec<u8>, BoxError> + Send + Sync>,
}

impl<Resp> Clone for TypedSink<Resp> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            serialize: self.serialize.clone(),
        }
    }
}

impl<Resp> TypedSink<Resp> {
    /// Serialize and send one stream message.
    pub fn send(&self, item: &Resp) -> Result<(), BoxError> {
        let bytes = (self.serialize)(item)?;
        self.sink.send(bytes)?;
        Ok(())
    }
}

/// Wrap a typed streaming function into a [`StreamingHandler`].
///
/// The function pushes messages through its [`TypedSink`]; its return
/// value decides the `grpc-status` on the END the transport sends.
pub fn make_streaming_handler<Req, Resp, F, Fut>(
    deserialize: impl Fn(&[u8]) -> Result<Req, BoxError> + Send + Sync + 'static,
    serialize: impl Fn(&Resp) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    f: F,
) -> StreamingHandler
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Context, Req, TypedSink<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    let deserialize = Arc::new(deserialize);
    let serialize: Arc<dyn Fn(&Resp) -> Result<Vec<u8>, BoxError> + Send + Sync> =
        Arc::new(serialize);
    let f = Arc::new(f);
    Arc::new(
        move |context: Context, envelope: RequestEnvelope, sink: StreamSink| {
            let deserialize = deserialize.clone();
            let serialize = serialize.clone();
            let f = f.clone();
            Box::pin(async move {
                let request = deserialize(&envelope.message)
                    .map_err(|e| Status::new(StatusCode::InvalidArgument, e.to_string()))?;
                let sink = TypedSink { sink, serialize };
                f(context, request, sink).await.map_err(into_status)
            })
        },
    )
}
