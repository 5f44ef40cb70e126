//! Pipeline assembly and dispatch.
//!
//! [`build_pipeline`] composes the fixed interceptor order. [`Pipeline`]
//! adapts a typed tonic handler to the erased chain: it admits the call
//! against the shutdown controller, records [`CallInfo`], boxes the message,
//! runs the chain once and unboxes the result.

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use reqlog_core::{level_for, BoxMessage, CallInfo, CallKind, CodeToLevel, RpcMessage};
use tonic::Status;
use tower::util::BoxCloneService;
use tower::{service_fn, ServiceExt};

use super::auth::{AllowAll, AuthLayer, Authenticator};
use super::chain::{StreamChain, UnaryChain};
use super::logging::AccessLogLayer;
use super::payload::PayloadLoggingLayer;
use super::tags::TagsLayer;
use super::{
    BoxFuture, Interceptor, MessageStream, StreamHandler, StreamRequest, StreamResponse, TypedStream,
    UnaryHandler, UnaryRequest, UnaryResponse,
};
use crate::network::shutdown::{InFlightGuard, ShutdownController};

/// Which interceptors run, and how.
#[derive(Clone)]
pub struct InterceptorConfig {
    /// Promote request fields to `grpc.request.<field>` tags.
    pub extract_fields: bool,
    /// `None` disables authentication.
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Access log and payload logging.
    pub log_enabled: bool,
    /// Request payload content in "Request received"/"Message received" lines.
    pub log_payload: bool,
    pub code_to_level: CodeToLevel,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            extract_fields: true,
            authenticator: Some(Arc::new(AllowAll)),
            log_enabled: true,
            log_payload: true,
            code_to_level: level_for,
        }
    }
}

impl fmt::Debug for InterceptorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorConfig")
            .field("extract_fields", &self.extract_fields)
            .field("auth_enabled", &self.authenticator.is_some())
            .field("log_enabled", &self.log_enabled)
            .field("log_payload", &self.log_payload)
            .finish_non_exhaustive()
    }
}

/// Build both chains from `config`.
///
/// Order (outermost to innermost):
/// 1. `tags` -- creates the call's tag store, so it must come first
/// 2. `auth` -- rejects unauthenticated callers before anything is logged
/// 3. `access_log` -- one terminal line per call
/// 4. `payload` -- inbound request payloads, closest to the handler
#[must_use]
pub fn build_pipeline(config: &InterceptorConfig, shutdown: Arc<ShutdownController>) -> Pipeline {
    let mut unary = UnaryChain::new();
    let mut stream = StreamChain::new();

    let tags = TagsLayer::new(config.extract_fields);
    unary.push(Interceptor::from_layer("tags", tags));
    stream.push(Interceptor::from_layer("tags", tags));

    if let Some(authenticator) = &config.authenticator {
        let auth = AuthLayer::from_arc(Arc::clone(authenticator));
        unary.push(Interceptor::from_layer("auth", auth.clone()));
        stream.push(Interceptor::from_layer("auth", auth));
    }

    if config.log_enabled {
        let access = AccessLogLayer::with_classifier(config.code_to_level);
        unary.push(Interceptor::from_layer("access_log", access));
        stream.push(Interceptor::from_layer("access_log", access));

        let payload = PayloadLoggingLayer::new(config.log_payload);
        unary.push(Interceptor::from_layer("payload", payload));
        stream.push(Interceptor::from_layer("payload", payload));
    }

    Pipeline::new(unary, stream, shutdown)
}

/// Dispatches typed calls through the interceptor chains.
#[derive(Clone)]
pub struct Pipeline {
    unary: Arc<UnaryChain>,
    stream: Arc<StreamChain>,
    shutdown: Arc<ShutdownController>,
    next_call_id: Arc<AtomicU64>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("unary", &self.unary.names())
            .field("stream", &self.stream.names())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(unary: UnaryChain, stream: StreamChain, shutdown: Arc<ShutdownController>) -> Self {
        Self {
            unary: Arc::new(unary),
            stream: Arc::new(stream),
            shutdown,
            next_call_id: Arc::new(AtomicU64::new(1)),
        }
    }

    #[must_use]
    pub fn unary_chain(&self) -> &UnaryChain {
        &self.unary
    }

    #[must_use]
    pub fn stream_chain(&self) -> &StreamChain {
        &self.stream
    }

    /// Runs a unary call through the unary chain.
    ///
    /// `handler` runs at most once, innermost, with the request's metadata
    /// and extensions (including the call's tag store) intact.
    ///
    /// # Errors
    ///
    /// - `Unavailable` while the server is draining
    /// - whatever an interceptor or the handler returns, unchanged
    /// - `Internal` if an interceptor swapped the message for another type
    pub async fn unary<Req, Resp, F, Fut>(
        &self,
        full_method: &'static str,
        request: tonic::Request<Req>,
        handler: F,
    ) -> Result<tonic::Response<Resp>, Status>
    where
        Req: RpcMessage,
        Resp: RpcMessage,
        F: FnOnce(tonic::Request<Req>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<tonic::Response<Resp>, Status>> + Send + 'static,
    {
        let _guard = self.admit()?;

        let mut request = request.map(|message| Box::new(message) as BoxMessage);
        request
            .extensions_mut()
            .insert(self.call_info(full_method, CallKind::Unary));

        let dispatch: BoxFuture<UnaryResponse> =
            Box::pin(self.unary.wrap(innermost_unary(handler)).oneshot(request));
        let response = dispatch.await?;

        let (metadata, message, extensions) = response.into_parts();
        let message = unbox::<Resp>(message)?;
        Ok(tonic::Response::from_parts(metadata, message, extensions))
    }

    /// Runs a streaming call through the stream chain.
    ///
    /// The call counts as in flight until the returned outbound stream is
    /// finished or dropped.
    ///
    /// # Errors
    ///
    /// Same as [`unary`](Self::unary). Type mismatches inside the streams
    /// surface as `Internal` items.
    pub async fn streaming<In, Out, S, F, Fut>(
        &self,
        full_method: &'static str,
        kind: CallKind,
        request: tonic::Request<S>,
        handler: F,
    ) -> Result<tonic::Response<TypedStream<Out>>, Status>
    where
        In: RpcMessage,
        Out: RpcMessage,
        S: Stream<Item = Result<In, Status>> + Send + 'static,
        F: FnOnce(tonic::Request<TypedStream<In>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<tonic::Response<TypedStream<Out>>, Status>> + Send + 'static,
    {
        let guard = self.admit()?;

        let mut request = request.map(erase::<In, S>);
        request
            .extensions_mut()
            .insert(self.call_info(full_method, kind));

        let dispatch: BoxFuture<StreamResponse> =
            Box::pin(self.stream.wrap(innermost_stream(handler)).oneshot(request));
        let response = dispatch.await?;

        Ok(response.map(|outbound| -> TypedStream<Out> {
            Box::pin(Guarded {
                inner: restore::<Out>(outbound),
                _guard: guard,
            })
        }))
    }

    fn admit(&self) -> Result<InFlightGuard, Status> {
        self.shutdown
            .try_admit()
            .ok_or_else(|| Status::unavailable("server is shutting down"))
    }

    fn call_info(&self, full_method: &'static str, kind: CallKind) -> CallInfo {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        CallInfo::new(call_id, full_method, kind)
    }
}

fn mismatch<T>() -> Status {
    Status::internal(format!("unexpected message type, wanted {}", type_name::<T>()))
}

fn unbox<T: RpcMessage>(message: BoxMessage) -> Result<T, Status> {
    message.downcast::<T>().map(|boxed| *boxed).map_err(|_| mismatch::<T>())
}

fn erase<T: RpcMessage, S>(typed: S) -> MessageStream
where
    S: Stream<Item = Result<T, Status>> + Send + 'static,
{
    Box::pin(typed.map(|item| item.map(|message| Box::new(message) as BoxMessage)))
}

fn restore<T: RpcMessage>(erased: MessageStream) -> TypedStream<T> {
    Box::pin(erased.map(|item| item.and_then(unbox::<T>)))
}

/// Innermost link for unary calls. A second invocation is refused.
fn innermost_unary<Req, Resp, F, Fut>(handler: F) -> UnaryHandler
where
    Req: RpcMessage,
    Resp: RpcMessage,
    F: FnOnce(tonic::Request<Req>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<tonic::Response<Resp>, Status>> + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(handler)));
    BoxCloneService::new(service_fn(move |req: UnaryRequest| {
        let handler = slot.lock().take();
        async move {
            let handler = handler.ok_or_else(|| Status::internal("handler already invoked"))?;
            let (metadata, extensions, message) = req.into_parts();
            let message = unbox::<Req>(message)?;
            let response = handler(tonic::Request::from_parts(metadata, extensions, message)).await?;
            Ok::<_, Status>(response.map(|message| Box::new(message) as BoxMessage))
        }
    }))
}

/// Innermost link for streaming calls. A second invocation is refused.
fn innermost_stream<In, Out, F, Fut>(handler: F) -> StreamHandler
where
    In: RpcMessage,
    Out: RpcMessage,
    F: FnOnce(tonic::Request<TypedStream<In>>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<tonic::Response<TypedStream<Out>>, Status>> + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Some(handler)));
    BoxCloneService::new(service_fn(move |req: StreamRequest| {
        let handler = slot.lock().take();
        async move {
            let handler = handler.ok_or_else(|| Status::internal("handler already invoked"))?;
            let response = handler(req.map(restore::<In>)).await?;
            Ok::<_, Status>(response.map(erase::<Out, TypedStream<Out>>))
        }
    }))
}

/// Keeps the call counted as in flight for as long as the stream lives.
struct Guarded<S> {
    inner: S,
    _guard: InFlightGuard,
}

impl<S: Stream + Unpin> Stream for Guarded<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
