//! gRPC call interceptors.
//!
//! Every interceptor is a tower [`Layer`] over an erased [`Handler`]. Unary
//! calls flow as `tonic::Request<BoxMessage>`; streaming calls carry the
//! inbound [`MessageStream`] in the request and return the outbound one.
//!
//! - [`tags`]: creates the per-call tag store and seeds it
//! - [`auth`]: authenticates the caller, short-circuits on failure
//! - [`logging`]: one terminal access-log line per call, plus metrics
//! - [`payload`]: logs inbound request payloads
//! - [`chain`]: ordered composition of interceptors
//! - [`pipeline`]: adapts typed tonic handlers to the erased chain

pub mod auth;
pub mod chain;
pub mod logging;
pub mod payload;
pub mod pipeline;
pub mod tags;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use reqlog_core::BoxMessage;
use tonic::Status;
use tower::util::BoxCloneService;
use tower::{Layer, Service};

pub use auth::{AllowAll, AuthLayer, Authenticator, Principal, StaticTokens};
pub use chain::{Chain, StreamChain, UnaryChain};
pub use logging::AccessLogLayer;
pub use payload::PayloadLoggingLayer;
pub use pipeline::{build_pipeline, InterceptorConfig, Pipeline};
pub use tags::TagsLayer;

/// Boxed future returned by interceptor services.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, Status>> + Send>>;

/// Erased stream of messages in one direction of a streaming call.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<BoxMessage, Status>> + Send>>;

/// Typed outbound stream as returned to tonic.
pub type TypedStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// A link in the chain: the handler itself or an interceptor wrapping it.
pub type Handler<Req, Resp> = BoxCloneService<tonic::Request<Req>, tonic::Response<Resp>, Status>;

pub type UnaryRequest = tonic::Request<BoxMessage>;
pub type UnaryResponse = tonic::Response<BoxMessage>;
pub type StreamRequest = tonic::Request<MessageStream>;
pub type StreamResponse = tonic::Response<MessageStream>;

pub type UnaryHandler = Handler<BoxMessage, BoxMessage>;
pub type StreamHandler = Handler<MessageStream, MessageStream>;

type WrapFn<Req, Resp> = dyn Fn(Handler<Req, Resp>) -> Handler<Req, Resp> + Send + Sync;

/// A named function from the next link to a wrapped link.
pub struct Interceptor<Req, Resp> {
    name: &'static str,
    wrap: Arc<WrapFn<Req, Resp>>,
}

impl<Req: 'static, Resp: 'static> Interceptor<Req, Resp> {
    pub fn new<F>(name: &'static str, wrap: F) -> Self
    where
        F: Fn(Handler<Req, Resp>) -> Handler<Req, Resp> + Send + Sync + 'static,
    {
        Self {
            name,
            wrap: Arc::new(wrap),
        }
    }

    /// Builds an interceptor from a tower layer.
    pub fn from_layer<L>(name: &'static str, layer: L) -> Self
    where
        L: Layer<Handler<Req, Resp>> + Send + Sync + 'static,
        L::Service: Service<tonic::Request<Req>, Response = tonic::Response<Resp>, Error = Status>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<tonic::Request<Req>>>::Future: Send + 'static,
    {
        Self::new(name, move |next| BoxCloneService::new(layer.layer(next)))
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wraps `next`, returning the new outer link.
    #[must_use]
    pub fn apply(&self, next: Handler<Req, Resp>) -> Handler<Req, Resp> {
        (self.wrap)(next)
    }
}

impl<Req, Resp> Clone for Interceptor<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            wrap: Arc::clone(&self.wrap),
        }
    }
}

impl<Req, Resp> fmt::Debug for Interceptor<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor").field("name", &self.name).finish()
    }
}
