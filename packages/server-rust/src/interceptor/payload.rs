//! Inbound payload logging.
//!
//! Unary calls get one DEBUG "Request received" line before the handler
//! runs. Streaming calls get one DEBUG "Message received" line per message
//! the handler successfully reads. Responses are never logged. With
//! `log_payload` on, content is attached as `grpc.request.content` and
//! rendered lazily, so nothing is serialized unless the line is actually
//! recorded. With it off the line is still written, without content.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use reqlog_core::{BoxMessage, CallLogger, RpcMessage, Severity};
use tonic::Status;
use tower::{Layer, Service};

use super::{BoxFuture, MessageStream, StreamRequest, StreamResponse, UnaryRequest, UnaryResponse};

pub(crate) const REQUEST_RECEIVED: &str = "Request received";
pub(crate) const MESSAGE_RECEIVED: &str = "Message received";

fn log_received(logger: &CallLogger, line: &str, message: &dyn RpcMessage, log_payload: bool) {
    match message.payload().filter(|_| log_payload) {
        Some(content) => logger.log_with_payload(Severity::Debug, line, content),
        None => logger.debug(line),
    }
}

// ---------------------------------------------------------------------------
// PayloadLoggingLayer
// ---------------------------------------------------------------------------

/// Tower layer that logs inbound request payloads for unary and streaming calls.
#[derive(Debug, Clone, Copy)]
pub struct PayloadLoggingLayer {
    log_payload: bool,
}

impl PayloadLoggingLayer {
    /// `log_payload` decides whether lines carry the request content.
    #[must_use]
    pub fn new(log_payload: bool) -> Self {
        Self { log_payload }
    }
}

impl<S> Layer<S> for PayloadLoggingLayer {
    type Service = PayloadLoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PayloadLoggingService {
            inner,
            log_payload: self.log_payload,
        }
    }
}

// ---------------------------------------------------------------------------
// PayloadLoggingService
// ---------------------------------------------------------------------------

/// Service wrapper that writes the "received" lines before passing the call on.
#[derive(Debug, Clone)]
pub struct PayloadLoggingService<S> {
    inner: S,
    log_payload: bool,
}

impl<S> Service<UnaryRequest> for PayloadLoggingService<S>
where
    S: Service<UnaryRequest, Response = UnaryResponse, Error = Status>,
    S::Future: Send + 'static,
{
    type Response = UnaryResponse;
    type Error = Status;
    type Future = BoxFuture<UnaryResponse>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: UnaryRequest) -> Self::Future {
        let logger = CallLogger::bind(req.extensions());
        log_received(&logger, REQUEST_RECEIVED, &**req.get_ref(), self.log_payload);
        Box::pin(self.inner.call(req))
    }
}

impl<S> Service<StreamRequest> for PayloadLoggingService<S>
where
    S: Service<StreamRequest, Response = StreamResponse, Error = Status>,
    S::Future: Send + 'static,
{
    type Response = StreamResponse;
    type Error = Status;
    type Future = BoxFuture<StreamResponse>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: StreamRequest) -> Self::Future {
        let logger = CallLogger::bind(req.extensions());
        let log_payload = self.log_payload;
        let req = req.map(|inbound| -> MessageStream {
            Box::pin(LoggingStream {
                inner: inbound,
                logger,
                log_payload,
            })
        });
        Box::pin(self.inner.call(req))
    }
}

// ---------------------------------------------------------------------------
// LoggingStream
// ---------------------------------------------------------------------------

/// Inbound stream that logs each message as the handler receives it.
///
/// The logger holds handles to the call's info and tag store, so each line
/// carries the tags present when that message arrived.
struct LoggingStream {
    inner: MessageStream,
    logger: CallLogger,
    log_payload: bool,
}

impl Stream for LoggingStream {
    type Item = Result<BoxMessage, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(message))) = &polled {
            log_received(&this.logger, MESSAGE_RECEIVED, &**message, this.log_payload);
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
