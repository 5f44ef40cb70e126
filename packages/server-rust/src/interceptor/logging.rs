//! Access logging: one terminal line per call.
//!
//! The line is emitted when the call is over, at the level the configured
//! classifier picks for the final status code. For unary calls that is when
//! the handler returns; for streaming calls, when the outbound stream ends,
//! yields an error, or is dropped before finishing (logged as `Cancelled`).
//! Each finished call also updates `grpc_server_handled_total` and
//! `grpc_server_handling_seconds`.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::Stream;
use reqlog_core::{log_at, level_for, BoxMessage, CallLogger, CodeToLevel};
use tonic::{Code, Status};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::{BoxFuture, MessageStream, StreamRequest, StreamResponse, UnaryRequest, UnaryResponse};

const UNARY_FINISHED: &str = "finished unary call";
const STREAM_FINISHED: &str = "finished streaming call";

// ---------------------------------------------------------------------------
// AccessLogLayer
// ---------------------------------------------------------------------------

/// Writes the terminal access-log line for every call it wraps.
#[derive(Debug, Clone, Copy)]
pub struct AccessLogLayer {
    code_to_level: CodeToLevel,
}

impl AccessLogLayer {
    /// Uses `code_to_level` instead of the default classifier.
    #[must_use]
    pub fn with_classifier(code_to_level: CodeToLevel) -> Self {
        Self { code_to_level }
    }
}

impl Default for AccessLogLayer {
    fn default() -> Self {
        Self::with_classifier(level_for)
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            code_to_level: self.code_to_level,
        }
    }
}

// ---------------------------------------------------------------------------
// AccessLogService
// ---------------------------------------------------------------------------

/// Service produced by [`AccessLogLayer`].
#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
    code_to_level: CodeToLevel,
}

impl<S> AccessLogService<S> {
    fn finisher<T>(&self, req: &tonic::Request<T>, message: &'static str) -> (Finisher, tracing::Span) {
        let logger = CallLogger::bind(req.extensions());
        let (call_id, started) = logger
            .info_ref()
            .map_or((0, Instant::now()), |info| (info.call_id, info.started));
        let span = info_span!(
            "grpc_call",
            call_id,
            grpc.service = logger.service(),
            grpc.method = logger.method(),
        );
        let finisher = Finisher {
            logger,
            message,
            started,
            code_to_level: self.code_to_level,
            done: false,
        };
        (finisher, span)
    }
}

impl<S> Service<UnaryRequest> for AccessLogService<S>
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
        let (mut finisher, span) = self.finisher(&req, UNARY_FINISHED);
        let fut: BoxFuture<UnaryResponse> = Box::pin(self.inner.call(req));

        Box::pin(
            async move {
                let result = fut.await;
                match &result {
                    Ok(_) => finisher.finish(Code::Ok, None),
                    Err(status) => finisher.finish(status.code(), Some(status)),
                }
                result
            }
            .instrument(span),
        )
    }
}

impl<S> Service<StreamRequest> for AccessLogService<S>
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
        let (mut finisher, span) = self.finisher(&req, STREAM_FINISHED);
        let fut: BoxFuture<StreamResponse> = Box::pin(self.inner.call(req));

        Box::pin(
            async move {
                match fut.await {
                    Ok(resp) => Ok(resp.map(|outbound| -> MessageStream {
                        Box::pin(FinishOnEnd {
                            inner: outbound,
                            finisher,
                        })
                    })),
                    Err(status) => {
                        finisher.finish(status.code(), Some(&status));
                        Err(status)
                    }
                }
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Finisher
// ---------------------------------------------------------------------------

/// Emits the terminal line exactly once. Dropping it unfinished means the
/// call was abandoned, which is reported as `Cancelled`.
struct Finisher {
    logger: CallLogger,
    message: &'static str,
    started: Instant,
    code_to_level: CodeToLevel,
    done: bool,
}

impl Finisher {
    fn finish(&mut self, code: Code, error: Option<&Status>) {
        if self.done {
            return;
        }
        self.done = true;

        let elapsed = self.started.elapsed();
        let time_ms = elapsed.as_secs_f64() * 1000.0;
        let code_name = format!("{code:?}");
        let service = self.logger.service();
        let method = self.logger.method();
        let message = self.message;

        log_at!(
            (self.code_to_level)(code),
            grpc.service = service,
            grpc.method = method,
            system = "grpc",
            span.kind = "server",
            grpc.code = code_name.as_str(),
            grpc.time_ms = time_ms,
            grpc.error = error.map(Status::message),
            tags = %self.logger.tags().snapshot(),
            "{message}"
        );

        metrics::counter!(
            "grpc_server_handled_total",
            "grpc_service" => service,
            "grpc_method" => method,
            "grpc_code" => code_name
        )
        .increment(1);
        metrics::histogram!(
            "grpc_server_handling_seconds",
            "grpc_service" => service,
            "grpc_method" => method
        )
        .record(elapsed.as_secs_f64());
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        if !self.done {
            let status = Status::cancelled("call abandoned before completion");
            self.finish(Code::Cancelled, Some(&status));
        }
    }
}

/// Outbound stream that reports the call finished when it ends.
struct FinishOnEnd {
    inner: MessageStream,
    finisher: Finisher,
}

impl Stream for FinishOnEnd {
    type Item = Result<BoxMessage, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(None) => this.finisher.finish(Code::Ok, None),
            Poll::Ready(Some(Err(status))) => this.finisher.finish(status.code(), Some(status)),
            Poll::Ready(Some(Ok(_))) | Poll::Pending => {}
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

#[cfg(test)]
mod tests {
    use futures_util::{stream, StreamExt};
    use reqlog_core::{CallInfo, CallKind, Severity, Tags};
    use tracing::Level;
    use tower::{service_fn, ServiceExt};

    use super::*;

    #[derive(Debug)]
    struct Reply;

    reqlog_core::opaque_messages!(Reply);

    fn unary_request(tags: &Tags) -> UnaryRequest {
        let mut req = tonic::Request::new(Box::new(Reply) as BoxMessage);
        req.extensions_mut()
            .insert(CallInfo::new(5, "/v1.ToDoService/Read", CallKind::Unary));
        req.extensions_mut().insert(tags.clone());
        req
    }

    fn stream_request() -> StreamRequest {
        let inbound: MessageStream = Box::pin(stream::empty());
        let mut req = tonic::Request::new(inbound);
        req.extensions_mut().insert(CallInfo::new(
            6,
            "/v1.ToDoService/BulkCreate",
            CallKind::BidiStreaming,
        ));
        req
    }

    fn unary_handler(
        outcome: Result<(), Status>,
    ) -> impl Service<UnaryRequest, Response = UnaryResponse, Error = Status, Future = BoxFuture<UnaryResponse>>
    {
        service_fn(move |req: UnaryRequest| {
            let outcome = outcome.clone();
            let tags = Tags::from_extensions(req.extensions());
            Box::pin(async move {
                tags.set("handler.ran", true);
                outcome.map(|()| tonic::Response::new(Box::new(Reply) as BoxMessage))
            }) as BoxFuture<UnaryResponse>
        })
    }

    fn stream_handler(
        items: Vec<Result<BoxMessage, Status>>,
    ) -> impl Service<StreamRequest, Response = StreamResponse, Error = Status, Future = BoxFuture<StreamResponse>>
    {
        let items = std::sync::Arc::new(parking_lot::Mutex::new(Some(items)));
        service_fn(move |_req: StreamRequest| {
            let items = items.lock().take().unwrap_or_default();
            Box::pin(async move {
                let out: MessageStream = Box::pin(stream::iter(items));
                Ok(tonic::Response::new(out))
            }) as BoxFuture<StreamResponse>
        })
    }

    #[tokio::test]
    async fn ok_unary_call_logs_at_debug() {
        let (logs, _guard) = reqlog_core::testing::capture();
        let tags = Tags::default();
        let svc = AccessLogLayer::default().layer(unary_handler(Ok(())));

        svc.oneshot(unary_request(&tags)).await.unwrap();

        let lines = logs.with_message(UNARY_FINISHED);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].level, Level::DEBUG);
        assert_eq!(lines[0].field("grpc.code"), Some("Ok"));
        assert!(lines[0].field("grpc.error").is_none());
        assert!(lines[0].field("grpc.time_ms").is_some());
        assert_eq!(lines[0].tags()["handler.ran"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn failed_unary_call_uses_standard_severity() {
        let (logs, _guard) = reqlog_core::testing::capture();
        let cases = [
            (Status::not_found("no such item"), Level::INFO),
            (Status::unavailable("busy"), Level::WARN),
            (Status::internal("boom"), Level::ERROR),
        ];

        for (status, level) in cases {
            logs.clear();
            let code = status.code();
            let svc = AccessLogLayer::default().layer(unary_handler(Err(status)));
            let err = svc.oneshot(unary_request(&Tags::default())).await.unwrap_err();
            assert_eq!(err.code(), code);

            let line = &logs.with_message(UNARY_FINISHED)[0];
            assert_eq!(line.level, level);
            assert!(line.field("grpc.error").is_some());
        }
    }

    #[tokio::test]
    async fn custom_classifier_is_honored() {
        fn always_error(_: Code) -> Severity {
            Severity::Error
        }
        let (logs, _guard) = reqlog_core::testing::capture();
        let svc = AccessLogLayer::with_classifier(always_error).layer(unary_handler(Ok(())));

        svc.oneshot(unary_request(&Tags::default())).await.unwrap();

        assert_eq!(logs.with_message(UNARY_FINISHED)[0].level, Level::ERROR);
    }

    #[tokio::test]
    async fn stream_finishes_when_outbound_ends() {
        let (logs, _guard) = reqlog_core::testing::capture();
        let items = vec![Ok(Box::new(Reply) as BoxMessage), Ok(Box::new(Reply) as BoxMessage)];
        let svc = AccessLogLayer::default().layer(stream_handler(items));

        let resp = svc.oneshot(stream_request()).await.unwrap();
        assert_eq!(logs.count(STREAM_FINISHED), 0);

        let received: Vec<_> = resp.into_inner().collect().await;
        assert_eq!(received.len(), 2);

        let lines = logs.with_message(STREAM_FINISHED);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].field("grpc.code"), Some("Ok"));
    }

    #[tokio::test]
    async fn stream_error_item_finishes_with_its_code() {
        let (logs, _guard) = reqlog_core::testing::capture();
        let items = vec![
            Ok(Box::new(Reply) as BoxMessage),
            Err(Status::aborted("conflict")),
        ];
        let svc = AccessLogLayer::default().layer(stream_handler(items));

        let resp = svc.oneshot(stream_request()).await.unwrap();
        let _drained: Vec<_> = resp.into_inner().collect().await;

        let lines = logs.with_message(STREAM_FINISHED);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].level, Level::WARN);
        assert_eq!(lines[0].field("grpc.code"), Some("Aborted"));
    }

    #[tokio::test]
    async fn dropped_stream_is_reported_cancelled() {
        let (logs, _guard) = reqlog_core::testing::capture();
        let items = vec![Ok(Box::new(Reply) as BoxMessage), Ok(Box::new(Reply) as BoxMessage)];
        let svc = AccessLogLayer::default().layer(stream_handler(items));

        let resp = svc.oneshot(stream_request()).await.unwrap();
        let mut outbound = resp.into_inner();
        assert!(outbound.next().await.is_some());
        drop(outbound);

        let lines = logs.with_message(STREAM_FINISHED);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].field("grpc.code"), Some("Cancelled"));
    }

    #[tokio::test]
    async fn handler_error_before_stream_finishes_immediately() {
        let (logs, _guard) = reqlog_core::testing::capture();
        let handler = service_fn(|_req: StreamRequest| {
            Box::pin(async { Err(Status::permission_denied("nope")) }) as BoxFuture<StreamResponse>
        });
        let svc = AccessLogLayer::default().layer(handler);

        let Err(err) = svc.oneshot(stream_request()).await else {
            panic!("expected the handler error");
        };

        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(logs.count(STREAM_FINISHED), 1);
    }
}
