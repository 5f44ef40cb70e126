//! Tag-store creation and seeding.
//!
//! Runs outermost so that every later interceptor, and the handler, writes
//! into the store created here. Seeds `grpc.start_time`, `peer.address` and
//! `grpc.request.deadline`; with field extraction on, promotes the request's
//! [`RpcMessage::log_fields`] to `grpc.request.<field>` tags.

use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use reqlog_core::{CallInfo, RpcMessage, Tags};
use tonic::Status;
use tower::{Layer, Service};

use super::{BoxFuture, MessageStream, StreamRequest, StreamResponse, UnaryRequest, UnaryResponse};

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

// ---------------------------------------------------------------------------
// TagsLayer
// ---------------------------------------------------------------------------

/// Attaches a fresh tag store to each call and seeds it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagsLayer {
    extract_fields: bool,
}

impl TagsLayer {
    #[must_use]
    pub fn new(extract_fields: bool) -> Self {
        Self { extract_fields }
    }
}

impl<S> Layer<S> for TagsLayer {
    type Service = TagsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TagsService {
            inner,
            extract_fields: self.extract_fields,
        }
    }
}

// ---------------------------------------------------------------------------
// TagsService
// ---------------------------------------------------------------------------

/// Service produced by [`TagsLayer`].
#[derive(Debug, Clone)]
pub struct TagsService<S> {
    inner: S,
    extract_fields: bool,
}

impl<S> Service<UnaryRequest> for TagsService<S>
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

    fn call(&mut self, mut req: UnaryRequest) -> Self::Future {
        let tags = seed(&mut req);
        if self.extract_fields {
            promote_fields(&tags, &**req.get_ref());
        }
        Box::pin(self.inner.call(req))
    }
}

impl<S> Service<StreamRequest> for TagsService<S>
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

    fn call(&mut self, mut req: StreamRequest) -> Self::Future {
        let tags = seed(&mut req);
        let req = if self.extract_fields {
            req.map(|inbound| extract_from_first(inbound, tags))
        } else {
            req
        };
        Box::pin(self.inner.call(req))
    }
}

/// Creates the call's store and writes the transport-level tags.
fn seed<T>(req: &mut tonic::Request<T>) -> Tags {
    let started_at = CallInfo::from_extensions(req.extensions())
        .map_or_else(SystemTime::now, |info| info.started_at);
    let peer = req.remote_addr();
    let deadline = req
        .metadata()
        .get(GRPC_TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_grpc_timeout)
        .and_then(|timeout| started_at.checked_add(timeout));

    let tags = Tags::extract(req.extensions_mut());
    tags.set("grpc.start_time", rfc3339(started_at));
    if let Some(addr) = peer {
        tags.set("peer.address", addr.to_string());
    }
    if let Some(deadline) = deadline {
        tags.set("grpc.request.deadline", rfc3339(deadline));
    }
    tags
}

fn promote_fields(tags: &Tags, message: &dyn RpcMessage) {
    for (field, value) in message.log_fields() {
        tags.set(format!("grpc.request.{field}"), value);
    }
}

/// Promotes fields of the first successfully received message only.
fn extract_from_first(inbound: MessageStream, tags: Tags) -> MessageStream {
    let mut pending = true;
    Box::pin(inbound.inspect(move |item| {
        if let (true, Ok(message)) = (pending, item) {
            pending = false;
            promote_fields(&tags, &**message);
        }
    }))
}

fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a `grpc-timeout` header value: up to 8 digits followed by one of
/// `H`, `M`, `S`, `m`, `u`, `n`.
fn parse_grpc_timeout(raw: &str) -> Option<Duration> {
    if raw.len() < 2 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    if digits.len() > 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use parking_lot::Mutex;
    use reqlog_core::{BoxMessage, CallKind, TagValue};
    use serde_json::json;
    use std::sync::Arc;
    use tower::{service_fn, ServiceExt};

    use super::*;

    #[derive(Debug)]
    struct Lookup {
        id: i64,
    }

    impl RpcMessage for Lookup {
        fn log_fields(&self) -> Vec<(&'static str, TagValue)> {
            vec![("id", json!(self.id))]
        }
    }

    /// Handler that hands back the tag store it saw.
    fn capture_unary(
        seen: Arc<Mutex<Option<Tags>>>,
    ) -> impl Service<UnaryRequest, Response = UnaryResponse, Error = Status, Future = BoxFuture<UnaryResponse>>
    {
        service_fn(move |req: UnaryRequest| {
            *seen.lock() = Some(Tags::from_extensions(req.extensions()));
            Box::pin(async move { Ok(tonic::Response::new(req.into_inner())) }) as BoxFuture<_>
        })
    }

    fn unary_request(id: i64) -> UnaryRequest {
        let mut req = tonic::Request::new(Box::new(Lookup { id }) as BoxMessage);
        req.extensions_mut().insert(CallInfo::new(
            1,
            "/v1.ToDoService/Read",
            CallKind::Unary,
        ));
        req
    }

    #[tokio::test]
    async fn seeds_start_time_and_deadline() {
        let seen = Arc::new(Mutex::new(None));
        let svc = TagsLayer::new(false).layer(capture_unary(Arc::clone(&seen)));

        let mut req = unary_request(3);
        req.metadata_mut()
            .insert(GRPC_TIMEOUT_HEADER, "5S".parse().unwrap());
        svc.oneshot(req).await.unwrap();

        let tags = seen.lock().take().unwrap();
        assert!(tags.has("grpc.start_time"));
        assert!(tags.has("grpc.request.deadline"));
        assert!(!tags.has("peer.address"));
        assert!(!tags.has("grpc.request.id"));
    }

    #[tokio::test]
    async fn promotes_unary_fields_when_enabled() {
        let seen = Arc::new(Mutex::new(None));
        let svc = TagsLayer::new(true).layer(capture_unary(Arc::clone(&seen)));

        svc.oneshot(unary_request(42)).await.unwrap();

        let tags = seen.lock().take().unwrap();
        assert_eq!(tags.get("grpc.request.id"), Some(json!(42)));
    }

    #[tokio::test]
    async fn reuses_store_already_on_the_call() {
        let seen = Arc::new(Mutex::new(None));
        let svc = TagsLayer::default().layer(capture_unary(Arc::clone(&seen)));

        let mut req = unary_request(1);
        let existing = Tags::extract(req.extensions_mut());
        existing.set("pre", true);
        svc.oneshot(req).await.unwrap();

        let tags = seen.lock().take().unwrap();
        assert!(tags.ptr_eq(&existing));
        assert!(tags.has("pre"));
    }

    #[tokio::test]
    async fn promotes_fields_of_first_stream_message_only() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in = Arc::clone(&seen);
        let handler = service_fn(move |req: StreamRequest| {
            let seen = Arc::clone(&seen_in);
            Box::pin(async move {
                let tags = Tags::from_extensions(req.extensions());
                let drained: Vec<_> = req.into_inner().collect().await;
                assert_eq!(drained.len(), 3);
                *seen.lock() = Some(tags);
                let out: MessageStream = Box::pin(stream::empty());
                Ok(tonic::Response::new(out))
            }) as BoxFuture<StreamResponse>
        });
        let svc = TagsLayer::new(true).layer(handler);

        let inbound: MessageStream = Box::pin(stream::iter(vec![
            Err(Status::data_loss("corrupt frame")),
            Ok(Box::new(Lookup { id: 7 }) as BoxMessage),
            Ok(Box::new(Lookup { id: 8 }) as BoxMessage),
        ]));
        svc.oneshot(tonic::Request::new(inbound)).await.unwrap();

        let tags = seen.lock().take().unwrap();
        assert_eq!(tags.get("grpc.request.id"), Some(json!(7)));
    }

    #[test]
    fn parses_grpc_timeout_units() {
        assert_eq!(parse_grpc_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_grpc_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_grpc_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_grpc_timeout("10n"), Some(Duration::from_nanos(10)));
        assert_eq!(parse_grpc_timeout("S"), None);
        assert_eq!(parse_grpc_timeout("123456789S"), None);
        assert_eq!(parse_grpc_timeout("5x"), None);
    }
}
