//! Ordered composition of interceptors.
//!
//! The first interceptor registered is the outermost one: it sees the call
//! first and the result last. Composition happens once per call via
//! [`Chain::wrap`], so the handler runs at most once per call.

use std::fmt;

use tower::Layer;

use super::{Handler, Interceptor, MessageStream};
use reqlog_core::BoxMessage;

/// Interceptors in registration order.
pub struct Chain<Req, Resp> {
    interceptors: Vec<Interceptor<Req, Resp>>,
}

/// Chain for unary calls.
pub type UnaryChain = Chain<BoxMessage, BoxMessage>;

/// Chain for streaming calls. Independent of [`UnaryChain`].
pub type StreamChain = Chain<MessageStream, MessageStream>;

impl<Req: 'static, Resp: 'static> Chain<Req, Resp> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    /// Appends `interceptor` as the innermost link so far.
    #[must_use]
    pub fn with(mut self, interceptor: Interceptor<Req, Resp>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Interceptor<Req, Resp>) {
        self.interceptors.push(interceptor);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Interceptor names, outermost first.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(Interceptor::name).collect()
    }

    /// Nests `handler` inside every interceptor. An empty chain returns the
    /// handler unchanged.
    #[must_use]
    pub fn wrap(&self, handler: Handler<Req, Resp>) -> Handler<Req, Resp> {
        self.interceptors
            .iter()
            .rev()
            .fold(handler, |next, interceptor| interceptor.apply(next))
    }
}

impl<Req: 'static, Resp: 'static> Default for Chain<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Resp> Clone for Chain<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<Req, Resp> fmt::Debug for Chain<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.interceptors).finish()
    }
}

impl<Req: 'static, Resp: 'static> Layer<Handler<Req, Resp>> for Chain<Req, Resp> {
    type Service = Handler<Req, Resp>;

    fn layer(&self, inner: Handler<Req, Resp>) -> Self::Service {
        self.wrap(inner)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tonic::{Code, Status};
    use tower::util::BoxCloneService;
    use tower::{service_fn, ServiceExt};

    use super::*;
    use crate::interceptor::{BoxFuture, UnaryHandler, UnaryRequest, UnaryResponse};

    #[derive(Debug)]
    struct Note(&'static str);

    reqlog_core::opaque_messages!(Note);

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Interceptor that records entry and exit around the next link.
    fn probe(name: &'static str, journal: &Journal) -> Interceptor<BoxMessage, BoxMessage> {
        let journal = Arc::clone(journal);
        Interceptor::new(name, move |next: UnaryHandler| {
            let journal = Arc::clone(&journal);
            BoxCloneService::new(service_fn(move |req: UnaryRequest| {
                let next = next.clone();
                let journal = Arc::clone(&journal);
                journal.lock().push(format!("{name}:enter"));
                let inner: BoxFuture<UnaryResponse> = Box::pin(next.oneshot(req));
                let journal = Arc::clone(&journal);
                async move {
                    let result = inner.await;
                    journal.lock().push(format!("{name}:exit"));
                    result
                }
            }))
        })
    }

    /// Interceptor that rejects every call without calling next.
    fn reject(name: &'static str) -> Interceptor<BoxMessage, BoxMessage> {
        Interceptor::new(name, |_next: UnaryHandler| {
            BoxCloneService::new(service_fn(|_req: UnaryRequest| async {
                Err::<UnaryResponse, _>(Status::permission_denied("rejected"))
            }))
        })
    }

    fn handler(journal: &Journal, calls: &Arc<AtomicUsize>) -> UnaryHandler {
        let journal = Arc::clone(journal);
        let calls = Arc::clone(calls);
        BoxCloneService::new(service_fn(move |_req: UnaryRequest| {
            let journal = Arc::clone(&journal);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                journal.lock().push("handler".to_string());
                Ok::<_, Status>(tonic::Response::new(Box::new(Note("done")) as BoxMessage))
            }
        }))
    }

    fn request() -> UnaryRequest {
        tonic::Request::new(Box::new(Note("ping")) as BoxMessage)
    }

    #[tokio::test]
    async fn first_registered_is_outermost() {
        let journal = Journal::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = UnaryChain::new()
            .with(probe("A", &journal))
            .with(probe("B", &journal));

        chain
            .wrap(handler(&journal, &calls))
            .oneshot(request())
            .await
            .unwrap();

        assert_eq!(
            *journal.lock(),
            vec!["A:enter", "B:enter", "handler", "B:exit", "A:exit"]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_chain_calls_handler_directly() {
        let journal = Journal::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = UnaryChain::new();
        assert!(chain.is_empty());

        let resp = chain
            .wrap(handler(&journal, &calls))
            .oneshot(request())
            .await
            .unwrap();

        let note = resp.into_inner().downcast::<Note>().unwrap();
        assert_eq!(note.0, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_links_and_handler() {
        let journal = Journal::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = UnaryChain::new()
            .with(probe("outer", &journal))
            .with(reject("gate"))
            .with(probe("inner", &journal));

        let err = chain
            .wrap(handler(&journal, &calls))
            .oneshot(request())
            .await
            .unwrap_err();

        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(*journal.lock(), vec!["outer:enter", "outer:exit"]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn names_follow_registration_order() {
        let journal = Journal::default();
        let mut chain = UnaryChain::new().with(probe("tags", &journal));
        chain.push(probe("auth", &journal));
        chain.push(probe("logging", &journal));

        assert_eq!(chain.len(), 3);
        assert_eq!(chain.names(), vec!["tags", "auth", "logging"]);
    }

    #[tokio::test]
    async fn chain_is_usable_as_a_layer() {
        let journal = Journal::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = UnaryChain::new().with(probe("only", &journal));

        let svc = chain.layer(handler(&journal, &calls));
        svc.oneshot(request()).await.unwrap();

        assert_eq!(*journal.lock(), vec!["only:enter", "handler", "only:exit"]);
    }
}
