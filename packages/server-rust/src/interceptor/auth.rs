//! Caller authentication.
//!
//! [`AuthLayer`] asks an [`Authenticator`] about each call's metadata. On
//! success the [`Principal`] is stored in the call's extensions and its id is
//! tagged as `auth.subject`; on failure the call is answered with
//! `Unauthenticated` and nothing further down the chain runs.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use reqlog_core::CallLogger;
use subtle::ConstantTimeEq;
use tonic::metadata::MetadataMap;
use tonic::Status;
use tower::{Layer, Service};

use super::BoxFuture;

const AUTHORIZATION: &str = "authorization";
const BEARER: &str = "Bearer ";

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub roles: Vec<String>,
}

impl Principal {
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            roles: Vec::new(),
        }
    }
}

/// Decides who a call comes from.
pub trait Authenticator: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns an `Unauthenticated` status when the caller cannot be
    /// identified.
    fn authenticate(&self, metadata: &MetadataMap) -> Result<Principal, Status>;
}

/// Accepts every call as [`Principal::anonymous`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _metadata: &MetadataMap) -> Result<Principal, Status> {
        Ok(Principal::anonymous())
    }
}

/// Bearer tokens from a fixed list.
///
/// Each entry is either `subject:token` or a bare token, which is attributed
/// to the subject `static-token`. Comparison runs in constant time over the
/// whole list.
#[derive(Clone)]
pub struct StaticTokens {
    entries: Vec<(String, Vec<u8>)>,
}

impl StaticTokens {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let entries = tokens
            .into_iter()
            .map(|entry| match entry.as_ref().split_once(':') {
                Some((subject, token)) => (subject.to_string(), token.as_bytes().to_vec()),
                None => ("static-token".to_string(), entry.as_ref().as_bytes().to_vec()),
            })
            .collect();
        Self { entries }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for StaticTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokens")
            .field("count", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, metadata: &MetadataMap) -> Result<Principal, Status> {
        let presented = metadata
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER))
            .ok_or_else(|| Status::unauthenticated("missing bearer token"))?;

        let mut matched: Option<&str> = None;
        for (subject, token) in &self.entries {
            if bool::from(token.as_slice().ct_eq(presented.as_bytes())) && matched.is_none() {
                matched = Some(subject.as_str());
            }
        }

        matched
            .map(|subject| Principal {
                id: subject.to_string(),
                roles: Vec::new(),
            })
            .ok_or_else(|| Status::unauthenticated("invalid bearer token"))
    }
}

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

/// Rejects calls the [`Authenticator`] does not accept.
#[derive(Clone)]
pub struct AuthLayer {
    authenticator: Arc<dyn Authenticator>,
}

impl AuthLayer {
    pub fn new(authenticator: impl Authenticator) -> Self {
        Self {
            authenticator: Arc::new(authenticator),
        }
    }

    #[must_use]
    pub fn from_arc(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

impl fmt::Debug for AuthLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthLayer").finish_non_exhaustive()
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            authenticator: Arc::clone(&self.authenticator),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

/// Service produced by [`AuthLayer`].
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    authenticator: Arc<dyn Authenticator>,
}

impl<S, T> Service<tonic::Request<T>> for AuthService<S>
where
    S: Service<tonic::Request<T>, Error = Status>,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = Status;
    type Future = BoxFuture<S::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: tonic::Request<T>) -> Self::Future {
        match self.authenticator.authenticate(req.metadata()) {
            Ok(principal) => {
                let logger = CallLogger::bind(req.extensions());
                logger.tag("auth.subject", principal.id.clone());
                req.extensions_mut().insert(principal);
                Box::pin(self.inner.call(req))
            }
            Err(status) => {
                let logger = CallLogger::bind(req.extensions());
                logger.tag("auth.error", status.message().to_string());
                logger.warn("authentication failed");
                Box::pin(std::future::ready(Err(status)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
