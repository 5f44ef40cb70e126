use std::time::{Instant, SystemTime};

use tonic::Extensions;

/// Shape of an RPC as declared by the service definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    ClientStreaming,
    ServerStreaming,
    BidiStreaming,
}

impl CallKind {
    #[must_use]
    pub fn is_streaming(self) -> bool {
        !matches!(self, CallKind::Unary)
    }
}

/// Immutable facts about one RPC invocation, inserted into the call's
/// extensions by the dispatcher before the interceptor chain runs.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Process-unique, monotonically increasing call identifier.
    pub call_id: u64,
    /// Full gRPC method path, e.g. `/v1.ToDoService/Create`.
    pub full_method: &'static str,
    pub kind: CallKind,
    /// Wall-clock start, used for the `grpc.start_time` tag.
    pub started_at: SystemTime,
    /// Monotonic start, used for call duration.
    pub started: Instant,
}

impl CallInfo {
    #[must_use]
    pub fn new(call_id: u64, full_method: &'static str, kind: CallKind) -> Self {
        Self {
            call_id,
            full_method,
            kind,
            started_at: SystemTime::now(),
            started: Instant::now(),
        }
    }

    /// Returns the call info recorded in `extensions`, if any.
    #[must_use]
    pub fn from_extensions(extensions: &Extensions) -> Option<&CallInfo> {
        extensions.get::<CallInfo>()
    }

    /// Service part of the method path (`v1.ToDoService`).
    #[must_use]
    pub fn service(&self) -> &'static str {
        split_method(self.full_method).0
    }

    /// Method part of the method path (`Create`).
    #[must_use]
    pub fn method(&self) -> &'static str {
        split_method(self.full_method).1
    }
}

/// Splits `/package.Service/Method` into `("package.Service", "Method")`.
///
/// Malformed paths yield `"unknown"` for the missing half.
#[must_use]
pub fn split_method(full_method: &'static str) -> (&'static str, &'static str) {
    let trimmed = full_method.strip_prefix('/').unwrap_or(full_method);
    match trimmed.split_once('/') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => (service, method),
        _ => ("unknown", "unknown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_well_formed_method() {
        assert_eq!(
            split_method("/v1.ToDoService/ReadAll"),
            ("v1.ToDoService", "ReadAll")
        );
    }

    #[test]
    fn split_malformed_method() {
        assert_eq!(split_method("nonsense"), ("unknown", "unknown"));
        assert_eq!(split_method("/svc/"), ("unknown", "unknown"));
    }

    #[test]
    fn call_info_roundtrips_through_extensions() {
        let mut ext = Extensions::new();
        assert!(CallInfo::from_extensions(&ext).is_none());

        ext.insert(CallInfo::new(7, "/v1.ToDoService/Read", CallKind::Unary));
        let info = CallInfo::from_extensions(&ext).unwrap();
        assert_eq!(info.call_id, 7);
        assert_eq!(info.service(), "v1.ToDoService");
        assert_eq!(info.method(), "Read");
        assert!(!info.kind.is_streaming());
    }
}
