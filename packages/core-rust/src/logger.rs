//! Call-scoped logger.
//!
//! [`CallLogger::bind`] captures handles to a call's [`CallInfo`] and
//! [`Tags`], not their contents: the tag store is read each time a line is
//! emitted. Bind per emission site rather than keeping a logger around, so a
//! tag written between two lines shows up in the second one only.

use tonic::Extensions;

use crate::context::CallInfo;
use crate::payload::{self, Payload};
use crate::severity::Severity;
use crate::tags::{TagValue, Tags};

/// Emits a `tracing` event whose level is chosen at runtime.
///
/// `tracing` macros need a constant level, so this expands to one macro
/// invocation per [`Severity`]. Only the selected arm evaluates its fields.
#[macro_export]
macro_rules! log_at {
    ($severity:expr, $($rest:tt)+) => {
        match $severity {
            $crate::severity::Severity::Debug => ::tracing::debug!($($rest)+),
            $crate::severity::Severity::Info => ::tracing::info!($($rest)+),
            $crate::severity::Severity::Warn => ::tracing::warn!($($rest)+),
            $crate::severity::Severity::Error => ::tracing::error!($($rest)+),
        }
    };
}

const UNKNOWN: &str = "unknown";

/// Logger bound to one call.
#[derive(Debug, Clone, Default)]
pub struct CallLogger {
    info: Option<CallInfo>,
    tags: Tags,
}

impl CallLogger {
    /// Binds to the call described by `extensions`. A call that has no tag
    /// store yet logs with an empty `tags` field.
    #[must_use]
    pub fn bind(extensions: &Extensions) -> Self {
        Self {
            info: CallInfo::from_extensions(extensions).cloned(),
            tags: Tags::from_extensions(extensions),
        }
    }

    #[must_use]
    pub fn from_parts(info: Option<CallInfo>, tags: Tags) -> Self {
        Self { info, tags }
    }

    #[must_use]
    pub fn info_ref(&self) -> Option<&CallInfo> {
        self.info.as_ref()
    }

    #[must_use]
    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Writes a tag to the bound call's store.
    pub fn tag(&self, key: impl Into<String>, value: impl Into<TagValue>) -> &Self {
        self.tags.set(key, value);
        self
    }

    #[must_use]
    pub fn service(&self) -> &'static str {
        self.info.as_ref().map_or(UNKNOWN, CallInfo::service)
    }

    #[must_use]
    pub fn method(&self) -> &'static str {
        self.info.as_ref().map_or(UNKNOWN, CallInfo::method)
    }

    pub fn log(&self, severity: Severity, message: &str) {
        log_at!(
            severity,
            grpc.service = self.service(),
            grpc.method = self.method(),
            system = "grpc",
            span.kind = "server",
            tags = %self.tags.snapshot(),
            "{message}"
        );
    }

    /// Like [`log`](Self::log) with the message content attached as
    /// `grpc.request.content`. The content is serialized only if the event is
    /// recorded.
    pub fn log_with_payload(&self, severity: Severity, message: &str, content: &dyn Payload) {
        log_at!(
            severity,
            grpc.service = self.service(),
            grpc.method = self.method(),
            system = "grpc",
            span.kind = "server",
            tags = %self.tags.snapshot(),
            grpc.request.content = %payload::wrap(content),
            "{message}"
        );
    }

    pub fn debug(&self, message: &str) {
        self.log(Severity::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Severity::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }
}
