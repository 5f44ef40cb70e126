//! Type-erased RPC messages.
//!
//! Interceptors are written once against [`BoxMessage`] and can then wrap
//! handlers for any request/response pair. The dispatcher boxes the typed
//! message on the way in and downcasts it back just before the handler runs.

use std::any::Any;
use std::fmt;

use crate::payload::Payload;
use crate::tags::TagValue;

/// Object-safe access to [`Any`] for message trait objects.
pub trait AsAny: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T: Any + Send> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// A request or response message flowing through the interceptor chain.
pub trait RpcMessage: AsAny + Sync + fmt::Debug {
    /// Structured view of the message for payload logging.
    ///
    /// `None` means the message is opaque: it is still passed through, only
    /// its content is left out of log lines.
    fn payload(&self) -> Option<&dyn Payload> {
        None
    }

    /// Request fields to promote into `grpc.request.<name>` tags.
    fn log_fields(&self) -> Vec<(&'static str, TagValue)> {
        Vec::new()
    }
}

/// Owned, erased message.
pub type BoxMessage = Box<dyn RpcMessage>;

impl dyn RpcMessage {
    #[must_use]
    pub fn is<T: RpcMessage>(&self) -> bool {
        self.as_any().is::<T>()
    }

    #[must_use]
    pub fn downcast_ref<T: RpcMessage>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Recovers the concrete message.
    ///
    /// # Errors
    ///
    /// Returns the original value, erased to [`Any`], if it does not hold a
    /// `T`. It can still be downcast to its real type.
    pub fn downcast<T: RpcMessage>(self: Box<Self>) -> Result<Box<T>, Box<dyn Any + Send>> {
        self.into_any().downcast::<T>()
    }
}

/// Implements [`RpcMessage`] for `serde::Serialize` types so their content
/// is available to payload logging.
#[macro_export]
macro_rules! structured_messages {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::message::RpcMessage for $ty {
                fn payload(&self) -> ::std::option::Option<&dyn $crate::payload::Payload> {
                    ::std::option::Option::Some(self)
                }
            }
        )+
    };
}

/// Implements [`RpcMessage`] for types whose content must stay out of logs.
#[macro_export]
macro_rules! opaque_messages {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::message::RpcMessage for $ty {}
        )+
    };
}
