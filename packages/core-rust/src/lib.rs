//! reqlog core: per-call tag store, call-scoped logger, lazy payload
//! marshalling, erased RPC messages and status-code severity classification.

pub mod context;
pub mod logger;
pub mod message;
pub mod payload;
pub mod severity;
pub mod tags;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use context::{CallInfo, CallKind};
pub use logger::CallLogger;
pub use message::{BoxMessage, RpcMessage};
pub use payload::{JsonPayload, MarshalError, Payload};
pub use severity::{default_level_for, level_for, CodeToLevel, Severity};
pub use tags::{TagSet, TagValue, Tags};
