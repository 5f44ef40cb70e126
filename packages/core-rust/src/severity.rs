//! Maps a call's final status code to the level of its terminal log line.

use std::fmt;

use tonic::Code;

/// Log severity of a call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Severity> for tracing::Level {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Debug => tracing::Level::DEBUG,
            Severity::Info => tracing::Level::INFO,
            Severity::Warn => tracing::Level::WARN,
            Severity::Error => tracing::Level::ERROR,
        }
    }
}

/// Signature of a pluggable code classifier.
pub type CodeToLevel = fn(Code) -> Severity;

/// Conventional gRPC server classification.
///
/// Client-caused and expected outcomes are `Info`, conditions worth
/// attention are `Warn`, and server faults are `Error`.
#[must_use]
pub fn default_level_for(code: Code) -> Severity {
    match code {
        Code::Ok
        | Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::Unauthenticated => Severity::Info,

        Code::DeadlineExceeded
        | Code::PermissionDenied
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::OutOfRange
        | Code::Unavailable => Severity::Warn,

        Code::Unknown | Code::Unimplemented | Code::Internal | Code::DataLoss => Severity::Error,
    }
}

/// Same as [`default_level_for`] except that successful calls drop to
/// `Debug`, keeping routine traffic out of `info` output.
#[must_use]
pub fn level_for(code: Code) -> Severity {
    match code {
        Code::Ok => Severity::Debug,
        other => default_level_for(other),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn ok_is_quieter_than_default() {
        assert_eq!(default_level_for(Code::Ok), Severity::Info);
        assert_eq!(level_for(Code::Ok), Severity::Debug);
    }

    #[test]
    fn standard_table() {
        assert_eq!(level_for(Code::NotFound), Severity::Info);
        assert_eq!(level_for(Code::Unauthenticated), Severity::Info);
        assert_eq!(level_for(Code::Cancelled), Severity::Info);
        assert_eq!(level_for(Code::DeadlineExceeded), Severity::Warn);
        assert_eq!(level_for(Code::Unavailable), Severity::Warn);
        assert_eq!(level_for(Code::Internal), Severity::Error);
        assert_eq!(level_for(Code::Unimplemented), Severity::Error);
        assert_eq!(level_for(Code::DataLoss), Severity::Error);
    }

    #[test]
    fn converts_to_tracing_level() {
        assert_eq!(tracing::Level::from(Severity::Debug), tracing::Level::DEBUG);
        assert_eq!(tracing::Level::from(Severity::Error), tracing::Level::ERROR);
    }

    proptest! {
        #[test]
        fn only_ok_differs_from_default(raw in 0i32..=16) {
            let code = Code::from_i32(raw);
            if code == Code::Ok {
                prop_assert_eq!(level_for(code), Severity::Debug);
            } else {
                prop_assert_eq!(level_for(code), default_level_for(code));
            }
        }

        #[test]
        fn classification_is_deterministic(raw in 0i32..=16) {
            let code = Code::from_i32(raw);
            prop_assert_eq!(level_for(code), level_for(code));
        }
    }
}
