//! Server lifecycle and shutdown control.

pub mod module;
pub mod shutdown;

pub use module::{run, shutdown_signal, GrpcServer};
pub use shutdown::*;
