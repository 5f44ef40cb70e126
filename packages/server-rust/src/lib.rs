//! reqlog server: gRPC interceptor chain with per-call tags, structured
//! call logging and graceful shutdown, demonstrated on a ToDo service.

pub mod config;
pub mod generated;
pub mod interceptor;
pub mod network;
pub mod telemetry;
pub mod todo;

pub use config::{ConfigError, LogConfig, LogFormat, ServerConfig};
pub use interceptor::{build_pipeline, InterceptorConfig, Pipeline};
pub use network::{GrpcServer, HealthState, ShutdownController};
