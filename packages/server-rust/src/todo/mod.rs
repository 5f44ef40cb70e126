//! ToDo demo service: the business handlers the interceptor pipeline wraps.

pub mod messages;
pub mod repository;
pub mod service;

pub use repository::{InMemoryRepository, RepositoryError, ToDoRepository};
pub use service::{routes, ToDoServer, API_VERSION};
