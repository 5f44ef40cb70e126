//! Storage behind the ToDo service.
//!
//! [`ToDoRepository`] is the seam between the gRPC handlers and wherever the
//! items live. [`InMemoryRepository`] keeps them in a `DashMap` for the
//! lifetime of the process.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tonic::Status;

use crate::generated::v1::ToDo;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("ToDo with id {0} not found")]
    NotFound(i64),
    #[error("ToDo title must not be empty")]
    EmptyTitle,
}

impl From<RepositoryError> for Status {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(_) => Status::not_found(err.to_string()),
            RepositoryError::EmptyTitle => Status::invalid_argument(err.to_string()),
        }
    }
}

/// CRUD over ToDo items.
///
/// Used as `Arc<dyn ToDoRepository>` or as a generic parameter.
#[async_trait]
pub trait ToDoRepository: Send + Sync + 'static {
    /// Stores a new item and returns its assigned id. The id in `item` is
    /// ignored.
    async fn create(&self, item: ToDo) -> Result<i64, RepositoryError>;

    async fn read(&self, id: i64) -> Result<ToDo, RepositoryError>;

    /// Replaces the item with the same id. Returns the number of rows
    /// changed.
    async fn update(&self, item: ToDo) -> Result<i64, RepositoryError>;

    /// Returns the number of rows removed.
    async fn delete(&self, id: i64) -> Result<i64, RepositoryError>;

    /// All items, ordered by id.
    async fn read_all(&self) -> Result<Vec<ToDo>, RepositoryError>;
}

/// `DashMap`-backed repository with sequential ids starting at 1.
#[derive(Debug)]
pub struct InMemoryRepository {
    items: DashMap<i64, ToDo>,
    next_id: AtomicI64,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToDoRepository for InMemoryRepository {
    async fn create(&self, mut item: ToDo) -> Result<i64, RepositoryError> {
        if item.title.is_empty() {
            return Err(RepositoryError::EmptyTitle);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        item.id = id;
        self.items.insert(id, item);
        Ok(id)
    }

    async fn read(&self, id: i64) -> Result<ToDo, RepositoryError> {
        self.items
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn update(&self, item: ToDo) -> Result<i64, RepositoryError> {
        if item.title.is_empty() {
            return Err(RepositoryError::EmptyTitle);
        }
        match self.items.get_mut(&item.id) {
            Some(mut entry) => {
                *entry = item;
                Ok(1)
            }
            None => Err(RepositoryError::NotFound(item.id)),
        }
    }

    async fn delete(&self, id: i64) -> Result<i64, RepositoryError> {
        self.items
            .remove(&id)
            .map(|_| 1)
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn read_all(&self) -> Result<Vec<ToDo>, RepositoryError> {
        let mut all: Vec<ToDo> = self.items.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by_key(|item| item.id);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use tonic::Code;

    use super::*;

    fn item(title: &str) -> ToDo {
        ToDo {
            id: 0,
            title: title.to_string(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids() {
        let repo = InMemoryRepository::new();
        let first = repo.create(item("a")).await.unwrap();
        let second = repo.create(item("b")).await.unwrap();
        assert!(second > first);
        assert_eq!(repo.read(first).await.unwrap().title, "a");
    }

    #[tokio::test]
    async fn empty_title_is_rejected() {
        let repo = InMemoryRepository::new();
        assert_eq!(
            repo.create(item("")).await.unwrap_err(),
            RepositoryError::EmptyTitle
        );
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn update_replaces_existing_item() {
        let repo = InMemoryRepository::new();
        let id = repo.create(item("old")).await.unwrap();

        let mut updated = item("new");
        updated.id = id;
        assert_eq!(repo.update(updated).await.unwrap(), 1);
        assert_eq!(repo.read(id).await.unwrap().title, "new");
    }

    #[tokio::test]
    async fn missing_ids_are_not_found() {
        let repo = InMemoryRepository::new();
        assert_eq!(repo.read(42).await.unwrap_err(), RepositoryError::NotFound(42));
        assert_eq!(repo.delete(42).await.unwrap_err(), RepositoryError::NotFound(42));

        let mut ghost = item("ghost");
        ghost.id = 42;
        assert_eq!(repo.update(ghost).await.unwrap_err(), RepositoryError::NotFound(42));
    }

    #[tokio::test]
    async fn delete_then_read_all() {
        let repo = InMemoryRepository::new();
        let a = repo.create(item("a")).await.unwrap();
        let b = repo.create(item("b")).await.unwrap();
        let c = repo.create(item("c")).await.unwrap();

        assert_eq!(repo.delete(b).await.unwrap(), 1);
        let ids: Vec<i64> = repo.read_all().await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(Status::from(RepositoryError::NotFound(1)).code(), Code::NotFound);
        assert_eq!(
            Status::from(RepositoryError::EmptyTitle).code(),
            Code::InvalidArgument
        );
    }
}
