//! Catalog management service

use std::sync::Arc;

use validator::Validate;

use crate::{
    error::{AppError, AppResult},
    models::{Author, Book, BookId, CreateAuthor, CreateBook, DomainId, UpdateCopies},
    policy::PolicyProvider,
    repository::RecordStore,
};

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn RecordStore>,
    policy: Arc<dyn PolicyProvider>,
}

impl CatalogService {
    pub fn new(store: Arc<dyn RecordStore>, policy: Arc<dyn PolicyProvider>) -> Self {
        Self { store, policy }
    }

    pub async fn create_author(&self, data: &CreateAuthor) -> AppResult<Author> {
        data.validate()?;
        let author = self.store.create_author(data).await?;
        tracing::info!("Author {} created: {}", author.id, author.lastname);
        Ok(author)
    }

    pub async fn get_author(&self, id: i32) -> AppResult<Author> {
        self.store.get_author(id).await
    }

    /// Register a title with its copy counters. All copies start on the shelf.
    pub async fn create_book(&self, data: &CreateBook) -> AppResult<Book> {
        data.validate()?;
        let book = self.store.create_book(data, self.max_domains()).await?;
        tracing::info!(
            "Book {} created: {} ({} copies, {} reading room)",
            book.id,
            book.title,
            book.total_copies,
            book.reading_room_copies
        );
        Ok(book)
    }

    pub async fn get_book(&self, id: BookId) -> AppResult<Book> {
        self.store.get_book(id).await
    }

    pub async fn list_books(&self) -> AppResult<Vec<Book>> {
        self.store.list_books().await
    }

    /// Replace the domain set of a book
    pub async fn set_book_domains(&self, id: BookId, domains: &[DomainId]) -> AppResult<Book> {
        let book = self
            .store
            .set_book_domains(id, domains, self.max_domains())
            .await?;
        tracing::info!("Book {} now filed under {:?}", id, book.domain_ids);
        Ok(book)
    }

    /// Change the copy counters. Copies currently on loan stay on loan.
    pub async fn update_copies(&self, id: BookId, copies: UpdateCopies) -> AppResult<Book> {
        if copies.total_copies < 0 || copies.reading_room_copies < 0 {
            return Err(AppError::Validation("Copy counts cannot be negative".to_string()));
        }
        if copies.reading_room_copies > copies.total_copies {
            return Err(AppError::Validation(format!(
                "Reading room copies ({}) exceed total copies ({})",
                copies.reading_room_copies, copies.total_copies
            )));
        }
        let book = self.store.update_book_copies(id, copies).await?;
        tracing::info!(
            "Book {} copies updated: {} total, {} reading room, {} available",
            id,
            book.total_copies,
            book.reading_room_copies,
            book.available_copies
        );
        Ok(book)
    }

    /// Remove a book that was never lent
    pub async fn delete_book(&self, id: BookId) -> AppResult<()> {
        self.store.delete_book(id).await?;
        tracing::info!("Book {} deleted", id);
        Ok(())
    }

    fn max_domains(&self) -> u32 {
        self.policy.configuration().max_domains_per_book
    }
}
