//! Book, edition and author models

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::{Validate, ValidationError};

use super::{AuthorId, BookId, DomainId};

/// Author model from database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Author {
    pub id: AuthorId,
    pub firstname: Option<String>,
    pub lastname: String,
}

/// Create author request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAuthor {
    pub firstname: Option<String>,
    #[validate(length(min = 1, message = "Last name is required"))]
    pub lastname: String,
}

/// Edition of a book (one per book)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Edition {
    pub id: i32,
    pub publisher: String,
    pub publication_year: Option<i32>,
    pub isbn: Option<String>,
    pub pages: Option<i32>,
}

/// Edition data supplied with a new book
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateEdition {
    #[validate(length(min = 1, message = "Publisher is required"))]
    pub publisher: String,
    #[validate(range(min = 1400, max = 2200, message = "Publication year out of range"))]
    pub publication_year: Option<i32>,
    #[validate(length(min = 10, max = 17, message = "ISBN must be 10-17 characters"))]
    pub isbn: Option<String>,
    #[validate(range(min = 1, message = "Page count must be positive"))]
    pub pages: Option<i32>,
}

/// Book with its copy counters.
///
/// `reading_room_copies` never leave the building; the rest circulate and
/// `available_copies` of those are on the shelf right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub edition: Edition,
    pub author_ids: Vec<AuthorId>,
    pub domain_ids: Vec<DomainId>,
    pub total_copies: i32,
    pub reading_room_copies: i32,
    pub available_copies: i32,
    /// Bumped whenever the counters change
    pub version: i32,
}

impl Book {
    /// Copies that are not restricted to the reading room
    pub fn borrowable_fund(&self) -> i32 {
        self.total_copies - self.reading_room_copies
    }
}

fn validate_counters(book: &CreateBook) -> Result<(), ValidationError> {
    if book.reading_room_copies > book.total_copies {
        let mut err = ValidationError::new("reading_room_copies");
        err.message = Some("Reading room copies cannot exceed total copies".into());
        return Err(err);
    }
    Ok(())
}

/// Create book request
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_counters"))]
pub struct CreateBook {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(nested)]
    pub edition: CreateEdition,
    #[serde(default)]
    pub author_ids: Vec<AuthorId>,
    #[validate(length(min = 1, message = "A book needs at least one domain"))]
    pub domain_ids: Vec<DomainId>,
    #[validate(range(min = 0, message = "Total copies cannot be negative"))]
    pub total_copies: i32,
    #[validate(range(min = 0, message = "Reading room copies cannot be negative"))]
    pub reading_room_copies: i32,
}

/// New copy counts for an existing book
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UpdateCopies {
    pub total_copies: i32,
    pub reading_room_copies: i32,
}
