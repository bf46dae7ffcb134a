//! Data models for the lending engine

pub mod book;
pub mod domain;
pub mod loan;
pub mod reader;

pub type DomainId = i32;
pub type BookId = i32;
pub type AuthorId = i32;
pub type ReaderId = i32;
pub type LoanId = i32;

// Re-export commonly used types
pub use book::{Author, Book, CreateAuthor, CreateBook, CreateEdition, Edition, UpdateCopies};
pub use domain::{CreateDomain, Domain};
pub use loan::{BorrowRequest, Extension, Loan, LoanState};
pub use reader::{CreateReader, Reader, UpdateReader};
