//! Loan (borrowed book) and extension models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{BookId, LoanId, ReaderId};

/// Shortest and longest single extension, in days
pub const MIN_EXTENSION_DAYS: u32 = 1;
pub const MAX_EXTENSION_DAYS: u32 = 90;

/// Lifecycle of a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanState {
    Open,
    Closed,
}

/// Loan of one book to one reader.
///
/// At most one open loan exists per (book, reader). Returned loans are
/// kept with `returned_at` set so the history windows can still see them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Loan {
    pub id: LoanId,
    pub book_id: BookId,
    pub reader_id: ReaderId,
    pub borrow_start: DateTime<Utc>,
    pub borrow_end: DateTime<Utc>,
    pub borrow_end_extended: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
    /// Staff member who issued the loan at the desk
    pub issued_by: Option<ReaderId>,
    pub version: i32,
}

impl Loan {
    pub fn state(&self) -> LoanState {
        if self.returned_at.is_some() {
            LoanState::Closed
        } else {
            LoanState::Open
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == LoanState::Open
    }

    /// Due date, taking extensions into account
    pub fn effective_end(&self) -> DateTime<Utc> {
        self.borrow_end_extended.unwrap_or(self.borrow_end)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && now >= self.effective_end()
    }
}

/// Immutable record of one granted extension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Extension {
    pub id: i32,
    pub loan_id: LoanId,
    pub book_id: BookId,
    pub reader_id: ReaderId,
    pub request_date: DateTime<Utc>,
    pub extension_days: i32,
}

/// Borrow request: one reader, a set of candidate books
#[derive(Debug, Clone, Deserialize)]
pub struct BorrowRequest {
    pub reader_id: ReaderId,
    pub book_ids: Vec<BookId>,
    /// Staff member processing the request, if done at the desk
    #[serde(default)]
    pub issued_by: Option<ReaderId>,
}
