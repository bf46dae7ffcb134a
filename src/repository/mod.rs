//! Record store port
//!
//! The lending engine never issues raw queries. Everything it reads or
//! writes goes through [`RecordStore`], so any storage technology can back
//! it. Two backends ship with the crate: Postgres for production and an
//! in-process store for tests and embedding.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};

use crate::{
    error::AppResult,
    models::{
        Author, Book, BookId, CreateAuthor, CreateBook, CreateDomain, CreateReader, Domain,
        DomainId, Extension, Loan, LoanId, Reader, ReaderId, UpdateCopies,
    },
};

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

/// Closed time interval `[from, to]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// From midnight (UTC) of `now`'s day up to `now`
    pub fn today(now: DateTime<Utc>) -> Self {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);
        Self::new(midnight, now)
    }

    /// The last `days` days up to `now`
    pub fn trailing_days(now: DateTime<Utc>, days: u32) -> Self {
        Self::new(now - Duration::days(i64::from(days)), now)
    }

    /// The last `months` calendar months up to `now`
    pub fn trailing_months(now: DateTime<Utc>, months: u32) -> Self {
        let from = now
            .checked_sub_months(Months::new(months))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self::new(from, now)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at <= self.to
    }

    /// True if an interval starting at `start` and still running or ended at
    /// `end` overlaps this window
    pub fn overlaps(&self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> bool {
        start <= self.to && end.map(|e| e >= self.from).unwrap_or(true)
    }
}

/// Id plus the version the caller observed it at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Versioned<I> {
    pub id: I,
    pub version: i32,
}

/// Loan to be created by a borrow commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLoan {
    pub book_id: BookId,
    pub borrow_start: DateTime<Utc>,
    pub borrow_end: DateTime<Utc>,
    pub issued_by: Option<ReaderId>,
}

/// Everything a successful borrow writes, applied atomically.
///
/// Fails with `Conflict` if the reader or any book changed since the
/// versions recorded here were read.
#[derive(Debug, Clone)]
pub struct BorrowCommit {
    pub reader: Versioned<ReaderId>,
    pub books: Vec<Versioned<BookId>>,
    pub loans: Vec<NewLoan>,
}

/// Everything a granted extension writes, applied atomically
#[derive(Debug, Clone)]
pub struct ExtensionCommit {
    pub loan: Versioned<LoanId>,
    pub reader: Versioned<ReaderId>,
    pub new_end: DateTime<Utc>,
    pub request_date: DateTime<Utc>,
    pub extension_days: i32,
}

/// Closing of an open loan
#[derive(Debug, Clone)]
pub struct ReturnCommit {
    pub loan: Versioned<LoanId>,
    pub book_id: BookId,
    pub reader_id: ReaderId,
    pub returned_at: DateTime<Utc>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    // Domains

    async fn create_domain(&self, data: &CreateDomain) -> AppResult<Domain>;

    async fn get_domain(&self, id: DomainId) -> AppResult<Domain>;

    async fn list_domains(&self) -> AppResult<Vec<Domain>>;

    async fn rename_domain(&self, id: DomainId, name: &str) -> AppResult<Domain>;

    /// Re-parent a domain. The cycle check and the check that no book ends
    /// up filed under two related domains run inside the store's atomic unit.
    async fn set_domain_parent(&self, id: DomainId, parent: Option<DomainId>) -> AppResult<Domain>;

    /// Delete a domain that has neither subdomains nor books
    async fn delete_domain(&self, id: DomainId) -> AppResult<()>;

    async fn count_books_in_domain(&self, id: DomainId) -> AppResult<i64>;

    async fn domain_descendants(&self, id: DomainId) -> AppResult<Vec<DomainId>>;

    async fn domain_is_ancestor(&self, ancestor: DomainId, of: DomainId) -> AppResult<bool>;

    // Catalog

    async fn create_author(&self, data: &CreateAuthor) -> AppResult<Author>;

    async fn get_author(&self, id: i32) -> AppResult<Author>;

    /// Insert a book. The domain set is checked against the hierarchy, at
    /// most `max_domains` and pairwise unrelated, in the same atomic unit as
    /// the write.
    async fn create_book(&self, data: &CreateBook, max_domains: u32) -> AppResult<Book>;

    async fn get_book(&self, id: BookId) -> AppResult<Book>;

    async fn list_books(&self) -> AppResult<Vec<Book>>;

    /// Replace the domain set of a book, checked like `create_book`
    async fn set_book_domains(
        &self,
        id: BookId,
        domains: &[DomainId],
        max_domains: u32,
    ) -> AppResult<Book>;

    /// Change copy counts, shifting `available_copies` by the change in borrowable fund
    async fn update_book_copies(&self, id: BookId, copies: UpdateCopies) -> AppResult<Book>;

    async fn delete_book(&self, id: BookId) -> AppResult<()>;

    // Readers

    async fn create_reader(&self, data: &CreateReader) -> AppResult<Reader>;

    async fn get_reader(&self, id: ReaderId) -> AppResult<Reader>;

    /// Persist identity, contact and role fields; counters are left alone.
    /// `Conflict` when `reader.version` is stale.
    async fn update_reader(&self, reader: &Reader) -> AppResult<Reader>;

    async fn delete_reader(&self, id: ReaderId) -> AppResult<()>;

    // Loan history

    async fn get_loan(&self, id: LoanId) -> AppResult<Loan>;

    async fn find_open_loan(&self, reader_id: ReaderId, book_id: BookId) -> AppResult<Option<Loan>>;

    /// Open loans, of one reader or of everybody
    async fn open_loans(&self, reader_id: Option<ReaderId>) -> AppResult<Vec<Loan>>;

    /// Loans the reader started within `window`
    async fn loans_by_reader(&self, reader_id: ReaderId, window: TimeWindow) -> AppResult<Vec<Loan>>;

    /// Loans of `book_id` the reader held at any point of `window`
    async fn loans_held_by_reader(
        &self,
        reader_id: ReaderId,
        book_id: BookId,
        window: TimeWindow,
    ) -> AppResult<Vec<Loan>>;

    /// Loans started within `window` of books in `domain_id` or any domain below it
    async fn loans_by_reader_in_domain(
        &self,
        reader_id: ReaderId,
        domain_id: DomainId,
        window: TimeWindow,
    ) -> AppResult<Vec<Loan>>;

    /// Loans a staff member issued within `window`
    async fn loans_issued_by(&self, staff_id: ReaderId, window: TimeWindow) -> AppResult<Vec<Loan>>;

    /// Extensions the reader requested within `window`
    async fn extensions_by_reader(
        &self,
        reader_id: ReaderId,
        window: TimeWindow,
    ) -> AppResult<Vec<Extension>>;

    async fn extensions_for_loan(&self, loan_id: LoanId) -> AppResult<Vec<Extension>>;

    // Commits

    async fn commit_borrow(&self, commit: &BorrowCommit) -> AppResult<Vec<Loan>>;

    async fn commit_extension(&self, commit: &ExtensionCommit) -> AppResult<(Loan, Extension)>;

    async fn commit_return(&self, commit: &ReturnCommit) -> AppResult<Loan>;
}
