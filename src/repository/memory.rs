//! In-process record store
//!
//! All state sits behind one `parking_lot::RwLock`. Each commit takes the
//! write lock once, checks versions and applies every write before
//! releasing it, which gives the same all-or-nothing behavior as a
//! database transaction. The lock is never held across an `.await`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{BorrowCommit, ExtensionCommit, RecordStore, ReturnCommit, TimeWindow};
use crate::{
    error::{AppError, AppResult},
    hierarchy::DomainHierarchy,
    models::{
        Author, Book, BookId, CreateAuthor, CreateBook, CreateDomain, CreateReader, Domain,
        DomainId, Edition, Extension, Loan, LoanId, Reader, ReaderId, UpdateCopies,
    },
};

#[derive(Debug, Default)]
struct State {
    domains: BTreeMap<DomainId, Domain>,
    authors: BTreeMap<i32, Author>,
    books: BTreeMap<BookId, Book>,
    readers: BTreeMap<ReaderId, Reader>,
    loans: BTreeMap<LoanId, Loan>,
    extensions: Vec<Extension>,
    last_id: i32,
}

impl State {
    fn next_id(&mut self) -> i32 {
        self.last_id += 1;
        self.last_id
    }

    fn hierarchy(&self) -> DomainHierarchy {
        DomainHierarchy::from_domains(self.domains.values())
    }

    fn domain(&self, id: DomainId) -> AppResult<&Domain> {
        self.domains
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("Domain with id {} not found", id)))
    }

    fn book(&self, id: BookId) -> AppResult<&Book> {
        self.books
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))
    }

    fn reader(&self, id: ReaderId) -> AppResult<&Reader> {
        self.readers
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("Reader with id {} not found", id)))
    }

    fn has_open_loan(&self, pred: impl Fn(&Loan) -> bool) -> bool {
        self.loans.values().any(|l| l.is_open() && pred(l))
    }

    fn has_loan(&self, pred: impl Fn(&Loan) -> bool) -> bool {
        self.loans.values().any(pred)
    }
}

/// Record store kept entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    state: Arc<RwLock<State>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a loan as-is, bypassing the lending rules.
    ///
    /// Used to seed history, e.g. when importing loans from another system.
    pub fn import_loan(&self, mut loan: Loan) -> Loan {
        let mut state = self.state.write();
        if loan.id == 0 {
            loan.id = state.next_id();
        } else {
            state.last_id = state.last_id.max(loan.id);
        }
        state.loans.insert(loan.id, loan.clone());
        loan
    }

    /// Insert a historical extension as-is
    pub fn import_extension(&self, mut extension: Extension) -> Extension {
        let mut state = self.state.write();
        extension.id = state.next_id();
        state.extensions.push(extension.clone());
        extension
    }

    fn sorted(mut loans: Vec<Loan>) -> Vec<Loan> {
        loans.sort_by_key(|l| (l.borrow_start, l.id));
        loans
    }

    fn select_loans(&self, pred: impl Fn(&Loan) -> bool) -> Vec<Loan> {
        let state = self.state.read();
        Self::sorted(state.loans.values().filter(|&l| pred(l)).cloned().collect())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_domain(&self, data: &CreateDomain) -> AppResult<Domain> {
        let mut state = self.state.write();
        if let Some(parent) = data.parent_id {
            state.domain(parent)?;
        }
        let domain = Domain {
            id: state.next_id(),
            name: data.name.clone(),
            parent_id: data.parent_id,
        };
        state.domains.insert(domain.id, domain.clone());
        Ok(domain)
    }

    async fn get_domain(&self, id: DomainId) -> AppResult<Domain> {
        self.state.read().domain(id).cloned()
    }

    async fn list_domains(&self) -> AppResult<Vec<Domain>> {
        Ok(self.state.read().domains.values().cloned().collect())
    }

    async fn rename_domain(&self, id: DomainId, name: &str) -> AppResult<Domain> {
        let mut state = self.state.write();
        state.domain(id)?;
        let domain = state
            .domains
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Domain with id {} not found", id)))?;
        domain.name = name.to_string();
        Ok(domain.clone())
    }

    async fn set_domain_parent(&self, id: DomainId, parent: Option<DomainId>) -> AppResult<Domain> {
        let mut state = self.state.write();
        state.domain(id)?;
        if let Some(parent) = parent {
            state.domain(parent)?;
        }
        state.hierarchy().check_move(
            id,
            parent,
            state.books.values().map(|b| b.domain_ids.as_slice()),
        )?;
        let domain = state
            .domains
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Domain with id {} not found", id)))?;
        domain.parent_id = parent;
        Ok(domain.clone())
    }

    async fn delete_domain(&self, id: DomainId) -> AppResult<()> {
        let mut state = self.state.write();
        state.domain(id)?;
        let books = state
            .books
            .values()
            .filter(|b| b.domain_ids.contains(&id))
            .count() as i64;
        state.hierarchy().check_delete(id, books)?;
        state.domains.remove(&id);
        Ok(())
    }

    async fn count_books_in_domain(&self, id: DomainId) -> AppResult<i64> {
        let state = self.state.read();
        state.domain(id)?;
        Ok(state
            .books
            .values()
            .filter(|b| b.domain_ids.contains(&id))
            .count() as i64)
    }

    async fn domain_descendants(&self, id: DomainId) -> AppResult<Vec<DomainId>> {
        Ok(self.state.read().hierarchy().descendants(id))
    }

    async fn domain_is_ancestor(&self, ancestor: DomainId, of: DomainId) -> AppResult<bool> {
        Ok(self.state.read().hierarchy().is_ancestor(ancestor, of)?)
    }

    async fn create_author(&self, data: &CreateAuthor) -> AppResult<Author> {
        let mut state = self.state.write();
        let author = Author {
            id: state.next_id(),
            firstname: data.firstname.clone(),
            lastname: data.lastname.clone(),
        };
        state.authors.insert(author.id, author.clone());
        Ok(author)
    }

    async fn get_author(&self, id: i32) -> AppResult<Author> {
        self.state
            .read()
            .authors
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Author with id {} not found", id)))
    }

    async fn create_book(&self, data: &CreateBook, max_domains: u32) -> AppResult<Book> {
        let mut state = self.state.write();
        state.hierarchy().check_assignment(&data.domain_ids, max_domains)?;
        for author in &data.author_ids {
            if !state.authors.contains_key(author) {
                return Err(AppError::NotFound(format!("Author with id {} not found", author)));
            }
        }
        let edition = Edition {
            id: state.next_id(),
            publisher: data.edition.publisher.clone(),
            publication_year: data.edition.publication_year,
            isbn: data.edition.isbn.clone(),
            pages: data.edition.pages,
        };
        let book = Book {
            id: state.next_id(),
            title: data.title.clone(),
            edition,
            author_ids: data.author_ids.clone(),
            domain_ids: data.domain_ids.clone(),
            total_copies: data.total_copies,
            reading_room_copies: data.reading_room_copies,
            available_copies: data.total_copies - data.reading_room_copies,
            version: 0,
        };
        state.books.insert(book.id, book.clone());
        Ok(book)
    }

    async fn get_book(&self, id: BookId) -> AppResult<Book> {
        self.state.read().book(id).cloned()
    }

    async fn list_books(&self) -> AppResult<Vec<Book>> {
        Ok(self.state.read().books.values().cloned().collect())
    }

    async fn set_book_domains(
        &self,
        id: BookId,
        domains: &[DomainId],
        max_domains: u32,
    ) -> AppResult<Book> {
        let mut state = self.state.write();
        state.book(id)?;
        state.hierarchy().check_assignment(domains, max_domains)?;
        let book = state
            .books
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))?;
        book.domain_ids = domains.to_vec();
        book.version += 1;
        Ok(book.clone())
    }

    async fn update_book_copies(&self, id: BookId, copies: UpdateCopies) -> AppResult<Book> {
        let mut state = self.state.write();
        let book = state
            .books
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))?;
        let shift = (copies.total_copies - copies.reading_room_copies) - book.borrowable_fund();
        let available = book.available_copies + shift;
        if available < 0 {
            return Err(AppError::Validation(format!(
                "Book {} has {} copies on loan, cannot shrink its fund that far",
                id,
                book.borrowable_fund() - book.available_copies
            )));
        }
        book.total_copies = copies.total_copies;
        book.reading_room_copies = copies.reading_room_copies;
        book.available_copies = available;
        book.version += 1;
        Ok(book.clone())
    }

    async fn delete_book(&self, id: BookId) -> AppResult<()> {
        let mut state = self.state.write();
        state.book(id)?;
        if state.has_loan(|l| l.book_id == id) {
            return Err(AppError::Validation(format!("Book {} has loans on record", id)));
        }
        state.books.remove(&id);
        Ok(())
    }

    async fn create_reader(&self, data: &CreateReader) -> AppResult<Reader> {
        let mut state = self.state.write();
        let reader = Reader {
            id: state.next_id(),
            firstname: data.firstname.clone(),
            lastname: data.lastname.clone(),
            address: data.address.clone(),
            email: data.email.clone(),
            phone: data.phone.clone(),
            is_employee: data.is_employee,
            number_of_extensions: 0,
            version: 0,
        };
        state.readers.insert(reader.id, reader.clone());
        Ok(reader)
    }

    async fn get_reader(&self, id: ReaderId) -> AppResult<Reader> {
        self.state.read().reader(id).cloned()
    }

    async fn update_reader(&self, reader: &Reader) -> AppResult<Reader> {
        let mut state = self.state.write();
        let stored = state
            .readers
            .get_mut(&reader.id)
            .ok_or_else(|| AppError::NotFound(format!("Reader with id {} not found", reader.id)))?;
        if stored.version != reader.version {
            return Err(AppError::Conflict(format!("Reader {} changed concurrently", reader.id)));
        }
        stored.firstname = reader.firstname.clone();
        stored.lastname = reader.lastname.clone();
        stored.address = reader.address.clone();
        stored.email = reader.email.clone();
        stored.phone = reader.phone.clone();
        stored.is_employee = reader.is_employee;
        stored.version += 1;
        Ok(stored.clone())
    }

    async fn delete_reader(&self, id: ReaderId) -> AppResult<()> {
        let mut state = self.state.write();
        state.reader(id)?;
        if state.has_loan(|l| l.reader_id == id || l.issued_by == Some(id)) {
            return Err(AppError::Validation(format!("Reader {} has loans on record", id)));
        }
        state.readers.remove(&id);
        Ok(())
    }

    async fn get_loan(&self, id: LoanId) -> AppResult<Loan> {
        self.state
            .read()
            .loans
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", id)))
    }

    async fn find_open_loan(&self, reader_id: ReaderId, book_id: BookId) -> AppResult<Option<Loan>> {
        Ok(self
            .select_loans(|l| l.is_open() && l.reader_id == reader_id && l.book_id == book_id)
            .into_iter()
            .next())
    }

    async fn open_loans(&self, reader_id: Option<ReaderId>) -> AppResult<Vec<Loan>> {
        Ok(self.select_loans(|l| l.is_open() && reader_id.map_or(true, |r| l.reader_id == r)))
    }

    async fn loans_by_reader(&self, reader_id: ReaderId, window: TimeWindow) -> AppResult<Vec<Loan>> {
        Ok(self.select_loans(|l| l.reader_id == reader_id && window.contains(l.borrow_start)))
    }

    async fn loans_held_by_reader(
        &self,
        reader_id: ReaderId,
        book_id: BookId,
        window: TimeWindow,
    ) -> AppResult<Vec<Loan>> {
        Ok(self.select_loans(|l| {
            l.reader_id == reader_id
                && l.book_id == book_id
                && window.overlaps(l.borrow_start, l.returned_at)
        }))
    }

    async fn loans_by_reader_in_domain(
        &self,
        reader_id: ReaderId,
        domain_id: DomainId,
        window: TimeWindow,
    ) -> AppResult<Vec<Loan>> {
        let state = self.state.read();
        let mut subtree = state.hierarchy().descendants(domain_id);
        subtree.push(domain_id);
        let loans = state
            .loans
            .values()
            .filter(|l| l.reader_id == reader_id && window.contains(l.borrow_start))
            .filter(|l| {
                state
                    .books
                    .get(&l.book_id)
                    .map(|b| b.domain_ids.iter().any(|d| subtree.contains(d)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(Self::sorted(loans))
    }

    async fn loans_issued_by(&self, staff_id: ReaderId, window: TimeWindow) -> AppResult<Vec<Loan>> {
        Ok(self.select_loans(|l| l.issued_by == Some(staff_id) && window.contains(l.borrow_start)))
    }

    async fn extensions_by_reader(
        &self,
        reader_id: ReaderId,
        window: TimeWindow,
    ) -> AppResult<Vec<Extension>> {
        Ok(self
            .state
            .read()
            .extensions
            .iter()
            .filter(|e| e.reader_id == reader_id && window.contains(e.request_date))
            .cloned()
            .collect())
    }

    async fn extensions_for_loan(&self, loan_id: LoanId) -> AppResult<Vec<Extension>> {
        Ok(self
            .state
            .read()
            .extensions
            .iter()
            .filter(|e| e.loan_id == loan_id)
            .cloned()
            .collect())
    }

    async fn commit_borrow(&self, commit: &BorrowCommit) -> AppResult<Vec<Loan>> {
        let mut state = self.state.write();

        let reader = state.reader(commit.reader.id)?;
        if reader.version != commit.reader.version {
            return Err(AppError::Conflict(format!(
                "Reader {} changed during the request",
                commit.reader.id
            )));
        }
        for expected in &commit.books {
            let book = state.book(expected.id)?;
            if book.version != expected.version {
                return Err(AppError::Conflict(format!(
                    "Book {} changed during the request",
                    expected.id
                )));
            }
            if book.available_copies <= 0 {
                return Err(AppError::Conflict(format!(
                    "Book {} has no copy left to lend",
                    expected.id
                )));
            }
        }
        for new in &commit.loans {
            if state.has_open_loan(|l| l.reader_id == commit.reader.id && l.book_id == new.book_id) {
                return Err(AppError::Conflict(format!(
                    "Reader {} already has an open loan for book {}",
                    commit.reader.id, new.book_id
                )));
            }
        }

        // all checks passed, nothing below can fail
        for expected in &commit.books {
            if let Some(book) = state.books.get_mut(&expected.id) {
                book.available_copies -= 1;
                book.version += 1;
            }
        }
        if let Some(reader) = state.readers.get_mut(&commit.reader.id) {
            reader.version += 1;
        }
        let mut created = Vec::with_capacity(commit.loans.len());
        for new in &commit.loans {
            let loan = Loan {
                id: state.next_id(),
                book_id: new.book_id,
                reader_id: commit.reader.id,
                borrow_start: new.borrow_start,
                borrow_end: new.borrow_end,
                borrow_end_extended: None,
                returned_at: None,
                issued_by: new.issued_by,
                version: 0,
            };
            state.loans.insert(loan.id, loan.clone());
            created.push(loan);
        }
        Ok(created)
    }

    async fn commit_extension(&self, commit: &ExtensionCommit) -> AppResult<(Loan, Extension)> {
        let mut state = self.state.write();

        let loan = state
            .loans
            .get(&commit.loan.id)
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", commit.loan.id)))?;
        if !loan.is_open() || loan.version != commit.loan.version {
            return Err(AppError::Conflict(format!(
                "Loan {} changed during the request",
                commit.loan.id
            )));
        }
        if commit.new_end <= loan.borrow_end {
            return Err(AppError::Internal(format!(
                "Extended end of loan {} must be after its original end",
                commit.loan.id
            )));
        }
        let book_id = loan.book_id;
        let reader = state.reader(commit.reader.id)?;
        if reader.version != commit.reader.version {
            return Err(AppError::Conflict(format!(
                "Reader {} changed during the request",
                commit.reader.id
            )));
        }

        let extension = Extension {
            id: state.next_id(),
            loan_id: commit.loan.id,
            book_id,
            reader_id: commit.reader.id,
            request_date: commit.request_date,
            extension_days: commit.extension_days,
        };
        state.extensions.push(extension.clone());
        if let Some(reader) = state.readers.get_mut(&commit.reader.id) {
            reader.number_of_extensions += 1;
            reader.version += 1;
        }
        let loan = state
            .loans
            .get_mut(&commit.loan.id)
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", commit.loan.id)))?;
        loan.borrow_end_extended = Some(commit.new_end);
        loan.version += 1;
        Ok((loan.clone(), extension))
    }

    async fn commit_return(&self, commit: &ReturnCommit) -> AppResult<Loan> {
        let mut state = self.state.write();

        let loan = state
            .loans
            .get(&commit.loan.id)
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", commit.loan.id)))?;
        if !loan.is_open() || loan.version != commit.loan.version {
            return Err(AppError::Conflict(format!(
                "Loan {} changed during the request",
                commit.loan.id
            )));
        }
        let book = state.book(commit.book_id)?;
        if book.available_copies >= book.total_copies {
            return Err(AppError::Internal(format!(
                "Book {} would exceed its total copies",
                commit.book_id
            )));
        }

        if let Some(book) = state.books.get_mut(&commit.book_id) {
            book.available_copies += 1;
            book.version += 1;
        }
        if let Some(reader) = state.readers.get_mut(&commit.reader_id) {
            reader.version += 1;
        }
        let loan = state
            .loans
            .get_mut(&commit.loan.id)
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", commit.loan.id)))?;
        loan.returned_at = Some(commit.returned_at);
        loan.version += 1;
        Ok(loan.clone())
    }
}
