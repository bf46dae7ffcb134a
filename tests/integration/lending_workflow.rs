//! Lending workflow tests against the in-process record store

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use tokio_test::{assert_err, assert_ok};

use elidune_lending::{
    config::WorkflowConfig,
    error::PolicyViolation,
    models::{
        Book, BookId, BorrowRequest, CreateBook, CreateDomain, CreateEdition, CreateReader,
        DomainId, Extension, Loan, Reader, ReaderId,
    },
    policy::{PolicyConfiguration, StaticPolicy},
    repository::MemoryRecordStore,
    services::{Clock, Services},
    AppError, AppResult,
};

/// Clock that only moves when told to
struct TestClock {
    now: Mutex<DateTime<Utc>>,
}

impl TestClock {
    fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

struct Library {
    services: Services,
    store: MemoryRecordStore,
    clock: Arc<TestClock>,
}

impl Library {
    fn new() -> Self {
        Self::with_policy(PolicyConfiguration::default())
    }

    fn with_policy(policy: PolicyConfiguration) -> Self {
        let clock = Arc::new(TestClock {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()),
        });
        let store = MemoryRecordStore::new();
        let services = Services::new(
            Arc::new(store.clone()),
            Arc::new(StaticPolicy::new(policy)),
            clock.clone(),
            &WorkflowConfig::default(),
        );
        Self { services, store, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn domain(&self, name: &str, parent_id: Option<DomainId>) -> DomainId {
        self.services
            .domains
            .create(&CreateDomain { name: name.into(), parent_id })
            .await
            .unwrap()
            .id
    }

    async fn book(&self, title: &str, domains: &[DomainId], total: i32, reading_room: i32) -> Book {
        self.services
            .catalog
            .create_book(&CreateBook {
                title: title.into(),
                edition: CreateEdition {
                    publisher: "Polirom".into(),
                    publication_year: Some(2001),
                    isbn: None,
                    pages: None,
                },
                author_ids: vec![],
                domain_ids: domains.to_vec(),
                total_copies: total,
                reading_room_copies: reading_room,
            })
            .await
            .unwrap()
    }

    async fn books(&self, domain: DomainId, count: usize) -> Vec<BookId> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            ids.push(self.book(&format!("Volume {}", i + 1), &[domain], 3, 0).await.id);
        }
        ids
    }

    async fn reader(&self, is_employee: bool) -> Reader {
        self.services
            .readers
            .create(&CreateReader {
                firstname: "Mircea".into(),
                lastname: if is_employee { "Bibliotecar".into() } else { "Cititor".into() },
                address: None,
                email: Some("mircea@example.org".into()),
                phone: None,
                is_employee,
            })
            .await
            .unwrap()
    }

    async fn borrow(&self, reader_id: ReaderId, book_ids: &[BookId]) -> AppResult<Vec<Loan>> {
        self.services
            .lending
            .borrow(&BorrowRequest {
                reader_id,
                book_ids: book_ids.to_vec(),
                issued_by: None,
            })
            .await
    }

    /// Seed a returned loan that was extended once, `days_ago` days back
    fn past_loan(&self, reader_id: ReaderId, book_id: BookId, days_ago: i64, extension_days: i32) {
        let start = self.now() - Duration::days(days_ago);
        let loan = self.store.import_loan(Loan {
            id: 0,
            book_id,
            reader_id,
            borrow_start: start,
            borrow_end: start + Duration::days(14),
            borrow_end_extended: Some(start + Duration::days(14 + i64::from(extension_days))),
            returned_at: Some(start + Duration::days(20)),
            issued_by: None,
            version: 0,
        });
        self.store.import_extension(Extension {
            id: 0,
            loan_id: loan.id,
            book_id,
            reader_id,
            request_date: start + Duration::days(5),
            extension_days,
        });
    }

    async fn available(&self, book_id: BookId) -> i32 {
        self.services.catalog.get_book(book_id).await.unwrap().available_copies
    }
}

fn violation(err: AppError) -> PolicyViolation {
    match err {
        AppError::PolicyViolation(v) => v,
        other => panic!("expected a policy violation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_three_books_from_one_lone_domain_lack_diversity() {
    let library = Library::new();
    let poetry = library.domain("Poetry", None).await;
    let reader = library.reader(false).await;
    let books = library.books(poetry, 3).await;

    let err = assert_err!(library.borrow(reader.id, &books).await);

    assert_eq!(
        violation(err),
        PolicyViolation::InsufficientDomainDiversity { books: 3, domains: 1 }
    );
    assert!(assert_ok!(library.services.lending.open_loans().await).is_empty());
    for id in books {
        assert_eq!(library.available(id).await, 3);
    }
}

#[tokio::test]
async fn test_two_leaves_under_one_root_are_diverse() {
    let library = Library::new();
    let literature = library.domain("Literature", None).await;
    let novel = library.domain("Novel", Some(literature)).await;
    let drama = library.domain("Drama", Some(literature)).await;
    let reader = library.reader(false).await;

    let mut books = library.books(novel, 2).await;
    books.extend(library.books(drama, 1).await);

    let loans = assert_ok!(library.borrow(reader.id, &books).await);

    assert_eq!(loans.len(), 3);
    for loan in &loans {
        assert_eq!(loan.borrow_end, library.now() + Duration::days(14));
        assert_eq!(library.available(loan.book_id).await, 2);
    }
}

#[tokio::test]
async fn test_staff_session_cap_is_double() {
    let library = Library::new();
    let history = library.domain("History", None).await;
    let geography = library.domain("Geography", None).await;
    let regular = library.reader(false).await;
    let staff = library.reader(true).await;

    let mut books = library.books(history, 5).await;
    books.extend(library.books(geography, 5).await);

    let err = assert_err!(library.borrow(regular.id, &books[..6]).await);
    assert_eq!(
        violation(err),
        PolicyViolation::SessionLimitExceeded { requested: 6, max: 5 }
    );

    let loans = assert_ok!(library.borrow(staff.id, &books).await);
    assert_eq!(loans.len(), 10);
}

#[tokio::test]
async fn test_rejected_request_has_no_side_effects() {
    let library = Library::new();
    let art = library.domain("Art", None).await;
    let reader = library.reader(false).await;
    let lendable = library.book("Istoria artei", &[art], 4, 1).await;
    let reference = library.book("Atlas", &[art], 2, 2).await;

    let err = assert_err!(library.borrow(reader.id, &[lendable.id, reference.id]).await);

    assert_eq!(
        violation(err),
        PolicyViolation::NotBorrowable { book_id: reference.id }
    );
    assert_eq!(library.available(lendable.id).await, 3);
    assert!(assert_ok!(library.services.lending.open_loans_for_reader(reader.id).await).is_empty());
}

#[tokio::test]
async fn test_last_copy_goes_to_one_reader() {
    let library = Library::new();
    let art = library.domain("Art", None).await;
    let first = library.reader(false).await;
    let second = library.reader(false).await;
    let book = library.book("Unicat", &[art], 1, 0).await;

    let ids = [book.id];
    let (a, b) = tokio::join!(
        library.borrow(first.id, &ids),
        library.borrow(second.id, &ids)
    );

    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    let err = if a.is_ok() { b.unwrap_err() } else { a.unwrap_err() };
    assert_eq!(
        violation(err),
        PolicyViolation::NoAvailableCopies { book_id: book.id, available: 0, required: 1 }
    );
    assert_eq!(library.available(book.id).await, 0);
}

#[tokio::test]
async fn test_extensions_stack_on_due_date() {
    let library = Library::new();
    let music = library.domain("Music", None).await;
    let reader = library.reader(false).await;
    let book = library.book("Partituri", &[music], 3, 0).await;
    let loan = assert_ok!(library.borrow(reader.id, &[book.id]).await).remove(0);
    let due = loan.borrow_end;

    library.clock.advance(Duration::days(2));
    let loan = assert_ok!(library.services.lending.extend(loan.id, 5).await);
    assert_eq!(loan.borrow_end, due);
    assert_eq!(loan.borrow_end_extended, Some(due + Duration::days(5)));

    library.clock.advance(Duration::days(3));
    let loan = assert_ok!(library.services.lending.extend(loan.id, 7).await);
    assert_eq!(loan.borrow_end_extended, Some(due + Duration::days(12)));

    let reader = assert_ok!(library.services.readers.get(reader.id).await);
    assert_eq!(reader.number_of_extensions, 2);
    let extensions = assert_ok!(library.services.lending.loan_extensions(loan.id).await);
    assert_eq!(
        extensions.iter().map(|e| e.extension_days).collect::<Vec<_>>(),
        vec![5, 7]
    );

    // 12 of 14 days used this quarter
    let err = assert_err!(library.services.lending.extend(loan.id, 3).await);
    assert_eq!(
        violation(err),
        PolicyViolation::ExtensionLimitExceeded { used: 12, requested: 3, max: 14 }
    );
    let unchanged = assert_ok!(library.services.lending.open_loans().await).remove(0);
    assert_eq!(unchanged.borrow_end_extended, Some(due + Duration::days(12)));
}

#[tokio::test]
async fn test_extension_days_leave_the_window_after_three_months() {
    let library = Library::new();
    let music = library.domain("Music", None).await;
    let reader = library.reader(false).await;
    let old_book = library.book("Rapsodii", &[music], 3, 0).await;
    let book = library.book("Partituri", &[music], 3, 0).await;

    // extended 145 days ago, outside the quarter
    library.past_loan(reader.id, old_book.id, 150, 10);
    // extended 88 days ago, just inside
    library.past_loan(reader.id, old_book.id, 93, 5);

    let loan = assert_ok!(library.borrow(reader.id, &[book.id]).await).remove(0);
    let err = assert_err!(library.services.lending.extend(loan.id, 10).await);
    assert_eq!(
        violation(err),
        PolicyViolation::ExtensionLimitExceeded { used: 5, requested: 10, max: 14 }
    );
    assert_ok!(library.services.lending.extend(loan.id, 9).await);

    // a few days on the 5 day extension ages out, today's 9 still count
    library.clock.advance(Duration::days(5));
    let loan = assert_ok!(library.services.lending.open_loans_for_reader(reader.id).await).remove(0);
    let err = assert_err!(library.services.lending.extend(loan.id, 6).await);
    assert_eq!(
        violation(err),
        PolicyViolation::ExtensionLimitExceeded { used: 9, requested: 6, max: 14 }
    );
    assert_ok!(library.services.lending.extend(loan.id, 5).await);
}

#[tokio::test]
async fn test_staff_extension_allowance_is_double() {
    let library = Library::new();
    let music = library.domain("Music", None).await;
    let staff = library.reader(true).await;
    let old_book = library.book("Opere", &[music], 3, 0).await;
    let book = library.book("Lieduri", &[music], 3, 0).await;
    library.past_loan(staff.id, old_book.id, 120, 30);

    let loan = assert_ok!(library.borrow(staff.id, &[book.id]).await).remove(0);
    let loan = assert_ok!(library.services.lending.extend(loan.id, 20).await);
    let loan = assert_ok!(library.services.lending.extend(loan.id, 8).await);
    assert_eq!(
        loan.borrow_end_extended,
        Some(loan.borrow_end + Duration::days(28))
    );

    let err = assert_err!(library.services.lending.extend(loan.id, 1).await);
    assert_eq!(
        violation(err),
        PolicyViolation::ExtensionLimitExceeded { used: 28, requested: 1, max: 28 }
    );
}

#[tokio::test]
async fn test_overdue_loan_cannot_be_extended() {
    let library = Library::new();
    let music = library.domain("Music", None).await;
    let reader = library.reader(false).await;
    let book = library.book("Simfonii", &[music], 3, 0).await;
    let loan = assert_ok!(library.borrow(reader.id, &[book.id]).await).remove(0);

    library.clock.advance(Duration::days(14));

    let err = assert_err!(library.services.lending.extend(loan.id, 1).await);
    assert_eq!(violation(err), PolicyViolation::LoanOverdue { loan_id: loan.id });
    let overdue = assert_ok!(library.services.lending.overdue_loans().await);
    assert_eq!(overdue.len(), 1);
    assert_eq!(overdue[0].id, loan.id);
}

#[tokio::test]
async fn test_return_restores_one_copy() {
    let library = Library::new();
    let science = library.domain("Science", None).await;
    let reader = library.reader(false).await;
    let book = library.book("Cosmos", &[science], 5, 1).await;
    assert_ok!(library.borrow(reader.id, &[book.id]).await);
    assert_eq!(library.available(book.id).await, 3);

    library.clock.advance(Duration::days(3));
    let closed = assert_ok!(library.services.lending.return_book(reader.id, book.id).await);

    assert_eq!(closed.returned_at, Some(library.now()));
    assert_eq!(library.available(book.id).await, 4);
    assert!(assert_ok!(library.services.lending.open_loans_for_reader(reader.id).await).is_empty());

    let err = assert_err!(library.services.lending.return_book(reader.id, book.id).await);
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(library.available(book.id).await, 4);

    // closed loans cannot be extended
    let err = assert_err!(library.services.lending.extend(closed.id, 2).await);
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_reborrow_cooldown_halved_for_staff() {
    let library = Library::new();
    let law = library.domain("Law", None).await;
    let regular = library.reader(false).await;
    let staff = library.reader(true).await;
    let book = library.book("Codul civil", &[law], 6, 0).await;

    for reader in [&regular, &staff] {
        assert_ok!(library.borrow(reader.id, &[book.id]).await);
        assert_ok!(library.services.lending.return_book(reader.id, book.id).await);
    }

    let err = assert_err!(library.borrow(regular.id, &[book.id]).await);
    assert_eq!(
        violation(err),
        PolicyViolation::RecentlyBorrowed { book_id: book.id, cooldown_days: 14 }
    );

    library.clock.advance(Duration::days(8));
    assert_ok!(library.borrow(staff.id, &[book.id]).await);
    assert_err!(library.borrow(regular.id, &[book.id]).await);

    library.clock.advance(Duration::days(7));
    assert_ok!(library.borrow(regular.id, &[book.id]).await);
}

#[tokio::test]
async fn test_book_already_held_or_repeated() {
    let library = Library::new();
    let law = library.domain("Law", None).await;
    let reader = library.reader(false).await;
    let held = library.book("Constitutia", &[law], 4, 0).await;
    let other = library.book("Codul penal", &[law], 4, 0).await;
    assert_ok!(library.borrow(reader.id, &[held.id]).await);

    let err = assert_err!(library.borrow(reader.id, &[other.id, held.id]).await);
    assert_eq!(violation(err), PolicyViolation::AlreadyBorrowed { book_id: held.id });

    let err = assert_err!(library.borrow(reader.id, &[other.id, other.id]).await);
    assert_eq!(violation(err), PolicyViolation::DuplicateInRequest { book_id: other.id });
}

#[tokio::test]
async fn test_daily_then_period_limit() {
    let library = Library::new();
    let [a, b, c, d] = [
        library.domain("Philosophy", None).await,
        library.domain("Religion", None).await,
        library.domain("Economics", None).await,
        library.domain("Sport", None).await,
    ];
    let reader = library.reader(false).await;
    let a_books = library.books(a, 3).await;
    let b_books = library.books(b, 3).await;
    let c_books = library.books(c, 3).await;
    let d_books = library.books(d, 2).await;

    assert_ok!(library.borrow(reader.id, &[a_books[0], b_books[0], c_books[0]]).await);
    assert_ok!(library.borrow(reader.id, &[a_books[1], b_books[1], c_books[1]]).await);
    let err = assert_err!(library.borrow(reader.id, &[a_books[2]]).await);
    assert_eq!(
        violation(err),
        PolicyViolation::DailyLimitExceeded { existing: 6, requested: 1, max: 6 }
    );

    library.clock.advance(Duration::days(1));
    assert_ok!(library.borrow(reader.id, &[a_books[2], b_books[2]]).await);
    assert_ok!(library.borrow(reader.id, &[c_books[2], d_books[0]]).await);
    let err = assert_err!(library.borrow(reader.id, &[d_books[1]]).await);
    assert_eq!(
        violation(err),
        PolicyViolation::PeriodLimitExceeded { existing: 10, requested: 1, max: 10, period_days: 30 }
    );
}

#[tokio::test]
async fn test_domain_window_counts_ancestors() {
    let library = Library::new();
    let science = library.domain("Science", None).await;
    let physics = library.domain("Physics", Some(science)).await;
    let chemistry = library.domain("Chemistry", Some(science)).await;
    let reader = library.reader(false).await;
    let physics_books = library.books(physics, 2).await;
    let chemistry_books = library.books(chemistry, 2).await;

    assert_ok!(library.borrow(reader.id, &physics_books).await);
    library.clock.advance(Duration::days(1));
    assert_ok!(library.borrow(reader.id, &chemistry_books[..1]).await);

    library.clock.advance(Duration::days(1));
    let err = assert_err!(library.borrow(reader.id, &chemistry_books[1..]).await);
    assert_eq!(
        violation(err),
        PolicyViolation::DomainLimitExceeded {
            domain_id: science,
            existing: 3,
            requested: 1,
            max: 3,
            window_months: 3,
        }
    );

    library.clock.advance(Duration::days(92));
    assert_ok!(library.borrow(reader.id, &chemistry_books[1..]).await);
}

#[tokio::test]
async fn test_staff_desk_cap() {
    let mut policy = PolicyConfiguration::default();
    policy.staff_daily_lending_cap = 3;
    let library = Library::with_policy(policy);
    let tech = library.domain("Technology", None).await;
    let staff = library.reader(true).await;
    let first = library.reader(false).await;
    let second = library.reader(false).await;
    let books = library.books(tech, 2).await;

    let issue = |reader_id, issued_by| BorrowRequest {
        reader_id,
        book_ids: books.clone(),
        issued_by: Some(issued_by),
    };

    let loans = assert_ok!(library.services.lending.borrow(&issue(first.id, staff.id)).await);
    assert!(loans.iter().all(|l| l.issued_by == Some(staff.id)));

    let err = assert_err!(library.services.lending.borrow(&issue(second.id, staff.id)).await);
    assert_eq!(
        violation(err),
        PolicyViolation::StaffLendingCapExceeded { staff_id: staff.id, issued: 2, requested: 2, max: 3 }
    );

    let err = assert_err!(library.services.lending.borrow(&issue(second.id, first.id)).await);
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_unknown_entities_and_empty_requests() {
    let library = Library::new();
    let tech = library.domain("Technology", None).await;
    let reader = library.reader(false).await;
    let book = library.book("Retele", &[tech], 3, 0).await;

    assert!(matches!(library.borrow(reader.id, &[]).await, Err(AppError::Validation(_))));
    assert!(matches!(library.borrow(9999, &[book.id]).await, Err(AppError::NotFound(_))));
    assert!(matches!(library.borrow(reader.id, &[9999]).await, Err(AppError::NotFound(_))));
    assert!(matches!(
        library.services.lending.open_loans_for_reader(9999).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_lent_books_and_readers_cannot_be_deleted() {
    let library = Library::new();
    let tech = library.domain("Technology", None).await;
    let reader = library.reader(false).await;
    let book = library.book("Compilatoare", &[tech], 3, 0).await;
    assert_ok!(library.borrow(reader.id, &[book.id]).await);
    assert_ok!(library.services.lending.return_book(reader.id, book.id).await);

    assert_err!(library.services.catalog.delete_book(book.id).await);
    assert_err!(library.services.readers.delete(reader.id).await);
    assert_err!(library.services.domains.delete(tech).await);
}
