//! Lending workflow: borrow, extend and return
//!
//! Every request reads fresh history, evaluates the rules and hands the
//! resulting writes to the record store as one commit. A commit that lost
//! a race comes back as `Conflict` and the whole request is evaluated
//! again, up to `max_commit_retries` times.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    config::WorkflowConfig,
    error::{AppError, AppResult, InvariantError, PolicyViolation},
    hierarchy::DomainHierarchy,
    models::{
        loan::{MAX_EXTENSION_DAYS, MIN_EXTENSION_DAYS},
        BookId, BorrowRequest, DomainId, Extension, Loan, LoanId, Reader, ReaderId,
    },
    policy::{PolicyProvider, ReaderLimits},
    repository::{
        BorrowCommit, ExtensionCommit, NewLoan, RecordStore, ReturnCommit, TimeWindow, Versioned,
    },
    services::validation::{self, BorrowHistory, Candidate},
};

/// Extensions are summed over this many trailing months
pub const EXTENSION_WINDOW_MONTHS: u32 = 3;

/// Source of the current time for window computations
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone)]
pub struct LendingService {
    store: Arc<dyn RecordStore>,
    policy: Arc<dyn PolicyProvider>,
    clock: Arc<dyn Clock>,
    loan_period: Duration,
    max_commit_retries: u32,
}

impl LendingService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        policy: Arc<dyn PolicyProvider>,
        clock: Arc<dyn Clock>,
        workflow: &WorkflowConfig,
    ) -> Self {
        Self {
            store,
            policy,
            clock,
            loan_period: Duration::days(i64::from(workflow.loan_period_days)),
            max_commit_retries: workflow.max_commit_retries,
        }
    }

    /// Lend every requested book to the reader, or none of them
    #[tracing::instrument(skip(self, request), fields(reader_id = request.reader_id, books = request.book_ids.len()))]
    pub async fn borrow(&self, request: &BorrowRequest) -> AppResult<Vec<Loan>> {
        if request.book_ids.is_empty() {
            return Err(AppError::Validation(
                "A borrow request needs at least one book".to_string(),
            ));
        }
        self.with_retries("borrow", || self.try_borrow(request)).await
    }

    /// Push the due date of an open loan back by `extension_days`
    #[tracing::instrument(skip(self))]
    pub async fn extend(&self, loan_id: LoanId, extension_days: u32) -> AppResult<Loan> {
        if !(MIN_EXTENSION_DAYS..=MAX_EXTENSION_DAYS).contains(&extension_days) {
            return Err(AppError::Validation(format!(
                "Extension must be between {} and {} days, got {}",
                MIN_EXTENSION_DAYS, MAX_EXTENSION_DAYS, extension_days
            )));
        }
        self.with_retries("extend", || self.try_extend(loan_id, extension_days))
            .await
    }

    /// Close the reader's open loan of a book
    #[tracing::instrument(skip(self))]
    pub async fn return_book(&self, reader_id: ReaderId, book_id: BookId) -> AppResult<Loan> {
        self.with_retries("return", || self.try_return(reader_id, book_id))
            .await
    }

    /// Open loans of one reader
    pub async fn open_loans_for_reader(&self, reader_id: ReaderId) -> AppResult<Vec<Loan>> {
        self.store.get_reader(reader_id).await?;
        self.store.open_loans(Some(reader_id)).await
    }

    /// Every open loan
    pub async fn open_loans(&self) -> AppResult<Vec<Loan>> {
        self.store.open_loans(None).await
    }

    /// Open loans past their effective due date
    pub async fn overdue_loans(&self) -> AppResult<Vec<Loan>> {
        let now = self.clock.now();
        let loans = self.store.open_loans(None).await?;
        Ok(loans.into_iter().filter(|l| l.is_overdue(now)).collect())
    }

    /// Extensions granted on a loan, oldest first
    pub async fn loan_extensions(&self, loan_id: LoanId) -> AppResult<Vec<Extension>> {
        self.store.get_loan(loan_id).await?;
        self.store.extensions_for_loan(loan_id).await
    }

    async fn with_retries<T, F, Fut>(&self, operation: &str, mut attempt: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(e) if e.is_retryable() && retries < self.max_commit_retries => {
                    retries += 1;
                    tracing::warn!(
                        "{} lost a commit race, re-validating ({}/{}): {}",
                        operation,
                        retries,
                        self.max_commit_retries,
                        e
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_borrow(&self, request: &BorrowRequest) -> AppResult<Vec<Loan>> {
        let reader = self.store.get_reader(request.reader_id).await?;
        let issuer = match request.issued_by {
            Some(staff_id) => {
                let staff = self.store.get_reader(staff_id).await?;
                if !staff.is_employee {
                    return Err(AppError::Validation(format!(
                        "Reader {} is not a staff member and cannot issue loans",
                        staff_id
                    )));
                }
                Some(staff)
            }
            None => None,
        };

        let mut books = Vec::with_capacity(request.book_ids.len());
        for book_id in &request.book_ids {
            let book = self.store.get_book(*book_id).await?;
            if book.domain_ids.is_empty() {
                return Err(AppError::Validation(format!("Book {} has no domain", book.id)));
            }
            books.push(book);
        }

        let open = self.store.open_loans(Some(reader.id)).await?;
        if let Some(book) = books.iter().find(|b| open.iter().any(|l| l.book_id == b.id)) {
            tracing::warn!("Borrow refused for reader {}: book {} already on loan", reader.id, book.id);
            return Err(PolicyViolation::AlreadyBorrowed { book_id: book.id }.into());
        }

        let now = self.clock.now();
        let limits = self.policy.reader_limits(&reader);
        let hierarchy = DomainHierarchy::from_domains(&self.store.list_domains().await?);

        let candidates = books
            .into_iter()
            .map(|book| {
                let domain_closure = hierarchy.closure(book.domain_ids.iter().copied())?;
                Ok(Candidate { book, domain_closure })
            })
            .collect::<Result<Vec<_>, InvariantError>>()?;

        let history = self.borrow_history(&reader, &candidates, &limits, now).await?;
        tracing::debug!(
            "Reader {} history: {} today, {} in period, per domain {:?}, recently held {:?}",
            reader.id,
            history.loans_today,
            history.loans_in_period,
            history.loans_per_domain,
            history.recently_held
        );

        if let Err(violation) = validation::validate_borrow(&candidates, &limits, &history) {
            tracing::warn!("Borrow refused for reader {}: {}", reader.id, violation);
            return Err(violation.into());
        }

        if let Some(ref staff) = issuer {
            let issued_today = self
                .store
                .loans_issued_by(staff.id, TimeWindow::today(now))
                .await?
                .len();
            let cap = self.policy.configuration().staff_daily_lending_cap;
            if let Err(violation) =
                validation::check_staff_lending_cap(staff.id, issued_today, candidates.len(), cap)
            {
                tracing::warn!("Borrow refused for reader {}: {}", reader.id, violation);
                return Err(violation.into());
            }
        }

        let commit = BorrowCommit {
            reader: Versioned {
                id: reader.id,
                version: reader.version,
            },
            books: candidates
                .iter()
                .map(|c| Versioned {
                    id: c.book.id,
                    version: c.book.version,
                })
                .collect(),
            loans: candidates
                .iter()
                .map(|c| NewLoan {
                    book_id: c.book.id,
                    borrow_start: now,
                    borrow_end: now + self.loan_period,
                    issued_by: issuer.as_ref().map(|s| s.id),
                })
                .collect(),
        };
        let loans = self.store.commit_borrow(&commit).await?;

        tracing::info!(
            "Reader {} borrowed {} book(s), due {}",
            reader.id,
            loans.len(),
            now + self.loan_period
        );
        Ok(loans)
    }

    async fn borrow_history(
        &self,
        reader: &Reader,
        candidates: &[Candidate],
        limits: &ReaderLimits,
        now: DateTime<Utc>,
    ) -> AppResult<BorrowHistory> {
        let loans_today = self
            .store
            .loans_by_reader(reader.id, TimeWindow::today(now))
            .await?
            .len();
        let loans_in_period = self
            .store
            .loans_by_reader(
                reader.id,
                TimeWindow::trailing_days(now, limits.period_length_days),
            )
            .await?
            .len();

        let domain_window = TimeWindow::trailing_months(now, limits.domain_window_months);
        let touched: BTreeSet<DomainId> = candidates
            .iter()
            .flat_map(|c| c.domain_closure.iter().copied())
            .collect();
        let mut loans_per_domain = BTreeMap::new();
        for domain_id in touched {
            let count = self
                .store
                .loans_by_reader_in_domain(reader.id, domain_id, domain_window)
                .await?
                .len();
            loans_per_domain.insert(domain_id, count);
        }

        let cooldown = TimeWindow::trailing_days(now, limits.cooldown_days);
        let mut recently_held = BTreeSet::new();
        for candidate in candidates {
            let held = self
                .store
                .loans_held_by_reader(reader.id, candidate.book.id, cooldown)
                .await?;
            if !held.is_empty() {
                recently_held.insert(candidate.book.id);
            }
        }

        Ok(BorrowHistory {
            loans_today,
            loans_in_period,
            loans_per_domain,
            recently_held,
        })
    }

    async fn try_extend(&self, loan_id: LoanId, extension_days: u32) -> AppResult<Loan> {
        let loan = self.store.get_loan(loan_id).await?;
        if !loan.is_open() {
            return Err(AppError::NotFound(format!("Open loan with id {} not found", loan_id)));
        }

        let now = self.clock.now();
        if loan.is_overdue(now) {
            tracing::warn!("Extension refused: loan {} is overdue", loan_id);
            return Err(PolicyViolation::LoanOverdue { loan_id }.into());
        }

        let reader = self.store.get_reader(loan.reader_id).await?;
        let limits = self.policy.reader_limits(&reader);
        let used: u32 = self
            .store
            .extensions_by_reader(
                reader.id,
                TimeWindow::trailing_months(now, EXTENSION_WINDOW_MONTHS),
            )
            .await?
            .iter()
            .map(|e| e.extension_days.max(0) as u32)
            .sum();

        if let Err(violation) = validation::check_extension_window(used, extension_days, &limits) {
            tracing::warn!("Extension refused for reader {}: {}", reader.id, violation);
            return Err(violation.into());
        }

        // extensions stack on the current due date, not on today
        let new_end = loan.effective_end() + Duration::days(i64::from(extension_days));
        let (loan, extension) = self
            .store
            .commit_extension(&ExtensionCommit {
                loan: Versioned {
                    id: loan.id,
                    version: loan.version,
                },
                reader: Versioned {
                    id: reader.id,
                    version: reader.version,
                },
                new_end,
                request_date: now,
                extension_days: extension_days as i32,
            })
            .await?;

        tracing::info!(
            "Loan {} extended by {} days (extension {}), now due {}",
            loan.id,
            extension_days,
            extension.id,
            new_end
        );
        Ok(loan)
    }

    async fn try_return(&self, reader_id: ReaderId, book_id: BookId) -> AppResult<Loan> {
        let loan = self
            .store
            .find_open_loan(reader_id, book_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "No open loan of book {} for reader {}",
                    book_id, reader_id
                ))
            })?;

        let now = self.clock.now();
        let closed = self
            .store
            .commit_return(&ReturnCommit {
                loan: Versioned {
                    id: loan.id,
                    version: loan.version,
                },
                book_id,
                reader_id,
                returned_at: now,
            })
            .await?;

        if loan.is_overdue(now) {
            tracing::info!("Loan {} returned late (due {})", closed.id, loan.effective_end());
        } else {
            tracing::info!("Loan {} returned", closed.id);
        }
        Ok(closed)
    }
}
