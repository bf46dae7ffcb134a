//! Error types for the Elidune lending engine

use thiserror::Error;

use crate::models::{BookId, DomainId, LoanId, ReaderId};

/// A named lending rule that rejected a borrow or extension request.
///
/// Every variant carries the entity it was evaluated against and the limit
/// that was in force, so callers can tell the reader exactly what to drop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    #[error("Book {book_id} is reserved for the reading room")]
    NotBorrowable { book_id: BookId },

    #[error("Book {book_id} has {available} available copies, at least {required} must remain")]
    NoAvailableCopies {
        book_id: BookId,
        available: i32,
        required: i32,
    },

    #[error("Requested {requested} books, at most {max} per request")]
    SessionLimitExceeded { requested: usize, max: u32 },

    #[error("{books} books span {domains} domain(s), at least 2 are required")]
    InsufficientDomainDiversity { books: usize, domains: usize },

    #[error("Daily limit reached ({existing} borrowed today + {requested} requested > {max})")]
    DailyLimitExceeded {
        existing: usize,
        requested: usize,
        max: u32,
    },

    #[error("Limit of {max} books per {period_days} days reached ({existing} + {requested})")]
    PeriodLimitExceeded {
        existing: usize,
        requested: usize,
        max: u32,
        period_days: u32,
    },

    #[error("Limit of {max} books in domain {domain_id} per {window_months} months reached ({existing} + {requested})")]
    DomainLimitExceeded {
        domain_id: DomainId,
        existing: usize,
        requested: usize,
        max: u32,
        window_months: u32,
    },

    #[error("Book {book_id} is already on loan to this reader")]
    AlreadyBorrowed { book_id: BookId },

    #[error("Book {book_id} appears more than once in the request")]
    DuplicateInRequest { book_id: BookId },

    #[error("Book {book_id} was held by this reader within the last {cooldown_days} days")]
    RecentlyBorrowed { book_id: BookId, cooldown_days: u32 },

    #[error("Extension of {requested} days exceeds the quarterly limit ({used} used, max {max})")]
    ExtensionLimitExceeded { used: u32, requested: u32, max: u32 },

    #[error("Loan {loan_id} is overdue and can no longer be extended")]
    LoanOverdue { loan_id: LoanId },

    #[error("Staff member {staff_id} already issued {issued} loans today, {requested} more exceeds {max}")]
    StaffLendingCapExceeded {
        staff_id: ReaderId,
        issued: usize,
        requested: usize,
        max: u32,
    },
}

impl PolicyViolation {
    /// Stable identifier of the rule that failed
    pub fn rule(&self) -> &'static str {
        match self {
            PolicyViolation::NotBorrowable { .. } | PolicyViolation::NoAvailableCopies { .. } => {
                "availability"
            }
            PolicyViolation::SessionLimitExceeded { .. } => "session_limit",
            PolicyViolation::InsufficientDomainDiversity { .. } => "domain_diversity",
            PolicyViolation::DailyLimitExceeded { .. } => "daily_limit",
            PolicyViolation::PeriodLimitExceeded { .. } => "period_limit",
            PolicyViolation::DomainLimitExceeded { .. } => "domain_limit",
            PolicyViolation::AlreadyBorrowed { .. }
            | PolicyViolation::DuplicateInRequest { .. }
            | PolicyViolation::RecentlyBorrowed { .. } => "reborrow",
            PolicyViolation::ExtensionLimitExceeded { .. } => "extension_limit",
            PolicyViolation::LoanOverdue { .. } => "loan_overdue",
            PolicyViolation::StaffLendingCapExceeded { .. } => "staff_lending_cap",
        }
    }
}

/// Structural rule of the catalog or the domain hierarchy was broken
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    #[error("Domain {domain_id} cannot be placed under {parent_id}: would create a cycle")]
    Cycle {
        domain_id: DomainId,
        parent_id: DomainId,
    },

    #[error("Domain {domain_id} is in use ({books} books, {children} subdomains)")]
    DomainInUse {
        domain_id: DomainId,
        books: i64,
        children: usize,
    },

    #[error("A book may belong to at most {max} domains, got {count}")]
    TooManyDomains { count: usize, max: u32 },

    #[error("Domains {ancestor} and {descendant} are related and cannot both be assigned")]
    RelatedDomains {
        ancestor: DomainId,
        descendant: DomainId,
    },

    #[error("Domain hierarchy is corrupted: walk from {domain_id} did not reach a root")]
    CorruptedHierarchy { domain_id: DomainId },
}

/// Main error type for lending operations
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(#[from] PolicyViolation),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Only lost commit races may be retried, and only after re-validation
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Conflict(_))
    }

    /// The violated rule, if this is a policy rejection
    pub fn policy_violation(&self) -> Option<&PolicyViolation> {
        match self {
            AppError::PolicyViolation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Result type alias for lending operations
pub type AppResult<T> = Result<T, AppError>;
