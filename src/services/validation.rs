//! Borrow validation rules
//!
//! Each rule is a pure function of the candidate books, the reader's
//! role-adjusted limits and history fetched for this request. Rules run in
//! a fixed order and the first failure is reported.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::PolicyViolation,
    models::{Book, BookId, DomainId, ReaderId},
    policy::ReaderLimits,
    services::availability,
};

/// Minimum request size at which domain diversity is required
pub const DIVERSITY_THRESHOLD: usize = 3;

/// A book in a borrow request with its domain closure resolved
#[derive(Debug, Clone)]
pub struct Candidate {
    pub book: Book,
    /// The book's own domains plus every ancestor of each
    pub domain_closure: BTreeSet<DomainId>,
}

/// What the reader already did inside the windows the rules look at
#[derive(Debug, Clone, Default)]
pub struct BorrowHistory {
    /// Loans started today
    pub loans_today: usize,
    /// Loans started within the borrowing period
    pub loans_in_period: usize,
    /// Loans started within the domain window, per domain of the request's closure
    pub loans_per_domain: BTreeMap<DomainId, usize>,
    /// Candidate books held at some point of the cooldown window
    pub recently_held: BTreeSet<BookId>,
}

/// Rule 1: every candidate can leave the building and the shelf keeps its reserve
pub fn check_availability(candidates: &[Candidate]) -> Result<(), PolicyViolation> {
    for candidate in candidates {
        let book = &candidate.book;
        if !availability::can_be_borrowed(book) {
            return Err(PolicyViolation::NotBorrowable { book_id: book.id });
        }
        if !availability::has_available_copies_to_borrow(book) {
            return Err(PolicyViolation::NoAvailableCopies {
                book_id: book.id,
                available: book.available_copies,
                required: availability::required_reserve(book),
            });
        }
    }
    Ok(())
}

/// Rule 2: per-request cap
pub fn check_session_size(requested: usize, limits: &ReaderLimits) -> Result<(), PolicyViolation> {
    if requested > limits.session_max as usize {
        return Err(PolicyViolation::SessionLimitExceeded {
            requested,
            max: limits.session_max,
        });
    }
    Ok(())
}

/// Rule 3: three or more books must touch at least two domains, ancestors included
pub fn check_domain_diversity(candidates: &[Candidate]) -> Result<(), PolicyViolation> {
    if candidates.len() < DIVERSITY_THRESHOLD {
        return Ok(());
    }
    let touched: BTreeSet<DomainId> = candidates
        .iter()
        .flat_map(|c| c.domain_closure.iter().copied())
        .collect();
    if touched.len() < 2 {
        return Err(PolicyViolation::InsufficientDomainDiversity {
            books: candidates.len(),
            domains: touched.len(),
        });
    }
    Ok(())
}

/// Rule 4: calendar-day cap; staff have none
pub fn check_daily_limit(
    requested: usize,
    limits: &ReaderLimits,
    history: &BorrowHistory,
) -> Result<(), PolicyViolation> {
    let Some(max) = limits.daily_max else {
        return Ok(());
    };
    if history.loans_today + requested > max as usize {
        return Err(PolicyViolation::DailyLimitExceeded {
            existing: history.loans_today,
            requested,
            max,
        });
    }
    Ok(())
}

/// Rule 5: cap over the trailing borrowing period
pub fn check_period_limit(
    requested: usize,
    limits: &ReaderLimits,
    history: &BorrowHistory,
) -> Result<(), PolicyViolation> {
    if history.loans_in_period + requested > limits.period_max as usize {
        return Err(PolicyViolation::PeriodLimitExceeded {
            existing: history.loans_in_period,
            requested,
            max: limits.period_max,
            period_days: limits.period_length_days,
        });
    }
    Ok(())
}

/// Rule 6: cap per domain over the domain window, each domain of the closure on its own
pub fn check_domain_limits(
    candidates: &[Candidate],
    limits: &ReaderLimits,
    history: &BorrowHistory,
) -> Result<(), PolicyViolation> {
    let mut requested: BTreeMap<DomainId, usize> = BTreeMap::new();
    for candidate in candidates {
        for domain in &candidate.domain_closure {
            *requested.entry(*domain).or_default() += 1;
        }
    }

    for (domain_id, count) in requested {
        let existing = history.loans_per_domain.get(&domain_id).copied().unwrap_or(0);
        if existing + count > limits.domain_max as usize {
            return Err(PolicyViolation::DomainLimitExceeded {
                domain_id,
                existing,
                requested: count,
                max: limits.domain_max,
                window_months: limits.domain_window_months,
            });
        }
    }
    Ok(())
}

/// Rule 7: no book twice in one request, none held within the cooldown
pub fn check_reborrow(
    candidates: &[Candidate],
    limits: &ReaderLimits,
    history: &BorrowHistory,
) -> Result<(), PolicyViolation> {
    let mut seen = BTreeSet::new();
    for candidate in candidates {
        if !seen.insert(candidate.book.id) {
            return Err(PolicyViolation::DuplicateInRequest {
                book_id: candidate.book.id,
            });
        }
    }
    for candidate in candidates {
        if history.recently_held.contains(&candidate.book.id) {
            return Err(PolicyViolation::RecentlyBorrowed {
                book_id: candidate.book.id,
                cooldown_days: limits.cooldown_days,
            });
        }
    }
    Ok(())
}

/// Run every borrow rule in order, stopping at the first failure
pub fn validate_borrow(
    candidates: &[Candidate],
    limits: &ReaderLimits,
    history: &BorrowHistory,
) -> Result<(), PolicyViolation> {
    let requested = candidates.len();
    check_availability(candidates)?;
    check_session_size(requested, limits)?;
    check_domain_diversity(candidates)?;
    check_daily_limit(requested, limits, history)?;
    check_period_limit(requested, limits, history)?;
    check_domain_limits(candidates, limits, history)?;
    check_reborrow(candidates, limits, history)?;
    Ok(())
}

/// Extension rule: days requested over the trailing quarter, plus this request
pub fn check_extension_window(
    used_days: u32,
    requested_days: u32,
    limits: &ReaderLimits,
) -> Result<(), PolicyViolation> {
    if used_days + requested_days > limits.extension_max {
        return Err(PolicyViolation::ExtensionLimitExceeded {
            used: used_days,
            requested: requested_days,
            max: limits.extension_max,
        });
    }
    Ok(())
}

/// Desk rule: loans one staff member may issue in a day
pub fn check_staff_lending_cap(
    staff_id: ReaderId,
    issued_today: usize,
    requested: usize,
    cap: u32,
) -> Result<(), PolicyViolation> {
    if issued_today + requested > cap as usize {
        return Err(PolicyViolation::StaffLendingCapExceeded {
            staff_id,
            issued: issued_today,
            requested,
            max: cap,
        });
    }
    Ok(())
}
