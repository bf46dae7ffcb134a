//! Lending policy thresholds and their reader-role adjustment
//!
//! The configuration is loaded once and never mutated. Rules never read it
//! directly: they receive a [`ReaderLimits`] derived for the requesting
//! reader, so staff/regular variance lives in exactly one place.

use serde::{Deserialize, Serialize};

use crate::{
    error::{AppError, AppResult},
    models::Reader,
};

/// Named numeric thresholds of the lending policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfiguration {
    /// Maximum number of domains a single book may be classified under
    pub max_domains_per_book: u32,
    /// C: books per borrow request
    pub max_books_per_session: u32,
    /// NCZ: books per calendar day
    pub max_books_per_day: u32,
    /// NMC: books per borrowing period
    pub max_books_per_period: u32,
    /// PER: length of the borrowing period, in days
    pub period_length_days: u32,
    /// D: books from one domain per domain window
    pub max_books_per_domain: u32,
    /// L: length of the domain window, in months
    pub domain_window_months: u32,
    /// LIM: cumulative extension days per trailing quarter
    pub max_extension_days: u32,
    /// DELTA: days before the same book can be borrowed again
    pub reborrow_cooldown_days: u32,
    /// PERSIMP: loans one staff member may issue per day
    pub staff_daily_lending_cap: u32,
}

impl Default for PolicyConfiguration {
    fn default() -> Self {
        Self {
            max_domains_per_book: 3,
            max_books_per_session: 5,
            max_books_per_day: 6,
            max_books_per_period: 10,
            period_length_days: 30,
            max_books_per_domain: 3,
            domain_window_months: 3,
            max_extension_days: 14,
            reborrow_cooldown_days: 14,
            staff_daily_lending_cap: 20,
        }
    }
}

impl PolicyConfiguration {
    /// Reject thresholds that would make every request fail
    pub fn validate(&self) -> AppResult<()> {
        let fields = [
            ("max_domains_per_book", self.max_domains_per_book),
            ("max_books_per_session", self.max_books_per_session),
            ("max_books_per_day", self.max_books_per_day),
            ("max_books_per_period", self.max_books_per_period),
            ("period_length_days", self.period_length_days),
            ("max_books_per_domain", self.max_books_per_domain),
            ("domain_window_months", self.domain_window_months),
            ("staff_daily_lending_cap", self.staff_daily_lending_cap),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(AppError::Validation(format!("lending.{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Derive the thresholds that apply to `reader`
    pub fn limits_for(&self, reader: &Reader) -> ReaderLimits {
        if reader.is_employee {
            self.staff_limits()
        } else {
            self.regular_limits()
        }
    }

    /// Thresholds for regular readers: the configuration unchanged
    pub fn regular_limits(&self) -> ReaderLimits {
        ReaderLimits {
            session_max: self.max_books_per_session,
            daily_max: Some(self.max_books_per_day),
            period_max: self.max_books_per_period,
            period_length_days: self.period_length_days,
            domain_max: self.max_books_per_domain,
            domain_window_months: self.domain_window_months,
            extension_max: self.max_extension_days,
            cooldown_days: self.reborrow_cooldown_days,
        }
    }

    /// Thresholds for staff: doubled caps, halved windows, no daily cap.
    ///
    /// Halving truncates, so an odd window of 15 days becomes 7.
    pub fn staff_limits(&self) -> ReaderLimits {
        ReaderLimits {
            session_max: self.max_books_per_session * 2,
            daily_max: None,
            period_max: self.max_books_per_period,
            period_length_days: self.period_length_days / 2,
            domain_max: self.max_books_per_domain * 2,
            domain_window_months: self.domain_window_months,
            extension_max: self.max_extension_days * 2,
            cooldown_days: self.reborrow_cooldown_days / 2,
        }
    }
}

/// Role-adjusted thresholds for one reader, derived fresh per evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReaderLimits {
    pub session_max: u32,
    /// `None` means no daily cap
    pub daily_max: Option<u32>,
    pub period_max: u32,
    pub period_length_days: u32,
    pub domain_max: u32,
    pub domain_window_months: u32,
    pub extension_max: u32,
    pub cooldown_days: u32,
}

/// Source of the lending policy consumed by the workflow
#[cfg_attr(test, mockall::automock)]
pub trait PolicyProvider: Send + Sync {
    fn configuration(&self) -> PolicyConfiguration;

    fn reader_limits(&self, reader: &Reader) -> ReaderLimits {
        self.configuration().limits_for(reader)
    }
}

/// Policy fixed at startup, usually from [`crate::AppConfig`]
#[derive(Debug, Clone)]
pub struct StaticPolicy {
    configuration: PolicyConfiguration,
}

impl StaticPolicy {
    pub fn new(configuration: PolicyConfiguration) -> Self {
        Self { configuration }
    }
}

impl PolicyProvider for StaticPolicy {
    fn configuration(&self) -> PolicyConfiguration {
        self.configuration.clone()
    }
}
