//! Availability arithmetic on a book's copy counters

use crate::models::Book;

/// Share of the borrowable fund, in percent, that must stay on the shelf
pub const RESERVE_PERCENT: i32 = 10;

/// At least one copy may leave the reading room
pub fn can_be_borrowed(book: &Book) -> bool {
    book.total_copies > book.reading_room_copies
}

/// Minimum number of available copies required to lend one more:
/// `ceil(borrowable_fund * 10%)`, or 0 when nothing circulates
pub fn required_reserve(book: &Book) -> i32 {
    let fund = book.borrowable_fund();
    if fund <= 0 {
        return 0;
    }
    (fund * RESERVE_PERCENT + 99) / 100
}

/// The shelf still holds at least the reserve. Inclusive: exactly the
/// reserve is enough to lend.
pub fn has_available_copies_to_borrow(book: &Book) -> bool {
    book.borrowable_fund() > 0 && book.available_copies >= required_reserve(book)
}
