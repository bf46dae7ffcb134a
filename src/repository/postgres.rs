//! Postgres record store
//!
//! Commits run inside one transaction and use the `version` columns of
//! books, readers and loans as compare-and-swap guards. A guard that
//! matches no row means another request committed first; the transaction
//! is rolled back and `Conflict` is returned.

use async_trait::async_trait;
use sqlx::{postgres::PgRow, Pool, Postgres, Row};

use super::{BorrowCommit, ExtensionCommit, RecordStore, ReturnCommit, TimeWindow};
use crate::{
    error::{AppError, AppResult},
    hierarchy::DomainHierarchy,
    models::{
        Author, Book, BookId, CreateAuthor, CreateBook, CreateDomain, CreateReader, Domain,
        DomainId, Edition, Extension, Loan, LoanId, Reader, ReaderId, UpdateCopies,
    },
};

const BOOK_SELECT: &str = r#"
    SELECT b.id, b.title, b.total_copies, b.reading_room_copies, b.available_copies, b.version,
           e.id AS edition_id, e.publisher, e.publication_year, e.isbn, e.pages,
           ARRAY(SELECT ba.author_id FROM book_authors ba WHERE ba.book_id = b.id ORDER BY ba.author_id) AS author_ids,
           ARRAY(SELECT bd.domain_id FROM book_domains bd WHERE bd.book_id = b.id ORDER BY bd.domain_id) AS domain_ids
    FROM books b
    JOIN editions e ON e.id = b.edition_id
"#;

/// Subtree of a domain (itself included); `$2` is the domain id
const DOMAIN_SUBTREE: &str = r#"
    WITH RECURSIVE subtree AS (
        SELECT $2::integer AS id
        UNION
        SELECT d.id FROM domains d JOIN subtree s ON d.parent_id = s.id
    )
"#;

fn book_from_row(row: &PgRow) -> Book {
    Book {
        id: row.get("id"),
        title: row.get("title"),
        edition: Edition {
            id: row.get("edition_id"),
            publisher: row.get("publisher"),
            publication_year: row.get("publication_year"),
            isbn: row.get("isbn"),
            pages: row.get("pages"),
        },
        author_ids: row.get("author_ids"),
        domain_ids: row.get("domain_ids"),
        total_copies: row.get("total_copies"),
        reading_room_copies: row.get("reading_room_copies"),
        available_copies: row.get("available_copies"),
        version: row.get("version"),
    }
}

/// Translate constraint errors into the lending error taxonomy
fn map_constraint(err: sqlx::Error, what: &str) -> AppError {
    if let sqlx::Error::Database(ref db) = err {
        if db.is_unique_violation() {
            return AppError::Conflict(format!("{} already exists", what));
        }
        if db.is_foreign_key_violation() {
            return AppError::NotFound(format!("{} references a missing record", what));
        }
    }
    AppError::Database(err)
}

#[derive(Clone)]
pub struct PgRecordStore {
    pool: Pool<Postgres>,
}

impl PgRecordStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Internal(format!("Migration failed: {}", e)))
    }

    async fn fetch_loans(&self, sql: &str, binds: LoanBinds) -> AppResult<Vec<Loan>> {
        let mut query = sqlx::query_as::<_, Loan>(sql);
        for id in binds.ids {
            query = query.bind(id);
        }
        if let Some(window) = binds.window {
            query = query.bind(window.from).bind(window.to);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }
}

/// Positional parameters of a loan history query: ids first, then the window
struct LoanBinds {
    ids: Vec<i32>,
    window: Option<TimeWindow>,
}

/// Validate a book's domain set against the hierarchy as of this
/// transaction. The share lock keeps re-parenting out until commit.
async fn check_domains_locked(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    domains: &[DomainId],
    max_domains: u32,
) -> AppResult<()> {
    sqlx::query("LOCK TABLE domains IN SHARE MODE")
        .execute(&mut **tx)
        .await?;
    let all = sqlx::query_as::<_, Domain>("SELECT * FROM domains")
        .fetch_all(&mut **tx)
        .await?;
    DomainHierarchy::from_domains(&all).check_assignment(domains, max_domains)
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_domain(&self, data: &CreateDomain) -> AppResult<Domain> {
        sqlx::query_as::<_, Domain>(
            "INSERT INTO domains (name, parent_id) VALUES ($1, $2) RETURNING *",
        )
        .bind(&data.name)
        .bind(data.parent_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_constraint(e, "Domain"))
    }

    async fn get_domain(&self, id: DomainId) -> AppResult<Domain> {
        sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Domain with id {} not found", id)))
    }

    async fn list_domains(&self) -> AppResult<Vec<Domain>> {
        let domains = sqlx::query_as::<_, Domain>("SELECT * FROM domains ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(domains)
    }

    async fn rename_domain(&self, id: DomainId, name: &str) -> AppResult<Domain> {
        sqlx::query_as::<_, Domain>("UPDATE domains SET name = $2 WHERE id = $1 RETURNING *")
            .bind(id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Domain with id {} not found", id)))
    }

    async fn set_domain_parent(&self, id: DomainId, parent: Option<DomainId>) -> AppResult<Domain> {
        let mut tx = self.pool.begin().await?;

        // Concurrent re-parenting could otherwise build a cycle from two valid moves
        sqlx::query("LOCK TABLE domains IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let domains = sqlx::query_as::<_, Domain>("SELECT * FROM domains")
            .fetch_all(&mut *tx)
            .await?;
        let hierarchy = DomainHierarchy::from_domains(&domains);
        if !hierarchy.contains(id) {
            return Err(AppError::NotFound(format!("Domain with id {} not found", id)));
        }
        if let Some(parent) = parent {
            if !hierarchy.contains(parent) {
                return Err(AppError::NotFound(format!("Domain with id {} not found", parent)));
            }
        }

        // domain sets of every book filed somewhere in the moved subtree
        let mut subtree = hierarchy.descendants(id);
        subtree.push(id);
        let filings: Vec<Vec<i32>> = sqlx::query_scalar(
            r#"
            SELECT ARRAY(SELECT bd.domain_id FROM book_domains bd WHERE bd.book_id = t.book_id ORDER BY bd.domain_id)
            FROM (SELECT DISTINCT book_id FROM book_domains WHERE domain_id = ANY($1)) t
            "#,
        )
        .bind(&subtree)
        .fetch_all(&mut *tx)
        .await?;
        hierarchy.check_move(id, parent, filings.iter().map(Vec::as_slice))?;

        let domain = sqlx::query_as::<_, Domain>(
            "UPDATE domains SET parent_id = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(parent)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(domain)
    }

    async fn delete_domain(&self, id: DomainId) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("LOCK TABLE domains IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let domains = sqlx::query_as::<_, Domain>("SELECT * FROM domains")
            .fetch_all(&mut *tx)
            .await?;
        let hierarchy = DomainHierarchy::from_domains(&domains);
        if !hierarchy.contains(id) {
            return Err(AppError::NotFound(format!("Domain with id {} not found", id)));
        }

        let books: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM book_domains WHERE domain_id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        hierarchy.check_delete(id, books)?;

        sqlx::query("DELETE FROM domains WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn count_books_in_domain(&self, id: DomainId) -> AppResult<i64> {
        self.get_domain(id).await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM book_domains WHERE domain_id = $1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn domain_descendants(&self, id: DomainId) -> AppResult<Vec<DomainId>> {
        // UNION (not UNION ALL) stops on repeated rows, so a corrupted cycle cannot loop
        let ids: Vec<i32> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE below AS (
                SELECT id FROM domains WHERE parent_id = $1
                UNION
                SELECT d.id FROM domains d JOIN below b ON d.parent_id = b.id
            )
            SELECT id FROM below WHERE id <> $1 ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn domain_is_ancestor(&self, ancestor: DomainId, of: DomainId) -> AppResult<bool> {
        if ancestor == of {
            return Ok(false);
        }
        let found: bool = sqlx::query_scalar(
            r#"
            WITH RECURSIVE chain AS (
                SELECT parent_id AS id, 1 AS depth FROM domains WHERE id = $2
                UNION ALL
                SELECT d.parent_id, c.depth + 1
                FROM domains d JOIN chain c ON d.id = c.id
                WHERE c.depth <= (SELECT COUNT(*) FROM domains)
            )
            SELECT EXISTS(SELECT 1 FROM chain WHERE id = $1)
            "#,
        )
        .bind(ancestor)
        .bind(of)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn create_author(&self, data: &CreateAuthor) -> AppResult<Author> {
        let author = sqlx::query_as::<_, Author>(
            "INSERT INTO authors (firstname, lastname) VALUES ($1, $2) RETURNING *",
        )
        .bind(&data.firstname)
        .bind(&data.lastname)
        .fetch_one(&self.pool)
        .await?;
        Ok(author)
    }

    async fn get_author(&self, id: i32) -> AppResult<Author> {
        sqlx::query_as::<_, Author>("SELECT * FROM authors WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Author with id {} not found", id)))
    }

    async fn create_book(&self, data: &CreateBook, max_domains: u32) -> AppResult<Book> {
        let mut tx = self.pool.begin().await?;
        check_domains_locked(&mut tx, &data.domain_ids, max_domains).await?;

        let edition_id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO editions (publisher, publication_year, isbn, pages)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&data.edition.publisher)
        .bind(data.edition.publication_year)
        .bind(&data.edition.isbn)
        .bind(data.edition.pages)
        .fetch_one(&mut *tx)
        .await?;

        let book_id: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO books (title, edition_id, total_copies, reading_room_copies, available_copies)
            VALUES ($1, $2, $3, $4, $3 - $4)
            RETURNING id
            "#,
        )
        .bind(&data.title)
        .bind(edition_id)
        .bind(data.total_copies)
        .bind(data.reading_room_copies)
        .fetch_one(&mut *tx)
        .await?;

        for author_id in &data.author_ids {
            sqlx::query("INSERT INTO book_authors (book_id, author_id) VALUES ($1, $2)")
                .bind(book_id)
                .bind(author_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_constraint(e, "Book author"))?;
        }
        for domain_id in &data.domain_ids {
            sqlx::query("INSERT INTO book_domains (book_id, domain_id) VALUES ($1, $2)")
                .bind(book_id)
                .bind(domain_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_constraint(e, "Book domain"))?;
        }

        tx.commit().await?;
        self.get_book(book_id).await
    }

    async fn get_book(&self, id: BookId) -> AppResult<Book> {
        let row = sqlx::query(&format!("{} WHERE b.id = $1", BOOK_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Book with id {} not found", id)))?;
        Ok(book_from_row(&row))
    }

    async fn list_books(&self) -> AppResult<Vec<Book>> {
        let rows = sqlx::query(&format!("{} ORDER BY b.id", BOOK_SELECT))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(book_from_row).collect())
    }

    async fn set_book_domains(
        &self,
        id: BookId,
        domains: &[DomainId],
        max_domains: u32,
    ) -> AppResult<Book> {
        let mut tx = self.pool.begin().await?;
        check_domains_locked(&mut tx, domains, max_domains).await?;

        // bumping the version locks the row and invalidates in-flight borrows
        let locked: Option<i32> =
            sqlx::query_scalar("UPDATE books SET version = version + 1 WHERE id = $1 RETURNING id")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(AppError::NotFound(format!("Book with id {} not found", id)));
        }

        sqlx::query("DELETE FROM book_domains WHERE book_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for domain_id in domains {
            sqlx::query("INSERT INTO book_domains (book_id, domain_id) VALUES ($1, $2)")
                .bind(id)
                .bind(domain_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_constraint(e, "Book domain"))?;
        }

        tx.commit().await?;
        self.get_book(id).await
    }

    async fn update_book_copies(&self, id: BookId, copies: UpdateCopies) -> AppResult<Book> {
        let updated = sqlx::query(
            r#"
            UPDATE books SET
                total_copies = $2,
                reading_room_copies = $3,
                available_copies = available_copies + ($2 - $3) - (total_copies - reading_room_copies),
                version = version + 1
            WHERE id = $1
              AND available_copies + ($2 - $3) - (total_copies - reading_room_copies) >= 0
            "#,
        )
        .bind(id)
        .bind(copies.total_copies)
        .bind(copies.reading_room_copies)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            let book = self.get_book(id).await?;
            return Err(AppError::Validation(format!(
                "Book {} has {} copies on loan, cannot shrink its fund that far",
                id,
                book.borrowable_fund() - book.available_copies
            )));
        }
        self.get_book(id).await
    }

    async fn delete_book(&self, id: BookId) -> AppResult<()> {
        let has_loans: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM loans WHERE book_id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if has_loans {
            return Err(AppError::Validation(format!("Book {} has loans on record", id)));
        }

        let mut tx = self.pool.begin().await?;
        let edition_id: Option<i32> =
            sqlx::query_scalar("DELETE FROM books WHERE id = $1 RETURNING edition_id")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(edition_id) = edition_id else {
            return Err(AppError::NotFound(format!("Book with id {} not found", id)));
        };
        sqlx::query("DELETE FROM editions WHERE id = $1")
            .bind(edition_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_reader(&self, data: &CreateReader) -> AppResult<Reader> {
        let reader = sqlx::query_as::<_, Reader>(
            r#"
            INSERT INTO readers (firstname, lastname, address, email, phone, is_employee)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&data.firstname)
        .bind(&data.lastname)
        .bind(&data.address)
        .bind(&data.email)
        .bind(&data.phone)
        .bind(data.is_employee)
        .fetch_one(&self.pool)
        .await?;
        Ok(reader)
    }

    async fn get_reader(&self, id: ReaderId) -> AppResult<Reader> {
        sqlx::query_as::<_, Reader>("SELECT * FROM readers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Reader with id {} not found", id)))
    }

    async fn update_reader(&self, reader: &Reader) -> AppResult<Reader> {
        let updated = sqlx::query_as::<_, Reader>(
            r#"
            UPDATE readers SET
                firstname = $2, lastname = $3, address = $4,
                email = $5, phone = $6, is_employee = $7,
                version = version + 1
            WHERE id = $1 AND version = $8
            RETURNING *
            "#,
        )
        .bind(reader.id)
        .bind(&reader.firstname)
        .bind(&reader.lastname)
        .bind(&reader.address)
        .bind(&reader.email)
        .bind(&reader.phone)
        .bind(reader.is_employee)
        .bind(reader.version)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(reader) => Ok(reader),
            None => {
                self.get_reader(reader.id).await?;
                Err(AppError::Conflict(format!("Reader {} changed concurrently", reader.id)))
            }
        }
    }

    async fn delete_reader(&self, id: ReaderId) -> AppResult<()> {
        let has_loans: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM loans WHERE reader_id = $1 OR issued_by = $1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if has_loans {
            return Err(AppError::Validation(format!("Reader {} has loans on record", id)));
        }

        let result = sqlx::query("DELETE FROM readers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Reader with id {} not found", id)));
        }
        Ok(())
    }

    async fn get_loan(&self, id: LoanId) -> AppResult<Loan> {
        sqlx::query_as::<_, Loan>("SELECT * FROM loans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Loan with id {} not found", id)))
    }

    async fn find_open_loan(&self, reader_id: ReaderId, book_id: BookId) -> AppResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>(
            "SELECT * FROM loans WHERE reader_id = $1 AND book_id = $2 AND returned_at IS NULL",
        )
        .bind(reader_id)
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(loan)
    }

    async fn open_loans(&self, reader_id: Option<ReaderId>) -> AppResult<Vec<Loan>> {
        let loans = sqlx::query_as::<_, Loan>(
            r#"
            SELECT * FROM loans
            WHERE returned_at IS NULL AND ($1::integer IS NULL OR reader_id = $1)
            ORDER BY borrow_start, id
            "#,
        )
        .bind(reader_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(loans)
    }

    async fn loans_by_reader(&self, reader_id: ReaderId, window: TimeWindow) -> AppResult<Vec<Loan>> {
        self.fetch_loans(
            r#"
            SELECT * FROM loans
            WHERE reader_id = $1 AND borrow_start BETWEEN $2 AND $3
            ORDER BY borrow_start, id
            "#,
            LoanBinds { ids: vec![reader_id], window: Some(window) },
        )
        .await
    }

    async fn loans_held_by_reader(
        &self,
        reader_id: ReaderId,
        book_id: BookId,
        window: TimeWindow,
    ) -> AppResult<Vec<Loan>> {
        self.fetch_loans(
            r#"
            SELECT * FROM loans
            WHERE reader_id = $1 AND book_id = $2
              AND borrow_start <= $4
              AND (returned_at IS NULL OR returned_at >= $3)
            ORDER BY borrow_start, id
            "#,
            LoanBinds { ids: vec![reader_id, book_id], window: Some(window) },
        )
        .await
    }

    async fn loans_by_reader_in_domain(
        &self,
        reader_id: ReaderId,
        domain_id: DomainId,
        window: TimeWindow,
    ) -> AppResult<Vec<Loan>> {
        let sql = format!(
            r#"
            {}
            SELECT l.* FROM loans l
            WHERE l.reader_id = $1
              AND l.borrow_start BETWEEN $3 AND $4
              AND EXISTS (
                  SELECT 1 FROM book_domains bd
                  WHERE bd.book_id = l.book_id AND bd.domain_id IN (SELECT id FROM subtree)
              )
            ORDER BY l.borrow_start, l.id
            "#,
            DOMAIN_SUBTREE
        );
        self.fetch_loans(&sql, LoanBinds { ids: vec![reader_id, domain_id], window: Some(window) })
            .await
    }

    async fn loans_issued_by(&self, staff_id: ReaderId, window: TimeWindow) -> AppResult<Vec<Loan>> {
        self.fetch_loans(
            r#"
            SELECT * FROM loans
            WHERE issued_by = $1 AND borrow_start BETWEEN $2 AND $3
            ORDER BY borrow_start, id
            "#,
            LoanBinds { ids: vec![staff_id], window: Some(window) },
        )
        .await
    }

    async fn extensions_by_reader(
        &self,
        reader_id: ReaderId,
        window: TimeWindow,
    ) -> AppResult<Vec<Extension>> {
        let extensions = sqlx::query_as::<_, Extension>(
            r#"
            SELECT * FROM extensions
            WHERE reader_id = $1 AND request_date BETWEEN $2 AND $3
            ORDER BY request_date, id
            "#,
        )
        .bind(reader_id)
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await?;
        Ok(extensions)
    }

    async fn extensions_for_loan(&self, loan_id: LoanId) -> AppResult<Vec<Extension>> {
        let extensions = sqlx::query_as::<_, Extension>(
            "SELECT * FROM extensions WHERE loan_id = $1 ORDER BY request_date, id",
        )
        .bind(loan_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(extensions)
    }

    async fn commit_borrow(&self, commit: &BorrowCommit) -> AppResult<Vec<Loan>> {
        let mut tx = self.pool.begin().await?;

        let reader_rows = sqlx::query("UPDATE readers SET version = version + 1 WHERE id = $1 AND version = $2")
            .bind(commit.reader.id)
            .bind(commit.reader.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if reader_rows == 0 {
            return Err(AppError::Conflict(format!(
                "Reader {} changed during the request",
                commit.reader.id
            )));
        }

        for book in &commit.books {
            let rows = sqlx::query(
                r#"
                UPDATE books SET available_copies = available_copies - 1, version = version + 1
                WHERE id = $1 AND version = $2 AND available_copies > 0
                "#,
            )
            .bind(book.id)
            .bind(book.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if rows == 0 {
                return Err(AppError::Conflict(format!(
                    "Book {} changed during the request",
                    book.id
                )));
            }
        }

        let mut created = Vec::with_capacity(commit.loans.len());
        for new in &commit.loans {
            let loan = sqlx::query_as::<_, Loan>(
                r#"
                INSERT INTO loans (book_id, reader_id, borrow_start, borrow_end, issued_by)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING *
                "#,
            )
            .bind(new.book_id)
            .bind(commit.reader.id)
            .bind(new.borrow_start)
            .bind(new.borrow_end)
            .bind(new.issued_by)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_constraint(e, "Open loan"))?;
            created.push(loan);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn commit_extension(&self, commit: &ExtensionCommit) -> AppResult<(Loan, Extension)> {
        let mut tx = self.pool.begin().await?;

        let loan = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans SET borrow_end_extended = $2, version = version + 1
            WHERE id = $1 AND version = $3 AND returned_at IS NULL
            RETURNING *
            "#,
        )
        .bind(commit.loan.id)
        .bind(commit.new_end)
        .bind(commit.loan.version)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("Loan {} changed during the request", commit.loan.id)))?;

        let reader_rows = sqlx::query(
            r#"
            UPDATE readers SET number_of_extensions = number_of_extensions + 1, version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(commit.reader.id)
        .bind(commit.reader.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if reader_rows == 0 {
            return Err(AppError::Conflict(format!(
                "Reader {} changed during the request",
                commit.reader.id
            )));
        }

        let extension = sqlx::query_as::<_, Extension>(
            r#"
            INSERT INTO extensions (loan_id, book_id, reader_id, request_date, extension_days)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(loan.id)
        .bind(loan.book_id)
        .bind(commit.reader.id)
        .bind(commit.request_date)
        .bind(commit.extension_days)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((loan, extension))
    }

    async fn commit_return(&self, commit: &ReturnCommit) -> AppResult<Loan> {
        let mut tx = self.pool.begin().await?;

        let loan = sqlx::query_as::<_, Loan>(
            r#"
            UPDATE loans SET returned_at = $2, version = version + 1
            WHERE id = $1 AND version = $3 AND returned_at IS NULL
            RETURNING *
            "#,
        )
        .bind(commit.loan.id)
        .bind(commit.returned_at)
        .bind(commit.loan.version)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("Loan {} changed during the request", commit.loan.id)))?;

        let book_rows = sqlx::query(
            r#"
            UPDATE books SET available_copies = available_copies + 1, version = version + 1
            WHERE id = $1 AND available_copies < total_copies
            "#,
        )
        .bind(commit.book_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if book_rows == 0 {
            return Err(AppError::Internal(format!(
                "Book {} would exceed its total copies",
                commit.book_id
            )));
        }

        sqlx::query("UPDATE readers SET version = version + 1 WHERE id = $1")
            .bind(commit.reader_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(loan)
    }
}
