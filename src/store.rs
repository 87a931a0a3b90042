//! Row access shared by the handler families: typed rows for books, members,
//! loans and reservations, plus the copy-count and reservation-queue updates
//! that more than one operation needs.

use crate::db;
use crate::policy::{self, LibrarySettings, MemberType, ReservationStatus, TransactionStatus};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use tracing::info;

pub const DATE_FMT: &str = "%Y-%m-%d";
pub const SETTINGS_KEY: &str = "library.settings";

pub fn fmt_date(d: NaiveDate) -> String {
    d.format(DATE_FMT).to_string()
}

fn conversion_err(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn date_col(row: &Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, DATE_FMT).map_err(|e| conversion_err(idx, e))
}

fn opt_date_col(row: &Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| NaiveDate::parse_from_str(&s, DATE_FMT).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn decimal_col(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| conversion_err(idx, e))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRow {
    pub id: String,
    pub school_id: String,
    pub title: String,
    pub author: String,
    pub isbn: Option<String>,
    pub genre: Option<String>,
    pub total_copies: i64,
    pub available_copies: i64,
}

const BOOK_COLS: &str =
    "id, school_id, title, author, isbn, genre, total_copies, available_copies";

fn book_from_row(r: &Row) -> rusqlite::Result<BookRow> {
    Ok(BookRow {
        id: r.get(0)?,
        school_id: r.get(1)?,
        title: r.get(2)?,
        author: r.get(3)?,
        isbn: r.get(4)?,
        genre: r.get(5)?,
        total_copies: r.get(6)?,
        available_copies: r.get(7)?,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRow {
    pub id: String,
    pub school_id: String,
    pub member_type: MemberType,
    pub person_kind: String,
    pub person_id: String,
    pub display_name: String,
    pub borrowing_limit: i64,
    pub is_active: bool,
}

const MEMBER_COLS: &str =
    "id, school_id, member_type, person_kind, person_id, display_name, borrowing_limit, is_active";

fn member_from_row(r: &Row) -> rusqlite::Result<MemberRow> {
    let raw_type: String = r.get(2)?;
    let member_type = MemberType::parse(&raw_type)
        .ok_or_else(|| conversion_err(2, format!("unknown member type {}", raw_type)))?;
    Ok(MemberRow {
        id: r.get(0)?,
        school_id: r.get(1)?,
        member_type,
        person_kind: r.get(3)?,
        person_id: r.get(4)?,
        display_name: r.get(5)?,
        borrowing_limit: r.get(6)?,
        is_active: r.get::<_, i64>(7)? != 0,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRow {
    pub id: String,
    pub school_id: String,
    pub book_id: String,
    pub member_id: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub return_date: Option<NaiveDate>,
    pub status: TransactionStatus,
    pub renewal_count: i64,
    pub max_renewals: i64,
    pub fine_amount: Decimal,
    pub fine_paid: bool,
}

const TRANSACTION_COLS: &str = "id, school_id, book_id, member_id, issue_date, due_date, \
     return_date, status, renewal_count, max_renewals, fine_amount, fine_paid";

fn transaction_from_row(r: &Row) -> rusqlite::Result<TransactionRow> {
    let raw_status: String = r.get(7)?;
    let status = TransactionStatus::parse(&raw_status)
        .ok_or_else(|| conversion_err(7, format!("unknown loan status {}", raw_status)))?;
    Ok(TransactionRow {
        id: r.get(0)?,
        school_id: r.get(1)?,
        book_id: r.get(2)?,
        member_id: r.get(3)?,
        issue_date: date_col(r, 4)?,
        due_date: date_col(r, 5)?,
        return_date: opt_date_col(r, 6)?,
        status,
        renewal_count: r.get(8)?,
        max_renewals: r.get(9)?,
        fine_amount: decimal_col(r, 10)?,
        fine_paid: r.get::<_, i64>(11)? != 0,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRow {
    pub id: String,
    pub school_id: String,
    pub book_id: String,
    pub member_id: String,
    pub reservation_date: NaiveDate,
    pub available_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub status: ReservationStatus,
}

const RESERVATION_COLS: &str =
    "id, school_id, book_id, member_id, reservation_date, available_date, expiry_date, status";

fn reservation_from_row(r: &Row) -> rusqlite::Result<ReservationRow> {
    let raw_status: String = r.get(7)?;
    let status = ReservationStatus::parse(&raw_status)
        .ok_or_else(|| conversion_err(7, format!("unknown reservation status {}", raw_status)))?;
    Ok(ReservationRow {
        id: r.get(0)?,
        school_id: r.get(1)?,
        book_id: r.get(2)?,
        member_id: r.get(3)?,
        reservation_date: date_col(r, 4)?,
        available_date: opt_date_col(r, 5)?,
        expiry_date: opt_date_col(r, 6)?,
        status,
    })
}

pub fn school_exists(conn: &Connection, school_id: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM schools WHERE id = ?", [school_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
}

pub fn load_settings(conn: &Connection, school_id: &str) -> anyhow::Result<LibrarySettings> {
    let saved = db::settings_get_json(conn, school_id, SETTINGS_KEY)?;
    Ok(match saved.as_ref().and_then(|v| v.as_object()) {
        Some(obj) => LibrarySettings::from_stored(obj),
        None => LibrarySettings::default(),
    })
}

pub fn get_book(conn: &Connection, school_id: &str, id: &str) -> rusqlite::Result<Option<BookRow>> {
    conn.query_row(
        &format!("SELECT {} FROM books WHERE id = ? AND school_id = ?", BOOK_COLS),
        (id, school_id),
        book_from_row,
    )
    .optional()
}

pub fn list_books(
    conn: &Connection,
    school_id: &str,
    search: Option<&str>,
) -> rusqlite::Result<Vec<BookRow>> {
    let pattern = format!("%{}%", search.unwrap_or("").trim().to_lowercase());
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM books
         WHERE school_id = ?1
           AND (lower(title) LIKE ?2 OR lower(author) LIKE ?2 OR lower(COALESCE(isbn, '')) LIKE ?2)
         ORDER BY title, author",
        BOOK_COLS
    ))?;
    let rows = stmt.query_map((school_id, &pattern), book_from_row)?;
    rows.collect()
}

pub fn get_member(
    conn: &Connection,
    school_id: &str,
    id: &str,
) -> rusqlite::Result<Option<MemberRow>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM library_members WHERE id = ? AND school_id = ?",
            MEMBER_COLS
        ),
        (id, school_id),
        member_from_row,
    )
    .optional()
}

pub fn list_members(
    conn: &Connection,
    school_id: &str,
    include_inactive: bool,
) -> rusqlite::Result<Vec<MemberRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM library_members
         WHERE school_id = ? AND (is_active = 1 OR ?)
         ORDER BY display_name",
        MEMBER_COLS
    ))?;
    let rows = stmt.query_map((school_id, include_inactive), member_from_row)?;
    rows.collect()
}

pub fn get_transaction(
    conn: &Connection,
    school_id: &str,
    id: &str,
) -> rusqlite::Result<Option<TransactionRow>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM book_transactions WHERE id = ? AND school_id = ?",
            TRANSACTION_COLS
        ),
        (id, school_id),
        transaction_from_row,
    )
    .optional()
}

#[derive(Debug, Default)]
pub struct TransactionFilter<'a> {
    pub member_id: Option<&'a str>,
    pub book_id: Option<&'a str>,
    pub status: Option<TransactionStatus>,
}

pub fn list_transactions(
    conn: &Connection,
    school_id: &str,
    filter: &TransactionFilter,
) -> rusqlite::Result<Vec<TransactionRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM book_transactions
         WHERE school_id = ?1
           AND (?2 IS NULL OR member_id = ?2)
           AND (?3 IS NULL OR book_id = ?3)
           AND (?4 IS NULL OR status = ?4)
         ORDER BY issue_date DESC, rowid DESC",
        TRANSACTION_COLS
    ))?;
    let rows = stmt.query_map(
        (
            school_id,
            filter.member_id,
            filter.book_id,
            filter.status.map(|s| s.as_str()),
        ),
        transaction_from_row,
    )?;
    rows.collect()
}

pub fn count_open_loans(conn: &Connection, member_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM book_transactions
         WHERE member_id = ? AND status IN ('issued', 'overdue')",
        [member_id],
        |r| r.get(0),
    )
}

pub fn count_open_loans_for_book(conn: &Connection, book_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM book_transactions
         WHERE book_id = ? AND status IN ('issued', 'overdue')",
        [book_id],
        |r| r.get(0),
    )
}

pub fn member_has_open_loan(
    conn: &Connection,
    member_id: &str,
    book_id: &str,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM book_transactions
         WHERE member_id = ? AND book_id = ? AND status IN ('issued', 'overdue')",
        (member_id, book_id),
        |r| r.get::<_, i64>(0),
    )
    .map(|n| n > 0)
}

/// Unpaid fines across the member's returned loans.
pub fn outstanding_fines(conn: &Connection, member_id: &str) -> rusqlite::Result<Decimal> {
    let mut stmt = conn.prepare(
        "SELECT fine_amount FROM book_transactions WHERE member_id = ? AND fine_paid = 0",
    )?;
    let rows = stmt.query_map([member_id], |r| decimal_col(r, 0))?;
    let mut total = Decimal::ZERO;
    for fine in rows {
        total += fine?;
    }
    Ok(total)
}

pub fn get_reservation(
    conn: &Connection,
    school_id: &str,
    id: &str,
) -> rusqlite::Result<Option<ReservationRow>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM book_reservations WHERE id = ? AND school_id = ?",
            RESERVATION_COLS
        ),
        (id, school_id),
        reservation_from_row,
    )
    .optional()
}

#[derive(Debug, Default)]
pub struct ReservationFilter<'a> {
    pub book_id: Option<&'a str>,
    pub member_id: Option<&'a str>,
    pub status: Option<ReservationStatus>,
}

/// Reservations in queue order: oldest reservation date first, then by
/// insertion.
pub fn list_reservations(
    conn: &Connection,
    school_id: &str,
    filter: &ReservationFilter,
) -> rusqlite::Result<Vec<ReservationRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM book_reservations
         WHERE school_id = ?1
           AND (?2 IS NULL OR book_id = ?2)
           AND (?3 IS NULL OR member_id = ?3)
           AND (?4 IS NULL OR status = ?4)
         ORDER BY reservation_date, rowid",
        RESERVATION_COLS
    ))?;
    let rows = stmt.query_map(
        (
            school_id,
            filter.book_id,
            filter.member_id,
            filter.status.map(|s| s.as_str()),
        ),
        reservation_from_row,
    )?;
    rows.collect()
}

/// Copies on the shelf that are pinned by `available` reservations.
pub fn count_held(conn: &Connection, book_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM book_reservations WHERE book_id = ? AND status = 'available'",
        [book_id],
        |r| r.get(0),
    )
}

pub fn active_reservation_for(
    conn: &Connection,
    book_id: &str,
    member_id: &str,
) -> rusqlite::Result<Option<ReservationRow>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM book_reservations
             WHERE book_id = ? AND member_id = ? AND status IN ('pending', 'available')
             ORDER BY rowid LIMIT 1",
            RESERVATION_COLS
        ),
        (book_id, member_id),
        reservation_from_row,
    )
    .optional()
}

/// Active reservations for the book by anyone other than `member_id`.
pub fn count_competing_reservations(
    conn: &Connection,
    book_id: &str,
    member_id: &str,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM book_reservations
         WHERE book_id = ? AND member_id <> ? AND status IN ('pending', 'available')",
        (book_id, member_id),
        |r| r.get(0),
    )
}

pub fn set_reservation_status(
    conn: &Connection,
    id: &str,
    status: ReservationStatus,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE book_reservations SET status = ? WHERE id = ?",
        (status.as_str(), id),
    )?;
    Ok(())
}

/// Move a reservation to `available` and start its hold window.
pub fn hold_reservation(
    conn: &Connection,
    settings: &LibrarySettings,
    id: &str,
    on: NaiveDate,
) -> rusqlite::Result<()> {
    let expiry = policy::add_days(on, settings.reservation_hold_days).unwrap_or(on);
    conn.execute(
        "UPDATE book_reservations
         SET status = 'available', available_date = ?, expiry_date = ?
         WHERE id = ?",
        (fmt_date(on), fmt_date(expiry), id),
    )?;
    Ok(())
}

/// Promote the oldest pending reservation of a book if an unheld copy is on
/// the shelf. Returns the promoted reservation.
pub fn promote_next_pending(
    conn: &Connection,
    settings: &LibrarySettings,
    school_id: &str,
    book_id: &str,
    on: NaiveDate,
) -> rusqlite::Result<Option<ReservationRow>> {
    let Some(book) = get_book(conn, school_id, book_id)? else {
        return Ok(None);
    };
    if book.available_copies - count_held(conn, book_id)? <= 0 {
        return Ok(None);
    }
    let next = list_reservations(
        conn,
        school_id,
        &ReservationFilter {
            book_id: Some(book_id),
            status: Some(ReservationStatus::Pending),
            ..Default::default()
        },
    )?
    .into_iter()
    .next();
    let Some(next) = next else {
        return Ok(None);
    };
    hold_reservation(conn, settings, &next.id, on)?;
    info!(
        reservation_id = %next.id,
        book_id,
        member_id = %next.member_id,
        "reservation promoted to available"
    );
    get_reservation(conn, school_id, &next.id)
}

/// Take one copy off the shelf. False when none was available.
pub fn take_copy(conn: &Connection, book_id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE books SET available_copies = available_copies - 1, updated_at = datetime('now')
         WHERE id = ? AND available_copies > 0",
        [book_id],
    )?;
    Ok(changed == 1)
}

/// Put one copy back on the shelf. False when every copy was already in.
pub fn restore_copy(conn: &Connection, book_id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE books SET available_copies = available_copies + 1, updated_at = datetime('now')
         WHERE id = ? AND available_copies < total_copies",
        [book_id],
    )?;
    Ok(changed == 1)
}
