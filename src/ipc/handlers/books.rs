use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    date_or_today, get_optional_i64, get_optional_str, get_required_str, require_school,
    to_json, with_db,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::CirculationError;
use crate::store;
use rusqlite::Connection;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn parse_copies(v: Option<i64>, key: &str) -> Result<Option<i64>, HandlerErr> {
    match v {
        Some(n) if !(0..=10_000).contains(&n) => Err(HandlerErr::bad_params(format!(
            "{} must be in 0..=10000",
            key
        ))),
        other => Ok(other),
    }
}

fn books_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let title = get_required_str(params, "title")?;
    let author = get_required_str(params, "author")?;
    let isbn = get_optional_str(params, "isbn")?;
    let genre = get_optional_str(params, "genre")?;
    let total = parse_copies(get_optional_i64(params, "totalCopies")?, "totalCopies")?.unwrap_or(1);

    let book_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO books(id, school_id, title, author, isbn, genre, total_copies, available_copies, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, datetime('now'), datetime('now'))",
        (&book_id, &school_id, &title, &author, &isbn, &genre, total, total),
    )
    .map_err(|e| HandlerErr::insert("books", e))?;
    info!(school_id = %school_id, book_id = %book_id, total_copies = total, "book added");

    let book = store::get_book(conn, &school_id, &book_id)?
        .ok_or_else(|| HandlerErr::not_found("book"))?;
    Ok(json!({ "book": to_json(&book)? }))
}

fn books_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let search = get_optional_str(params, "search")?;
    let books = store::list_books(conn, &school_id, search.as_deref())?;
    Ok(json!({ "books": to_json(&books)? }))
}

fn books_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let book_id = get_required_str(params, "bookId")?;
    let book = store::get_book(conn, &school_id, &book_id)?
        .ok_or_else(|| HandlerErr::not_found("book"))?;
    let held = store::count_held(conn, &book_id)?;
    let on_loan = store::count_open_loans_for_book(conn, &book_id)?;
    Ok(json!({
        "book": to_json(&book)?,
        "heldCopies": held,
        "onLoan": on_loan,
        "freeCopies": (book.available_copies - held).max(0)
    }))
}

fn books_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let book_id = get_required_str(params, "bookId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let book = store::get_book(conn, &school_id, &book_id)?
        .ok_or_else(|| HandlerErr::not_found("book"))?;

    for key in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        if !matches!(key.as_str(), "title" | "author" | "isbn" | "genre" | "totalCopies") {
            return Err(HandlerErr::bad_params(format!("unknown book field: {}", key)));
        }
    }

    let title = match patch.get("title") {
        Some(_) => get_required_str(patch, "title")?,
        None => book.title.clone(),
    };
    let author = match patch.get("author") {
        Some(_) => get_required_str(patch, "author")?,
        None => book.author.clone(),
    };
    let isbn = match patch.get("isbn") {
        Some(_) => get_optional_str(patch, "isbn")?,
        None => book.isbn.clone(),
    };
    let genre = match patch.get("genre") {
        Some(_) => get_optional_str(patch, "genre")?,
        None => book.genre.clone(),
    };

    // Copies currently out stay out; the shelf count moves by the same delta.
    // Held copies must stay on the shelf.
    let on_loan = book.total_copies - book.available_copies;
    let held = store::count_held(conn, &book_id)?;
    let total = parse_copies(get_optional_i64(patch, "totalCopies")?, "totalCopies")?
        .unwrap_or(book.total_copies);
    if total < on_loan {
        return Err(CirculationError::CopiesOnLoan { on_loan }.into());
    }
    if total - on_loan < held {
        return Err(CirculationError::CopiesHeld {
            held,
            floor: on_loan + held,
        }
        .into());
    }
    let available = total - on_loan;
    let on = date_or_today(params, "asOf")?;
    let settings = store::load_settings(conn, &school_id).map_err(HandlerErr::query)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "UPDATE books
         SET title = ?, author = ?, isbn = ?, genre = ?, total_copies = ?, available_copies = ?,
             updated_at = datetime('now')
         WHERE id = ? AND school_id = ?",
        (&title, &author, &isbn, &genre, total, available, &book_id, &school_id),
    )
    .map_err(HandlerErr::update)?;

    // New shelf copies go down the reservation queue first.
    let mut promoted = Vec::new();
    while let Some(r) = store::promote_next_pending(&tx, &settings, &school_id, &book_id, on)? {
        promoted.push(r.id);
    }
    tx.commit().map_err(HandlerErr::tx)?;

    if total != book.total_copies {
        info!(
            school_id = %school_id,
            book_id = %book_id,
            from = book.total_copies,
            to = total,
            promoted = promoted.len(),
            "book copy count changed"
        );
    }
    let book = store::get_book(conn, &school_id, &book_id)?
        .ok_or_else(|| HandlerErr::not_found("book"))?;
    Ok(json!({
        "book": to_json(&book)?,
        "promotedReservationIds": promoted
    }))
}

fn books_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let book_id = get_required_str(params, "bookId")?;
    if store::get_book(conn, &school_id, &book_id)?.is_none() {
        return Err(HandlerErr::not_found("book"));
    }
    let on_loan = store::count_open_loans_for_book(conn, &book_id)?;
    if on_loan > 0 {
        return Err(CirculationError::CopiesOnLoan { on_loan }.into());
    }

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    // Dependency order; there is no ON DELETE CASCADE.
    for (table, sql) in [
        ("book_reservations", "DELETE FROM book_reservations WHERE book_id = ?"),
        ("book_transactions", "DELETE FROM book_transactions WHERE book_id = ?"),
        ("books", "DELETE FROM books WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&book_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::new("db_delete_failed", e.to_string())
                .with_details(json!({ "table": table })));
        }
    }
    tx.commit().map_err(HandlerErr::tx)?;
    info!(school_id = %school_id, book_id = %book_id, "book deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "books.create" => Some(with_db(state, req, books_create)),
        "books.list" => Some(with_db(state, req, books_list)),
        "books.get" => Some(with_db(state, req, books_get)),
        "books.update" => Some(with_db(state, req, books_update)),
        "books.delete" => Some(with_db(state, req, books_delete)),
        _ => None,
    }
}
