use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    date_or_today, get_optional_str, get_required_str, require_school, to_json, with_db,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{
    self, CirculationError, ReservationStatus, ShelfDecision, TransactionStatus,
};
use crate::store::{self, fmt_date, TransactionFilter};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn load_open_transaction(
    conn: &Connection,
    school_id: &str,
    transaction_id: &str,
) -> Result<store::TransactionRow, HandlerErr> {
    let txn = store::get_transaction(conn, school_id, transaction_id)?
        .ok_or_else(|| HandlerErr::not_found("transaction"))?;
    if !txn.status.is_open() {
        return Err(CirculationError::AlreadyReturned.into());
    }
    Ok(txn)
}

fn circulation_issue(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let book_id = get_required_str(params, "bookId")?;
    let member_id = get_required_str(params, "memberId")?;
    let issue_date = date_or_today(params, "issueDate")?;

    let member = store::get_member(conn, &school_id, &member_id)?
        .ok_or_else(|| HandlerErr::not_found("member"))?;
    if !member.is_active {
        return Err(CirculationError::MemberInactive.into());
    }
    let book = store::get_book(conn, &school_id, &book_id)?
        .ok_or_else(|| HandlerErr::not_found("book"))?;
    let settings = store::load_settings(conn, &school_id).map_err(HandlerErr::query)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;

    let open_loans = store::count_open_loans(&tx, &member_id)?;
    policy::check_borrowing_limit(open_loans, member.borrowing_limit)?;

    let held = store::count_held(&tx, &book_id)?;
    let own = store::active_reservation_for(&tx, &book_id, &member_id)?;
    let has_hold = own
        .as_ref()
        .is_some_and(|r| r.status == ReservationStatus::Available);
    let decision = policy::check_shelf(book.available_copies, held, has_hold)?;

    let days = settings.borrowing_days(member.member_type);
    let due_date = policy::add_days(issue_date, days)
        .ok_or_else(|| HandlerErr::bad_params("issueDate out of range"))?;

    let transaction_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO book_transactions(id, school_id, book_id, member_id, issue_date, due_date, status, renewal_count, max_renewals, fine_amount, fine_paid)
         VALUES(?, ?, ?, ?, ?, ?, 'issued', 0, ?, '0', 1)",
        (
            &transaction_id,
            &school_id,
            &book_id,
            &member_id,
            fmt_date(issue_date),
            fmt_date(due_date),
            settings.max_renewals,
        ),
    )
    .map_err(|e| HandlerErr::insert("book_transactions", e))?;

    // Guarded decrement: a concurrent issue that took the last copy makes
    // this a no-op and the whole issue is rolled back.
    if !store::take_copy(&tx, &book_id)? {
        let _ = tx.rollback();
        return Err(CirculationError::NoCopiesAvailable.into());
    }

    // The borrower's own reservation is satisfied by this loan, whether it
    // was holding a copy or still queued.
    let mut fulfilled = None;
    if let Some(r) = own {
        store::set_reservation_status(&tx, &r.id, ReservationStatus::Fulfilled)?;
        fulfilled = Some(r.id);
    }
    tx.commit().map_err(HandlerErr::tx)?;

    info!(
        school_id = %school_id,
        transaction_id = %transaction_id,
        book_id = %book_id,
        member_id = %member_id,
        due_date = %due_date,
        own_hold = decision == ShelfDecision::OwnHold,
        "book issued"
    );

    let txn = store::get_transaction(conn, &school_id, &transaction_id)?
        .ok_or_else(|| HandlerErr::not_found("transaction"))?;
    Ok(json!({
        "transaction": to_json(&txn)?,
        "fulfilledReservationId": fulfilled
    }))
}

fn circulation_return(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let transaction_id = get_required_str(params, "transactionId")?;
    let return_date = date_or_today(params, "returnDate")?;
    let txn = load_open_transaction(conn, &school_id, &transaction_id)?;
    let settings = store::load_settings(conn, &school_id).map_err(HandlerErr::query)?;

    // A caller-supplied fine overrides the derived one.
    let fine = match params.get("fineAmount").filter(|v| !v.is_null()) {
        Some(v) => policy::parse_money(v, "fineAmount").map_err(HandlerErr::bad_params)?,
        None => policy::compute_fine(&settings, txn.due_date, return_date),
    };
    let days_late = policy::days_late(txn.due_date, return_date);

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "UPDATE book_transactions
         SET return_date = ?, status = 'returned', fine_amount = ?, fine_paid = ?
         WHERE id = ? AND status IN ('issued', 'overdue')",
        (
            fmt_date(return_date),
            fine.to_string(),
            fine.is_zero(),
            &transaction_id,
        ),
    )
    .map_err(HandlerErr::update)?;
    if !store::restore_copy(&tx, &txn.book_id)? {
        let _ = tx.rollback();
        return Err(HandlerErr::new(
            "copy_count_mismatch",
            "every copy of this book is already on the shelf",
        ));
    }
    let promoted =
        store::promote_next_pending(&tx, &settings, &school_id, &txn.book_id, return_date)?;
    tx.commit().map_err(HandlerErr::tx)?;

    info!(
        school_id = %school_id,
        transaction_id = %transaction_id,
        days_late,
        fine = %fine,
        promoted = promoted.as_ref().map(|r| r.id.as_str()),
        "book returned"
    );

    let txn = store::get_transaction(conn, &school_id, &transaction_id)?
        .ok_or_else(|| HandlerErr::not_found("transaction"))?;
    Ok(json!({
        "transaction": to_json(&txn)?,
        "daysLate": days_late,
        "fineAmount": to_json(&fine)?,
        "promotedReservation": to_json(&promoted)?
    }))
}

fn circulation_renew(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let transaction_id = get_required_str(params, "transactionId")?;
    let as_of = date_or_today(params, "asOf")?;
    let txn = load_open_transaction(conn, &school_id, &transaction_id)?;

    policy::check_renewal(txn.renewal_count, txn.max_renewals)?;
    if store::count_competing_reservations(conn, &txn.book_id, &txn.member_id)? > 0 {
        return Err(CirculationError::ReservedForAnotherMember.into());
    }

    let member = store::get_member(conn, &school_id, &txn.member_id)?
        .ok_or_else(|| HandlerErr::not_found("member"))?;
    let settings = store::load_settings(conn, &school_id).map_err(HandlerErr::query)?;
    let renewal_days = settings.borrowing_days(member.member_type);
    let due_date = policy::add_days(as_of, renewal_days)
        .ok_or_else(|| HandlerErr::bad_params("asOf out of range"))?;

    let changed = conn
        .execute(
            "UPDATE book_transactions
             SET due_date = ?, renewal_count = renewal_count + 1, status = 'issued'
             WHERE id = ? AND renewal_count = ? AND status IN ('issued', 'overdue')",
            (fmt_date(due_date), &transaction_id, txn.renewal_count),
        )
        .map_err(HandlerErr::update)?;
    if changed != 1 {
        return Err(HandlerErr::new(
            "conflict",
            "transaction changed while renewing; reload and retry",
        ));
    }
    info!(
        school_id = %school_id,
        transaction_id = %transaction_id,
        renewal = txn.renewal_count + 1,
        due_date = %due_date,
        "loan renewed"
    );

    let txn = store::get_transaction(conn, &school_id, &transaction_id)?
        .ok_or_else(|| HandlerErr::not_found("transaction"))?;
    Ok(json!({ "transaction": to_json(&txn)? }))
}

fn circulation_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let member_id = get_optional_str(params, "memberId")?;
    let book_id = get_optional_str(params, "bookId")?;
    let status = match get_optional_str(params, "status")? {
        Some(raw) => Some(TransactionStatus::parse(&raw).ok_or_else(|| {
            HandlerErr::bad_params("status must be one of: issued, returned, overdue")
        })?),
        None => None,
    };
    let rows = store::list_transactions(
        conn,
        &school_id,
        &TransactionFilter {
            member_id: member_id.as_deref(),
            book_id: book_id.as_deref(),
            status,
        },
    )?;
    Ok(json!({ "transactions": to_json(&rows)? }))
}

/// Flag every issued loan that is past due as of the given date.
fn circulation_mark_overdue(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let as_of = date_or_today(params, "asOf")?;

    let mut stmt = conn.prepare(
        "SELECT id FROM book_transactions
         WHERE school_id = ? AND status = 'issued' AND due_date < ?
         ORDER BY due_date, rowid",
    )?;
    let ids = stmt
        .query_map((&school_id, fmt_date(as_of)), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    for id in &ids {
        tx.execute(
            "UPDATE book_transactions SET status = 'overdue' WHERE id = ? AND status = 'issued'",
            [id],
        )
        .map_err(HandlerErr::update)?;
    }
    tx.commit().map_err(HandlerErr::tx)?;

    if !ids.is_empty() {
        info!(school_id = %school_id, as_of = %as_of, count = ids.len(), "loans marked overdue");
    }
    Ok(json!({ "overdueTransactionIds": ids }))
}

fn circulation_pay_fine(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let transaction_id = get_required_str(params, "transactionId")?;
    let txn = store::get_transaction(conn, &school_id, &transaction_id)?
        .ok_or_else(|| HandlerErr::not_found("transaction"))?;
    if txn.fine_paid || txn.fine_amount <= Decimal::ZERO {
        return Err(CirculationError::NoFineDue.into());
    }
    conn.execute(
        "UPDATE book_transactions SET fine_paid = 1 WHERE id = ?",
        [&transaction_id],
    )
    .map_err(HandlerErr::update)?;
    info!(
        school_id = %school_id,
        transaction_id = %transaction_id,
        amount = %txn.fine_amount,
        "fine paid"
    );
    Ok(json!({ "ok": true, "amountPaid": to_json(&txn.fine_amount)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "circulation.issue" => Some(with_db(state, req, circulation_issue)),
        "circulation.return" => Some(with_db(state, req, circulation_return)),
        "circulation.renew" => Some(with_db(state, req, circulation_renew)),
        "circulation.list" => Some(with_db(state, req, circulation_list)),
        "circulation.markOverdue" => Some(with_db(state, req, circulation_mark_overdue)),
        "circulation.payFine" => Some(with_db(state, req, circulation_pay_fine)),
        _ => None,
    }
}
