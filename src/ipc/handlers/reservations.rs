use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    date_or_today, get_optional_str, get_required_str, require_school, to_json, with_db,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{self, CirculationError, ReservationStatus};
use crate::store::{self, fmt_date, ReservationFilter};
use rusqlite::Connection;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn parse_status(raw: &str) -> Result<ReservationStatus, HandlerErr> {
    ReservationStatus::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params(
            "status must be one of: pending, available, fulfilled, expired, cancelled",
        )
    })
}

fn reservations_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let book_id = get_required_str(params, "bookId")?;
    let member_id = get_required_str(params, "memberId")?;
    let reservation_date = date_or_today(params, "reservationDate")?;

    let member = store::get_member(conn, &school_id, &member_id)?
        .ok_or_else(|| HandlerErr::not_found("member"))?;
    if !member.is_active {
        return Err(CirculationError::MemberInactive.into());
    }
    let book = store::get_book(conn, &school_id, &book_id)?
        .ok_or_else(|| HandlerErr::not_found("book"))?;
    if store::active_reservation_for(conn, &book_id, &member_id)?.is_some() {
        return Err(CirculationError::DuplicateReservation.into());
    }
    if store::member_has_open_loan(conn, &member_id, &book_id)? {
        return Err(CirculationError::AlreadyBorrowed.into());
    }
    let settings = store::load_settings(conn, &school_id).map_err(HandlerErr::query)?;

    let reservation_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "INSERT INTO book_reservations(id, school_id, book_id, member_id, reservation_date, status)
         VALUES(?, ?, ?, ?, ?, 'pending')",
        (
            &reservation_id,
            &school_id,
            &book_id,
            &member_id,
            fmt_date(reservation_date),
        ),
    )
    .map_err(|e| HandlerErr::insert("book_reservations", e))?;

    // A copy already free on the shelf is held straight away, unless older
    // pending reservations are queued ahead.
    let queued_ahead = store::list_reservations(
        &tx,
        &school_id,
        &ReservationFilter {
            book_id: Some(&book_id),
            status: Some(ReservationStatus::Pending),
            ..Default::default()
        },
    )?
    .into_iter()
    .take_while(|r| r.id != reservation_id)
    .count();
    let free = book.available_copies - store::count_held(&tx, &book_id)?;
    if free > 0 && queued_ahead == 0 {
        store::hold_reservation(&tx, &settings, &reservation_id, reservation_date)?;
    }
    tx.commit().map_err(HandlerErr::tx)?;

    let reservation = store::get_reservation(conn, &school_id, &reservation_id)?
        .ok_or_else(|| HandlerErr::not_found("reservation"))?;
    info!(
        school_id = %school_id,
        reservation_id = %reservation_id,
        book_id = %book_id,
        member_id = %member_id,
        status = reservation.status.as_str(),
        "reservation created"
    );
    Ok(json!({ "reservation": to_json(&reservation)? }))
}

fn reservations_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let book_id = get_optional_str(params, "bookId")?;
    let member_id = get_optional_str(params, "memberId")?;
    let status = get_optional_str(params, "status")?
        .map(|s| parse_status(&s))
        .transpose()?;
    let rows = store::list_reservations(
        conn,
        &school_id,
        &ReservationFilter {
            book_id: book_id.as_deref(),
            member_id: member_id.as_deref(),
            status,
        },
    )?;
    Ok(json!({ "reservations": to_json(&rows)? }))
}

/// Manual status change by library staff.
fn reservations_transition(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let reservation_id = get_required_str(params, "reservationId")?;
    let to = parse_status(&get_required_str(params, "status")?)?;
    let on = date_or_today(params, "asOf")?;

    let reservation = store::get_reservation(conn, &school_id, &reservation_id)?
        .ok_or_else(|| HandlerErr::not_found("reservation"))?;
    policy::check_transition(reservation.status, to)?;
    let settings = store::load_settings(conn, &school_id).map_err(HandlerErr::query)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let mut promoted = None;
    match to {
        ReservationStatus::Available => {
            let book = store::get_book(&tx, &school_id, &reservation.book_id)?
                .ok_or_else(|| HandlerErr::not_found("book"))?;
            let held = store::count_held(&tx, &reservation.book_id)?;
            policy::check_shelf(book.available_copies, held, false)?;
            store::hold_reservation(&tx, &settings, &reservation_id, on)?;
        }
        _ => {
            store::set_reservation_status(&tx, &reservation_id, to)?;
            // A hold that ends without a loan (expired, cancelled, or fulfilled
            // by hand) leaves its copy on the shelf for the next in queue.
            if reservation.status == ReservationStatus::Available {
                promoted = store::promote_next_pending(
                    &tx,
                    &settings,
                    &school_id,
                    &reservation.book_id,
                    on,
                )?;
            }
        }
    }
    tx.commit().map_err(HandlerErr::tx)?;

    info!(
        school_id = %school_id,
        reservation_id = %reservation_id,
        from = reservation.status.as_str(),
        to = to.as_str(),
        "reservation status changed"
    );
    let reservation = store::get_reservation(conn, &school_id, &reservation_id)?
        .ok_or_else(|| HandlerErr::not_found("reservation"))?;
    Ok(json!({
        "reservation": to_json(&reservation)?,
        "promotedReservation": to_json(&promoted)?
    }))
}

/// Expire holds whose window closed before `asOf` and pass each freed copy
/// to the next pending reservation.
fn reservations_expire_sweep(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let as_of = date_or_today(params, "asOf")?;
    let settings = store::load_settings(conn, &school_id).map_err(HandlerErr::query)?;

    let lapsed: Vec<store::ReservationRow> = store::list_reservations(
        conn,
        &school_id,
        &ReservationFilter {
            status: Some(ReservationStatus::Available),
            ..Default::default()
        },
    )?
    .into_iter()
    .filter(|r| r.expiry_date.is_some_and(|d| d < as_of))
    .collect();

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    let mut expired = Vec::new();
    let mut promoted = Vec::new();
    for r in lapsed {
        store::set_reservation_status(&tx, &r.id, ReservationStatus::Expired)?;
        if let Some(p) = store::promote_next_pending(&tx, &settings, &school_id, &r.book_id, as_of)? {
            promoted.push(p.id);
        }
        expired.push(r.id);
    }
    tx.commit().map_err(HandlerErr::tx)?;

    if !expired.is_empty() {
        info!(
            school_id = %school_id,
            as_of = %as_of,
            expired = expired.len(),
            promoted = promoted.len(),
            "reservation holds expired"
        );
    }
    Ok(json!({
        "expiredReservationIds": expired,
        "promotedReservationIds": promoted
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reservations.create" => Some(with_db(state, req, reservations_create)),
        "reservations.list" => Some(with_db(state, req, reservations_list)),
        "reservations.transition" => Some(with_db(state, req, reservations_transition)),
        "reservations.expireSweep" => Some(with_db(state, req, reservations_expire_sweep)),
        _ => None,
    }
}
