use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    date_or_today, get_bool, get_optional_i64, get_optional_str, get_required_str,
    require_school, to_json, with_db,
};
use crate::ipc::types::{AppState, Request};
use crate::policy::{MemberType, ReservationStatus};
use crate::store::{self, ReservationFilter};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn parse_member_type(raw: &str) -> Result<MemberType, HandlerErr> {
    MemberType::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params("memberType must be one of: student, teacher, staff"))
}

fn parse_limit(v: Option<i64>) -> Result<Option<i64>, HandlerErr> {
    match v {
        Some(n) if !(0..=50).contains(&n) => {
            Err(HandlerErr::bad_params("borrowingLimit must be in 0..=50"))
        }
        other => Ok(other),
    }
}

fn members_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let member_type = parse_member_type(&get_required_str(params, "memberType")?)?;
    let person_id = get_required_str(params, "personId")?;
    let display_name = get_required_str(params, "displayName")?;

    // The limit is resolved once, at creation; later settings changes do not
    // move existing members.
    let borrowing_limit = match parse_limit(get_optional_i64(params, "borrowingLimit")?)? {
        Some(n) => n,
        None => store::load_settings(conn, &school_id)
            .map_err(HandlerErr::query)?
            .borrowing_limit(member_type),
    };

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM library_members WHERE school_id = ? AND person_kind = ? AND person_id = ?",
            (&school_id, member_type.person_kind(), &person_id),
            |r| r.get(0),
        )
        .optional()?;
    if let Some(existing_id) = existing {
        return Err(HandlerErr::new("duplicate_member", "person is already a library member")
            .with_details(json!({ "memberId": existing_id })));
    }

    let member_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO library_members(id, school_id, member_type, person_kind, person_id, display_name, borrowing_limit, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, datetime('now'))",
        (
            &member_id,
            &school_id,
            member_type.as_str(),
            member_type.person_kind(),
            &person_id,
            &display_name,
            borrowing_limit,
        ),
    )
    .map_err(|e| HandlerErr::insert("library_members", e))?;
    info!(
        school_id = %school_id,
        member_id = %member_id,
        member_type = member_type.as_str(),
        borrowing_limit,
        "library member created"
    );

    let member = store::get_member(conn, &school_id, &member_id)?
        .ok_or_else(|| HandlerErr::not_found("member"))?;
    Ok(json!({ "member": to_json(&member)? }))
}

fn members_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let include_inactive = get_bool(params, "includeInactive", false)?;
    let members = store::list_members(conn, &school_id, include_inactive)?;
    Ok(json!({ "members": to_json(&members)? }))
}

fn members_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let member_id = get_required_str(params, "memberId")?;
    let member = store::get_member(conn, &school_id, &member_id)?
        .ok_or_else(|| HandlerErr::not_found("member"))?;
    let open_loans = store::count_open_loans(conn, &member_id)?;
    let fines = store::outstanding_fines(conn, &member_id)?;
    Ok(json!({
        "member": to_json(&member)?,
        "openLoans": open_loans,
        "remainingAllowance": (member.borrowing_limit - open_loans).max(0),
        "outstandingFines": to_json(&fines)?
    }))
}

fn members_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let member_id = get_required_str(params, "memberId")?;
    let Some(patch) = params.get("patch").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };
    let member = store::get_member(conn, &school_id, &member_id)?
        .ok_or_else(|| HandlerErr::not_found("member"))?;

    for key in patch.as_object().into_iter().flat_map(|o| o.keys()) {
        if !matches!(key.as_str(), "displayName" | "memberType" | "borrowingLimit") {
            return Err(HandlerErr::bad_params(format!("unknown member field: {}", key)));
        }
    }

    let display_name = match patch.get("displayName") {
        Some(_) => get_required_str(patch, "displayName")?,
        None => member.display_name.clone(),
    };
    let member_type = match get_optional_str(patch, "memberType")? {
        Some(raw) => parse_member_type(&raw)?,
        None => member.member_type,
    };
    if member_type.person_kind() != member.person_kind {
        return Err(HandlerErr::bad_params(format!(
            "a {} member cannot become a {}",
            member.member_type.as_str(),
            member_type.as_str()
        )));
    }
    let borrowing_limit =
        parse_limit(get_optional_i64(patch, "borrowingLimit")?)?.unwrap_or(member.borrowing_limit);

    conn.execute(
        "UPDATE library_members SET display_name = ?, member_type = ?, borrowing_limit = ?
         WHERE id = ? AND school_id = ?",
        (&display_name, member_type.as_str(), borrowing_limit, &member_id, &school_id),
    )
    .map_err(HandlerErr::update)?;

    let member = store::get_member(conn, &school_id, &member_id)?
        .ok_or_else(|| HandlerErr::not_found("member"))?;
    Ok(json!({ "member": to_json(&member)? }))
}

/// Soft delete. Active reservations are cancelled; a freed hold goes to the
/// next pending reservation of that book.
fn members_deactivate(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let member_id = get_required_str(params, "memberId")?;
    let on = date_or_today(params, "asOf")?;
    if store::get_member(conn, &school_id, &member_id)?.is_none() {
        return Err(HandlerErr::not_found("member"));
    }
    let settings = store::load_settings(conn, &school_id).map_err(HandlerErr::query)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::tx)?;
    tx.execute(
        "UPDATE library_members SET is_active = 0 WHERE id = ? AND school_id = ?",
        (&member_id, &school_id),
    )
    .map_err(HandlerErr::update)?;

    let active = store::list_reservations(
        &tx,
        &school_id,
        &ReservationFilter {
            member_id: Some(&member_id),
            ..Default::default()
        },
    )?
    .into_iter()
    .filter(|r| r.status.is_active());

    let mut cancelled = Vec::new();
    let mut promoted = Vec::new();
    for r in active {
        store::set_reservation_status(&tx, &r.id, ReservationStatus::Cancelled)?;
        if r.status == ReservationStatus::Available {
            if let Some(p) = store::promote_next_pending(&tx, &settings, &school_id, &r.book_id, on)? {
                promoted.push(p.id);
            }
        }
        cancelled.push(r.id);
    }
    tx.commit().map_err(HandlerErr::tx)?;

    info!(
        school_id = %school_id,
        member_id = %member_id,
        cancelled = cancelled.len(),
        "library member deactivated"
    );
    Ok(json!({
        "ok": true,
        "cancelledReservations": cancelled,
        "promotedReservations": promoted
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "members.create" => Some(with_db(state, req, members_create)),
        "members.list" => Some(with_db(state, req, members_list)),
        "members.get" => Some(with_db(state, req, members_get)),
        "members.update" => Some(with_db(state, req, members_update)),
        "members.deactivate" => Some(with_db(state, req, members_deactivate)),
        _ => None,
    }
}
