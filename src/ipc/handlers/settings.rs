use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_required_str, require_school, to_json, with_db};
use crate::ipc::types::{AppState, Request};
use crate::policy::MemberType;
use crate::store::{self, SETTINGS_KEY};
use rusqlite::Connection;
use serde_json::json;
use tracing::info;

fn load(conn: &Connection, school_id: &str) -> Result<crate::policy::LibrarySettings, HandlerErr> {
    store::load_settings(conn, school_id).map_err(HandlerErr::query)
}

fn settings_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let settings = load(conn, &school_id)?;
    Ok(json!({ "settings": to_json(&settings)? }))
}

fn settings_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut settings = load(conn, &school_id)?;
    settings
        .apply_patch(patch)
        .map_err(HandlerErr::bad_params)?;
    let value = to_json(&settings)?;
    db::settings_set_json(conn, &school_id, SETTINGS_KEY, &value).map_err(HandlerErr::update)?;

    let fields: Vec<&str> = patch.keys().map(|k| k.as_str()).collect();
    info!(school_id = %school_id, ?fields, "library settings updated");
    Ok(json!({ "settings": value }))
}

/// Borrowing limit and loan duration for a member type.
fn policy_resolve(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let school_id = require_school(conn, params)?;
    let raw = get_required_str(params, "memberType")?;
    let member_type = MemberType::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params("memberType must be one of: student, teacher, staff"))?;
    let settings = load(conn, &school_id)?;
    Ok(json!({
        "memberType": member_type.as_str(),
        "borrowingLimit": settings.borrowing_limit(member_type),
        "borrowingDays": settings.borrowing_days(member_type),
        "maxRenewals": settings.max_renewals
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "librarySettings.get" => Some(with_db(state, req, settings_get)),
        "librarySettings.update" => Some(with_db(state, req, settings_update)),
        "library.policy" => Some(with_db(state, req, policy_resolve)),
        _ => None,
    }
}
