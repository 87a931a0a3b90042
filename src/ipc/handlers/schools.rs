use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_required_str, with_db};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn schools_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    // Counts let the UI show a dashboard without extra calls.
    let mut stmt = conn.prepare(
        "SELECT
           s.id,
           s.name,
           (SELECT COUNT(*) FROM books b WHERE b.school_id = s.id) AS book_count,
           (SELECT COUNT(*) FROM library_members m WHERE m.school_id = s.id AND m.is_active = 1) AS member_count
         FROM schools s
         ORDER BY s.name",
    )?;
    let schools = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let book_count: i64 = row.get(2)?;
            let member_count: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "bookCount": book_count,
                "memberCount": member_count
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "schools": schools }))
}

fn schools_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let school_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schools(id, name, created_at) VALUES(?, ?, datetime('now'))",
        (&school_id, &name),
    )
    .map_err(|e| HandlerErr::insert("schools", e))?;
    info!(school_id = %school_id, name = %name, "school created");
    Ok(json!({ "schoolId": school_id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.list" => Some(with_db(state, req, schools_list)),
        "schools.create" => Some(with_db(state, req, schools_create)),
        _ => None,
    }
}
