use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "library.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS workspace_settings(
            school_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(school_id, key),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS books(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            isbn TEXT,
            genre TEXT,
            total_copies INTEGER NOT NULL,
            available_copies INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK(available_copies >= 0 AND available_copies <= total_copies),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_books_school ON books(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS library_members(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            member_type TEXT NOT NULL,
            person_kind TEXT NOT NULL,
            person_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            borrowing_limit INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            UNIQUE(school_id, person_kind, person_id),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_library_members_school ON library_members(school_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS book_transactions(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            book_id TEXT NOT NULL,
            member_id TEXT NOT NULL,
            issue_date TEXT NOT NULL,
            due_date TEXT NOT NULL,
            return_date TEXT,
            status TEXT NOT NULL,
            renewal_count INTEGER NOT NULL DEFAULT 0,
            max_renewals INTEGER NOT NULL,
            fine_amount TEXT NOT NULL DEFAULT '0',
            fine_paid INTEGER NOT NULL DEFAULT 1,
            CHECK(renewal_count <= max_renewals),
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(book_id) REFERENCES books(id),
            FOREIGN KEY(member_id) REFERENCES library_members(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_book_transactions_member ON book_transactions(member_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_book_transactions_book ON book_transactions(book_id, status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS book_reservations(
            id TEXT PRIMARY KEY,
            school_id TEXT NOT NULL,
            book_id TEXT NOT NULL,
            member_id TEXT NOT NULL,
            reservation_date TEXT NOT NULL,
            available_date TEXT,
            expiry_date TEXT,
            status TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(book_id) REFERENCES books(id),
            FOREIGN KEY(member_id) REFERENCES library_members(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_book_reservations_book ON book_reservations(book_id, status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_book_reservations_member ON book_reservations(member_id)",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(
    conn: &Connection,
    school_id: &str,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM workspace_settings WHERE school_id = ? AND key = ?",
            (school_id, key),
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {} is not valid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    school_id: &str,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO workspace_settings(school_id, key, value_json, updated_at)
         VALUES(?, ?, ?, datetime('now'))
         ON CONFLICT(school_id, key) DO UPDATE SET
           value_json = excluded.value_json,
           updated_at = excluded.updated_at",
        (school_id, key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
