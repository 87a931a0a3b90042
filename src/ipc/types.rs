//! Request envelope and the daemon's per-process state.

use crate::db;
use rusqlite::Connection;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// One line of the stdin protocol.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The selected workspace and its open library database, if any.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    /// Open (creating if needed) the workspace database and make it current.
    pub fn open_workspace(&mut self, path: &Path) -> anyhow::Result<()> {
        let conn = db::open_db(path)?;
        self.workspace = Some(path.to_path_buf());
        self.db = Some(conn);
        info!(workspace = %path.display(), "workspace opened");
        Ok(())
    }

    pub fn is_current(&self, path: &Path) -> bool {
        self.workspace.as_deref() == Some(path)
    }

    /// Drop the connection so the database file can be swapped on disk.
    pub fn release_db(&mut self) {
        self.db = None;
    }
}
