use crate::AuditError;
use crate::schema::MIGRATIONS;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

pub const DB_FILE: &str = "archive.db";

pub fn db_path(archive_dir: &Path) -> PathBuf {
    archive_dir.join(DB_FILE)
}

/// Apply standard PRAGMAs (before migrations).
fn apply_pragmas(conn: &Connection) -> Result<(), AuditError> {
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Open (creating if needed) the archive database inside `archive_dir`.
pub fn open_db(archive_dir: &Path) -> Result<Connection, AuditError> {
    if !archive_dir.exists() {
        std::fs::create_dir_all(archive_dir)?;
    }
    let mut conn = Connection::open(db_path(archive_dir))?;
    apply_pragmas(&conn)?;
    MIGRATIONS.to_latest(&mut conn)?;
    Ok(conn)
}
