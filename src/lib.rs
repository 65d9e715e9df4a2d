pub mod archive;
pub mod audit;
pub mod cli;
pub mod config;
pub mod db;
pub mod extract;
pub mod history;
pub mod hook;
pub mod project;
pub mod publish;
pub mod render;
pub mod rerun;
pub mod schema;
pub mod score;
pub mod topics;
pub mod transcript;
pub mod verify;

#[derive(Debug)]
pub enum AuditError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
    Config(String),
    Input(String),
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::Database(e) => write!(f, "database: {e}"),
            AuditError::Io(e) => write!(f, "io: {e}"),
            AuditError::Json(e) => write!(f, "json: {e}"),
            AuditError::Config(msg) => write!(f, "config: {msg}"),
            AuditError::Input(msg) => write!(f, "input: {msg}"),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<rusqlite::Error> for AuditError {
    fn from(e: rusqlite::Error) -> Self {
        AuditError::Database(e)
    }
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::Io(e)
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        AuditError::Json(e)
    }
}

impl From<rusqlite_migration::Error> for AuditError {
    fn from(e: rusqlite_migration::Error) -> Self {
        match e {
            rusqlite_migration::Error::RusqliteError { query: _, err } => AuditError::Database(err),
            other => AuditError::Config(format!("migration: {other}")),
        }
    }
}
