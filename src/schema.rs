use rusqlite_migration::{M, Migrations};
use std::sync::LazyLock;

pub static MIGRATIONS: LazyLock<Migrations<'static>> = LazyLock::new(|| {
    Migrations::new(vec![
        M::up(
            "
CREATE TABLE sessions (
    session_id     TEXT NOT NULL,
    split          INTEGER NOT NULL,
    project        TEXT NOT NULL,
    started_at     TEXT,
    ended_at       TEXT,
    turn_count     INTEGER NOT NULL DEFAULT 0,
    active_version INTEGER NOT NULL DEFAULT 0,
    tags           TEXT NOT NULL DEFAULT '',
    summary        TEXT,
    updated_at     INTEGER NOT NULL,
    PRIMARY KEY (session_id, split)
);

CREATE TABLE turns (
    session_id  TEXT NOT NULL,
    split       INTEGER NOT NULL,
    seq         INTEGER NOT NULL,
    role        TEXT NOT NULL,
    timestamp   TEXT NOT NULL,
    text        TEXT NOT NULL,
    thinking    TEXT NOT NULL DEFAULT '',
    tool_uses   TEXT,
    model       TEXT,
    PRIMARY KEY (session_id, split, seq)
);

CREATE TABLE records (
    session_id  TEXT NOT NULL,
    split       INTEGER NOT NULL,
    version     INTEGER NOT NULL,
    format      INTEGER NOT NULL,
    tag_map     TEXT NOT NULL,
    turn_count  INTEGER NOT NULL,
    content     TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    PRIMARY KEY (session_id, split, version)
);

CREATE TABLE compactions (
    session_id  TEXT NOT NULL,
    split       INTEGER NOT NULL,
    timestamp   TEXT NOT NULL,
    text        TEXT NOT NULL,
    PRIMARY KEY (session_id, split)
);

CREATE TABLE audit_runs (
    run           INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at    INTEGER NOT NULL,
    lineage       TEXT,
    weighted_rate REAL NOT NULL,
    entry         TEXT NOT NULL
);

CREATE INDEX idx_sessions_updated ON sessions(updated_at);
CREATE INDEX idx_audit_lineage ON audit_runs(lineage, run);
",
        ),
        M::up(
            "
CREATE TABLE reruns (
    id          INTEGER PRIMARY KEY,
    batch       TEXT NOT NULL,
    rerun_of    INTEGER NOT NULL,
    status      TEXT NOT NULL,
    result      TEXT NOT NULL
);
CREATE INDEX idx_reruns_run ON reruns(rerun_of, batch);
",
        ),
    ])
});
