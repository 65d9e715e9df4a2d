//! The archive store: append-only turns per (session, split), versioned
//! rendered records with an active pointer, and the compaction summaries
//! seen while ingesting.
//!
//! SQLite is the store of record. Each append or enrich runs in one
//! transaction; ingest stores turns batch by batch and renders each touched
//! split once at the end. The published markdown files and `index.md` are
//! derived views written after commit.

use crate::AuditError;
use crate::db::open_db;
use crate::project::derive_project;
use crate::publish::{IndexEntry, write_atomic, write_index};
use crate::render::{
    Format, Header, RenderInput, parse_header, record_file_name, render, session_summary,
    session_tags,
};
use crate::topics::TopicMap;
use crate::transcript::{Event, Role, Sequencer, ToolUse, Turn, open_transcript};
use chrono::DateTime;
use rusqlite::{Connection, OptionalExtension, params};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Turns buffered per (session, split) before they are flushed to the store.
const INGEST_BATCH: usize = 500;

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Integrity problems found in stored data. Reported alongside results,
/// never raised as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    SequenceGap {
        session_id: String,
        split: u32,
        expected: u32,
        found: u32,
    },
    TimestampRegression {
        session_id: String,
        split: u32,
        seq: u32,
        previous: String,
        timestamp: String,
    },
    HeaderMismatch {
        session_id: String,
        split: u32,
        header_turns: u32,
        stored_turns: u32,
    },
    TurnConflict {
        session_id: String,
        split: u32,
        seq: u32,
    },
    DuplicateRun {
        run: i64,
    },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::SequenceGap {
                session_id,
                split,
                expected,
                found,
            } => write!(
                f,
                "sequence gap in {session_id}/{split}: expected turn {expected}, found {found}"
            ),
            Anomaly::TimestampRegression {
                session_id,
                split,
                seq,
                previous,
                timestamp,
            } => write!(
                f,
                "timestamp regression in {session_id}/{split} at turn {seq}: {timestamp} < {previous}"
            ),
            Anomaly::HeaderMismatch {
                session_id,
                split,
                header_turns,
                stored_turns,
            } => write!(
                f,
                "header of {session_id}/{split} claims {header_turns} turns, store has {stored_turns}"
            ),
            Anomaly::TurnConflict {
                session_id,
                split,
                seq,
            } => write!(
                f,
                "turn {seq} of {session_id}/{split} differs from the stored turn; kept the stored one"
            ),
            Anomaly::DuplicateRun { run } => write!(f, "run number {run} appears more than once"),
        }
    }
}

/// True when `ts` is strictly earlier than `prev`. Unparseable timestamps
/// never count as a regression.
fn timestamp_before(ts: &str, prev: &str) -> bool {
    match (DateTime::parse_from_rfc3339(ts), DateTime::parse_from_rfc3339(prev)) {
        (Ok(a), Ok(b)) => a < b,
        _ => false,
    }
}

/// Gaps and timestamp regressions over a stored turn sequence.
pub fn check_integrity(session_id: &str, split: u32, turns: &[Turn]) -> Vec<Anomaly> {
    let mut out = Vec::new();
    let mut expected = 1;
    let mut prev: Option<&Turn> = None;
    for t in turns {
        if t.seq != expected {
            out.push(Anomaly::SequenceGap {
                session_id: session_id.into(),
                split,
                expected,
                found: t.seq,
            });
        }
        expected = t.seq + 1;
        if let Some(p) = prev {
            if timestamp_before(&t.timestamp, &p.timestamp) {
                out.push(Anomaly::TimestampRegression {
                    session_id: session_id.into(),
                    split,
                    seq: t.seq,
                    previous: p.timestamp.clone(),
                    timestamp: t.timestamp.clone(),
                });
            }
        }
        prev = Some(t);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct SessionInfo {
    pub session_id: String,
    pub split: u32,
    pub project: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub turn_count: u32,
    pub active_version: u32,
    pub tags: String,
    pub summary: Option<String>,
}

impl SessionInfo {
    fn date(&self) -> String {
        self.started_at
            .as_deref()
            .and_then(|s| s.get(..10))
            .unwrap_or("unknown-date")
            .to_string()
    }
}

/// One rendered record version together with the turns it covers.
#[derive(Debug, Clone)]
pub struct Record {
    pub session_id: String,
    pub split: u32,
    pub version: u32,
    pub format: Format,
    pub project: String,
    pub turns: Vec<Turn>,
    pub header: Header,
    pub content: String,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Default)]
pub struct AppendOutcome {
    pub added: usize,
    pub skipped: usize,
    pub version: u32,
    /// Whether the active record's content changed.
    pub written: bool,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichOutcome {
    Unchanged { version: u32 },
    Created { version: u32 },
}

#[derive(Debug, Clone)]
pub struct Compaction {
    pub session_id: String,
    pub split: u32,
    pub timestamp: String,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct IngestOptions {
    /// Project name to record instead of deriving one from `cwd`.
    pub project: Option<String>,
    /// Only ingest this session.
    pub session: Option<String>,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub files: usize,
    pub turns_added: usize,
    pub turns_skipped: usize,
    pub compactions: usize,
    pub lines_skipped: usize,
    pub touched: BTreeSet<(String, u32)>,
    pub anomalies: Vec<Anomaly>,
}

struct Pending {
    session_id: String,
    split: u32,
    project: String,
    turns: Vec<Turn>,
}

/// Formatting rules stored with a record version.
struct Rules {
    format: Format,
    tags: TopicMap,
    turn_count: u32,
    content: String,
}

pub struct ArchiveStore {
    dir: PathBuf,
    conn: Connection,
    tags: TopicMap,
    /// Formatting revision for records created from now on.
    format: Format,
}

impl ArchiveStore {
    /// Open (creating if needed) the archive in `dir`.
    pub fn open(dir: &Path, tags: TopicMap) -> Result<Self, AuditError> {
        let conn = open_db(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            conn,
            tags,
            format: Format::LATEST,
        })
    }

    /// Create new records with `format` instead of the latest revision.
    /// Existing records keep their own; `enrich` upgrades them.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Open an archive that must already exist.
    pub fn open_existing(dir: &Path, tags: TopicMap) -> Result<Self, AuditError> {
        if !dir.is_dir() {
            return Err(AuditError::Config(format!(
                "archive directory {} does not exist",
                dir.display()
            )));
        }
        Self::open(dir, tags)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn tags(&self) -> &TopicMap {
        &self.tags
    }

    /// Stream transcripts into the store. One [`Sequencer`] spans all files
    /// so a session continued across files keeps gapless numbering.
    pub fn ingest(&self, paths: &[PathBuf], opts: &IngestOptions) -> Result<IngestReport, AuditError> {
        let mut seq = Sequencer::default();
        let mut report = IngestReport::default();
        let mut projects = BTreeMap::new();

        for path in paths {
            let mut reader = open_transcript(path)?;
            let mut pending: Option<Pending> = None;

            for event in reader.by_ref() {
                match event {
                    Event::Compaction {
                        session_id,
                        timestamp,
                        text,
                        ..
                    } => {
                        if opts.session.as_deref().is_some_and(|s| s != session_id) {
                            continue;
                        }
                        self.flush(pending.take(), &mut projects, &mut report)?;
                        let split = seq.open_split(&session_id);
                        self.record_compaction(&session_id, split, &timestamp, &text)?;
                        report.compactions += 1;
                    }
                    Event::Turn {
                        session_id,
                        cwd,
                        mut turn,
                    } => {
                        if opts.session.as_deref().is_some_and(|s| s != session_id) {
                            continue;
                        }
                        let split = seq.place(&session_id, &mut turn);
                        let same_key = pending
                            .as_ref()
                            .is_some_and(|p| p.session_id == session_id && p.split == split);
                        if !same_key {
                            self.flush(pending.take(), &mut projects, &mut report)?;
                        }
                        let batch = pending.get_or_insert_with(|| Pending {
                            project: opts
                                .project
                                .clone()
                                .unwrap_or_else(|| derive_project(cwd.as_deref().unwrap_or(""))),
                            session_id,
                            split,
                            turns: Vec::new(),
                        });
                        batch.turns.push(turn);
                        if batch.turns.len() >= INGEST_BATCH {
                            self.flush(pending.take(), &mut projects, &mut report)?;
                        }
                    }
                }
            }

            self.flush(pending.take(), &mut projects, &mut report)?;
            report.lines_skipped += reader.skipped();
            report.files += 1;
        }

        // Render each touched split once, after all of its turns are stored.
        let mut published = 0;
        for ((session_id, split), project) in &projects {
            let tx = self.conn.unchecked_transaction()?;
            let (version, written) = self.rerender(&tx, session_id, *split, project)?;
            tx.commit()?;
            if let Some(content) = written {
                self.publish(session_id, *split, version, &content)?;
                published += 1;
                log::info!("archived {session_id}/{split} v{version}");
            }
        }
        if published > 0 {
            self.refresh_index()?;
        }
        Ok(report)
    }

    fn flush(
        &self,
        pending: Option<Pending>,
        projects: &mut BTreeMap<(String, u32), String>,
        report: &mut IngestReport,
    ) -> Result<(), AuditError> {
        let Some(p) = pending else {
            return Ok(());
        };
        let tx = self.conn.unchecked_transaction()?;
        let outcome = insert_turns(&tx, &p.session_id, p.split, &p.turns)?;
        tx.commit()?;
        report.turns_added += outcome.added;
        report.turns_skipped += outcome.skipped;
        report.anomalies.extend(outcome.anomalies);
        projects
            .entry((p.session_id.clone(), p.split))
            .or_insert(p.project);
        report.touched.insert((p.session_id, p.split));
        Ok(())
    }

    /// Merge `turns` into (session, split). Turns whose sequence index is
    /// already stored are skipped; the active record is re-rendered with its
    /// own formatting rules.
    pub fn append(
        &self,
        session_id: &str,
        split: u32,
        project: &str,
        turns: &[Turn],
    ) -> Result<AppendOutcome, AuditError> {
        if turns.is_empty() {
            return Ok(AppendOutcome::default());
        }
        let tx = self.conn.unchecked_transaction()?;
        let mut outcome = insert_turns(&tx, session_id, split, turns)?;
        let (version, written) = self.rerender(&tx, session_id, split, project)?;
        tx.commit()?;

        outcome.version = version;
        outcome.written = written.is_some();
        if let Some(content) = written {
            self.publish(session_id, split, version, &content)?;
            self.refresh_index()?;
            log::info!(
                "archived {session_id}/{split} v{version}: {} new turns, {} skipped",
                outcome.added,
                outcome.skipped
            );
        }
        Ok(outcome)
    }

    /// Refresh the session row and re-render the active record from the
    /// stored turns. Returns the active version and, when the record changed,
    /// its new content for publishing after commit.
    fn rerender(
        &self,
        conn: &Connection,
        session_id: &str,
        split: u32,
        project: &str,
    ) -> Result<(u32, Option<String>), AuditError> {
        let existing: Option<(String, u32)> = conn
            .query_row(
                "SELECT project, active_version FROM sessions WHERE session_id = ?1 AND split = ?2",
                params![session_id, split],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (project, active) = match existing {
            Some((p, v)) => (p, v),
            None => (project.to_string(), 0),
        };

        let stored = load_turns(conn, session_id, split, None)?;
        let started_at = stored.first().map(|t| t.timestamp.clone());
        let ended_at = stored.last().map(|t| t.timestamp.clone());
        conn.execute(
            "INSERT INTO sessions (session_id, split, project, started_at, ended_at, turn_count,
                                   active_version, tags, summary, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(session_id, split) DO UPDATE SET
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                turn_count = excluded.turn_count,
                active_version = excluded.active_version,
                tags = excluded.tags,
                summary = excluded.summary,
                updated_at = excluded.updated_at",
            params![
                session_id,
                split,
                project,
                started_at,
                ended_at,
                stored.len() as u32,
                active.max(1),
                session_tags(&stored, &self.tags),
                session_summary(&stored),
                now_ts(),
            ],
        )?;

        let (version, rules) = match active {
            0 => (1, None),
            v => (v, load_rules(conn, session_id, split, v)?),
        };
        let (format, map) = match &rules {
            Some(r) => (r.format, &r.tags),
            None => (self.format, &self.tags),
        };
        let content = render(&RenderInput {
            session_id,
            split,
            version,
            project: &project,
            format,
            tags: map,
            turns: &stored,
        });

        if rules.as_ref().map(|r| r.content.as_str()) == Some(content.as_str()) {
            return Ok((version, None));
        }
        conn.execute(
            "INSERT INTO records (session_id, split, version, format, tag_map, turn_count, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(session_id, split, version) DO UPDATE SET
                turn_count = excluded.turn_count,
                content = excluded.content",
            params![
                session_id,
                split,
                version,
                format.as_i64(),
                map.to_json(),
                stored.len() as u32,
                content,
                now_ts(),
            ],
        )?;
        Ok((version, Some(content)))
    }

    /// Re-render the active record with the latest formatting rules and the
    /// injected semantic map. A new version is created only when the bytes
    /// would differ.
    pub fn enrich(&self, session_id: &str, split: u32) -> Result<EnrichOutcome, AuditError> {
        let info = self.session(session_id, split)?.ok_or_else(|| {
            AuditError::Input(format!("no archived session {session_id}/{split}"))
        })?;
        let active = info.active_version;
        let current = load_rules(&self.conn, session_id, split, active)?.ok_or_else(|| {
            AuditError::Input(format!("no record v{active} for {session_id}/{split}"))
        })?;
        let turns = load_turns(&self.conn, session_id, split, None)?;

        let render_as = |version| {
            render(&RenderInput {
                session_id,
                split,
                version,
                project: &info.project,
                format: Format::LATEST,
                tags: &self.tags,
                turns: &turns,
            })
        };
        if render_as(active) == current.content {
            return Ok(EnrichOutcome::Unchanged { version: active });
        }

        let version = active + 1;
        let content = render_as(version);
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO records (session_id, split, version, format, tag_map, turn_count, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                split,
                version,
                Format::LATEST.as_i64(),
                self.tags.to_json(),
                turns.len() as u32,
                content,
                now_ts(),
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET active_version = ?3, tags = ?4, updated_at = ?5
             WHERE session_id = ?1 AND split = ?2",
            params![
                session_id,
                split,
                version,
                session_tags(&turns, &self.tags),
                now_ts()
            ],
        )?;
        tx.commit()?;

        self.publish(session_id, split, version, &content)?;
        self.refresh_index()?;
        log::info!("enriched {session_id}/{split}: v{active} -> v{version}");
        Ok(EnrichOutcome::Created { version })
    }

    /// Enrich every archived split, optionally restricted to one session.
    pub fn enrich_all(
        &self,
        session: Option<&str>,
    ) -> Result<Vec<(String, u32, EnrichOutcome)>, AuditError> {
        let mut out = Vec::new();
        for info in self.sessions()? {
            if session.is_some_and(|s| s != info.session_id) {
                continue;
            }
            let outcome = self.enrich(&info.session_id, info.split)?;
            out.push((info.session_id, info.split, outcome));
        }
        Ok(out)
    }

    /// A stored record version (the active one when `version` is None).
    pub fn read(
        &self,
        session_id: &str,
        split: u32,
        version: Option<u32>,
    ) -> Result<Record, AuditError> {
        let info = self.session(session_id, split)?.ok_or_else(|| {
            AuditError::Input(format!("no archived session {session_id}/{split}"))
        })?;
        let version = version.unwrap_or(info.active_version);
        let rules = load_rules(&self.conn, session_id, split, version)?.ok_or_else(|| {
            AuditError::Input(format!("no record v{version} for {session_id}/{split}"))
        })?;
        let turns = load_turns(&self.conn, session_id, split, Some(rules.turn_count))?;
        Ok(self.assemble(&info, version, rules.format, turns, rules.content))
    }

    /// Record content exactly as it stood when `version` covered its first
    /// `turn_count` turns, re-rendered from the stored rules.
    pub fn snapshot(
        &self,
        session_id: &str,
        split: u32,
        version: u32,
        turn_count: u32,
    ) -> Result<Record, AuditError> {
        let info = self.session(session_id, split)?.ok_or_else(|| {
            AuditError::Input(format!("no archived session {session_id}/{split}"))
        })?;
        let rules = load_rules(&self.conn, session_id, split, version)?.ok_or_else(|| {
            AuditError::Input(format!("no record v{version} for {session_id}/{split}"))
        })?;
        let turns = load_turns(&self.conn, session_id, split, Some(turn_count))?;
        let content = render(&RenderInput {
            session_id,
            split,
            version,
            project: &info.project,
            format: rules.format,
            tags: &rules.tags,
            turns: &turns,
        });
        Ok(self.assemble(&info, version, rules.format, turns, content))
    }

    fn assemble(
        &self,
        info: &SessionInfo,
        version: u32,
        format: Format,
        turns: Vec<Turn>,
        content: String,
    ) -> Record {
        let header = parse_header(&content);
        let mut anomalies = check_integrity(&info.session_id, info.split, &turns);
        if header.turns as usize != turns.len() {
            anomalies.push(Anomaly::HeaderMismatch {
                session_id: info.session_id.clone(),
                split: info.split,
                header_turns: header.turns,
                stored_turns: turns.len() as u32,
            });
        }
        Record {
            session_id: info.session_id.clone(),
            split: info.split,
            version,
            format,
            project: info.project.clone(),
            turns,
            header,
            content,
            anomalies,
        }
    }

    pub fn record_compaction(
        &self,
        session_id: &str,
        split: u32,
        timestamp: &str,
        text: &str,
    ) -> Result<(), AuditError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO compactions (session_id, split, timestamp, text)
             VALUES (?1, ?2, ?3, ?4)",
            params![session_id, split, timestamp, text],
        )?;
        Ok(())
    }

    /// The compaction summary that opened `split`.
    pub fn compaction(&self, session_id: &str, split: u32) -> Result<Option<Compaction>, AuditError> {
        Ok(self
            .conn
            .query_row(
                "SELECT timestamp, text FROM compactions WHERE session_id = ?1 AND split = ?2",
                params![session_id, split],
                |r| {
                    Ok(Compaction {
                        session_id: session_id.to_string(),
                        split,
                        timestamp: r.get(0)?,
                        text: r.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// Split whose compaction has this timestamp, if one was ingested.
    pub fn split_for_compaction(
        &self,
        session_id: &str,
        timestamp: &str,
    ) -> Result<Option<u32>, AuditError> {
        Ok(self
            .conn
            .query_row(
                "SELECT split FROM compactions WHERE session_id = ?1 AND timestamp = ?2",
                params![session_id, timestamp],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn session(&self, session_id: &str, split: u32) -> Result<Option<SessionInfo>, AuditError> {
        Ok(self
            .conn
            .query_row(
                &format!("{SESSION_COLUMNS} WHERE session_id = ?1 AND split = ?2"),
                params![session_id, split],
                session_from_row,
            )
            .optional()?)
    }

    /// All archived splits in chronological order.
    pub fn sessions(&self) -> Result<Vec<SessionInfo>, AuditError> {
        let mut stmt = self.conn.prepare(&format!(
            "{SESSION_COLUMNS} ORDER BY COALESCE(started_at, ''), session_id, split"
        ))?;
        let rows = stmt.query_map([], session_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// The split that ended most recently, optionally within one session.
    pub fn latest_session(&self, session: Option<&str>) -> Result<Option<SessionInfo>, AuditError> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "{SESSION_COLUMNS} WHERE ?1 IS NULL OR session_id = ?1
                     ORDER BY COALESCE(ended_at, '') DESC, split DESC LIMIT 1"
                ),
                params![session],
                session_from_row,
            )
            .optional()?)
    }

    fn publish(&self, session_id: &str, split: u32, version: u32, content: &str) -> Result<(), AuditError> {
        let info = self.session(session_id, split)?.ok_or_else(|| {
            AuditError::Input(format!("no archived session {session_id}/{split}"))
        })?;
        let name = record_file_name(session_id, split, &info.date(), version);
        write_atomic(&self.dir.join(name), content.as_bytes())
    }

    fn refresh_index(&self) -> Result<(), AuditError> {
        let entries: Vec<IndexEntry> = self
            .sessions()?
            .into_iter()
            .map(|s| IndexEntry {
                file: record_file_name(&s.session_id, s.split, &s.date(), s.active_version),
                date: s.date(),
                session_id: s.session_id,
                split: s.split,
                version: s.active_version,
                turns: s.turn_count,
                tags: s.tags,
                summary: s.summary.unwrap_or_default(),
            })
            .collect();
        write_index(&self.dir, &entries)
    }
}

const SESSION_COLUMNS: &str = "SELECT session_id, split, project, started_at, ended_at, turn_count,
        active_version, tags, summary FROM sessions";

fn session_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<SessionInfo> {
    Ok(SessionInfo {
        session_id: r.get(0)?,
        split: r.get(1)?,
        project: r.get(2)?,
        started_at: r.get(3)?,
        ended_at: r.get(4)?,
        turn_count: r.get(5)?,
        active_version: r.get(6)?,
        tags: r.get(7)?,
        summary: r.get(8)?,
    })
}

/// Store the turns of `turns` not yet present under (session, split).
fn insert_turns(
    conn: &Connection,
    session_id: &str,
    split: u32,
    turns: &[Turn],
) -> Result<AppendOutcome, AuditError> {
    let mut outcome = AppendOutcome::default();
    let (mut max_seq, mut last_ts): (u32, Option<String>) = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0),
                (SELECT timestamp FROM turns WHERE session_id = ?1 AND split = ?2
                 ORDER BY seq DESC LIMIT 1)
         FROM turns WHERE session_id = ?1 AND split = ?2",
        params![session_id, split],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    for turn in turns {
        if turn.seq <= max_seq {
            if let Some(existing) = load_turn(conn, session_id, split, turn.seq)? {
                if !existing.same_content(turn) {
                    let a = Anomaly::TurnConflict {
                        session_id: session_id.into(),
                        split,
                        seq: turn.seq,
                    };
                    log::warn!("{a}");
                    outcome.anomalies.push(a);
                }
                outcome.skipped += 1;
                continue;
            }
        } else if turn.seq != max_seq + 1 {
            let a = Anomaly::SequenceGap {
                session_id: session_id.into(),
                split,
                expected: max_seq + 1,
                found: turn.seq,
            };
            log::warn!("{a}");
            outcome.anomalies.push(a);
        }

        if let Some(prev) = last_ts.as_deref() {
            if turn.seq > max_seq && timestamp_before(&turn.timestamp, prev) {
                let a = Anomaly::TimestampRegression {
                    session_id: session_id.into(),
                    split,
                    seq: turn.seq,
                    previous: prev.to_string(),
                    timestamp: turn.timestamp.clone(),
                };
                log::warn!("{a}");
                outcome.anomalies.push(a);
            }
        }

        insert_turn(conn, session_id, split, turn)?;
        if turn.seq > max_seq {
            max_seq = turn.seq;
            last_ts = Some(turn.timestamp.clone());
        }
        outcome.added += 1;
    }
    Ok(outcome)
}

fn insert_turn(conn: &Connection, session_id: &str, split: u32, turn: &Turn) -> Result<(), AuditError> {
    conn.execute(
        "INSERT INTO turns (session_id, split, seq, role, timestamp, text, thinking, tool_uses, model)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            session_id,
            split,
            turn.seq,
            turn.role.as_str(),
            turn.timestamp,
            turn.text,
            turn.thinking,
            serde_json::to_string(&turn.tool_uses)?,
            turn.model,
        ],
    )?;
    Ok(())
}

type TurnRow = (u32, String, String, String, String, Option<String>, Option<String>);

fn turn_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TurnRow> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
    ))
}

fn build_turn(row: TurnRow) -> Result<Turn, AuditError> {
    let (seq, role, timestamp, text, thinking, tool_uses, model) = row;
    let role = Role::parse(&role)
        .ok_or_else(|| AuditError::Input(format!("stored turn {seq} has unknown role {role:?}")))?;
    let tool_uses: Vec<ToolUse> = match tool_uses.as_deref() {
        Some(json) if !json.is_empty() => serde_json::from_str(json)?,
        _ => Vec::new(),
    };
    Ok(Turn {
        seq,
        role,
        timestamp,
        text,
        thinking,
        tool_uses,
        model,
    })
}

const TURN_COLUMNS: &str =
    "SELECT seq, role, timestamp, text, thinking, tool_uses, model FROM turns";

fn load_turn(conn: &Connection, session_id: &str, split: u32, seq: u32) -> Result<Option<Turn>, AuditError> {
    let row = conn
        .query_row(
            &format!("{TURN_COLUMNS} WHERE session_id = ?1 AND split = ?2 AND seq = ?3"),
            params![session_id, split, seq],
            turn_from_row,
        )
        .optional()?;
    row.map(build_turn).transpose()
}

/// Stored turns in sequence order, the first `limit` of them when given.
fn load_turns(
    conn: &Connection,
    session_id: &str,
    split: u32,
    limit: Option<u32>,
) -> Result<Vec<Turn>, AuditError> {
    let mut stmt = conn.prepare(&format!(
        "{TURN_COLUMNS} WHERE session_id = ?1 AND split = ?2 ORDER BY seq LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(
            params![session_id, split, limit.map_or(-1, i64::from)],
            turn_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(build_turn).collect()
}

fn load_rules(
    conn: &Connection,
    session_id: &str,
    split: u32,
    version: u32,
) -> Result<Option<Rules>, AuditError> {
    let row: Option<(i64, String, u32, String)> = conn
        .query_row(
            "SELECT format, tag_map, turn_count, content FROM records
             WHERE session_id = ?1 AND split = ?2 AND version = ?3",
            params![session_id, split, version],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((format, tag_map, turn_count, content)) = row else {
        return Ok(None);
    };
    let format = Format::from_i64(format)
        .ok_or_else(|| AuditError::Input(format!("record v{version} has unknown format {format}")))?;
    Ok(Some(Rules {
        format,
        tags: TopicMap::from_json(&tag_map)?,
        turn_count,
        content,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;

    fn turn(seq: u32, role: Role, ts: &str, text: &str) -> Turn {
        Turn {
            seq,
            role,
            timestamp: ts.into(),
            text: text.into(),
            thinking: String::new(),
            tool_uses: Vec::new(),
            model: None,
        }
    }

    fn turns() -> Vec<Turn> {
        vec![
            turn(1, Role::User, "2026-01-05T10:00:00Z", "Fix the parser in /src/parse/mod.rs"),
            turn(2, Role::Assistant, "2026-01-05T10:00:05Z", "Done."),
        ]
    }

    fn store(dir: &Path) -> ArchiveStore {
        ArchiveStore::open(dir, TopicMap::default()).unwrap()
    }

    fn published(dir: &Path) -> Vec<(String, String)> {
        let mut out: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".md"))
            .map(|e| {
                (
                    e.file_name().to_string_lossy().into_owned(),
                    fs::read_to_string(e.path()).unwrap(),
                )
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn append_twice_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = store(dir.path());
        let first = s.append("sess1", 0, "proj", &turns()).unwrap();
        assert_eq!(first.added, 2);
        assert!(first.written);
        let before = published(dir.path());

        let second = s.append("sess1", 0, "proj", &turns()).unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.skipped, 2);
        assert!(!second.written);
        assert!(second.anomalies.is_empty());
        assert_eq!(published(dir.path()), before);
    }

    #[test]
    fn appended_turns_extend_the_prefix() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = store(dir.path());
        s.append("sess1", 0, "proj", &turns()[..1]).unwrap();
        let before = s.read("sess1", 0, None).unwrap();
        s.append("sess1", 0, "proj", &turns()).unwrap();
        let after = s.read("sess1", 0, None).unwrap();
        assert_eq!(after.turns[..before.turns.len()], before.turns[..]);
        assert_eq!(after.header.turns, 2);
        assert_eq!(after.version, 1);
    }

    #[test]
    fn conflicting_turn_is_kept_and_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = store(dir.path());
        s.append("sess1", 0, "proj", &turns()).unwrap();
        let changed = vec![turn(2, Role::Assistant, "2026-01-05T10:00:05Z", "Different.")];
        let out = s.append("sess1", 0, "proj", &changed).unwrap();
        assert_eq!(out.skipped, 1);
        assert!(matches!(out.anomalies[0], Anomaly::TurnConflict { seq: 2, .. }));
        assert_eq!(s.read("sess1", 0, None).unwrap().turns[1].text, "Done.");
    }

    #[test]
    fn gaps_and_regressions_are_anomalies() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = store(dir.path());
        let out = s
            .append(
                "sess1",
                0,
                "proj",
                &[
                    turn(1, Role::User, "2026-01-05T10:00:00Z", "a"),
                    turn(3, Role::User, "2026-01-05T09:00:00Z", "b"),
                ],
            )
            .unwrap();
        assert!(out
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::SequenceGap { expected: 2, found: 3, .. })));
        assert!(out
            .anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::TimestampRegression { seq: 3, .. })));
        let rec = s.read("sess1", 0, None).unwrap();
        assert_eq!(rec.turns.len(), 2);
        assert!(!rec.anomalies.is_empty());
    }

    #[test]
    fn enrich_is_noop_until_rules_change() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = store(dir.path());
        s.append("sess1", 0, "proj", &turns()).unwrap();
        assert_eq!(
            s.enrich("sess1", 0).unwrap(),
            EnrichOutcome::Unchanged { version: 1 }
        );
        drop(s);

        let map = TopicMap::new(BTreeMap::from([('Π', "parser".to_string())]), Vec::new()).unwrap();
        let s = ArchiveStore::open(dir.path(), map).unwrap();
        assert_eq!(
            s.enrich("sess1", 0).unwrap(),
            EnrichOutcome::Created { version: 2 }
        );
        assert_eq!(
            s.enrich("sess1", 0).unwrap(),
            EnrichOutcome::Unchanged { version: 2 }
        );
        let rec = s.read("sess1", 0, None).unwrap();
        assert_eq!(rec.version, 2);
        assert_eq!(rec.header.semantic_tags[0].topic, "parser");
        // v1 is retained
        assert_eq!(s.read("sess1", 0, Some(1)).unwrap().version, 1);
        let names: Vec<String> = published(dir.path()).into_iter().map(|(n, _)| n).collect();
        assert!(names.iter().any(|n| n.ends_with(".v1.md")));
        assert!(names.iter().any(|n| n.ends_with(".v2.md")));
        assert!(names.contains(&"index.md".to_string()));
    }

    #[test]
    fn snapshot_reproduces_earlier_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = store(dir.path());
        s.append("sess1", 0, "proj", &turns()[..1]).unwrap();
        let early = s.read("sess1", 0, None).unwrap().content;
        s.append("sess1", 0, "proj", &turns()).unwrap();
        let snap = s.snapshot("sess1", 0, 1, 1).unwrap();
        assert_eq!(snap.content, early);
        assert_eq!(snap.header.turns, 1);
    }

    #[test]
    fn ingest_splits_at_compaction() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcript = dir.path().join("t.jsonl");
        fs::write(
            &transcript,
            concat!(
                r#"{"type":"user","sessionId":"abc","cwd":"/tmp/demo","timestamp":"2026-01-05T10:00:00Z","message":{"content":"first question here"}}"#,
                "\n",
                r#"{"type":"assistant","sessionId":"abc","timestamp":"2026-01-05T10:00:05Z","message":{"content":[{"type":"text","text":"answer"}]}}"#,
                "\n",
                r#"{"type":"user","sessionId":"abc","isCompactSummary":true,"timestamp":"2026-01-05T11:00:00Z","message":{"content":"Summary of 2 turns"}}"#,
                "\n",
                r#"{"type":"user","sessionId":"abc","timestamp":"2026-01-05T11:00:10Z","message":{"content":"after compaction"}}"#,
                "\n",
            ),
        )
        .unwrap();
        let archive = dir.path().join("archive");
        let s = store(&archive);
        let report = s.ingest(&[transcript.clone()], &IngestOptions::default()).unwrap();
        assert_eq!(report.turns_added, 3);
        assert_eq!(report.compactions, 1);
        assert_eq!(s.session("abc", 0).unwrap().unwrap().turn_count, 2);
        assert_eq!(s.session("abc", 0).unwrap().unwrap().project, "demo");
        assert_eq!(s.session("abc", 1).unwrap().unwrap().turn_count, 1);
        assert_eq!(s.compaction("abc", 1).unwrap().unwrap().text, "Summary of 2 turns");
        assert_eq!(s.latest_session(None).unwrap().unwrap().split, 1);

        let again = s.ingest(&[transcript], &IngestOptions::default()).unwrap();
        assert_eq!(again.turns_added, 0);
        assert_eq!(again.turns_skipped, 3);
    }

    #[test]
    fn ingest_across_batches_renders_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcript = dir.path().join("long.jsonl");
        let n = INGEST_BATCH * 2 + 7;
        let lines: String = (0..n)
            .map(|i| {
                format!(
                    "{{\"type\":\"user\",\"sessionId\":\"long\",\"timestamp\":\"2026-01-05T10:{:02}:{:02}Z\",\"message\":{{\"content\":\"step {i}\"}}}}\n",
                    i / 60 % 60,
                    i % 60
                )
            })
            .collect();
        fs::write(&transcript, lines).unwrap();

        let archive = dir.path().join("archive");
        let s = store(&archive);
        let report = s.ingest(&[transcript], &IngestOptions::default()).unwrap();
        assert_eq!(report.turns_added, n);

        let rec = s.read("long", 0, None).unwrap();
        assert_eq!(rec.version, 1);
        assert_eq!(rec.header.turns as usize, n);
        assert_eq!(rec.turns.len(), n);
        let files: Vec<String> = published(&archive).into_iter().map(|(f, _)| f).collect();
        assert_eq!(files.iter().filter(|f| f.ends_with(".v1.md")).count(), 1);
        assert!(files.contains(&"index.md".to_string()));
    }

    #[test]
    fn plain_records_are_upgraded_by_enrich() {
        let dir = tempfile::TempDir::new().unwrap();
        let s = store(dir.path()).with_format(Format::Plain);
        s.append("sess1", 0, "proj", &turns()).unwrap();
        let plain = s.read("sess1", 0, None).unwrap();
        assert!(plain.header.files_referenced.is_empty());

        // later appends keep the record's own layout
        s.append("sess1", 0, "proj", &[turn(3, Role::User, "2026-01-05T10:01:00Z", "ok")])
            .unwrap();
        assert!(s.read("sess1", 0, None).unwrap().header.files_referenced.is_empty());

        assert_eq!(
            s.enrich("sess1", 0).unwrap(),
            EnrichOutcome::Created { version: 2 }
        );
        let rec = s.read("sess1", 0, None).unwrap();
        assert_eq!(rec.header.files_referenced, vec!["/src/parse/mod.rs"]);
        let v1 = s.read("sess1", 0, Some(1)).unwrap().content;
        assert_eq!(s.snapshot("sess1", 0, 1, 3).unwrap().content, v1);
    }

    #[test]
    fn open_existing_requires_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = ArchiveStore::open_existing(&dir.path().join("missing"), TopicMap::default());
        assert!(matches!(err, Err(AuditError::Config(_))));
    }
}
