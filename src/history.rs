//! Append-only audit history and regression tracking.
//!
//! Entries live in the `audit_runs` table; `AUTOINCREMENT` keeps run numbers
//! strictly increasing and never reused. Each committed entry is mirrored as
//! one line of `audit_history.jsonl`.

use crate::AuditError;
use crate::archive::Anomaly;
use crate::extract::Category;
use crate::score::{CategoryScore, Counts, Scorecard, category_mean};
use crate::verify::Verification;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const HISTORY_FILE: &str = "audit_history.jsonl";
pub const REPORTS_DIR: &str = "reports";

/// Drop in severity-weighted accuracy, in percentage points, beyond which a
/// run is flagged.
pub const REGRESSION_THRESHOLD_PP: f64 = 5.0;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Where the audited summary came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSource {
    Transcript {
        path: String,
        /// Position of the compaction among the transcript's compactions.
        index: usize,
        timestamp: String,
    },
    SummaryFile {
        path: String,
    },
}

/// Everything needed to replay an audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AuditInput {
    pub source: InputSource,
    pub session_id: String,
    pub split: u32,
    pub version: u32,
    pub turn_count: u32,
    pub deep: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Regression {
    pub previous_run: i64,
    pub previous_rate: f64,
    pub new_rate: f64,
    pub delta_pp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CategoryDrop {
    pub category: Category,
    pub previous_rate: f64,
    pub new_rate: f64,
    pub delta_pp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HistoryEntry {
    pub run: i64,
    pub timestamp: String,
    /// Session the audited summary belongs to.
    pub lineage: Option<String>,
    /// Imported or bootstrap entry with no replayable input.
    #[serde(default)]
    pub baseline: bool,
    pub input: Option<AuditInput>,
    pub score: Scorecard,
    #[serde(default)]
    pub verifications: Vec<Verification>,
    pub regression: Option<Regression>,
    #[serde(default)]
    pub category_drops: Vec<CategoryDrop>,
    #[serde(default)]
    pub anomalies: Vec<Anomaly>,
    /// Bundle path relative to the archive directory.
    pub report: Option<String>,
}

/// An entry before it has a run number.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub timestamp: String,
    pub lineage: Option<String>,
    pub baseline: bool,
    pub input: Option<AuditInput>,
    pub score: Scorecard,
    pub verifications: Vec<Verification>,
    pub anomalies: Vec<Anomaly>,
    pub with_report: bool,
}

/// Change in percentage points, rounded to whole basis points so that
/// float noise cannot push an exact threshold drop over the line.
fn delta_pp(previous: f64, new: f64) -> f64 {
    ((new - previous) * 10_000.0).round() / 100.0
}

/// A regression when the weighted rate fell by more than the threshold.
pub fn detect_regression(previous_run: i64, previous_rate: f64, new_rate: f64) -> Option<Regression> {
    let delta = delta_pp(previous_rate, new_rate);
    (delta < -REGRESSION_THRESHOLD_PP).then_some(Regression {
        previous_run,
        previous_rate,
        new_rate,
        delta_pp: delta,
    })
}

/// Per-category drops beyond the threshold, over categories that had
/// claims in both runs.
pub fn category_drops(previous: &Scorecard, new: &Scorecard) -> Vec<CategoryDrop> {
    new.categories
        .iter()
        .filter(|c| c.counts.total > 0)
        .filter_map(|c| {
            let prev = previous.category(c.category).filter(|p| p.counts.total > 0)?;
            let delta = delta_pp(prev.rate, c.rate);
            (delta < -REGRESSION_THRESHOLD_PP).then_some(CategoryDrop {
                category: c.category,
                previous_rate: prev.rate,
                new_rate: c.rate,
                delta_pp: delta,
            })
        })
        .collect()
}

/// Bundle path for a run, relative to the archive directory.
pub fn report_rel_path(run: i64, timestamp: &str) -> String {
    let stamp = DateTime::parse_from_rfc3339(timestamp)
        .map(|t| t.with_timezone(&Utc).format("%Y%m%d-%H%M%S").to_string())
        .unwrap_or_else(|_| "unknown".into());
    format!("{REPORTS_DIR}/report_{run}_{stamp}.json")
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

pub struct History<'a> {
    conn: &'a Connection,
    dir: PathBuf,
}

impl<'a> History<'a> {
    pub fn new(conn: &'a Connection, archive_dir: &Path) -> Self {
        Self {
            conn,
            dir: archive_dir.to_path_buf(),
        }
    }

    pub fn jsonl_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    /// Append one entry. Run-number allocation and the regression lookup
    /// happen inside one IMMEDIATE transaction.
    pub fn append(&self, new: NewEntry) -> Result<HistoryEntry, AuditError> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let with_report = new.with_report;
        let mut entry = build_entry(&tx, new)?;

        tx.execute(
            "INSERT INTO audit_runs (created_at, lineage, weighted_rate, entry) VALUES (?1, ?2, ?3, '{}')",
            params![Utc::now().timestamp(), entry.lineage, entry.score.weighted_rate],
        )?;
        entry.run = tx.last_insert_rowid();
        if with_report {
            entry.report = Some(report_rel_path(entry.run, &entry.timestamp));
        }
        tx.execute(
            "UPDATE audit_runs SET entry = ?2 WHERE run = ?1",
            params![entry.run, serde_json::to_string(&entry)?],
        )?;
        tx.commit()?;

        self.mirror(&entry)?;
        if let Some(r) = &entry.regression {
            log::warn!(
                "run {}: weighted accuracy fell {:.1}pp since run {}",
                entry.run,
                -r.delta_pp,
                r.previous_run
            );
        }
        Ok(entry)
    }

    /// The entry `append` would produce, without storing it (run 0).
    pub fn preview(&self, new: NewEntry) -> Result<HistoryEntry, AuditError> {
        build_entry(self.conn, new)
    }

    fn mirror(&self, entry: &HistoryEntry) -> Result<(), AuditError> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.jsonl_path())?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }

    /// All entries in run order.
    pub fn entries(&self) -> Result<Vec<HistoryEntry>, AuditError> {
        let mut stmt = self.conn.prepare("SELECT entry FROM audit_runs ORDER BY run")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|json| serde_json::from_str::<HistoryEntry>(json).map_err(AuditError::from))
            .collect()
    }

    pub fn entry(&self, run: i64) -> Result<Option<HistoryEntry>, AuditError> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT entry FROM audit_runs WHERE run = ?1",
                params![run],
                |r| r.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(AuditError::from))
            .transpose()
    }

    /// Entries of one lineage, or all entries.
    pub fn select(&self, lineage: Option<&str>) -> Result<Vec<HistoryEntry>, AuditError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| lineage.is_none() || e.lineage.as_deref() == lineage)
            .collect())
    }

    /// Ordered severity-weighted rates.
    pub fn trend(&self, lineage: Option<&str>) -> Result<Vec<f64>, AuditError> {
        Ok(self
            .select(lineage)?
            .iter()
            .map(|e| e.score.weighted_rate)
            .collect())
    }

    /// Duplicate run numbers in the JSONL mirror.
    pub fn check_mirror(&self) -> Result<Vec<Anomaly>, AuditError> {
        let path = self.jsonl_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut seen = HashSet::new();
        let mut reported = HashSet::new();
        let mut out = Vec::new();
        for line in BufReader::new(fs::File::open(&path)?).lines() {
            let line = line?;
            let Ok(v) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let Some(run) = v.get("run").and_then(Value::as_i64) else {
                continue;
            };
            if !seen.insert(run) && reported.insert(run) {
                out.push(Anomaly::DuplicateRun { run });
            }
        }
        Ok(out)
    }

    /// Import a legacy JSONL history as baseline entries.
    pub fn import_legacy(&self, path: &Path) -> Result<ImportReport, AuditError> {
        let file = fs::File::open(path).map_err(|e| {
            AuditError::Input(format!("cannot open history {}: {e}", path.display()))
        })?;
        let mut report = ImportReport::default();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line).ok().and_then(|v| legacy_entry(&v)) {
                Some(entry) => {
                    self.append(entry)?;
                    report.imported += 1;
                }
                None => {
                    log::warn!("{}:{}: skipping unreadable history entry", path.display(), n + 1);
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }
}

fn build_entry(conn: &Connection, new: NewEntry) -> Result<HistoryEntry, AuditError> {
    let previous = match new.lineage.as_deref() {
        Some(lineage) => last_in_lineage(conn, lineage)?,
        None => None,
    };
    Ok(HistoryEntry {
        run: 0,
        timestamp: new.timestamp,
        lineage: new.lineage,
        baseline: new.baseline,
        input: new.input,
        regression: previous
            .as_ref()
            .and_then(|p| detect_regression(p.run, p.score.weighted_rate, new.score.weighted_rate)),
        category_drops: previous
            .as_ref()
            .map(|p| category_drops(&p.score, &new.score))
            .unwrap_or_default(),
        score: new.score,
        verifications: new.verifications,
        anomalies: new.anomalies,
        report: None,
    })
}

fn last_in_lineage(conn: &Connection, lineage: &str) -> Result<Option<HistoryEntry>, AuditError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT entry FROM audit_runs WHERE lineage = ?1 ORDER BY run DESC LIMIT 1",
            params![lineage],
            |r| r.get(0),
        )
        .optional()?;
    json.map(|j| serde_json::from_str(&j).map_err(AuditError::from))
        .transpose()
}

fn legacy_category(name: &str) -> Option<Category> {
    match name {
        "File Paths" | "file_path" => Some(Category::FilePath),
        "Functions/Classes" | "symbol" => Some(Category::Symbol),
        "Tools Used" | "tool_name" => Some(Category::ToolName),
        "User Quotes" | "user_quote" => Some(Category::UserQuote),
        "Topics" | "topic" => Some(Category::Topic),
        "Turn Counts" | "turn_count" => Some(Category::TurnCount),
        _ => None,
    }
}

fn legacy_counts(v: &Value) -> Counts {
    let n = |k: &str| v.get(k).and_then(Value::as_u64).unwrap_or(0) as u32;
    Counts {
        total: n("total"),
        found: n("found"),
        found_deep: 0,
        missing: n("missing"),
        mismatched: n("mismatched"),
    }
}

/// Map one legacy history object onto a baseline entry.
fn legacy_entry(v: &Value) -> Option<NewEntry> {
    let summary = v.get("summary")?;
    let counts = legacy_counts(summary);
    let raw_rate = summary
        .get("rate")
        .and_then(Value::as_f64)
        .unwrap_or_else(|| counts.rate());
    let weighted_rate = summary
        .get("severity_weighted_rate")
        .and_then(Value::as_f64)
        .unwrap_or(raw_rate);

    let legacy_cats = v.get("categories").and_then(Value::as_object);
    let categories: Vec<CategoryScore> = Category::ALL
        .iter()
        .map(|&category| {
            let stats = legacy_cats.and_then(|m| {
                m.iter()
                    .find(|(k, _)| legacy_category(k) == Some(category))
                    .map(|(_, s)| s)
            });
            let counts = stats.map(legacy_counts).unwrap_or_default();
            CategoryScore {
                category,
                severity: category.severity(),
                weight: category.weight(),
                counts,
                rate: stats
                    .and_then(|s| s.get("rate"))
                    .and_then(Value::as_f64)
                    .unwrap_or_else(|| counts.rate()),
            }
        })
        .collect();

    Some(NewEntry {
        timestamp: v
            .get("timestamp")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(now_rfc3339),
        lineage: v
            .get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        baseline: true,
        input: None,
        score: Scorecard {
            counts,
            raw_rate,
            weighted_rate,
            category_mean: category_mean(&categories),
            categories,
        },
        verifications: Vec::new(),
        anomalies: Vec::new(),
        with_report: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db;
    use crate::score::score;

    fn scored(rate: f64) -> Scorecard {
        let mut s = score(&[]);
        s.weighted_rate = rate;
        s
    }

    fn new_entry(lineage: &str, rate: f64) -> NewEntry {
        NewEntry {
            timestamp: "2026-01-05T10:00:00Z".into(),
            lineage: Some(lineage.into()),
            baseline: false,
            input: None,
            score: scored(rate),
            verifications: Vec::new(),
            anomalies: Vec::new(),
            with_report: true,
        }
    }

    #[test]
    fn regression_threshold() {
        let r = detect_regression(1, 0.64, 0.40).unwrap();
        assert!((r.delta_pp + 24.0).abs() < 1e-9);
        assert!(detect_regression(1, 0.64, 0.60).is_none());
        assert!(detect_regression(1, 0.60, 0.95).is_none());
    }

    #[test]
    fn exact_threshold_drop_is_not_a_regression() {
        assert!(detect_regression(1, 0.75, 0.70).is_none());
        let r = detect_regression(1, 0.75, 0.699).unwrap();
        assert_eq!(r.delta_pp, -5.1);

        let with_files = |rate: f64| {
            let mut card = score(&[]);
            for c in &mut card.categories {
                if c.category == crate::extract::Category::FilePath {
                    c.counts.total = 4;
                    c.rate = rate;
                }
            }
            card
        };
        let prev = with_files(0.75);
        assert!(category_drops(&prev, &with_files(0.70)).is_empty());
        let next = with_files(0.699);
        assert_eq!(category_drops(&prev, &next).len(), 1);
    }

    #[test]
    fn append_flags_regression_within_lineage() {
        let dir = tempfile::TempDir::new().unwrap();
        let conn = open_db(dir.path()).unwrap();
        let h = History::new(&conn, dir.path());

        let first = h.append(new_entry("s1", 0.64)).unwrap();
        let other = h.append(new_entry("s2", 0.10)).unwrap();
        let second = h.append(new_entry("s1", 0.40)).unwrap();
        assert_eq!((first.run, other.run, second.run), (1, 2, 3));
        assert!(first.regression.is_none());
        assert!(other.regression.is_none());
        let r = second.regression.unwrap();
        assert_eq!(r.previous_run, 1);
        assert_eq!(
            second.report.as_deref(),
            Some("reports/report_3_20260105-100000.json")
        );

        let third = h.append(new_entry("s1", 0.37)).unwrap();
        assert!(third.regression.is_none());

        assert_eq!(h.trend(Some("s1")).unwrap(), vec![0.64, 0.40, 0.37]);
        assert_eq!(h.trend(None).unwrap().len(), 4);
        let mirrored = fs::read_to_string(h.jsonl_path()).unwrap();
        assert_eq!(mirrored.lines().count(), 4);
        assert!(h.check_mirror().unwrap().is_empty());
    }

    #[test]
    fn run_numbers_survive_reopen_and_deletion() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let conn = open_db(dir.path()).unwrap();
            let h = History::new(&conn, dir.path());
            h.append(new_entry("s1", 0.5)).unwrap();
            h.append(new_entry("s1", 0.5)).unwrap();
            conn.execute("DELETE FROM audit_runs WHERE run = 2", []).unwrap();
        }
        let conn = open_db(dir.path()).unwrap();
        let h = History::new(&conn, dir.path());
        assert_eq!(h.append(new_entry("s1", 0.5)).unwrap().run, 3);
    }

    #[test]
    fn duplicate_runs_in_mirror_are_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let conn = open_db(dir.path()).unwrap();
        let h = History::new(&conn, dir.path());
        fs::write(h.jsonl_path(), "{\"run\":1}\n{\"run\":1}\n{\"run\":2}\n").unwrap();
        assert_eq!(h.check_mirror().unwrap(), vec![Anomaly::DuplicateRun { run: 1 }]);
    }

    #[test]
    fn legacy_history_imports_as_baselines() {
        let dir = tempfile::TempDir::new().unwrap();
        let legacy = dir.path().join("old.jsonl");
        fs::write(
            &legacy,
            concat!(
                r#"{"timestamp":"2025-12-01T10:00:00Z","session_id":"s1","summary":{"total":10,"found":7,"missing":3,"mismatched":0,"rate":0.7},"categories":{"File Paths":{"total":4,"found":4,"rate":1.0}}}"#,
                "\n",
                "not json\n",
            ),
        )
        .unwrap();
        let conn = open_db(dir.path()).unwrap();
        let h = History::new(&conn, dir.path());
        let report = h.import_legacy(&legacy).unwrap();
        assert_eq!((report.imported, report.skipped), (1, 1));
        let e = &h.entries().unwrap()[0];
        assert!(e.baseline);
        assert!(e.input.is_none());
        assert_eq!(e.score.counts.found, 7);
        assert!((e.score.weighted_rate - 0.7).abs() < 1e-9);
        assert_eq!(e.score.category(Category::FilePath).unwrap().counts.total, 4);
    }
}
