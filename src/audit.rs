//! One audit run: locate the summary, read the archived record it covers,
//! extract and verify claims, score them, and record the result.

use crate::AuditError;
use crate::archive::{Anomaly, ArchiveStore, Record};
use crate::extract::{Category, ClaimExtractor};
use crate::history::{AuditInput, History, HistoryEntry, InputSource, NewEntry, now_rfc3339};
use crate::publish::write_atomic;
use crate::render::{SemanticTag, record_file_name};
use crate::score::{Scorecard, pct, score};
use crate::topics::TopicMap;
use crate::transcript::{CompactionRef, find_compactions};
use crate::verify::{Tier, Verification, Verifier};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

pub const REPORT_VERSION: u32 = 2;

/// Which compaction of a transcript to audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    First,
    Last,
    /// 0-based position among the transcript's compactions.
    Index(usize),
}

impl FromStr for Which {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" => Ok(Which::First),
            "last" => Ok(Which::Last),
            n => n
                .parse()
                .map(Which::Index)
                .map_err(|_| format!("expected first, last or a number, got {n:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SummarySource {
    Transcript { path: PathBuf, which: Which },
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct AuditRequest {
    pub source: SummarySource,
    pub session: Option<String>,
    pub split: Option<u32>,
    pub deep: bool,
    pub record: bool,
}

/// A summary resolved to text plus the archive record it should be checked
/// against.
#[derive(Debug, Clone)]
pub struct ResolvedSummary {
    pub source: InputSource,
    pub text: String,
    pub session_id: String,
    pub split: u32,
    pub timestamp: Option<String>,
}

pub fn pick_compaction(found: &[CompactionRef], which: Which) -> Option<&CompactionRef> {
    match which {
        Which::First => found.first(),
        Which::Last => found.last(),
        Which::Index(n) => found.get(n),
    }
}

fn resolve(store: &ArchiveStore, req: &AuditRequest) -> Result<ResolvedSummary, AuditError> {
    match &req.source {
        SummarySource::Transcript { path, which } => {
            let found = find_compactions(path)?;
            let mut candidates: Vec<CompactionRef> = found
                .into_iter()
                .filter(|c| req.session.as_deref().is_none_or(|s| s == c.session_id))
                .collect();
            for (i, c) in candidates.iter_mut().enumerate() {
                c.index = i;
            }
            let c = pick_compaction(&candidates, *which).ok_or_else(|| {
                AuditError::Input(format!(
                    "{}: no compaction summary {} ({} found)",
                    path.display(),
                    match which {
                        Which::Index(n) => format!("#{n}"),
                        _ => "found".into(),
                    },
                    candidates.len()
                ))
            })?;
            // The summary replaces the split before the one it opens.
            let opened = store
                .split_for_compaction(&c.session_id, &c.timestamp)?
                .unwrap_or(c.split);
            let split = req.split.unwrap_or(opened.saturating_sub(1));
            Ok(ResolvedSummary {
                source: InputSource::Transcript {
                    path: path.display().to_string(),
                    index: c.index,
                    timestamp: c.timestamp.clone(),
                },
                text: c.text.clone(),
                session_id: c.session_id.clone(),
                split,
                timestamp: Some(c.timestamp.clone()),
            })
        }
        SummarySource::File(path) => {
            let text = fs::read_to_string(path).map_err(|e| {
                AuditError::Input(format!("cannot read summary {}: {e}", path.display()))
            })?;
            let latest = store.latest_session(req.session.as_deref())?.ok_or_else(|| {
                AuditError::Input(match &req.session {
                    Some(s) => format!("no archived session {s}"),
                    None => "archive is empty".into(),
                })
            })?;
            Ok(ResolvedSummary {
                source: InputSource::SummaryFile {
                    path: path.display().to_string(),
                },
                text,
                session_id: latest.session_id,
                split: req.split.unwrap_or(latest.split),
                timestamp: None,
            })
        }
    }
}

/// Extract, verify and score `summary` against `record`.
pub fn evaluate(
    tags: &TopicMap,
    summary: &str,
    record: &Record,
    deep: bool,
) -> (Vec<Verification>, Scorecard) {
    let claims = ClaimExtractor::new(tags).extract(summary);
    let verifications = Verifier::new(deep).verify_all(&claims, record);
    let card = score(&verifications);
    (verifications, card)
}

/// Archive facts a summary could be checked against, as injected before
/// compaction and stored in the report bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GroundTruth {
    pub session_id: String,
    pub split: u32,
    pub version: u32,
    pub project: String,
    pub turn_count: u32,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub topics: Vec<String>,
    pub files_referenced: Vec<String>,
    pub tools_used: Vec<String>,
    pub symbols: Vec<String>,
    pub semantic_tags: Vec<SemanticTag>,
    pub archive_file: String,
}

impl GroundTruth {
    pub fn from_record(record: &Record) -> Self {
        let h = &record.header;
        let date = h
            .started_at
            .as_deref()
            .and_then(|t| t.get(..10))
            .unwrap_or("unknown-date");
        Self {
            session_id: record.session_id.clone(),
            split: record.split,
            version: record.version,
            project: record.project.clone(),
            turn_count: record.turns.len() as u32,
            started_at: h.started_at.clone(),
            ended_at: h.ended_at.clone(),
            topics: h.topics.clone(),
            files_referenced: h.files_referenced.clone(),
            tools_used: h.tools_used.clone(),
            symbols: h.symbols.clone(),
            semantic_tags: h.semantic_tags.clone(),
            archive_file: record_file_name(&record.session_id, record.split, date, record.version),
        }
    }

    /// Text block printed by the pre-compaction hook.
    pub fn block(&self) -> String {
        let list = |v: &[String], n: usize| {
            if v.is_empty() {
                "none".to_string()
            } else {
                v.iter().take(n).cloned().collect::<Vec<_>>().join(", ")
            }
        };
        let mut out = String::from("=== SESSION GROUND TRUTH (for compaction reference) ===\n");
        let _ = writeln!(out, "Turn count: {}", self.turn_count);
        let _ = writeln!(out, "Session ID: {}", self.session_id);
        let _ = writeln!(
            out,
            "Duration: {} to {}",
            self.started_at.as_deref().unwrap_or("unknown"),
            self.ended_at.as_deref().unwrap_or("unknown")
        );
        let _ = writeln!(out, "Topics: {}", list(&self.topics, 10));
        let _ = writeln!(out, "Files referenced: {}", list(&self.files_referenced, 15));
        let _ = writeln!(out, "Tools used: {}", list(&self.tools_used, 15));
        let _ = writeln!(out, "Archive file: {}", self.archive_file);
        out.push_str("===\n");
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CompactionSummary {
    pub text: String,
    /// Length in characters.
    pub length: usize,
    pub compaction_timestamp: Option<String>,
}

/// The per-run report bundle written under `reports/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Bundle {
    pub report_version: u32,
    pub run: i64,
    pub timestamp: String,
    pub session_id: String,
    pub ground_truth: GroundTruth,
    pub compaction_summary: CompactionSummary,
    pub audit: HistoryEntry,
    /// Severity-weighted rates of this lineage in run order, ending with
    /// this run.
    pub trend: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct AuditReport {
    pub bundle: Bundle,
    /// Where the bundle was written; None when the run was not recorded.
    pub bundle_path: Option<PathBuf>,
    pub archive_dir: PathBuf,
}

impl AuditReport {
    pub fn entry(&self) -> &HistoryEntry {
        &self.bundle.audit
    }

    pub fn recorded(&self) -> bool {
        self.bundle_path.is_some()
    }
}

pub fn run_audit(store: &ArchiveStore, req: &AuditRequest) -> Result<AuditReport, AuditError> {
    let summary = resolve(store, req)?;
    let record = store.read(&summary.session_id, summary.split, None)?;
    log::info!(
        "auditing {} chars of summary against {}/{} v{} ({} turns)",
        summary.text.chars().count(),
        record.session_id,
        record.split,
        record.version,
        record.turns.len()
    );

    let (verifications, card) = evaluate(store.tags(), &summary.text, &record, req.deep);

    let history = History::new(store.conn(), store.dir());
    let mut anomalies: Vec<Anomaly> = record.anomalies.clone();
    anomalies.extend(history.check_mirror()?);
    for a in &anomalies {
        log::warn!("{a}");
    }

    let new = NewEntry {
        timestamp: now_rfc3339(),
        lineage: Some(summary.session_id.clone()),
        baseline: false,
        input: Some(AuditInput {
            source: summary.source.clone(),
            session_id: record.session_id.clone(),
            split: record.split,
            version: record.version,
            turn_count: record.turns.len() as u32,
            deep: req.deep,
        }),
        score: card,
        verifications,
        anomalies,
        with_report: req.record,
    };

    let entry = if req.record {
        history.append(new)?
    } else {
        history.preview(new)?
    };
    let mut trend = history.trend(Some(&summary.session_id))?;
    if !req.record {
        trend.push(entry.score.weighted_rate);
    }

    let bundle = Bundle {
        report_version: REPORT_VERSION,
        run: entry.run,
        timestamp: entry.timestamp.clone(),
        session_id: summary.session_id.clone(),
        ground_truth: GroundTruth::from_record(&record),
        compaction_summary: CompactionSummary {
            length: summary.text.chars().count(),
            text: summary.text,
            compaction_timestamp: summary.timestamp,
        },
        audit: entry,
        trend,
    };

    let bundle_path = match &bundle.audit.report {
        Some(rel) => {
            let path = store.dir().join(rel);
            write_atomic(&path, serde_json::to_string_pretty(&bundle)?.as_bytes())?;
            log::info!("run {}: report written to {}", bundle.run, path.display());
            Some(path)
        }
        None => None,
    };

    Ok(AuditReport {
        bundle,
        bundle_path,
        archive_dir: store.dir().to_path_buf(),
    })
}

/// JSON Schema of the report bundle.
pub fn bundle_schema() -> Result<String, AuditError> {
    Ok(serde_json::to_string_pretty(&schemars::schema_for!(Bundle))?)
}

fn trend_line(trend: &[f64]) -> String {
    let start = trend.len().saturating_sub(5);
    trend[start..]
        .iter()
        .map(|r| pct(*r))
        .collect::<Vec<_>>()
        .join(" → ")
}

fn describe_source(source: &InputSource) -> String {
    match source {
        InputSource::Transcript {
            path,
            index,
            timestamp,
        } => format!("{path} (compaction #{index} at {timestamp})"),
        InputSource::SummaryFile { path } => path.clone(),
    }
}

fn tier_label(tier: Tier) -> &'static str {
    match tier {
        Tier::Found => "FOUND     ",
        Tier::FoundDeep => "FOUND_DEEP",
        Tier::Missing => "MISSING   ",
        Tier::Mismatch => "MISMATCH  ",
    }
}

pub fn format_text(report: &AuditReport) -> String {
    let entry = report.entry();
    let card = &entry.score;
    let rule = "=".repeat(64);
    let mut out = String::new();

    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "  COMPACTION SUMMARY AUDIT");
    let _ = writeln!(out, "{rule}");
    if report.recorded() {
        let _ = writeln!(out, "  Run              : {}", entry.run);
    } else {
        let _ = writeln!(out, "  Run              : (not recorded)");
    }
    if let Some(input) = &entry.input {
        let _ = writeln!(
            out,
            "  Archive          : {}/{} v{} ({} turns{})",
            input.session_id,
            input.split,
            input.version,
            input.turn_count,
            if input.deep { ", deep" } else { "" }
        );
        let _ = writeln!(out, "  Summary          : {}", describe_source(&input.source));
    }
    let _ = writeln!(
        out,
        "  Accuracy         : {} ({}/{} claims)",
        pct(card.raw_rate),
        card.counts.found,
        card.counts.total
    );
    let _ = writeln!(out, "  Severity-weighted: {}", pct(card.weighted_rate));
    let _ = writeln!(out, "  Category mean    : {}", pct(card.category_mean));
    if report.bundle.trend.len() > 1 {
        let _ = writeln!(out, "  Trend            : {}", trend_line(&report.bundle.trend));
    }
    let _ = writeln!(out, "{rule}");

    for cat in &card.categories {
        let _ = writeln!(
            out,
            "\n  --- {} [{:?}] ({}/{}) ---",
            cat.category, cat.severity, cat.counts.found, cat.counts.total
        );
        let claims: Vec<&Verification> = entry
            .verifications
            .iter()
            .filter(|v| v.claim.category == cat.category)
            .collect();
        if claims.is_empty() {
            let _ = writeln!(out, "    (no claims)");
        }
        for v in claims {
            let _ = write!(out, "    [{}] {}", tier_label(v.tier), v.claim.text);
            if let Some(d) = &v.detail {
                let _ = write!(out, "  ({d})");
            }
            out.push('\n');
        }
    }

    out.push('\n');
    match &entry.regression {
        Some(r) => {
            let _ = writeln!(
                out,
                "  REGRESSION: {} → {} ({:+.1}pp since run {})",
                pct(r.previous_rate),
                pct(r.new_rate),
                r.delta_pp,
                r.previous_run
            );
        }
        None => {
            let _ = writeln!(out, "  No regression.");
        }
    }
    for d in &entry.category_drops {
        let _ = writeln!(
            out,
            "  {} dropped {} → {} ({:+.1}pp)",
            d.category,
            pct(d.previous_rate),
            pct(d.new_rate),
            d.delta_pp
        );
    }
    if !entry.anomalies.is_empty() {
        let _ = writeln!(out, "  Integrity warnings:");
        for a in &entry.anomalies {
            let _ = writeln!(out, "    - {a}");
        }
    }
    if let Some(path) = &report.bundle_path {
        let _ = writeln!(out, "  Report: {}", path.display());
    }
    out
}

/// Short status block printed after compaction so the next context sees the
/// audit outcome.
pub fn format_beacon(report: &AuditReport) -> String {
    let entry = report.entry();
    let mut out = String::from("=== COMPACTION AUDIT ===\n");
    let _ = writeln!(
        out,
        "Run {}: {} (severity-weighted: {})",
        entry.run,
        pct(entry.score.raw_rate),
        pct(entry.score.weighted_rate)
    );
    if report.bundle.trend.len() > 1 {
        let _ = writeln!(out, "Trend: {}", trend_line(&report.bundle.trend));
    }
    let mut regressions: Vec<String> = Vec::new();
    if let Some(r) = &entry.regression {
        regressions.push(format!("overall {:+.1}pp", r.delta_pp));
    }
    regressions.extend(
        entry
            .category_drops
            .iter()
            .map(|d| format!("{} {:+.1}pp", d.category, d.delta_pp)),
    );
    let _ = writeln!(
        out,
        "Regressions: {}",
        if regressions.is_empty() {
            "None".to_string()
        } else {
            regressions.join(", ")
        }
    );
    if let Some(path) = &report.bundle_path {
        let _ = writeln!(out, "Report: {}", path.display());
    }
    let _ = writeln!(out, "Archive: {}", report.archive_dir.display());
    out.push_str("===\n");
    out
}

/// Ground truth for one archived split, the latest when neither is given.
pub fn ground_truth(
    store: &ArchiveStore,
    session: Option<&str>,
    split: Option<u32>,
) -> Result<GroundTruth, AuditError> {
    let (session_id, split) = match (session, split) {
        (Some(s), Some(n)) => (s.to_string(), n),
        _ => {
            let latest = store.latest_session(session)?.ok_or_else(|| {
                AuditError::Input(match session {
                    Some(s) => format!("no archived session {s}"),
                    None => "archive is empty".into(),
                })
            })?;
            (latest.session_id, split.unwrap_or(latest.split))
        }
    };
    let record = store.read(&session_id, split, None)?;
    Ok(GroundTruth::from_record(&record))
}

/// Per-category one-liners, used by `history`.
pub fn category_summary(card: &Scorecard) -> String {
    Category::ALL
        .iter()
        .filter_map(|c| card.category(*c))
        .filter(|c| c.counts.total > 0)
        .map(|c| format!("{} {}/{}", c.category, c.counts.found, c.counts.total))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    const T0: &str = "2026-01-05T10:00:00Z";

    fn line(kind: &str, ts: &str, content: &str) -> String {
        serde_json::json!({
            "type": kind,
            "sessionId": "sess-audit",
            "timestamp": ts,
            "cwd": "/tmp/demo",
            "message": {"role": kind, "content": content},
        })
        .to_string()
    }

    fn transcript(dir: &Path, summary: &str) -> PathBuf {
        let compact = serde_json::json!({
            "type": "user",
            "sessionId": "sess-audit",
            "timestamp": "2026-01-05T11:00:00Z",
            "isCompactSummary": true,
            "message": {"role": "user", "content": summary},
        })
        .to_string();
        let lines = [
            line("user", T0, "Please fix the login bug in /src/auth.rs"),
            line("assistant", "2026-01-05T10:00:05Z", "Looking at /src/auth.rs now."),
            line("user", "2026-01-05T10:01:00Z", "Thanks, that works"),
            compact,
            line("user", "2026-01-05T11:00:10Z", "Continue"),
        ];
        let path = dir.join("t.jsonl");
        let mut f = fs::File::create(&path).unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        path
    }

    fn store(dir: &Path) -> ArchiveStore {
        ArchiveStore::open(&dir.join("archive"), TopicMap::default()).unwrap()
    }

    fn request(path: &Path, record: bool) -> AuditRequest {
        AuditRequest {
            source: SummarySource::Transcript {
                path: path.to_path_buf(),
                which: Which::Last,
            },
            session: None,
            split: None,
            deep: false,
            record,
        }
    }

    #[test]
    fn which_parses() {
        assert_eq!("first".parse::<Which>().unwrap(), Which::First);
        assert_eq!("last".parse::<Which>().unwrap(), Which::Last);
        assert_eq!("2".parse::<Which>().unwrap(), Which::Index(2));
        assert!("second".parse::<Which>().is_err());
    }

    #[test]
    fn audits_previous_split_and_writes_bundle() {
        let dir = TempDir::new().unwrap();
        let path = transcript(
            dir.path(),
            "Worked on /src/auth.rs and /src/db.rs across 3 turns.",
        );
        let s = store(dir.path());
        s.ingest(&[path.clone()], &Default::default()).unwrap();

        let report = run_audit(&s, &request(&path, true)).unwrap();
        let entry = report.entry();
        assert_eq!(entry.run, 1);
        let input = entry.input.as_ref().unwrap();
        assert_eq!((input.split, input.turn_count), (0, 3));
        let files = entry.score.category(Category::FilePath).unwrap();
        assert_eq!((files.counts.found, files.counts.total), (1, 2));
        let turns = entry.score.category(Category::TurnCount).unwrap();
        assert_eq!(turns.counts.found, 1);

        let bundle_path = report.bundle_path.clone().unwrap();
        let bundle: Bundle =
            serde_json::from_str(&fs::read_to_string(&bundle_path).unwrap()).unwrap();
        assert_eq!(bundle.run, 1);
        assert_eq!(bundle.session_id, "sess-audit");
        assert_eq!(bundle.ground_truth.turn_count, 3);
        assert_eq!(bundle.trend.len(), 1);
        assert!(format_beacon(&report).starts_with("=== COMPACTION AUDIT ===\nRun 1: "));
    }

    #[test]
    fn no_record_leaves_history_untouched() {
        let dir = TempDir::new().unwrap();
        let path = transcript(dir.path(), "Edited /src/auth.rs.");
        let s = store(dir.path());
        s.ingest(&[path.clone()], &Default::default()).unwrap();

        let report = run_audit(&s, &request(&path, false)).unwrap();
        assert_eq!(report.entry().run, 0);
        assert!(report.bundle_path.is_none());
        assert!(History::new(s.conn(), s.dir()).entries().unwrap().is_empty());
        assert!(format_text(&report).contains("(not recorded)"));
    }

    #[test]
    fn unarchived_session_is_an_input_error() {
        let dir = TempDir::new().unwrap();
        let path = transcript(dir.path(), "Edited /src/auth.rs.");
        let s = store(dir.path());
        let err = run_audit(&s, &request(&path, true)).unwrap_err();
        assert!(matches!(err, AuditError::Input(_)));
    }

    #[test]
    fn ground_truth_block_shape() {
        let dir = TempDir::new().unwrap();
        let path = transcript(dir.path(), "x");
        let s = store(dir.path());
        s.ingest(&[path], &Default::default()).unwrap();
        let gt = ground_truth(&s, Some("sess-audit"), Some(0)).unwrap();
        let block = gt.block();
        assert!(block.starts_with("=== SESSION GROUND TRUTH (for compaction reference) ===\n"));
        assert!(block.contains("Turn count: 3\n"));
        assert!(block.contains("Session ID: sess-audit\n"));
        assert!(block.ends_with("===\n"));
    }

    #[test]
    fn text_report_lists_empty_categories() {
        let dir = TempDir::new().unwrap();
        let path = transcript(dir.path(), "Edited /src/auth.rs.");
        let s = store(dir.path());
        s.ingest(&[path.clone()], &Default::default()).unwrap();
        let text = format_text(&run_audit(&s, &request(&path, true)).unwrap());
        assert!(text.contains("[FOUND     ] /src/auth.rs"));
        assert!(text.contains("Function/Class"));
        assert!(text.contains("(no claims)"));
    }
}
