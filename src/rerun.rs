//! Replays recorded audits against the exact record versions they saw and
//! reports whether the integer counts come out the same.

use crate::AuditError;
use crate::archive::ArchiveStore;
use crate::audit::evaluate;
use crate::extract::Category;
use crate::history::{History, HistoryEntry, InputSource, now_rfc3339};
use crate::score::Counts;
use crate::transcript::{CompactionRef, find_compactions};
use crate::verify::{Tier, Verification};
use chrono::DateTime;
use rusqlite::params;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Largest distance between a stored and a found compaction timestamp that
/// still counts as the same compaction.
const TIMESTAMP_TOLERANCE_SECS: i64 = 5;

#[derive(Debug, Clone, Default)]
pub struct RerunOptions {
    /// Only these runs; all runs when empty.
    pub runs: Vec<i64>,
    pub dry_run: bool,
    pub save: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimChange {
    pub category: Category,
    pub claim: String,
    pub original: Tier,
    pub rerun: Tier,
}

/// Per-claim differences, keyed by (category, claim text).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClaimDiff {
    pub unchanged: usize,
    pub upgraded: Vec<ClaimChange>,
    pub downgraded: Vec<ClaimChange>,
    pub new_claims: Vec<Verification>,
    pub removed_claims: Vec<Verification>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Reproduced {
        counts: Counts,
    },
    Diverged {
        original: Counts,
        rerun: Counts,
        diff: ClaimDiff,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
    /// Dry run: the entry would be replayed.
    Pending,
}

impl Outcome {
    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Reproduced { .. } => "reproduced",
            Outcome::Diverged { .. } => "diverged",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Failed { .. } => "failed",
            Outcome::Pending => "pending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerunResult {
    pub rerun_of: i64,
    pub lineage: Option<String>,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RerunBatch {
    pub batch: String,
    pub results: Vec<RerunResult>,
}

impl RerunBatch {
    pub fn count(&self, status: &str) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.status() == status)
            .count()
    }
}

/// Only found/total/missing/mismatched are compared; rates are derived.
pub fn same_counts(a: &Counts, b: &Counts) -> bool {
    (a.found, a.total, a.missing, a.mismatched) == (b.found, b.total, b.missing, b.mismatched)
}

pub fn compare_claims(original: &[Verification], rerun: &[Verification]) -> ClaimDiff {
    let key = |v: &Verification| (v.claim.category.as_str(), v.claim.text.clone());
    let before: BTreeMap<_, &Verification> = original.iter().map(|v| (key(v), v)).collect();
    let after: BTreeMap<_, &Verification> = rerun.iter().map(|v| (key(v), v)).collect();

    let mut diff = ClaimDiff::default();
    for (k, o) in &before {
        match after.get(k) {
            Some(r) if r.tier == o.tier => diff.unchanged += 1,
            Some(r) => {
                let change = ClaimChange {
                    category: o.claim.category,
                    claim: o.claim.text.clone(),
                    original: o.tier,
                    rerun: r.tier,
                };
                if r.tier.rank() > o.tier.rank() {
                    diff.upgraded.push(change);
                } else {
                    diff.downgraded.push(change);
                }
            }
            None => diff.removed_claims.push((*o).clone()),
        }
    }
    for (k, r) in &after {
        if !before.contains_key(k) {
            diff.new_claims.push((*r).clone());
        }
    }
    diff
}

fn seconds_apart(a: &str, b: &str) -> Option<i64> {
    let a = DateTime::parse_from_rfc3339(a).ok()?;
    let b = DateTime::parse_from_rfc3339(b).ok()?;
    Some((a - b).num_seconds().abs())
}

/// The compaction an entry was audited against: exact timestamp, else the
/// nearest within tolerance, else the stored position.
pub fn match_compaction<'a>(
    found: &'a [CompactionRef],
    index: usize,
    timestamp: &str,
) -> Option<&'a CompactionRef> {
    if let Some(c) = found.iter().find(|c| c.timestamp == timestamp) {
        return Some(c);
    }
    let nearest = found
        .iter()
        .filter_map(|c| seconds_apart(&c.timestamp, timestamp).map(|d| (d, c)))
        .filter(|(d, _)| *d <= TIMESTAMP_TOLERANCE_SECS)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c);
    nearest.or_else(|| found.get(index))
}

fn summary_text(source: &InputSource, session_id: &str) -> Result<String, String> {
    match source {
        InputSource::SummaryFile { path } => {
            fs::read_to_string(path).map_err(|e| format!("cannot read summary {path}: {e}"))
        }
        InputSource::Transcript {
            path,
            index,
            timestamp,
        } => {
            let found: Vec<CompactionRef> = find_compactions(Path::new(path))
                .map_err(|e| format!("cannot read transcript {path}: {e}"))?
                .into_iter()
                .filter(|c| c.session_id == session_id)
                .collect();
            match_compaction(&found, *index, timestamp)
                .map(|c| c.text.clone())
                .ok_or_else(|| format!("compaction at {timestamp} not found in {path}"))
        }
    }
}

fn replay(store: &ArchiveStore, entry: &HistoryEntry) -> Outcome {
    if entry.baseline {
        return Outcome::Skipped {
            reason: "baseline entry".into(),
        };
    }
    let Some(input) = &entry.input else {
        return Outcome::Skipped {
            reason: "no input recorded".into(),
        };
    };
    let text = match summary_text(&input.source, &input.session_id) {
        Ok(t) => t,
        Err(reason) => return Outcome::Failed { reason },
    };
    let record = match store.snapshot(&input.session_id, input.split, input.version, input.turn_count) {
        Ok(r) => r,
        Err(e) => {
            return Outcome::Failed {
                reason: e.to_string(),
            };
        }
    };
    if (record.turns.len() as u32) < input.turn_count {
        return Outcome::Failed {
            reason: format!(
                "archive has {} turns for {}/{}, audit saw {}",
                record.turns.len(),
                input.session_id,
                input.split,
                input.turn_count
            ),
        };
    }

    let (verifications, card) = evaluate(store.tags(), &text, &record, input.deep);
    if same_counts(&entry.score.counts, &card.counts) {
        Outcome::Reproduced { counts: card.counts }
    } else {
        Outcome::Diverged {
            original: entry.score.counts,
            rerun: card.counts,
            diff: compare_claims(&entry.verifications, &verifications),
        }
    }
}

pub fn rerun(store: &ArchiveStore, opts: &RerunOptions) -> Result<RerunBatch, AuditError> {
    let history = History::new(store.conn(), store.dir());
    let entries: Vec<HistoryEntry> = history
        .entries()?
        .into_iter()
        .filter(|e| opts.runs.is_empty() || opts.runs.contains(&e.run))
        .collect();
    for run in &opts.runs {
        if !entries.iter().any(|e| e.run == *run) {
            log::warn!("run {run} is not in the history");
        }
    }

    let batch = now_rfc3339();
    let mut results = Vec::with_capacity(entries.len());
    for entry in &entries {
        let outcome = if opts.dry_run {
            match (&entry.input, entry.baseline) {
                (_, true) => Outcome::Skipped {
                    reason: "baseline entry".into(),
                },
                (None, _) => Outcome::Skipped {
                    reason: "no input recorded".into(),
                },
                (Some(_), false) => Outcome::Pending,
            }
        } else {
            replay(store, entry)
        };
        match &outcome {
            Outcome::Diverged { original, rerun, .. } => log::warn!(
                "run {}: diverged ({}/{} found, originally {}/{})",
                entry.run,
                rerun.found,
                rerun.total,
                original.found,
                original.total
            ),
            Outcome::Failed { reason } => log::warn!("run {}: {reason}", entry.run),
            _ => {}
        }
        results.push(RerunResult {
            rerun_of: entry.run,
            lineage: entry.lineage.clone(),
            outcome,
        });
    }

    let out = RerunBatch { batch, results };
    if opts.save && !opts.dry_run {
        save(store, &out)?;
    }
    Ok(out)
}

fn save(store: &ArchiveStore, batch: &RerunBatch) -> Result<(), AuditError> {
    let tx = store.conn().unchecked_transaction()?;
    for r in &batch.results {
        tx.execute(
            "INSERT INTO reruns (batch, rerun_of, status, result) VALUES (?1, ?2, ?3, ?4)",
            params![batch.batch, r.rerun_of, r.outcome.status(), serde_json::to_string(r)?],
        )?;
    }
    tx.commit()?;
    log::info!("saved {} rerun results (batch {})", batch.results.len(), batch.batch);
    Ok(())
}

pub fn format_text(batch: &RerunBatch) -> String {
    let mut out = String::new();
    for r in &batch.results {
        let _ = write!(out, "run {:>4}  {:<10}", r.rerun_of, r.outcome.status());
        match &r.outcome {
            Outcome::Reproduced { counts } => {
                let _ = write!(out, "  {}/{} found", counts.found, counts.total);
            }
            Outcome::Diverged {
                original,
                rerun,
                diff,
            } => {
                let _ = write!(
                    out,
                    "  {}/{} found, originally {}/{}",
                    rerun.found, rerun.total, original.found, original.total
                );
                for c in &diff.upgraded {
                    let _ = write!(out, "\n      + {} \"{}\": {} → {}", c.category, c.claim, c.original, c.rerun);
                }
                for c in &diff.downgraded {
                    let _ = write!(out, "\n      - {} \"{}\": {} → {}", c.category, c.claim, c.original, c.rerun);
                }
                for v in &diff.new_claims {
                    let _ = write!(out, "\n      new {} \"{}\" ({})", v.claim.category, v.claim.text, v.tier);
                }
                for v in &diff.removed_claims {
                    let _ = write!(out, "\n      gone {} \"{}\" ({})", v.claim.category, v.claim.text, v.tier);
                }
            }
            Outcome::Skipped { reason } | Outcome::Failed { reason } => {
                let _ = write!(out, "  {reason}");
            }
            Outcome::Pending => {}
        }
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "{} reproduced, {} diverged, {} skipped, {} failed{}",
        batch.count("reproduced"),
        batch.count("diverged"),
        batch.count("skipped"),
        batch.count("failed"),
        if batch.count("pending") > 0 {
            format!(", {} to replay", batch.count("pending"))
        } else {
            String::new()
        }
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditRequest, SummarySource, Which, run_audit};
    use crate::extract::Claim;
    use crate::topics::TopicMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn v(category: Category, text: &str, tier: Tier) -> Verification {
        Verification {
            claim: Claim::new(category, text),
            tier,
            detail: None,
        }
    }

    fn cref(index: usize, ts: &str) -> CompactionRef {
        CompactionRef {
            index,
            session_id: "s".into(),
            split: index as u32 + 1,
            timestamp: ts.into(),
            text: format!("summary {index}"),
            line: index,
        }
    }

    #[test]
    fn matches_exact_then_nearest_then_index() {
        let found = vec![
            cref(0, "2026-01-05T10:00:00Z"),
            cref(1, "2026-01-05T11:00:00Z"),
        ];
        assert_eq!(match_compaction(&found, 0, "2026-01-05T11:00:00Z").unwrap().index, 1);
        assert_eq!(match_compaction(&found, 0, "2026-01-05T11:00:04Z").unwrap().index, 1);
        assert_eq!(match_compaction(&found, 0, "2026-01-05T11:00:30Z").unwrap().index, 0);
        assert!(match_compaction(&found, 5, "2026-01-05T12:00:00Z").is_none());
    }

    #[test]
    fn claim_diff_buckets() {
        let before = vec![
            v(Category::FilePath, "/a/b.rs", Tier::Missing),
            v(Category::ToolName, "Bash", Tier::Found),
            v(Category::Topic, "Rust", Tier::Found),
            v(Category::Topic, "Old", Tier::Found),
        ];
        let after = vec![
            v(Category::FilePath, "/a/b.rs", Tier::Found),
            v(Category::ToolName, "Bash", Tier::Mismatch),
            v(Category::Topic, "Rust", Tier::Found),
            v(Category::Topic, "New", Tier::Missing),
        ];
        let d = compare_claims(&before, &after);
        assert_eq!(d.unchanged, 1);
        assert_eq!(d.upgraded.len(), 1);
        assert_eq!(d.upgraded[0].claim, "/a/b.rs");
        assert_eq!(d.downgraded.len(), 1);
        assert_eq!(d.new_claims[0].claim.text, "New");
        assert_eq!(d.removed_claims[0].claim.text, "Old");
    }

    fn setup(dir: &Path) -> (ArchiveStore, std::path::PathBuf) {
        let lines = [
            r#"{"type":"user","sessionId":"sr","timestamp":"2026-01-05T10:00:00Z","cwd":"/tmp/demo","message":{"role":"user","content":"Look at /src/auth.rs"}}"#,
            r#"{"type":"assistant","sessionId":"sr","timestamp":"2026-01-05T10:00:05Z","message":{"role":"assistant","content":"Done."}}"#,
            r#"{"type":"user","sessionId":"sr","timestamp":"2026-01-05T11:00:00Z","isCompactSummary":true,"message":{"role":"user","content":"We edited /src/auth.rs and /src/gone.rs in 2 turns."}}"#,
        ];
        let path = dir.join("t.jsonl");
        let mut f = fs::File::create(&path).unwrap();
        for l in lines {
            writeln!(f, "{l}").unwrap();
        }
        let store = ArchiveStore::open(&dir.join("archive"), TopicMap::default()).unwrap();
        store.ingest(&[path.clone()], &Default::default()).unwrap();
        (store, path)
    }

    fn audit(store: &ArchiveStore, path: &Path) -> i64 {
        let req = AuditRequest {
            source: SummarySource::Transcript {
                path: path.to_path_buf(),
                which: Which::Last,
            },
            session: None,
            split: None,
            deep: false,
            record: true,
        };
        run_audit(store, &req).unwrap().entry().run
    }

    #[test]
    fn replays_against_snapshot_after_archive_grows() {
        let dir = TempDir::new().unwrap();
        let (store, path) = setup(dir.path());
        let run = audit(&store, &path);

        // A turn the first ingest never saw lands in split 0.
        let original = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = original.lines().collect();
        lines.insert(
            2,
            r#"{"type":"user","sessionId":"sr","timestamp":"2026-01-05T10:30:00Z","message":{"role":"user","content":"Also /src/gone.rs"}}"#,
        );
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        store.ingest(&[path.clone()], &Default::default()).unwrap();
        assert_eq!(store.session("sr", 0).unwrap().unwrap().turn_count, 3);

        let batch = rerun(&store, &RerunOptions::default()).unwrap();
        assert_eq!(batch.results.len(), 1);
        assert_eq!(batch.results[0].rerun_of, run);
        assert!(
            matches!(batch.results[0].outcome, Outcome::Reproduced { .. }),
            "{:?}",
            batch.results[0].outcome
        );
    }

    #[test]
    fn baselines_skipped_and_missing_inputs_fail() {
        let dir = TempDir::new().unwrap();
        let (store, path) = setup(dir.path());
        audit(&store, &path);
        let legacy = dir.path().join("legacy.jsonl");
        fs::write(
            &legacy,
            r#"{"timestamp":"2026-01-01T00:00:00Z","session_id":"sr","summary":{"total":2,"found":1,"missing":1,"mismatched":0}}"#,
        )
        .unwrap();
        History::new(store.conn(), store.dir()).import_legacy(&legacy).unwrap();
        fs::remove_file(&path).unwrap();

        let batch = rerun(&store, &RerunOptions::default()).unwrap();
        assert_eq!(batch.count("failed"), 1);
        assert_eq!(batch.count("skipped"), 1);
    }

    #[test]
    fn dry_run_and_save() {
        let dir = TempDir::new().unwrap();
        let (store, path) = setup(dir.path());
        audit(&store, &path);

        let dry = rerun(
            &store,
            &RerunOptions {
                dry_run: true,
                save: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(dry.count("pending"), 1);

        rerun(
            &store,
            &RerunOptions {
                save: true,
                ..Default::default()
            },
        )
        .unwrap();
        let saved: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM reruns WHERE status = 'reproduced'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(saved, 1);
    }
}
