//! Compaction hook entry points. The host passes a JSON payload on stdin;
//! whatever is returned is printed to stdout for the host to inject.

use crate::AuditError;
use crate::archive::{ArchiveStore, IngestOptions};
use crate::audit::{AuditRequest, SummarySource, Which, format_beacon, ground_truth, run_audit};
use crate::cli::HookPhase;
use crate::project::derive_project;
use crate::transcript::{find_compactions, last_session_id};
use serde::Deserialize;
use std::io::Read;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct HookPayload {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    hook_event_name: String,
    #[serde(default)]
    transcript_path: Option<String>,
}

pub fn handle_hook(
    store: &ArchiveStore,
    phase: HookPhase,
    mut input: impl Read,
    deep: bool,
) -> Result<String, AuditError> {
    let mut raw = String::new();
    input.read_to_string(&mut raw)?;
    let payload: HookPayload = serde_json::from_str(&raw)?;

    let Some(transcript) = payload.transcript_path.as_deref().filter(|p| !p.is_empty()) else {
        log::warn!("{} hook without transcript_path; nothing to do", payload.hook_event_name);
        return Ok(String::new());
    };
    let transcript = PathBuf::from(transcript);

    let session_id = match payload.session_id.filter(|s| !s.is_empty()) {
        Some(s) => s,
        None => match last_session_id(&transcript)? {
            Some(s) => s,
            None => {
                log::warn!("no session id in payload or {}", transcript.display());
                return Ok(String::new());
            }
        },
    };

    let opts = IngestOptions {
        project: (!payload.cwd.is_empty()).then(|| derive_project(&payload.cwd)),
        session: Some(session_id.clone()),
    };
    let report = store.ingest(std::slice::from_ref(&transcript), &opts)?;
    log::info!(
        "{:?} hook: {} turns archived for {}",
        phase,
        report.turns_added,
        session_id
    );

    match phase {
        HookPhase::Pre => Ok(ground_truth(store, Some(&session_id), None)?.block()),
        HookPhase::Post => {
            let has_summary = find_compactions(&transcript)?
                .iter()
                .any(|c| c.session_id == session_id);
            if !has_summary {
                log::warn!("no compaction summary in {} yet", transcript.display());
                return Ok(String::new());
            }
            let report = run_audit(
                store,
                &AuditRequest {
                    source: SummarySource::Transcript {
                        path: transcript,
                        which: Which::Last,
                    },
                    session: Some(session_id),
                    split: None,
                    deep,
                    record: true,
                },
            )?;
            Ok(format_beacon(&report))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::topics::TopicMap;
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    const PRE: &str = r#"{"type":"user","sessionId":"hk","timestamp":"2026-01-05T10:00:00Z","cwd":"/tmp/demo","message":{"role":"user","content":"Refactor /src/lib.rs"}}
{"type":"assistant","sessionId":"hk","timestamp":"2026-01-05T10:00:03Z","message":{"role":"assistant","content":[{"type":"tool_use","name":"Read","input":{"file_path":"/src/lib.rs"}}]}}
"#;
    const COMPACT: &str = r#"{"type":"user","sessionId":"hk","timestamp":"2026-01-05T10:30:00Z","isCompactSummary":true,"message":{"role":"user","content":"The assistant ran Read on /src/lib.rs over 2 turns."}}
"#;

    fn payload(path: &std::path::Path) -> Cursor<Vec<u8>> {
        let json = serde_json::json!({
            "session_id": "hk",
            "cwd": "/tmp/demo",
            "hook_event_name": "PreCompact",
            "transcript_path": path.display().to_string(),
        });
        Cursor::new(json.to_string().into_bytes())
    }

    #[test]
    fn pre_then_post() {
        let dir = TempDir::new().unwrap();
        let t = dir.path().join("hk.jsonl");
        fs::write(&t, PRE).unwrap();
        let store = ArchiveStore::open(&dir.path().join("archive"), TopicMap::default()).unwrap();

        let pre = handle_hook(&store, HookPhase::Pre, payload(&t), false).unwrap();
        assert!(pre.contains("Turn count: 2\n"), "{pre}");
        assert!(pre.contains("/src/lib.rs"));

        fs::write(&t, format!("{PRE}{COMPACT}")).unwrap();
        let post = handle_hook(&store, HookPhase::Post, payload(&t), false).unwrap();
        assert!(post.starts_with("=== COMPACTION AUDIT ===\nRun 1: 100.0%"), "{post}");
        assert!(post.contains("Regressions: None"));
        assert_eq!(History::new(store.conn(), store.dir()).entries().unwrap().len(), 1);
    }

    #[test]
    fn post_without_summary_is_quiet() {
        let dir = TempDir::new().unwrap();
        let t = dir.path().join("hk.jsonl");
        fs::write(&t, PRE).unwrap();
        let store = ArchiveStore::open(&dir.path().join("archive"), TopicMap::default()).unwrap();
        let out = handle_hook(&store, HookPhase::Post, payload(&t), false).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn payload_without_transcript_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(dir.path(), TopicMap::default()).unwrap();
        let input = Cursor::new(br#"{"session_id":""}"#.to_vec());
        assert!(handle_hook(&store, HookPhase::Pre, input, false).unwrap().is_empty());
    }

    #[test]
    fn session_id_falls_back_to_transcript() {
        let dir = TempDir::new().unwrap();
        let t = dir.path().join("hk.jsonl");
        fs::write(&t, PRE).unwrap();
        let store = ArchiveStore::open(&dir.path().join("archive"), TopicMap::default()).unwrap();
        let json = serde_json::json!({
            "cwd": "/tmp/demo",
            "hook_event_name": "PreCompact",
            "transcript_path": t.display().to_string(),
        });
        let input = Cursor::new(json.to_string().into_bytes());
        let pre = handle_hook(&store, HookPhase::Pre, input, false).unwrap();
        assert!(pre.contains("Session ID: hk"), "{pre}");
        assert_eq!(store.session("hk", 0).unwrap().unwrap().turn_count, 2);
    }
}
