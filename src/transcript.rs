//! Streaming reader for Claude Code JSONL transcripts.
//!
//! Lines are read one at a time with a byte cap; malformed or oversized
//! lines are skipped with a warning. A [`Sequencer`] assigns each turn its
//! logical split and sequence index as the stream goes by.

use crate::AuditError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Fallback marker for transcripts that predate the `isCompactSummary` flag.
pub const COMPACTION_MARKER: &str = "This session is being continued from a previous conversation";

const MAX_LINE_BYTES: u64 = 32 * 1024 * 1024;
const TOOL_INPUT_PREVIEW: usize = 200;
const TOOL_RESULT_PREVIEW: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    pub input: String,
}

/// One conversational exchange unit. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub seq: u32,
    pub role: Role,
    pub timestamp: String,
    pub text: String,
    pub thinking: String,
    pub tool_uses: Vec<ToolUse>,
    pub model: Option<String>,
}

impl Turn {
    /// Everything a deep search may look at.
    pub fn body(&self) -> String {
        let mut out = self.text.clone();
        for tu in &self.tool_uses {
            out.push('\n');
            out.push_str(&tu.name);
            out.push(' ');
            out.push_str(&tu.input);
        }
        if !self.thinking.is_empty() {
            out.push('\n');
            out.push_str(&self.thinking);
        }
        out
    }

    /// Same stored content, ignoring the sequence index.
    pub fn same_content(&self, other: &Turn) -> bool {
        self.role == other.role
            && self.timestamp == other.timestamp
            && self.text == other.text
            && self.tool_uses == other.tool_uses
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Turn {
        session_id: String,
        cwd: Option<String>,
        turn: Turn,
    },
    Compaction {
        session_id: String,
        timestamp: String,
        text: String,
        line: usize,
    },
}

pub struct TranscriptReader<R> {
    reader: R,
    source: String,
    line_no: usize,
    buf: Vec<u8>,
    skipped: usize,
}

pub fn open_transcript(path: &Path) -> Result<TranscriptReader<BufReader<File>>, AuditError> {
    let file = File::open(path).map_err(|e| {
        AuditError::Input(format!("cannot open transcript {}: {e}", path.display()))
    })?;
    Ok(TranscriptReader::new(
        BufReader::new(file),
        path.display().to_string(),
    ))
}

impl<R: BufRead> TranscriptReader<R> {
    pub fn new(reader: R, source: impl Into<String>) -> Self {
        Self {
            reader,
            source: source.into(),
            line_no: 0,
            buf: Vec::new(),
            skipped: 0,
        }
    }

    /// Lines skipped so far as malformed or oversized.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Read one line into `buf`, discarding the tail of lines over the cap.
    /// Returns Ok(None) at EOF, Ok(Some(false)) for an oversized line.
    fn next_line(&mut self) -> std::io::Result<Option<bool>> {
        self.buf.clear();
        let n = (&mut self.reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        if self.buf.last() != Some(&b'\n') && n as u64 == MAX_LINE_BYTES {
            let mut sink = Vec::new();
            loop {
                sink.clear();
                let m = (&mut self.reader)
                    .take(MAX_LINE_BYTES)
                    .read_until(b'\n', &mut sink)?;
                if m == 0 || sink.last() == Some(&b'\n') {
                    break;
                }
            }
            return Ok(Some(false));
        }
        Ok(Some(true))
    }
}

impl<R: BufRead> Iterator for TranscriptReader<R> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            match self.next_line() {
                Ok(None) => return None,
                Err(e) => {
                    log::warn!("{}: read error after line {}: {e}", self.source, self.line_no);
                    return None;
                }
                Ok(Some(false)) => {
                    self.skipped += 1;
                    log::warn!("{}:{}: skipping oversized line", self.source, self.line_no);
                    continue;
                }
                Ok(Some(true)) => {}
            }

            let line = String::from_utf8_lossy(&self.buf);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let entry: Value = match serde_json::from_str(trimmed) {
                Ok(v) => v,
                Err(e) => {
                    self.skipped += 1;
                    log::warn!("{}:{}: skipping malformed line ({e})", self.source, self.line_no);
                    continue;
                }
            };
            if let Some(event) = parse_entry(&entry, self.line_no) {
                return Some(event);
            }
        }
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}

/// Text blocks of a message content value, joined by newlines.
pub fn text_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                Value::String(s) => Some(s.as_str()),
                Value::Object(_) if str_field(b, "type") == Some("text") => str_field(b, "text"),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn blocks_of<'a>(content: &'a Value, kind: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
    content
        .as_array()
        .into_iter()
        .flatten()
        .filter(move |b| str_field(b, "type") == Some(kind))
}

fn is_compaction(entry: &Value, role: Role, content: &Value) -> bool {
    if entry.get("isCompactSummary").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    if role != Role::User {
        return false;
    }
    match content {
        Value::String(s) => {
            let head: String = s.chars().take(200).collect();
            head.contains(COMPACTION_MARKER)
        }
        _ => false,
    }
}

/// Interpret one JSON entry. Entries that are neither turns nor compaction
/// markers (system records, empty messages) yield None.
pub fn parse_entry(entry: &Value, line: usize) -> Option<Event> {
    let kind = str_field(entry, "type")
        .or_else(|| str_field(entry, "role"))
        .or_else(|| entry.get("message").and_then(|m| str_field(m, "role")))?;
    let role = match kind {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => return None,
    };

    let message = entry.get("message").unwrap_or(entry);
    let content = message.get("content").cloned().unwrap_or(Value::Null);
    let session_id = str_field(entry, "sessionId")
        .or_else(|| str_field(entry, "session_id"))
        .unwrap_or("unknown")
        .to_string();
    let timestamp = str_field(entry, "timestamp").unwrap_or("").to_string();

    if is_compaction(entry, role, &content) {
        return Some(Event::Compaction {
            session_id,
            timestamp,
            text: text_content(&content),
            line,
        });
    }

    let mut role = role;
    let mut text = text_content(&content);
    let thinking = blocks_of(&content, "thinking")
        .filter_map(|b| str_field(b, "thinking"))
        .collect::<Vec<_>>()
        .join("\n");
    let tool_uses: Vec<ToolUse> = if role == Role::Assistant {
        blocks_of(&content, "tool_use")
            .filter_map(|b| {
                let name = str_field(b, "name")?;
                let input = b.get("input").map(|i| i.to_string()).unwrap_or_default();
                Some(ToolUse {
                    name: name.to_string(),
                    input: truncate(&input, TOOL_INPUT_PREVIEW),
                })
            })
            .collect()
    } else {
        Vec::new()
    };

    if text.trim().is_empty() && role == Role::User {
        let results: Vec<String> = blocks_of(&content, "tool_result")
            .map(|b| match b.get("content") {
                Some(c @ Value::Array(_)) => text_content(c),
                Some(Value::String(s)) => s.clone(),
                _ => String::new(),
            })
            .filter(|s| !s.trim().is_empty())
            .collect();
        if !results.is_empty() {
            role = Role::Tool;
            text = truncate(&results.join("\n"), TOOL_RESULT_PREVIEW);
        }
    }

    if text.trim().is_empty() && tool_uses.is_empty() {
        return None;
    }

    Some(Event::Turn {
        session_id,
        cwd: str_field(entry, "cwd").map(str::to_string),
        turn: Turn {
            seq: 0,
            role,
            timestamp,
            text: text.replace("\r\n", "\n").replace('\r', "\n"),
            thinking,
            tool_uses,
            model: str_field(message, "model").map(str::to_string),
        },
    })
}

/// Assigns logical splits and sequence indices. Shared across every file of
/// one ingest so that a session spanning several transcripts stays gapless.
#[derive(Debug, Default)]
pub struct Sequencer {
    splits: HashMap<String, u32>,
    next_seq: HashMap<(String, u32), u32>,
}

impl Sequencer {
    /// Register a compaction boundary; returns the split it opens.
    pub fn open_split(&mut self, session_id: &str) -> u32 {
        let split = self.splits.entry(session_id.to_string()).or_insert(0);
        *split += 1;
        *split
    }

    pub fn current_split(&self, session_id: &str) -> u32 {
        self.splits.get(session_id).copied().unwrap_or(0)
    }

    /// Give `turn` its sequence index; returns the split it belongs to.
    pub fn place(&mut self, session_id: &str, turn: &mut Turn) -> u32 {
        let split = self.current_split(session_id);
        let next = self
            .next_seq
            .entry((session_id.to_string(), split))
            .or_insert(1);
        turn.seq = *next;
        *next += 1;
        split
    }
}

/// A compaction summary located in a transcript file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionRef {
    pub index: usize,
    pub session_id: String,
    /// Split the compaction opened within this file's numbering.
    pub split: u32,
    pub timestamp: String,
    pub text: String,
    pub line: usize,
}

/// Session id of the last turn or compaction in the transcript.
pub fn last_session_id(path: &Path) -> Result<Option<String>, AuditError> {
    let last = open_transcript(path)?
        .filter_map(|event| match event {
            Event::Turn { session_id, .. } | Event::Compaction { session_id, .. } => {
                Some(session_id)
            }
        })
        .filter(|s| s != "unknown")
        .last();
    Ok(last)
}

/// All compaction summaries in one transcript, in file order.
pub fn find_compactions(path: &Path) -> Result<Vec<CompactionRef>, AuditError> {
    let mut reader = open_transcript(path)?;
    let mut seq = Sequencer::default();
    let mut found = Vec::new();
    for event in reader.by_ref() {
        if let Event::Compaction {
            session_id,
            timestamp,
            text,
            line,
        } = event
        {
            let split = seq.open_split(&session_id);
            found.push(CompactionRef {
                index: found.len(),
                session_id,
                split,
                timestamp,
                text,
                line,
            });
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn events(input: &str) -> (Vec<Event>, usize) {
        let mut r = TranscriptReader::new(Cursor::new(input.as_bytes().to_vec()), "test");
        let ev: Vec<Event> = r.by_ref().collect();
        (ev, r.skipped())
    }

    #[test]
    fn parses_string_and_block_content() {
        let input = r#"{"type":"user","sessionId":"s1","timestamp":"2026-01-05T10:00:00Z","message":{"role":"user","content":"Fix /src/auth.rs please"}}
{"type":"assistant","sessionId":"s1","timestamp":"2026-01-05T10:00:05Z","message":{"role":"assistant","model":"m1","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"Reading it"},{"type":"tool_use","name":"Read","input":{"file_path":"/src/auth.rs"}}]}}
"#;
        let (ev, skipped) = events(input);
        assert_eq!(skipped, 0);
        assert_eq!(ev.len(), 2);
        match &ev[1] {
            Event::Turn { turn, .. } => {
                assert_eq!(turn.role, Role::Assistant);
                assert_eq!(turn.text, "Reading it");
                assert_eq!(turn.thinking, "hmm");
                assert_eq!(turn.tool_uses[0].name, "Read");
                assert!(turn.tool_uses[0].input.contains("/src/auth.rs"));
                assert_eq!(turn.model.as_deref(), Some("m1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let input = "not json\n\n{\"type\":\"user\",\"message\":{\"content\":\"hello there\"}}\n{broken\n";
        let (ev, skipped) = events(input);
        assert_eq!(ev.len(), 1);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn tool_results_become_tool_turns() {
        let input = r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"file contents"}]}}"#;
        let (ev, _) = events(input);
        match &ev[0] {
            Event::Turn { turn, .. } => {
                assert_eq!(turn.role, Role::Tool);
                assert_eq!(turn.text, "file contents");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn compaction_flag_and_marker_text() {
        let input = format!(
            "{}\n{}\n",
            r#"{"type":"user","sessionId":"s1","isCompactSummary":true,"timestamp":"t1","message":{"content":"Summary one"}}"#,
            serde_json::json!({"type":"user","sessionId":"s1","timestamp":"t2","message":{"content":format!("{COMPACTION_MARKER}. Summary two")}})
        );
        let (ev, _) = events(&input);
        assert_eq!(ev.len(), 2);
        assert!(ev.iter().all(|e| matches!(e, Event::Compaction { .. })));
    }

    #[test]
    fn sequencer_splits_at_compaction() {
        let mut seq = Sequencer::default();
        let mut t = Turn {
            seq: 0,
            role: Role::User,
            timestamp: String::new(),
            text: "x".into(),
            thinking: String::new(),
            tool_uses: Vec::new(),
            model: None,
        };
        assert_eq!(seq.place("s", &mut t), 0);
        assert_eq!(t.seq, 1);
        assert_eq!(seq.place("s", &mut t), 0);
        assert_eq!(t.seq, 2);
        assert_eq!(seq.open_split("s"), 1);
        assert_eq!(seq.place("s", &mut t), 1);
        assert_eq!(t.seq, 1);
        assert_eq!(seq.place("other", &mut t), 0);
        assert_eq!(t.seq, 1);
    }
}
