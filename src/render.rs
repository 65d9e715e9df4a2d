//! Archive record layout: rendering turns into the human-readable record and
//! parsing its header block back into structured fields.
//!
//! Rendering is a pure function of (format revision, semantic map, project,
//! turns), so any stored version can be reproduced exactly.

use crate::extract::{fenced_declarations, find_paths};
use crate::topics::{TopicMap, extract_topics, summary_line};
use crate::transcript::{Role, Turn};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

const MAX_TOPICS: usize = 10;
const MAX_FILES: usize = 40;
const EXCERPT_CHARS: usize = 160;
const EXCERPT_SEP: &str = " ‖ ";

static HEADER_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*([A-Za-z][A-Za-z ]*)\*\*:\s*(.*?)\s*$").unwrap());
static SEMANTIC_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S)\s+\((.*)\)$").unwrap());

/// Formatting rules revision. New records use [`Format::LATEST`]; enrichment
/// re-renders older records with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Format {
    /// Identity, turn count and duration only.
    Plain = 1,
    /// Adds topics, tools, files, symbols, user excerpts and semantic tags.
    Enriched = 2,
}

impl Format {
    pub const LATEST: Format = Format::Enriched;

    pub fn from_i64(n: i64) -> Option<Format> {
        match n {
            1 => Some(Format::Plain),
            2 => Some(Format::Enriched),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SemanticTag {
    pub tag: String,
    pub topic: String,
}

/// Structured header of an archive record. The verifier's non-deep source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Header {
    pub session_id: String,
    pub split: u32,
    pub version: u32,
    pub turns: u32,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub summary: Option<String>,
    pub topics: Vec<String>,
    pub tools_used: Vec<String>,
    pub files_referenced: Vec<String>,
    pub symbols: Vec<String>,
    pub user_excerpts: Vec<String>,
    pub semantic_tags: Vec<SemanticTag>,
}

pub struct RenderInput<'a> {
    pub session_id: &'a str,
    pub split: u32,
    pub version: u32,
    pub project: &'a str,
    pub format: Format,
    pub tags: &'a TopicMap,
    pub turns: &'a [Turn],
}

/// Collapse runs of whitespace to single spaces.
pub fn normalize_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn time_of(ts: &str) -> &str {
    ts.get(11..19).unwrap_or("")
}

fn user_texts(turns: &[Turn]) -> impl Iterator<Item = &str> {
    turns
        .iter()
        .filter(|t| t.role == Role::User)
        .map(|t| t.text.as_str())
}

/// Sorted, deduplicated tool names used across turns.
pub fn tools_used(turns: &[Turn]) -> Vec<String> {
    turns
        .iter()
        .flat_map(|t| t.tool_uses.iter().map(|u| u.name.clone()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn files_referenced(turns: &[Turn]) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for t in turns {
        paths.extend(find_paths(&t.text));
        for u in &t.tool_uses {
            paths.extend(find_paths(&u.input));
        }
    }
    paths
        .into_iter()
        .filter(|p| !p.contains(", "))
        .take(MAX_FILES)
        .collect()
}

fn symbols(turns: &[Turn]) -> Vec<String> {
    turns
        .iter()
        .flat_map(|t| fenced_declarations(&t.text))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn excerpts(turns: &[Turn]) -> Vec<String> {
    user_texts(turns)
        .map(|t| {
            let flat = normalize_ws(t).replace('‖', "|");
            flat.chars().take(EXCERPT_CHARS).collect::<String>()
        })
        .filter(|e| !e.is_empty())
        .collect()
}

/// Union of semantic tags over all turn text, in codepoint order.
pub fn session_tags(turns: &[Turn], tags: &TopicMap) -> String {
    let all = turns
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    tags.scan(&all)
}

/// Derived session metadata used in enriched headers and the index.
pub fn session_summary(turns: &[Turn]) -> Option<String> {
    summary_line(user_texts(turns))
}

pub fn session_topics(turns: &[Turn]) -> Vec<String> {
    extract_topics(user_texts(turns), MAX_TOPICS)
}

fn push_field(lines: &mut Vec<String>, key: &str, value: &str) {
    lines.push(format!("**{key}**: {value}  "));
}

pub fn render(input: &RenderInput<'_>) -> String {
    let turns = input.turns;
    let first_ts = turns.first().map(|t| t.timestamp.as_str()).unwrap_or("");
    let last_ts = turns.last().map(|t| t.timestamp.as_str()).unwrap_or("");
    let date = first_ts.get(..10).unwrap_or("unknown-date");

    let mut lines = vec![format!("# Session: {date} | {}", input.project), String::new()];
    push_field(&mut lines, "Session ID", &format!("`{}`", input.session_id));
    push_field(&mut lines, "Split", &input.split.to_string());
    push_field(&mut lines, "Version", &input.version.to_string());
    push_field(&mut lines, "Turns", &turns.len().to_string());
    if !first_ts.is_empty() {
        push_field(&mut lines, "Duration", &format!("{first_ts} to {last_ts}"));
    }

    let enriched = input.format >= Format::Enriched;
    if enriched {
        if let Some(summary) = session_summary(turns) {
            push_field(&mut lines, "Summary", &normalize_ws(&summary));
        }
        let lists = [
            ("Topics", session_topics(turns), ", "),
            ("Tools Used", tools_used(turns), ", "),
            ("Files Referenced", files_referenced(turns), ", "),
            ("Symbols", symbols(turns), ", "),
            ("User Excerpts", excerpts(turns), EXCERPT_SEP),
        ];
        for (key, items, sep) in lists {
            if !items.is_empty() {
                push_field(&mut lines, key, &items.join(sep));
            }
        }
        let tag = session_tags(turns, input.tags);
        if !tag.is_empty() {
            let parts: Vec<String> = tag
                .chars()
                .map(|c| format!("{c} ({})", input.tags.topic_for(c).unwrap_or("?")))
                .collect();
            push_field(&mut lines, "Semantic Tags", &parts.join(", "));
        }
    }

    lines.push(String::new());
    lines.push("---".into());
    lines.push(String::new());

    for turn in turns {
        render_turn(&mut lines, turn, enriched.then_some(input.tags));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn render_turn(lines: &mut Vec<String>, turn: &Turn, tags: Option<&TopicMap>) {
    let heading = format!(
        "## Turn {} — {} [{}]",
        turn.seq,
        turn.role.label(),
        time_of(&turn.timestamp)
    );

    match tags {
        Some(map) => {
            let paragraphs: Vec<&str> = turn
                .text
                .split("\n\n")
                .filter(|p| !p.trim().is_empty())
                .collect();
            let para_tags: Vec<String> = paragraphs.iter().map(|p| map.scan(p)).collect();
            let turn_tag: String = para_tags
                .iter()
                .flat_map(|t| t.chars())
                .collect::<BTreeSet<char>>()
                .into_iter()
                .collect();
            if turn_tag.is_empty() {
                lines.push(heading);
            } else {
                lines.push(format!("{heading} {{{turn_tag}}}"));
            }
            lines.push(String::new());
            for (para, tag) in paragraphs.iter().zip(&para_tags) {
                lines.push((*para).to_string());
                lines.push(String::new());
                if !tag.is_empty() {
                    lines.push(format!("{{{tag}}}"));
                    lines.push(String::new());
                }
            }
        }
        None => {
            lines.push(heading);
            lines.push(String::new());
            if !turn.text.is_empty() {
                lines.push(turn.text.clone());
                lines.push(String::new());
            }
        }
    }

    for tu in &turn.tool_uses {
        lines.push(format!("**Tool**: `{}` | Input: `{}`", tu.name, tu.input));
        lines.push(String::new());
    }

    if !turn.thinking.is_empty() {
        lines.push("<details><summary>Thinking</summary>".into());
        lines.push(String::new());
        lines.push(turn.thinking.clone());
        lines.push(String::new());
        lines.push("</details>".into());
        lines.push(String::new());
    }

    lines.push("---".into());
    lines.push(String::new());
}

fn split_list(value: &str, sep: &str) -> Vec<String> {
    value
        .split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the header block (everything before the first `---`).
pub fn parse_header(content: &str) -> Header {
    let mut header = Header::default();
    for line in content.lines() {
        if line.trim() == "---" {
            break;
        }
        let Some(caps) = HEADER_LINE_RE.captures(line) else {
            continue;
        };
        let value = caps[2].trim();
        match &caps[1] {
            "Session ID" => header.session_id = value.trim_matches('`').to_string(),
            "Split" => header.split = value.parse().unwrap_or(0),
            "Version" => header.version = value.parse().unwrap_or(0),
            "Turns" => header.turns = value.parse().unwrap_or(0),
            "Duration" => {
                if let Some((start, end)) = value.split_once(" to ") {
                    header.started_at = Some(start.to_string());
                    header.ended_at = Some(end.to_string());
                }
            }
            "Summary" => header.summary = Some(value.to_string()),
            "Topics" => header.topics = split_list(value, ", "),
            "Tools Used" => header.tools_used = split_list(value, ", "),
            "Files Referenced" => header.files_referenced = split_list(value, ", "),
            "Symbols" => header.symbols = split_list(value, ", "),
            "User Excerpts" => header.user_excerpts = split_list(value, EXCERPT_SEP.trim()),
            "Semantic Tags" => {
                header.semantic_tags = split_list(value, ", ")
                    .iter()
                    .filter_map(|item| {
                        let caps = SEMANTIC_ITEM_RE.captures(item)?;
                        Some(SemanticTag {
                            tag: caps[1].to_string(),
                            topic: caps[2].to_string(),
                        })
                    })
                    .collect();
            }
            _ => {}
        }
    }
    header
}

/// `_b`, `_c`, ... for splits after the first.
pub fn split_suffix(split: u32) -> String {
    match split {
        0 => String::new(),
        1..=25 => format!("_{}", (b'a' + split as u8) as char),
        n => format!("_{n}"),
    }
}

/// Published file name for one record version.
pub fn record_file_name(session_id: &str, split: u32, date: &str, version: u32) -> String {
    let short: String = if session_id == "unknown" {
        "nosession".into()
    } else {
        session_id.chars().take(8).collect()
    };
    let ident: String = format!("session_{date}_{short}")
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{ident}{}.v{version}.md", split_suffix(split))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::ToolUse;
    use std::collections::BTreeMap;

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

    fn sample() -> Vec<Turn> {
        let mut t2 = turn(2, Role::Assistant, "2026-01-05T10:00:05Z", "Looking at it.");
        t2.tool_uses.push(ToolUse {
            name: "Read".into(),
            input: r#"{"file_path":"/src/auth.rs"}"#.into(),
        });
        vec![
            turn(
                1,
                Role::User,
                "2026-01-05T10:00:00Z",
                "Please fix the token check in /src/auth.rs for Rust builds.",
            ),
            t2,
            turn(3, Role::Assistant, "2026-01-05T10:01:00Z", "```rust\nfn check_token() {}\n```"),
        ]
    }

    fn tags() -> TopicMap {
        TopicMap::new(BTreeMap::from([('Σ', "rust".to_string())]), Vec::new()).unwrap()
    }

    #[test]
    fn enriched_header_round_trips() {
        let turns = sample();
        let map = tags();
        let content = render(&RenderInput {
            session_id: "abcdef123456",
            split: 1,
            version: 2,
            project: "proj",
            format: Format::Enriched,
            tags: &map,
            turns: &turns,
        });
        let h = parse_header(&content);
        assert_eq!(h.session_id, "abcdef123456");
        assert_eq!(h.split, 1);
        assert_eq!(h.version, 2);
        assert_eq!(h.turns, 3);
        assert_eq!(h.started_at.as_deref(), Some("2026-01-05T10:00:00Z"));
        assert_eq!(h.ended_at.as_deref(), Some("2026-01-05T10:01:00Z"));
        assert_eq!(h.tools_used, vec!["Read"]);
        assert_eq!(h.files_referenced, vec!["/src/auth.rs"]);
        assert_eq!(h.symbols, vec!["check_token"]);
        assert_eq!(h.user_excerpts.len(), 1);
        assert_eq!(h.semantic_tags[0].topic, "rust");
        assert!(content.contains("## Turn 1 — User [10:00:00] {Σ}"));
    }

    #[test]
    fn plain_header_has_no_enrichment() {
        let turns = sample();
        let map = tags();
        let content = render(&RenderInput {
            session_id: "abc",
            split: 0,
            version: 1,
            project: "proj",
            format: Format::Plain,
            tags: &map,
            turns: &turns,
        });
        let h = parse_header(&content);
        assert_eq!(h.turns, 3);
        assert!(h.tools_used.is_empty());
        assert!(h.files_referenced.is_empty());
        assert!(!content.contains("{Σ}"));
    }

    #[test]
    fn render_is_deterministic() {
        let turns = sample();
        let map = tags();
        let input = RenderInput {
            session_id: "abc",
            split: 0,
            version: 1,
            project: "proj",
            format: Format::Enriched,
            tags: &map,
            turns: &turns,
        };
        assert_eq!(render(&input), render(&input));
    }

    #[test]
    fn file_names_carry_split_and_version() {
        assert_eq!(
            record_file_name("abcdef123456", 0, "2026-01-05", 1),
            "session_2026-01-05_abcdef12.v1.md"
        );
        assert_eq!(
            record_file_name("abcdef123456", 2, "2026-01-05", 3),
            "session_2026-01-05_abcdef12_c.v3.md"
        );
        assert_eq!(split_suffix(30), "_30");
    }
}
