//! Claim extraction from compaction summaries.
//!
//! One [`Extractor`] per category; [`ClaimExtractor`] runs them in order and
//! collapses duplicate literals within a category.

use crate::topics::TopicMap;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::LazyLock;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```(.*?)```").unwrap());
static WIN_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z]:[/\\][\w./\\-]+").unwrap());
static POSIX_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w:/])(/(?:[\w.-]+/)+[\w.-]+)").unwrap());
static TOOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    let alts = KNOWN_TOOLS.join("|");
    Regex::new(&format!(r"\b(?:{alts})\b")).unwrap()
});
static CURLY_QUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\u{201c}([^\u{201d}]{8,})\u{201d}").unwrap());
static STRAIGHT_QUOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"\n]{8,})""#).unwrap());
static PATHLIKE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w./\\:]+$").unwrap());
static USER_SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)All User Messages[:\s]*\n").unwrap());
static NEXT_SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*\d+\.\s+[A-Z]").unwrap());
static BOLD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]{3,50})\*\*").unwrap());
static PHRASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b").unwrap());
static ACRONYM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([A-Z]{2,})\b").unwrap());
static MESSAGE_N_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Message\s+\d+").unwrap());
static STRUCTURAL_PHRASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:Message|Session|Turn|Step|Phase|Option)\s").unwrap());
static TURN_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)[\s-]*turns?\b").unwrap());
static DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:def|class|fn|function|struct|enum|trait|interface)\s+([A-Za-z_][A-Za-z0-9_]*)")
        .unwrap()
});

pub const KNOWN_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Bash",
    "Glob",
    "Grep",
    "Task",
    "TodoWrite",
    "AskUserQuestion",
    "ExitPlanMode",
    "EnterPlanMode",
    "WebFetch",
    "WebSearch",
    "NotebookEdit",
    "Skill",
];

const USER_CUES: &[&str] = &["user", "you said", "asked", "requested"];

const SECTION_HEADERS: &[&str] = &[
    "primary request and intent",
    "key technical concepts",
    "files and code sections",
    "errors and fixes",
    "problem solving",
    "all user messages",
    "pending tasks",
    "current work",
    "optional next step",
    "analysis",
    "summary",
];

const SKIP_LABELS: &[&str] = &[
    "NOTE", "CRITICAL", "IMPORTANT", "SOLVED", "NOT FIXED", "ONGOING", "MODIFIED", "CREATED",
    "READ", "GENERATED", "BUG", "COMPLETE", "WHAT", "WHY", "HOW", "FIX", "ERROR", "FIXED",
    "DEFERRED", "IN", "ADD", "JUST", "ONLY", "CHANGE",
];

const SKIP_ACRONYMS: &[&str] = &[
    "OK", "ID", "VS", "IE", "EG", "IF", "OR", "IS", "IT", "DO", "AS", "ON", "TO", "AT", "OF",
    "NO", "UP", "SO", "BE", "BY", "AM", "AN", "PC", "IN", "NOT", "THE", "AND", "FOR", "ALL",
    "HAS", "WAS", "GET", "SET", "PUT", "API", "CLI", "URL", "SQL", "ADD", "BUT", "CAN", "DID",
    "HAD", "HER", "HIS", "HIM", "HOW", "ITS", "LET", "MAY", "NEW", "NOW", "OLD", "OUR", "OWN",
    "RAN", "SAY", "SHE", "TRY", "USE", "WAY", "WHO", "WIN", "YET", "ANY", "FEW", "GOT", "NOR",
    "RUN", "TWO", "JSON", "HTML", "TEXT", "FILE", "PATH", "UUID", "NULL", "TRUE", "ARGS",
    "HTTP", "SELF", "NONE", "JUST", "ONLY", "ALSO", "BACK", "BEEN", "BOTH", "CALL", "COME",
    "DONE", "EACH", "EVEN", "FIND", "FROM", "GAVE", "GOES", "GONE", "GOOD", "HAVE", "HERE",
    "INTO", "KEEP", "KNOW", "LAST", "LEFT", "LIKE", "LIST", "LOOK", "MADE", "MAKE", "MANY",
    "MORE", "MOST", "MUCH", "MUST", "NAME", "NEED", "NEXT", "ONCE", "OVER", "PART", "SAME",
    "SHOW", "SIDE", "SOME", "SUCH", "SURE", "TAKE", "TELL", "THAN", "THAT", "THEM", "THEN",
    "THEY", "THIS", "TOOK", "VERY", "WANT", "WELL", "WENT", "WERE", "WHAT", "WHEN", "WILL",
    "WITH", "WORK", "YOUR", "FALSE", "ABOUT", "ABOVE", "AFTER", "AGAIN", "BEING", "BELOW",
    "COULD", "EVERY", "FIRST", "FOUND", "NEVER", "OTHER", "SHALL", "SINCE", "STILL", "THEIR",
    "THERE", "THESE", "THINK", "THOSE", "THREE", "UNDER", "UNTIL", "WHERE", "WHICH", "WHILE",
    "WHOSE", "WOULD", "SHOULD", "THROUGH", "BEFORE", "BETWEEN", "BECAUSE", "DURING", "WITHOUT",
    "ALREADY", "ANOTHER", "ALWAYS", "APPEAR", "CHANGE", "DISCUSSED", "IDENTIFIED", "PREVIOUS",
    "UPDATED", "UNLESS", "CREATED", "MODIFIED", "GENERATED", "MEMORY", "README", "UTF",
    "STDERR", "STDOUT", "TYPE", "LOCAL",
];

/// Declaration names too generic to be a symbol claim.
const SKIP_SYMBOLS: &[&str] = &["Task", "Path", "Counter"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Info,
}

impl Severity {
    pub const fn weight(self) -> u32 {
        match self {
            Severity::Critical => 4,
            Severity::Major => 3,
            Severity::Minor => 2,
            Severity::Info => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    FilePath,
    ToolName,
    UserQuote,
    Topic,
    TurnCount,
    Symbol,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::FilePath,
        Category::ToolName,
        Category::UserQuote,
        Category::Topic,
        Category::TurnCount,
        Category::Symbol,
    ];

    pub const fn severity(self) -> Severity {
        match self {
            Category::FilePath | Category::Symbol => Severity::Critical,
            Category::ToolName | Category::UserQuote => Severity::Major,
            Category::Topic => Severity::Minor,
            Category::TurnCount => Severity::Info,
        }
    }

    pub const fn weight(self) -> u32 {
        self.severity().weight()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::FilePath => "file_path",
            Category::ToolName => "tool_name",
            Category::UserQuote => "user_quote",
            Category::Topic => "topic",
            Category::TurnCount => "turn_count",
            Category::Symbol => "symbol",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::FilePath => "File Path",
            Category::ToolName => "Tool Name",
            Category::UserQuote => "User Quote",
            Category::Topic => "Topic",
            Category::TurnCount => "Turn Count",
            Category::Symbol => "Function/Class",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Claim {
    pub category: Category,
    pub text: String,
}

impl Claim {
    pub fn new(category: Category, text: impl Into<String>) -> Self {
        Self {
            category,
            text: text.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.category.severity()
    }
}

/// A single-category, single-pass matcher over summary text.
pub trait Extractor {
    fn category(&self) -> Category;
    fn extract(&self, text: &str) -> Vec<String>;
}

pub fn strip_code_blocks(text: &str) -> String {
    FENCE_RE.replace_all(text, "").into_owned()
}

/// Path-like tokens, drive-letter or POSIX, in order of first appearance.
pub fn find_paths(text: &str) -> Vec<String> {
    let win = WIN_PATH_RE.find_iter(text).map(|m| m.as_str());
    let posix = POSIX_PATH_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()));
    let mut seen = HashSet::new();
    win.chain(posix)
        .map(|p| p.trim_end_matches(['/', '\\', ')', '.', ',', ':', ';']))
        .filter(|p| p.chars().count() > 5)
        .filter(|p| seen.insert(p.to_string()))
        .map(str::to_string)
        .collect()
}

/// Names declared inside fenced code blocks.
pub fn fenced_declarations(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for block in FENCE_RE.captures_iter(text) {
        for decl in DECL_RE.captures_iter(&block[1]) {
            let name = &decl[1];
            if !SKIP_SYMBOLS.contains(&name) && !out.iter().any(|n| n == name) {
                out.push(name.to_string());
            }
        }
    }
    out
}

pub struct FilePaths;

impl Extractor for FilePaths {
    fn category(&self) -> Category {
        Category::FilePath
    }

    fn extract(&self, text: &str) -> Vec<String> {
        let mut paths = find_paths(text);
        paths.sort();
        paths
    }
}

pub struct ToolNames;

impl Extractor for ToolNames {
    fn category(&self) -> Category {
        Category::ToolName
    }

    fn extract(&self, text: &str) -> Vec<String> {
        TOOL_RE
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub struct UserQuotes;

impl UserQuotes {
    fn has_user_cue(prefix: &str) -> bool {
        let lower = prefix.to_lowercase();
        USER_CUES.iter().any(|cue| lower.contains(cue))
    }

    fn looks_like_code(q: &str) -> bool {
        q.starts_with('{') || q.starts_with('[') || q.contains("\\n") || PATHLIKE_RE.is_match(q)
    }
}

impl Extractor for UserQuotes {
    fn category(&self) -> Category {
        Category::UserQuote
    }

    fn extract(&self, text: &str) -> Vec<String> {
        let stripped = strip_code_blocks(text);
        let section = USER_SECTION_RE.find(&stripped).map(|m| {
            let start = m.end();
            let end = NEXT_SECTION_RE
                .find(&stripped[start..])
                .map_or(stripped.len(), |n| start + n.start());
            start..end
        });

        let mut spans: Vec<(usize, &str, bool)> = CURLY_QUOTE_RE
            .captures_iter(&stripped)
            .filter_map(|c| c.get(1))
            .map(|m| (m.start(), m.as_str(), false))
            .collect();
        spans.extend(
            STRAIGHT_QUOTE_RE
                .captures_iter(&stripped)
                .filter_map(|c| c.get(1))
                .map(|m| (m.start(), m.as_str(), true)),
        );
        spans.sort_by_key(|(pos, _, _)| *pos);

        let mut seen = HashSet::new();
        let mut quotes = Vec::new();
        for (pos, quote, straight) in spans {
            if straight && Self::looks_like_code(quote) {
                continue;
            }
            let in_section = section.as_ref().is_some_and(|r| r.contains(&pos));
            if !in_section {
                let line_start = stripped[..pos].rfind('\n').map_or(0, |i| i + 1);
                if !Self::has_user_cue(&stripped[line_start..pos]) {
                    continue;
                }
            }
            let key: String = quote.chars().take(40).collect::<String>().trim().to_lowercase();
            if seen.insert(key) {
                quotes.push(quote.to_string());
            }
        }
        quotes
    }
}

/// Topic terms filtered through the injected semantic map's blacklist.
pub struct Topics<'a> {
    pub map: &'a TopicMap,
}

fn is_formatting_artifact(term: &str) -> bool {
    if term.contains('\n') || term.contains('\r') {
        return true;
    }
    let total = term.chars().count();
    let alnum = term.chars().filter(|c| c.is_alphanumeric()).count();
    if total > 0 && alnum * 2 < total {
        return true;
    }
    term.starts_with([':', '-', '(', ')', '[', ']', '{', '}', '|', '>'])
}

impl Extractor for Topics<'_> {
    fn category(&self) -> Category {
        Category::Topic
    }

    fn extract(&self, text: &str) -> Vec<String> {
        let cleaned = strip_code_blocks(text);
        let is_section = |t: &str| SECTION_HEADERS.contains(&t.to_lowercase().as_str());
        let mut topics = BTreeSet::new();

        for m in BOLD_RE.captures_iter(&cleaned) {
            let term = m[1].trim();
            if SKIP_LABELS.contains(&term.to_uppercase().as_str())
                || self.map.is_blacklisted(term)
                || is_section(term)
                || MESSAGE_N_RE.is_match(term)
                || term.contains('/')
                || term.contains('\\')
                || is_formatting_artifact(term)
            {
                continue;
            }
            if term.chars().count() > 3 {
                topics.insert(term.to_string());
            }
        }

        for m in PHRASE_RE.captures_iter(&cleaned) {
            let phrase = m[1].trim();
            if is_section(phrase)
                || self.map.is_blacklisted(phrase)
                || STRUCTURAL_PHRASE_RE.is_match(phrase)
                || is_formatting_artifact(phrase)
            {
                continue;
            }
            if phrase.chars().count() > 5 {
                topics.insert(phrase.to_string());
            }
        }

        for m in ACRONYM_RE.captures_iter(&cleaned) {
            let acr = &m[1];
            if !SKIP_ACRONYMS.contains(&acr)
                && !SKIP_LABELS.contains(&acr)
                && !self.map.is_blacklisted(acr)
            {
                topics.insert(acr.to_string());
            }
        }

        topics.into_iter().collect()
    }
}

pub struct TurnCounts;

impl Extractor for TurnCounts {
    fn category(&self) -> Category {
        Category::TurnCount
    }

    fn extract(&self, text: &str) -> Vec<String> {
        TURN_COUNT_RE
            .captures_iter(text)
            .map(|c| match c[1].parse::<u32>() {
                Ok(n) => n.to_string(),
                // Too large for any session; kept so it verifies as a mismatch.
                Err(_) => c[1].to_string(),
            })
            .collect()
    }
}

pub struct Symbols;

impl Extractor for Symbols {
    fn category(&self) -> Category {
        Category::Symbol
    }

    fn extract(&self, text: &str) -> Vec<String> {
        let mut names = fenced_declarations(text);
        names.sort();
        names
    }
}

/// All category extractors in report order.
pub struct ClaimExtractor<'a> {
    extractors: Vec<Box<dyn Extractor + 'a>>,
}

impl<'a> ClaimExtractor<'a> {
    pub fn new(map: &'a TopicMap) -> Self {
        Self::with(vec![
            Box::new(FilePaths),
            Box::new(ToolNames),
            Box::new(UserQuotes),
            Box::new(Topics { map }),
            Box::new(TurnCounts),
            Box::new(Symbols),
        ])
    }

    pub fn with(extractors: Vec<Box<dyn Extractor + 'a>>) -> Self {
        Self { extractors }
    }

    pub fn extract(&self, summary: &str) -> Vec<Claim> {
        let mut seen = HashSet::new();
        let mut claims = Vec::new();
        for ex in &self.extractors {
            let category = ex.category();
            for text in ex.extract(summary) {
                if seen.insert((category, text.clone())) {
                    claims.push(Claim::new(category, text));
                }
            }
        }
        claims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn texts(ex: &dyn Extractor, input: &str) -> Vec<String> {
        ex.extract(input)
    }

    #[test]
    fn paths_windows_and_posix() {
        let found = find_paths(r"Edited C:\work\proj\main.py and /src/auth/token.rs, then /tmp.");
        assert_eq!(found, vec![r"C:\work\proj\main.py", "/src/auth/token.rs"]);
    }

    #[test]
    fn urls_are_not_split_into_paths() {
        let found = find_paths("see https://example.com/docs/page.html for details");
        assert!(found.is_empty(), "{found:?}");
    }

    #[test]
    fn tools_are_case_sensitive_whole_words() {
        let t = texts(&ToolNames, "Used Read and Bash; reading is not Readme, grep is lowercase");
        assert_eq!(t, vec!["Bash", "Read"]);
    }

    #[test]
    fn quotes_need_a_user_cue_or_section() {
        let summary = "\
The user said \"please keep the archive format\" earlier.
Config contains \"some_config_value here\" as a default.

7. All User Messages:
- \"stop using the old parser now\"
- \u{201c}make the tests deterministic\u{201d}
8. Pending Tasks
";
        let q = texts(&UserQuotes, summary);
        assert_eq!(
            q,
            vec![
                "please keep the archive format",
                "stop using the old parser now",
                "make the tests deterministic",
            ]
        );
    }

    #[test]
    fn quotes_skip_code_and_paths() {
        let summary = "User asked for \"/src/auth/token.rs\" and \"{\\\"a\\\": 1}\" items\n```\nuser \"inside a fence\"\n```";
        assert!(texts(&UserQuotes, summary).is_empty());
    }

    #[test]
    fn topics_filter_labels_sections_and_blacklist() {
        let map = TopicMap::new(BTreeMap::new(), vec!["WIDGET".to_string()]).unwrap();
        let ex = Topics { map: &map };
        let summary = "\
**Key Technical Concepts**
- **Better Compaction Protocol** for RLM work
- **NOTE** the WIDGET and the JSON output
```
Fenced Phrase Here
```
";
        let t = texts(&ex, summary);
        assert_eq!(t, vec!["Better Compaction Protocol", "RLM"]);
    }

    #[test]
    fn turn_counts_and_symbols() {
        assert_eq!(texts(&TurnCounts, "a 68-turn session, 143 turns total"), vec!["68", "143"]);
        assert_eq!(texts(&TurnCounts, "after 99999999999 turns"), vec!["99999999999"]);
        let summary = "fn outside_fence\n```rust\nfn verify_claim() {}\nstruct Scorecard;\n```";
        assert_eq!(texts(&Symbols, summary), vec!["Scorecard", "verify_claim"]);
    }

    #[test]
    fn duplicates_collapse_within_category() {
        let map = TopicMap::default();
        let claims = ClaimExtractor::new(&map).extract("31 turns, then 31 turns again with Read and Read");
        let turn_claims: Vec<_> = claims
            .iter()
            .filter(|c| c.category == Category::TurnCount)
            .collect();
        assert_eq!(turn_claims.len(), 1);
        assert_eq!(
            claims.iter().filter(|c| c.category == Category::ToolName).count(),
            1
        );
    }

    #[test]
    fn severity_weights_are_fixed() {
        assert_eq!(Category::FilePath.weight(), 4);
        assert_eq!(Category::Symbol.weight(), 4);
        assert_eq!(Category::ToolName.weight(), 3);
        assert_eq!(Category::UserQuote.weight(), 3);
        assert_eq!(Category::Topic.weight(), 2);
        assert_eq!(Category::TurnCount.weight(), 1);
    }
}
