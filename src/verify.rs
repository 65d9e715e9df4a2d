//! Claim verification against an archive record.
//!
//! Header fields are the primary source. Full turn bodies are searched only
//! when the verifier is built with `deep`, and a hit there is reported as
//! [`Tier::FoundDeep`].

use crate::archive::Record;
use crate::extract::{Category, Claim};
use crate::render::normalize_ws;
use crate::transcript::Role;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

const QUOTE_PREFIX: usize = 40;
const MIN_FILE_NAME: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Found,
    FoundDeep,
    Missing,
    Mismatch,
}

impl Tier {
    pub fn is_found(self) -> bool {
        matches!(self, Tier::Found | Tier::FoundDeep)
    }

    /// Ordering used when comparing reruns: higher is better.
    pub fn rank(self) -> u8 {
        match self {
            Tier::Found => 3,
            Tier::FoundDeep => 2,
            Tier::Mismatch => 1,
            Tier::Missing => 0,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Found => "FOUND",
            Tier::FoundDeep => "FOUND_DEEP",
            Tier::Missing => "MISSING",
            Tier::Mismatch => "MISMATCH",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Verification {
    pub claim: Claim,
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Verification {
    fn new(claim: &Claim, tier: Tier) -> Self {
        Self {
            claim: claim.clone(),
            tier,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Whole-word containment. Falls back to plain substring search when the
/// needle starts or ends with a non-word character.
fn contains_word(haystack: &str, needle: &str, ignore_case: bool) -> bool {
    if needle.is_empty() {
        return false;
    }
    let wordy = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_');
    if !wordy(needle.chars().next()) || !wordy(needle.chars().last()) {
        return if ignore_case {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        } else {
            haystack.contains(needle)
        };
    }
    let flags = if ignore_case { "(?i)" } else { "" };
    Regex::new(&format!(r"{flags}\b{}\b", regex::escape(needle)))
        .map(|re| re.is_match(haystack))
        .unwrap_or(false)
}

fn normalize_path(p: &str) -> String {
    p.replace('\\', "/").to_lowercase()
}

/// Number of trailing path segments two normalised paths share.
fn shared_suffix(a: &str, b: &str) -> usize {
    a.rsplit('/')
        .zip(b.rsplit('/'))
        .take_while(|(x, y)| !x.is_empty() && x == y)
        .count()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Verifier {
    pub deep: bool,
}

impl Verifier {
    pub fn new(deep: bool) -> Self {
        Self { deep }
    }

    pub fn verify_all(&self, claims: &[Claim], record: &Record) -> Vec<Verification> {
        claims.iter().map(|c| self.verify(c, record)).collect()
    }

    pub fn verify(&self, claim: &Claim, record: &Record) -> Verification {
        match claim.category {
            Category::FilePath => self.verify_path(claim, record),
            Category::ToolName => {
                if record.header.tools_used.iter().any(|t| t == &claim.text) {
                    Verification::new(claim, Tier::Found)
                } else if self.deep
                    && record
                        .turns
                        .iter()
                        .any(|t| t.tool_uses.iter().any(|u| u.name == claim.text))
                {
                    Verification::new(claim, Tier::FoundDeep)
                } else {
                    Verification::new(claim, Tier::Missing)
                }
            }
            Category::Symbol => {
                if record.header.symbols.iter().any(|s| s == &claim.text) {
                    Verification::new(claim, Tier::Found)
                } else {
                    self.deep_or_missing(claim, record, |body| contains_word(body, &claim.text, false))
                }
            }
            Category::UserQuote => self.verify_quote(claim, record),
            Category::Topic => self.verify_topic(claim, record),
            Category::TurnCount => {
                let actual = record.turns.len();
                match claim.text.parse::<usize>() {
                    Ok(n) if n == actual => Verification::new(claim, Tier::Found),
                    _ => Verification::new(claim, Tier::Mismatch)
                        .with_detail(format!("archive: {actual} turns")),
                }
            }
        }
    }

    fn deep_or_missing<F>(&self, claim: &Claim, record: &Record, hit: F) -> Verification
    where
        F: Fn(&str) -> bool,
    {
        if self.deep {
            if let Some(t) = record.turns.iter().find(|t| hit(&t.body())) {
                return Verification::new(claim, Tier::FoundDeep).with_detail(format!("turn {}", t.seq));
            }
        }
        Verification::new(claim, Tier::Missing)
    }

    fn verify_path(&self, claim: &Claim, record: &Record) -> Verification {
        let wanted = normalize_path(&claim.text);
        let files: Vec<String> = record
            .header
            .files_referenced
            .iter()
            .map(|f| normalize_path(f))
            .collect();

        if files.iter().any(|f| f == &wanted) {
            return Verification::new(claim, Tier::Found);
        }

        let name_len = wanted.rsplit('/').next().map_or(0, |n| n.chars().count());
        if name_len >= MIN_FILE_NAME {
            let mut best = 0;
            let mut matches: Vec<&str> = Vec::new();
            for (norm, orig) in files.iter().zip(&record.header.files_referenced) {
                let n = shared_suffix(&wanted, norm);
                if n == 0 || n < best {
                    continue;
                }
                if n > best {
                    best = n;
                    matches.clear();
                }
                if !matches.contains(&orig.as_str()) {
                    matches.push(orig);
                }
            }
            match matches.as_slice() {
                [] => {}
                [one] => {
                    return Verification::new(claim, Tier::Found).with_detail(format!("matched {one}"));
                }
                many => {
                    return Verification::new(claim, Tier::Mismatch)
                        .with_detail(format!("ambiguous: {}", many.join(", ")));
                }
            }
        }

        self.deep_or_missing(claim, record, |body| normalize_path(body).contains(&wanted))
    }

    fn verify_quote(&self, claim: &Claim, record: &Record) -> Verification {
        let quote = normalize_ws(&claim.text);
        let prefix: String = quote.chars().take(QUOTE_PREFIX).collect();
        let hit = |text: &str| text.contains(&quote) || text.contains(&prefix);

        if record
            .header
            .user_excerpts
            .iter()
            .any(|e| hit(&normalize_ws(e)))
        {
            return Verification::new(claim, Tier::Found);
        }
        if self.deep {
            if let Some(t) = record
                .turns
                .iter()
                .filter(|t| t.role == Role::User)
                .find(|t| hit(&normalize_ws(&t.text)))
            {
                return Verification::new(claim, Tier::FoundDeep).with_detail(format!("turn {}", t.seq));
            }
        }
        Verification::new(claim, Tier::Missing)
    }

    fn verify_topic(&self, claim: &Claim, record: &Record) -> Verification {
        let wanted = claim.text.trim();
        let known = record
            .header
            .topics
            .iter()
            .map(String::as_str)
            .chain(record.header.semantic_tags.iter().map(|t| t.topic.as_str()));
        for topic in known {
            if topic.eq_ignore_ascii_case(wanted)
                || contains_word(topic, wanted, true)
                || contains_word(wanted, topic, true)
            {
                return Verification::new(claim, Tier::Found).with_detail(format!("topic {topic}"));
            }
        }
        self.deep_or_missing(claim, record, |body| contains_word(body, wanted, true))
    }
}
