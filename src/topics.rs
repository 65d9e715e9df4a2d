//! Topic derivation: the injected semantic map (single character → topic
//! name) and the heuristics that pull topics and a one-line summary out of
//! user text.

use crate::AuditError;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

/// Characters that may not serve as semantic tags (filename-hostile or the
/// separator used in published names).
const EXCLUDED_TAG_CHARS: &str = "\\/:\"*?<>|~{}";

const STOP_WORDS: &[&str] = &[
    "the", "and", "but", "for", "with", "from", "was", "are", "were", "been", "being", "have",
    "has", "had", "does", "did", "will", "would", "could", "should", "may", "might", "shall",
    "can", "need", "that", "this", "these", "those", "you", "she", "they", "him", "her", "them",
    "your", "his", "its", "our", "their", "what", "which", "who", "whom", "when", "where", "why",
    "how", "all", "each", "every", "both", "few", "more", "most", "other", "some", "such", "not",
    "only", "own", "same", "than", "too", "very", "just", "because", "then", "else", "also",
    "about", "out", "into", "over", "after", "before", "between", "under", "again", "further",
    "once", "here", "there", "any", "much", "many", "well", "back", "even", "still", "already",
    "now", "let", "make", "like", "think", "want", "get", "see", "know", "take", "come", "look",
    "use", "find", "give", "tell", "say", "try", "ask", "work", "call", "keep", "put", "run",
    "move", "going", "really", "thing", "things", "something", "anything", "nothing", "way",
    "one", "two", "first", "new", "good", "long", "great", "little", "right", "old", "big",
    "high", "different", "small", "large", "next", "don", "doesn", "didn", "won", "wouldn",
    "couldn", "shouldn", "isn", "aren", "wasn", "weren", "hasn", "haven", "hadn", "yes", "okay",
    "yeah", "hey", "hello", "sure", "got", "done", "using", "used", "please", "can't", "it's",
];

static PHRASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)\b").unwrap());
static ACRONYM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([A-Z]{2,})\b").unwrap());
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b([a-zA-Z]{3,})\b").unwrap());

/// Semantic map shared by tag derivation and topic-claim filtering.
/// Built once from configuration and passed to whoever needs it.
#[derive(Debug, Clone, Default)]
pub struct TopicMap {
    mappings: BTreeMap<char, String>,
    blacklist: BTreeSet<String>,
    matchers: Vec<(char, Regex)>,
}

impl TopicMap {
    pub fn new<I>(mappings: BTreeMap<char, String>, blacklist: I) -> Result<Self, AuditError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut matchers = Vec::with_capacity(mappings.len());
        for (&c, topic) in &mappings {
            if c.is_whitespace() || EXCLUDED_TAG_CHARS.contains(c) {
                return Err(AuditError::Config(format!(
                    "semantic tag {c:?} is not allowed"
                )));
            }
            let topic = topic.trim();
            if topic.is_empty() {
                return Err(AuditError::Config(format!(
                    "semantic tag {c:?} maps to an empty topic"
                )));
            }
            let pattern = format!(r"(?i)\b{}\b", regex::escape(topic));
            let re = Regex::new(&pattern)
                .map_err(|e| AuditError::Config(format!("semantic tag {c:?}: {e}")))?;
            matchers.push((c, re));
        }
        Ok(Self {
            mappings,
            blacklist: blacklist
                .into_iter()
                .map(|w| w.trim().to_uppercase())
                .filter(|w| !w.is_empty())
                .collect(),
            matchers,
        })
    }

    pub fn mappings(&self) -> &BTreeMap<char, String> {
        &self.mappings
    }

    pub fn topic_for(&self, tag: char) -> Option<&str> {
        self.mappings.get(&tag).map(String::as_str)
    }

    /// Case-insensitive blacklist check.
    pub fn is_blacklisted(&self, word: &str) -> bool {
        self.blacklist.contains(&word.trim().to_uppercase())
    }

    /// Tag characters whose topic appears in `text` as a whole word,
    /// in codepoint order.
    pub fn scan(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }
        self.matchers
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(c, _)| *c)
            .collect::<BTreeSet<char>>()
            .into_iter()
            .collect()
    }

    /// Mappings only, as stored with a record version.
    pub fn to_json(&self) -> String {
        let map: BTreeMap<String, &String> = self
            .mappings
            .iter()
            .map(|(c, t)| (c.to_string(), t))
            .collect();
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".into())
    }

    pub fn from_json(json: &str) -> Result<Self, AuditError> {
        let raw: BTreeMap<String, String> = serde_json::from_str(json)?;
        Self::new(parse_tag_keys(raw)?, Vec::new())
    }
}

/// Turn string keys (as found in JSON/TOML) into tag characters.
pub fn parse_tag_keys(raw: BTreeMap<String, String>) -> Result<BTreeMap<char, String>, AuditError> {
    let mut out = BTreeMap::new();
    for (key, topic) in raw {
        let mut chars = key.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => {
                out.insert(c, topic);
            }
            _ => {
                return Err(AuditError::Config(format!(
                    "semantic map key {key:?} must be a single character"
                )));
            }
        }
    }
    Ok(out)
}

/// Heuristic topic keywords from user text, highest score first.
pub fn extract_topics<'a, I>(user_texts: I, max_topics: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let text = user_texts.into_iter().collect::<Vec<_>>().join(" ");
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut scores: HashMap<String, u32> = HashMap::new();

    for m in PHRASE_RE.captures_iter(&text) {
        let phrase = m[1].trim();
        if phrase.len() > 3 {
            *scores.entry(phrase.to_string()).or_default() += 5;
        }
    }

    for m in ACRONYM_RE.captures_iter(&text) {
        let acr = &m[1];
        if !matches!(acr, "OK" | "ID" | "VS" | "IE" | "EG") {
            *scores.entry(acr.to_string()).or_default() += 3;
        }
    }

    let lower = text.to_lowercase();
    let mut freq: HashMap<&str, u32> = HashMap::new();
    for m in WORD_RE.captures_iter(&lower) {
        let w = m.get(1).map_or("", |g| g.as_str());
        if !STOP_WORDS.contains(&w) {
            *freq.entry(w).or_default() += 1;
        }
    }
    for (word, count) in freq {
        if count >= 2 {
            *scores.entry(word.to_string()).or_default() += count;
        }
    }

    let mut ranked: Vec<(String, u32)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(max_topics).map(|(t, _)| t).collect()
}

/// One-line summary: first sentence of the first substantive user message.
pub fn summary_line<'a, I>(user_texts: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    for text in user_texts {
        let joined = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("<ide_"))
            .collect::<Vec<_>>()
            .join(" ");
        if joined.chars().count() < 15 {
            continue;
        }
        for (i, (byte, ch)) in joined.char_indices().enumerate() {
            if matches!(ch, '.' | '!' | '?') && i > 15 {
                return Some(joined[..byte + ch.len_utf8()].trim().to_string());
            }
        }
        if joined.chars().count() > 120 {
            let head: String = joined.chars().take(120).collect();
            return Some(format!("{}...", head.trim()));
        }
        return Some(joined);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(char, &str)]) -> TopicMap {
        let m = pairs.iter().map(|(c, t)| (*c, t.to_string())).collect();
        TopicMap::new(m, vec!["Foo".to_string()]).unwrap()
    }

    #[test]
    fn scan_uses_word_boundaries() {
        let m = map(&[('Σ', "IDE"), ('μ', "MIT")]);
        assert_eq!(m.scan("please provide a commit"), "");
        assert_eq!(m.scan("the IDE crashed, see MIT paper"), "Σμ");
    }

    #[test]
    fn scan_orders_by_codepoint() {
        let m = map(&[('ω', "rust"), ('α', "sqlite")]);
        assert_eq!(m.scan("Rust and SQLite"), "αω");
    }

    #[test]
    fn rejects_bad_tag_chars() {
        let mut m = BTreeMap::new();
        m.insert('/', "paths".to_string());
        assert!(TopicMap::new(m, Vec::new()).is_err());
        let raw = BTreeMap::from([("ab".to_string(), "x".to_string())]);
        assert!(parse_tag_keys(raw).is_err());
    }

    #[test]
    fn blacklist_is_case_insensitive() {
        let m = map(&[]);
        assert!(m.is_blacklisted("FOO"));
        assert!(m.is_blacklisted("foo"));
        assert!(!m.is_blacklisted("bar"));
    }

    #[test]
    fn json_round_trip_keeps_mappings() {
        let m = map(&[('Σ', "rust")]);
        let back = TopicMap::from_json(&m.to_json()).unwrap();
        assert_eq!(back.topic_for('Σ'), Some("rust"));
    }

    #[test]
    fn topics_prefer_phrases_and_acronyms() {
        let topics = extract_topics(
            [
                "Let's design the Better Compaction Protocol with RLM ideas",
                "the archive archive needs work",
            ],
            10,
        );
        assert_eq!(topics[0], "Better Compaction Protocol");
        assert!(topics.contains(&"RLM".to_string()));
        assert!(topics.contains(&"archive".to_string()));
    }

    #[test]
    fn summary_skips_short_messages() {
        let s = summary_line(["hi", "Please fix the parser bug. Then add tests."]).unwrap();
        assert_eq!(s, "Please fix the parser bug.");
        assert_eq!(summary_line(["ok"]), None);
    }
}
