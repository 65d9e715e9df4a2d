use crate::AuditError;
use crate::topics::{TopicMap, parse_tag_keys};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_ARCHIVE_DIR: &str = "context_archive";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    pub archive_dir: Option<PathBuf>,
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default)]
    pub audit: AuditDefaults,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SemanticConfig {
    /// Tag character → topic name.
    #[serde(default)]
    pub mappings: BTreeMap<String, String>,
    /// Words never reported as topic claims.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// A `semantic_map.json` whose entries are merged under `mappings`.
    pub map_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AuditDefaults {
    /// Search full turn bodies for claims missing from the header.
    #[serde(default)]
    pub deep: bool,
}

/// The JSON form written by the semantic map editor.
#[derive(Debug, Deserialize, Default)]
struct MapFile {
    #[serde(default)]
    mappings: BTreeMap<String, String>,
    #[serde(default)]
    blacklist: Vec<String>,
}

/// Load config from `explicit`, COMPAUDIT_CONFIG, ~/.compaudit/config.toml,
/// or defaults. An explicitly named file must exist.
pub fn load_config(explicit: Option<&Path>) -> Result<AuditConfig, AuditError> {
    if let Some(p) = explicit {
        if !p.exists() {
            return Err(AuditError::Config(format!("{}: no such file", p.display())));
        }
        return read_config(p);
    }
    match config_path() {
        Some(p) if p.exists() => read_config(&p),
        _ => Ok(AuditConfig::default()),
    }
}

fn read_config(path: &Path) -> Result<AuditConfig, AuditError> {
    let content = std::fs::read_to_string(path)?;
    let config: AuditConfig = toml::from_str(&content)
        .map_err(|e| AuditError::Config(format!("{}: {e}", path.display())))?;
    validate_config(&config)?;
    log::debug!("loaded config from {}", path.display());
    Ok(config)
}

fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("COMPAUDIT_CONFIG") {
        return Some(PathBuf::from(p));
    }
    let home = std::env::var("HOME").ok()?;
    Some(Path::new(&home).join(".compaudit").join("config.toml"))
}

fn validate_config(config: &AuditConfig) -> Result<(), AuditError> {
    parse_tag_keys(config.semantic.mappings.clone())?;
    for (key, topic) in &config.semantic.mappings {
        if topic.trim().is_empty() {
            return Err(AuditError::Config(format!(
                "semantic.mappings[{key:?}] is empty"
            )));
        }
    }
    if let Some(dir) = &config.archive_dir
        && dir.as_os_str().is_empty()
    {
        return Err(AuditError::Config("archive_dir is empty".into()));
    }
    Ok(())
}

impl AuditConfig {
    /// Semantic map from the map file (if any) overlaid with the inline
    /// `[semantic]` entries.
    pub fn topic_map(&self) -> Result<TopicMap, AuditError> {
        let mut mappings = BTreeMap::new();
        let mut blacklist = Vec::new();

        if let Some(path) = &self.semantic.map_file {
            let content = std::fs::read_to_string(path).map_err(|e| {
                AuditError::Config(format!("semantic map {}: {e}", path.display()))
            })?;
            let file: MapFile = serde_json::from_str(&content).map_err(|e| {
                AuditError::Config(format!("semantic map {}: {e}", path.display()))
            })?;
            mappings.extend(file.mappings);
            blacklist.extend(file.blacklist);
        }
        mappings.extend(self.semantic.mappings.clone());
        blacklist.extend(self.semantic.blacklist.iter().cloned());

        TopicMap::new(parse_tag_keys(mappings)?, blacklist)
    }

    /// CLI flag (already merged with COMPAUDIT_ARCHIVE by clap), then the
    /// config file, then `./context_archive`.
    pub fn archive_dir(&self, cli: Option<&Path>) -> PathBuf {
        cli.map(Path::to_path_buf)
            .or_else(|| self.archive_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARCHIVE_DIR))
    }
}
