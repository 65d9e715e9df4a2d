//! Project naming and Claude Code project-directory lookup.

use crate::AuditError;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory names that group projects rather than name them.
const CONTAINER_DIRS: &[&str] = &["workspace", "workspaces", "dev", "src", "code", "repos", "projects"];

fn home_dir() -> Option<String> {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()
        .filter(|h| !h.is_empty())
        .map(|h| h.replace('\\', "/").trim_end_matches('/').to_string())
}

/// Project label for a working directory. Under the home directory this is
/// the first component that is not a container directory; elsewhere it is
/// the last component.
pub fn derive_project(cwd: &str) -> String {
    let cwd = cwd.replace('\\', "/");
    let cwd = cwd.trim_end_matches('/');
    if cwd.is_empty() {
        return "unknown".into();
    }

    let last = || {
        cwd.rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("unknown")
            .to_string()
    };

    let Some(home) = home_dir() else {
        return last();
    };
    let rel = match cwd.strip_prefix(&home) {
        Some("") => return "home".into(),
        Some(rest) if rest.starts_with('/') => rest,
        _ => return last(),
    };

    let parts: Vec<&str> = rel.split('/').filter(|p| !p.is_empty()).collect();
    parts
        .iter()
        .find(|p| !CONTAINER_DIRS.contains(p))
        .or(parts.last())
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Claude Code's directory name for a project path: separators and
/// underscores become `-`, a drive letter `F:` becomes `f-`.
pub fn encode_project_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    let mut s = normalized.trim_end_matches('/').to_string();
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        s = format!("{drive}-{}", &s[2..]);
    }
    s.replace(['/', '_'], "-")
}

/// The transcripts directory for `project_path` under `projects_root`
/// (normally `~/.claude/projects`): the exactly-encoded name, else the
/// single directory containing it.
pub fn find_project_dir(projects_root: &Path, project_path: &str) -> Result<PathBuf, AuditError> {
    let encoded = encode_project_path(project_path);
    let exact = projects_root.join(&encoded);
    if exact.is_dir() {
        return Ok(exact);
    }

    let entries = fs::read_dir(projects_root).map_err(|e| {
        AuditError::Input(format!(
            "cannot read projects directory {}: {e}",
            projects_root.display()
        ))
    })?;
    let mut available = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            available.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    available.sort();

    let needle = encoded.to_lowercase();
    let partial: Vec<&String> = available
        .iter()
        .filter(|name| name.to_lowercase().contains(&needle))
        .collect();
    if let [only] = partial.as_slice() {
        return Ok(projects_root.join(only));
    }

    Err(AuditError::Input(format!(
        "no project directory for {project_path} (looked for {encoded}); available: {}",
        if available.is_empty() {
            "none".to_string()
        } else {
            available.join(", ")
        }
    )))
}

/// `~/.claude/projects`.
pub fn default_projects_root() -> Option<PathBuf> {
    home_dir().map(|h| PathBuf::from(h).join(".claude").join("projects"))
}

/// Transcript files (`*.jsonl`) directly inside a project directory, oldest
/// first by modification time.
pub fn list_transcripts(dir: &Path) -> Result<Vec<PathBuf>, AuditError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "jsonl") {
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
            found.push((modified, path));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, p)| p).collect())
}
