//! Published view of the archive: one markdown file per record version plus
//! `index.md`. Every file goes through temp+rename so readers never see a
//! partial write.

use crate::AuditError;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

pub const INDEX_FILE: &str = "index.md";

/// Write `content` to `path` atomically (same-directory temp file, fsync, rename).
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), AuditError> {
    let dir = path
        .parent()
        .ok_or_else(|| AuditError::Input(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.tmp-{}", std::process::id()));

    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub file: String,
    pub session_id: String,
    pub split: u32,
    pub version: u32,
    pub date: String,
    pub turns: u32,
    pub tags: String,
    pub summary: String,
}

fn cell(s: &str) -> String {
    s.replace('|', "\\|").replace('\n', " ")
}

pub fn render_index(entries: &[IndexEntry]) -> String {
    let mut out = String::from("# Context Archive Index\n\n");
    out.push_str("| Session | Split | Version | Date | Turns | Tags | Summary |\n");
    out.push_str("|---|---|---|---|---|---|---|\n");
    for e in entries {
        let short: String = e.session_id.chars().take(8).collect();
        out.push_str(&format!(
            "| [{short}]({}) | {} | v{} | {} | {} | {} | {} |\n",
            e.file,
            e.split,
            e.version,
            e.date,
            e.turns,
            cell(&e.tags),
            cell(&e.summary),
        ));
    }
    out
}

pub fn write_index(archive_dir: &Path, entries: &[IndexEntry]) -> Result<(), AuditError> {
    write_atomic(
        &archive_dir.join(INDEX_FILE),
        render_index(entries).as_bytes(),
    )
}
