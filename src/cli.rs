use crate::audit::Which;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "compaudit",
    version,
    about = "Archive Claude Code transcripts and audit compaction summaries against them"
)]
pub struct Cli {
    /// Archive directory (default: ./context_archive)
    #[arg(long, env = "COMPAUDIT_ARCHIVE", global = true)]
    pub archive: Option<PathBuf>,

    /// Config file (default: ~/.compaudit/config.toml)
    #[arg(long, env = "COMPAUDIT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Archive transcripts into versioned session records
    Archive(ArchiveArgs),
    /// Re-render records with the current semantic map
    Enrich(EnrichArgs),
    /// Audit a compaction summary against the archive
    Audit(AuditArgs),
    /// Replay recorded audits and check they reproduce
    Rerun(RerunArgs),
    /// Show audit history and trend
    History(HistoryArgs),
    /// Import a legacy audit_history.jsonl as baseline entries
    ImportHistory(ImportArgs),
    /// Print the ground-truth block for an archived session
    GroundTruth(GroundTruthArgs),
    /// Compaction hook entry point (payload on stdin)
    Hook(HookArgs),
    /// Print the JSON Schema of the report bundle
    Schema,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
pub struct ArchiveArgs {
    /// Transcript files (.jsonl); defaults to every transcript of --project-path
    pub transcripts: Vec<PathBuf>,

    /// Project path whose ~/.claude/projects directory holds the transcripts
    #[arg(long)]
    pub project_path: Option<String>,

    /// Only archive this session
    #[arg(long)]
    pub session: Option<String>,

    /// Create new records in the plain header-only layout
    #[arg(long)]
    pub plain: bool,
}

#[derive(Parser)]
pub struct EnrichArgs {
    /// Only enrich this session
    #[arg(long)]
    pub session: Option<String>,
}

#[derive(Parser)]
pub struct AuditArgs {
    /// Transcript containing the compaction summary
    #[arg(required_unless_present = "summary", conflicts_with = "summary")]
    pub transcript: Option<PathBuf>,

    /// Read the summary from a file instead of a transcript
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Which compaction: first, last, or a 0-based index
    #[arg(long, default_value = "last")]
    pub which: Which,

    /// Session to audit against
    #[arg(long)]
    pub session: Option<String>,

    /// Split to audit against (default: the split the summary replaced)
    #[arg(long)]
    pub split: Option<u32>,

    /// Search full turn bodies for claims missing from the header
    #[arg(long)]
    pub deep: bool,

    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Do not append to the history or write a report bundle
    #[arg(long)]
    pub no_record: bool,
}

#[derive(Parser)]
pub struct RerunArgs {
    /// Only replay these runs
    #[arg(long = "run")]
    pub runs: Vec<i64>,

    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Store the results in the archive database
    #[arg(long)]
    pub save: bool,

    /// List what would be replayed
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Parser)]
pub struct HistoryArgs {
    /// Only this session's lineage
    #[arg(long)]
    pub session: Option<String>,

    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Parser)]
pub struct ImportArgs {
    /// Legacy JSONL history file
    pub file: PathBuf,
}

#[derive(Parser)]
pub struct GroundTruthArgs {
    #[arg(long)]
    pub session: Option<String>,

    #[arg(long)]
    pub split: Option<u32>,
}

#[derive(Parser)]
pub struct HookArgs {
    #[arg(value_enum)]
    pub phase: HookPhase,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HookPhase {
    /// Before compaction: archive and print ground truth
    Pre,
    /// After compaction: archive, audit the new summary, print the beacon
    Post,
}
