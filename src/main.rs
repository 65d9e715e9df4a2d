use clap::Parser;
use compaudit::AuditError;
use compaudit::archive::{ArchiveStore, EnrichOutcome, IngestOptions};
use compaudit::audit::{
    AuditRequest, SummarySource, bundle_schema, category_summary, format_text, ground_truth,
    run_audit,
};
use compaudit::cli::{
    ArchiveArgs, AuditArgs, Cli, Command, HistoryArgs, OutputFormat, RerunArgs,
};
use compaudit::config::{AuditConfig, load_config};
use compaudit::history::History;
use compaudit::hook::handle_hook;
use compaudit::project::{default_projects_root, find_project_dir, list_transcripts};
use compaudit::render::Format;
use compaudit::rerun::{RerunOptions, rerun};
use compaudit::score::pct;
use std::path::PathBuf;
use std::process::ExitCode;

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("COMPAUDIT_LOG", "info"))
        .format_timestamp(None)
        .init();
}

fn handle_archive(store: &ArchiveStore, args: ArchiveArgs) -> Result<(), AuditError> {
    let paths: Vec<PathBuf> = if !args.transcripts.is_empty() {
        args.transcripts
    } else if let Some(project) = &args.project_path {
        let root = default_projects_root()
            .ok_or_else(|| AuditError::Config("cannot locate home directory".into()))?;
        list_transcripts(&find_project_dir(&root, project)?)?
    } else {
        return Err(AuditError::Input(
            "give transcript files or --project-path".into(),
        ));
    };

    let report = store.ingest(
        &paths,
        &IngestOptions {
            project: None,
            session: args.session,
        },
    )?;
    println!(
        "{} files: {} turns archived, {} already present, {} compactions, {} lines skipped",
        report.files,
        report.turns_added,
        report.turns_skipped,
        report.compactions,
        report.lines_skipped
    );
    for (session, split) in &report.touched {
        if let Some(info) = store.session(session, *split)? {
            println!(
                "  {session}/{split}: v{} {} turns",
                info.active_version, info.turn_count
            );
        }
    }
    for a in &report.anomalies {
        println!("  warning: {a}");
    }
    Ok(())
}

fn handle_audit(store: &ArchiveStore, config: &AuditConfig, args: AuditArgs) -> Result<(), AuditError> {
    let source = match (args.summary, args.transcript) {
        (Some(path), _) => SummarySource::File(path),
        (None, Some(path)) => SummarySource::Transcript {
            path,
            which: args.which,
        },
        (None, None) => return Err(AuditError::Input("no summary source".into())),
    };
    let report = run_audit(
        store,
        &AuditRequest {
            source,
            session: args.session,
            split: args.split,
            deep: args.deep || config.audit.deep,
            record: !args.no_record,
        },
    )?;
    match args.format {
        OutputFormat::Text => print!("{}", format_text(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report.bundle)?),
    }
    Ok(())
}

fn handle_rerun(store: &ArchiveStore, args: RerunArgs) -> Result<(), AuditError> {
    let batch = rerun(
        store,
        &RerunOptions {
            runs: args.runs,
            dry_run: args.dry_run,
            save: args.save,
        },
    )?;
    match args.format {
        OutputFormat::Text => print!("{}", compaudit::rerun::format_text(&batch)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&batch)?),
    }
    Ok(())
}

fn handle_history(store: &ArchiveStore, args: HistoryArgs) -> Result<(), AuditError> {
    let history = History::new(store.conn(), store.dir());
    let entries = history.select(args.session.as_deref())?;
    if args.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("no audits recorded");
        return Ok(());
    }
    for e in &entries {
        let target = match &e.input {
            Some(i) => format!("{}/{} v{}", i.session_id, i.split, i.version),
            None => e.lineage.clone().unwrap_or_else(|| "-".into()),
        };
        let mut flags = Vec::new();
        if e.baseline {
            flags.push("baseline".to_string());
        }
        if let Some(r) = &e.regression {
            flags.push(format!("REGRESSION {:+.1}pp", r.delta_pp));
        }
        if !e.anomalies.is_empty() {
            flags.push(format!("{} warnings", e.anomalies.len()));
        }
        println!(
            "{:>4}  {}  {:<24}  {:>6}  {:>6}  {}  {}",
            e.run,
            e.timestamp,
            target,
            pct(e.score.raw_rate),
            pct(e.score.weighted_rate),
            category_summary(&e.score),
            flags.join(" ")
        );
    }
    let trend: Vec<String> = history
        .trend(args.session.as_deref())?
        .iter()
        .map(|r| pct(*r))
        .collect();
    println!("trend: {}", trend.join(" → "));
    Ok(())
}

fn run() -> Result<(), AuditError> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let archive_dir = config.archive_dir(cli.archive.as_deref());
    let tags = config.topic_map()?;

    match cli.command {
        Command::Archive(args) => {
            let mut store = ArchiveStore::open(&archive_dir, tags)?;
            if args.plain {
                store = store.with_format(Format::Plain);
            }
            handle_archive(&store, args)
        }
        Command::Enrich(args) => {
            let store = ArchiveStore::open_existing(&archive_dir, tags)?;
            for (session, split, outcome) in store.enrich_all(args.session.as_deref())? {
                match outcome {
                    EnrichOutcome::Unchanged { version } => {
                        println!("{session}/{split}: unchanged (v{version})")
                    }
                    EnrichOutcome::Created { version } => {
                        println!("{session}/{split}: created v{version}")
                    }
                }
            }
            Ok(())
        }
        Command::Audit(args) => {
            let store = ArchiveStore::open_existing(&archive_dir, tags)?;
            handle_audit(&store, &config, args)
        }
        Command::Rerun(args) => handle_rerun(&ArchiveStore::open_existing(&archive_dir, tags)?, args),
        Command::History(args) => {
            handle_history(&ArchiveStore::open_existing(&archive_dir, tags)?, args)
        }
        Command::ImportHistory(args) => {
            let store = ArchiveStore::open(&archive_dir, tags)?;
            let report = History::new(store.conn(), store.dir()).import_legacy(&args.file)?;
            println!(
                "imported {} baseline entries ({} skipped)",
                report.imported, report.skipped
            );
            Ok(())
        }
        Command::GroundTruth(args) => {
            let store = ArchiveStore::open_existing(&archive_dir, tags)?;
            print!("{}", ground_truth(&store, args.session.as_deref(), args.split)?.block());
            Ok(())
        }
        Command::Hook(args) => {
            let store = ArchiveStore::open(&archive_dir, tags)?;
            let out = handle_hook(&store, args.phase, std::io::stdin().lock(), config.audit.deep)?;
            print!("{out}");
            Ok(())
        }
        Command::Schema => {
            println!("{}", bundle_schema()?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    init_logging();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("compaudit: {e}");
            ExitCode::from(1)
        }
    }
}
