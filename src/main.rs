use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};

use rating_engine::{Actor, LocalFileStore, RatingEngine, Role, SubjectType, VERSION};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("init") => run_init(),
        Some("import") => run_import(args.get(2)),
        Some("trail") => run_trail(args.get(2), args.get(3)),
        Some("export") => run_export(),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("rating-engine {VERSION}");
    println!();
    println!("Usage:");
    println!("  rating-engine init                    Create the database");
    println!("  rating-engine import <file.csv>       Import a batch of rating rows");
    println!("  rating-engine trail <subject> <id>    Show the audit trail of a record");
    println!("  rating-engine export                  Dump all ratings as JSON");
    println!();
    println!("The database path is taken from RATING_ENGINE_DB (default ./ratings.db).");
}

fn db_path() -> PathBuf {
    env::var("RATING_ENGINE_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ratings.db"))
}

// The CLI runs as the local operator with full privileges; role separation
// applies to embedding applications with real identities.
fn operator() -> Actor {
    Actor::new(0, [Role::Admin])
}

fn run_init() -> Result<()> {
    let path = db_path();
    RatingEngine::open(&path).context("database initialization failed")?;
    println!("✓ Database initialized at {}", path.display());
    Ok(())
}

fn run_import(file: Option<&String>) -> Result<()> {
    let Some(file) = file else {
        bail!("usage: rating-engine import <file.csv>");
    };
    let path = Path::new(file);
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("invalid file name")?;

    let mut engine = RatingEngine::open(&db_path())?.with_files(LocalFileStore::new(dir));
    let result = engine.submit_batch(&operator(), name)?;

    println!("✓ Batch {} completed", result.batch_id);
    println!("  rows:      {}", result.total);
    println!("  imported:  {}", result.succeeded);
    println!("  failed:    {}", result.failed);

    if result.failed > 0 {
        let (_, rows) = engine.batch_detail(&operator(), result.batch_id)?;
        println!("\nFailed rows:");
        for row in rows.iter().filter(|r| r.rating_id.is_none()) {
            println!(
                "  row {}: {}",
                row.row_number,
                row.detail.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}

fn run_trail(subject: Option<&String>, id: Option<&String>) -> Result<()> {
    let (Some(subject), Some(id)) = (subject, id) else {
        bail!("usage: rating-engine trail <rating|batch|party|instrument> <id>");
    };
    let subject_type =
        SubjectType::parse(subject).with_context(|| format!("unknown subject '{subject}'"))?;
    let subject_id: i64 = id.parse().context("id must be an integer")?;

    let engine = RatingEngine::open(&db_path())?;
    let entries = engine.audit_trail(&operator(), subject_type, subject_id)?;
    if entries.is_empty() {
        println!("No audit entries for {subject} {subject_id}");
        return Ok(());
    }
    for entry in entries {
        let actor = entry
            .actor_id
            .map(|id| format!("actor {id}"))
            .unwrap_or_else(|| "system".to_string());
        println!(
            "{}  {:<8} {}  {}",
            entry.created_at.to_rfc3339(),
            entry.action.as_str(),
            actor,
            entry.detail.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn run_export() -> Result<()> {
    let mut engine = RatingEngine::open(&db_path())?;
    let ratings = engine.export_ratings(&operator())?;
    println!("{}", serde_json::to_string_pretty(&ratings)?);
    Ok(())
}
