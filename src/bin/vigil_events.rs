//! vigil_events - list stored event records as JSON

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;

use vigil::recorder::writer::sha256_file;
use vigil::{EventRecord, EventStore, SqliteEventStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "List Vigil event records")]
struct Args {
    /// Path to the event database.
    #[arg(long, env = "VIGIL_DB_PATH", default_value = "vigil.db")]
    db_path: String,

    /// Maximum records to list (most recent first).
    #[arg(long, default_value_t = 50)]
    limit: usize,

    /// Show a single event.
    #[arg(long)]
    event_id: Option<String>,

    /// Re-hash every clip part and report mismatches.
    #[arg(long)]
    verify: bool,

    /// List the person gallery instead of events.
    #[arg(long, conflicts_with_all = ["event_id", "verify"])]
    persons: bool,
}

#[derive(Serialize)]
struct PartCheck {
    path: String,
    status: &'static str,
}

#[derive(Serialize)]
struct Listed<'a> {
    #[serde(flatten)]
    record: &'a EventRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    verification: Option<Vec<PartCheck>>,
}

fn verify(record: &EventRecord) -> Vec<PartCheck> {
    record
        .segments
        .iter()
        .map(|part| {
            let status = match sha256_file(&part.path) {
                Ok((bytes, sha)) if bytes == part.bytes && sha == part.sha256 => "ok",
                Ok(_) => "mismatch",
                Err(_) => "missing",
            };
            PartCheck {
                path: part.path.display().to_string(),
                status,
            }
        })
        .collect()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let mut store = SqliteEventStore::open(&args.db_path)?;

    if args.persons {
        println!("{}", serde_json::to_string_pretty(&store.list_persons()?)?);
        return Ok(());
    }

    let records = match &args.event_id {
        Some(id) => vec![store
            .get_event(id)?
            .ok_or_else(|| anyhow!("no event with id {}", id))?],
        None => store.list_events(args.limit)?,
    };

    let listed: Vec<Listed> = records
        .iter()
        .map(|record| Listed {
            record,
            verification: args.verify.then(|| verify(record)),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&listed)?);

    if args.verify {
        let failed = listed
            .iter()
            .flat_map(|l| l.verification.iter().flatten())
            .filter(|c| c.status != "ok")
            .count();
        if failed > 0 {
            return Err(anyhow!("{} clip part(s) failed verification", failed));
        }
    }
    Ok(())
}
