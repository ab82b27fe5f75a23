//! vigil_infer_worker - isolated inference worker
//!
//! Reads frame batches on stdin and answers with JSON lines on stdout (see
//! `vigil::supervisor::protocol`). Logs go to stderr only.
//!
//! Fault injection for recovery testing:
//! - `--crash-on-sequence N`: exit abruptly when frame N is reached
//! - `--hang-on-sequence N`: stop responding when frame N is reached

use anyhow::Result;
use clap::Parser;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use vigil::detect::{BackendOptions, BackendRegistry};
use vigil::supervisor::protocol::{read_request, write_response, BatchStatus, WorkerRequest, WorkerResponse};

#[derive(Parser, Debug)]
#[command(author, version, about = "Vigil isolated inference worker")]
struct Args {
    /// Detector backend name.
    #[arg(long, default_value = "motion")]
    backend: String,

    /// Track script for the scripted backend.
    #[arg(long)]
    script: Option<PathBuf>,

    #[arg(long)]
    crash_on_sequence: Option<u64>,

    #[arg(long)]
    hang_on_sequence: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let registry = BackendRegistry::with_builtin();
    let mut backend = registry.create(
        &args.backend,
        &BackendOptions {
            script: args.script.clone(),
        },
    )?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    write_response(
        &mut out,
        &WorkerResponse::Ready {
            backend: backend.name().to_string(),
            pid: std::process::id(),
        },
    )?;
    log::info!("worker ready (backend={})", backend.name());

    let stdin = io::stdin();
    let mut input = BufReader::new(stdin.lock());

    while let Some((request, frames)) = read_request(&mut input)? {
        let batch_id = match request {
            WorkerRequest::Shutdown => {
                log::info!("worker shutting down");
                break;
            }
            WorkerRequest::Batch { batch_id, .. } => batch_id,
        };

        let mut failures = 0usize;
        let mut last_error = None;
        for frame in &frames {
            if args.crash_on_sequence == Some(frame.sequence()) {
                log::error!("fault injection: crashing on frame {}", frame.sequence());
                std::process::exit(101);
            }
            if args.hang_on_sequence == Some(frame.sequence()) {
                log::error!("fault injection: hanging on frame {}", frame.sequence());
                loop {
                    std::thread::sleep(Duration::from_secs(3600));
                }
            }

            match backend.detect(frame) {
                Ok(detections) => write_response(
                    &mut out,
                    &WorkerResponse::Frame {
                        batch_id,
                        sequence: frame.sequence(),
                        detections,
                    },
                )?,
                Err(e) => {
                    log::warn!("detect failed on frame {}: {:#}", frame.sequence(), e);
                    failures += 1;
                    last_error = Some(e.to_string());
                }
            }
        }

        let status = match failures {
            0 => BatchStatus::Ok,
            n if n == frames.len() => BatchStatus::Failed,
            _ => BatchStatus::Partial,
        };
        write_response(
            &mut out,
            &WorkerResponse::BatchDone {
                batch_id,
                status,
                error: last_error,
            },
        )?;
    }

    Ok(())
}
