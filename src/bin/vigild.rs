//! vigild - per-source event pipeline daemon
//!
//! Reads frames from one source, evaluates behavior rules and records event
//! clips with metadata into the event store. Runs until Ctrl-C, or until a
//! finite source (file, limited synthetic) is exhausted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use vigil::config::VigildConfig;
use vigil::transport::{LogNotifier, MqttNotifier, NotifierSet};
use vigil::{SourcePipeline, SqliteEventStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Vigil event pipeline daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the source URL (stub://, rtsp://, or a file path).
    #[arg(long)]
    source: Option<String>,

    /// Drain window for a graceful stop, in seconds.
    #[arg(long, default_value_t = 10)]
    stop_timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = VigildConfig::load_from(args.config.as_deref())?;
    if let Some(url) = &args.source {
        cfg.set_source_url(url);
        cfg.validate()?;
    }

    let store = SqliteEventStore::open(&cfg.db_path)?;
    let mut notifiers = NotifierSet::new();
    notifiers.push(Box::new(LogNotifier));
    if let Some(mqtt) = &cfg.mqtt {
        match MqttNotifier::connect(mqtt) {
            Ok(notifier) => notifiers.push(Box::new(notifier)),
            Err(e) => log::warn!("MQTT notifications disabled: {:#}", e),
        }
    }

    log::info!(
        "vigild starting: source={} ({}), db={}, clips={}",
        cfg.pipeline.source_id,
        cfg.pipeline.source.url,
        cfg.db_path,
        cfg.pipeline.recorder.output_dir.display()
    );
    let mut pipeline = SourcePipeline::new(
        Arc::new(cfg.pipeline.clone()),
        Box::new(store),
        Box::new(notifiers),
    )?;
    pipeline.start()?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping pipeline...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if !pipeline.is_alive() {
                    log::info!("pipeline finished");
                    break;
                }
            }
        }
    }

    let reports = pipeline.stop(Duration::from_secs(args.stop_timeout_secs))?;
    for report in reports {
        log::info!(
            "stage {}: {:?}, consumed={}, errors={}",
            report.name,
            report.reason,
            report.consumed,
            report.errors
        );
    }
    let stats = pipeline.stats();
    log::info!(
        "vigild stopped: frames={} gaps={} clips={} pending={}",
        stats.frames_ingested,
        stats.gap_frames,
        stats.recorder.clips_finalized,
        stats.recorder.records_pending
    );
    Ok(())
}
