use crate::output::print_json;
use anyhow::Context;
use cbc_core::config::Config;
use cbc_core::workflow::Engine;
use chrono::Utc;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{error, info};

const PRUNE_EVERY: Duration = Duration::from_secs(60 * 60);

/// Recover interrupted runs, then tick until the process is stopped.
pub fn run(root: &Path, once: bool, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let engine = Engine::open(root, &config).context("failed to start engine")?;
    engine.recover(config.recovery_max_age())?;
    let retention = config.retention();
    if let Some(retention) = retention {
        engine.prune(retention)?;
    }

    if once {
        let report = engine.tick()?;
        if json {
            print_json(&report)?;
        } else {
            println!(
                "due: {}  succeeded: {}  failed: {}  waiting: {}",
                report.due, report.succeeded, report.failed, report.suspended
            );
        }
        return Ok(());
    }

    let interval = config.tick_interval();
    info!(orchestrator = %config.orchestrator_id, interval_ms = interval.as_millis() as u64, "worker started");
    let mut last_prune = Instant::now();
    loop {
        if let Err(e) = engine.tick() {
            error!(error = %e, "tick failed");
        }
        if let Some(retention) = retention.filter(|_| last_prune.elapsed() >= PRUNE_EVERY) {
            if let Err(e) = engine.prune(retention) {
                error!(error = %e, "prune failed");
            }
            last_prune = Instant::now();
        }
        // Sleep until the next timer, but never longer than one interval so
        // runs submitted by `cbc submit` or the API are picked up.
        let wait = match engine.next_wake() {
            Ok(Some(at)) => (at - Utc::now())
                .to_std()
                .unwrap_or_default()
                .min(interval),
            _ => interval,
        };
        std::thread::sleep(wait);
    }
}
