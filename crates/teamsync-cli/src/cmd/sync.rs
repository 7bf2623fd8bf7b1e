use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use racing_api::SystemClock;
use std::path::Path;
use std::sync::Arc;
use teamsync_core::coordinator::{BatchStatus, PhaseStatus};
use teamsync_core::{BatchOptions, BatchRun, Engine, SyncConfig};

pub enum SyncMode {
    Batch(BatchOptions),
    Smart,
}

pub fn run(root: &Path, mode: SyncMode, json: bool) -> anyhow::Result<()> {
    let config = SyncConfig::load(root).context("failed to load config")?;
    if !config.is_valid() {
        anyhow::bail!("config has errors; run `teamsync validate` for details");
    }

    let rt = tokio::runtime::Runtime::new()?;
    let run = rt.block_on(async {
        let engine = Engine::open(root, &config, Arc::new(SystemClock))?;
        match mode {
            SyncMode::Batch(options) => engine.coordinator.execute_batch(options, "cli").await,
            SyncMode::Smart => {
                let plan = engine.coordinator.plan_smart_sync();
                tracing::info!(
                    peak = plan.peak,
                    near_events = plan.near_events,
                    "smart sync plan"
                );
                engine.coordinator.execute_smart_sync().await
            }
        }
    })?;

    if json {
        print_json(&run)?;
    } else {
        print_run(&run);
    }

    if run.status == BatchStatus::Error {
        anyhow::bail!("sync failed: {}", run.summary);
    }
    Ok(())
}

fn print_run(run: &BatchRun) {
    let rows = run
        .phases
        .iter()
        .map(|p| {
            vec![
                p.phase.as_str().to_string(),
                status_label(p.status).to_string(),
                p.items_processed.to_string(),
                p.items_new.to_string(),
                p.items_updated.to_string(),
                p.items_failed.to_string(),
                format!("{}ms", p.duration_ms),
                or_dash(p.error.as_deref()),
            ]
        })
        .collect();
    print_table(
        &["PHASE", "STATUS", "PROCESSED", "NEW", "UPDATED", "FAILED", "TIME", "ERROR"],
        rows,
    );
    println!("\n{} ({}ms)", run.summary, run.duration_ms);
}

fn status_label(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Success => "success",
        PhaseStatus::Partial => "partial",
        PhaseStatus::Error => "error",
        PhaseStatus::Skipped => "skipped",
    }
}
