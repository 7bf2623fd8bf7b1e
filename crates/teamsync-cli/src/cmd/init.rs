use anyhow::Context;
use std::path::Path;
use teamsync_core::schedule::ScheduleValidator;
use teamsync_core::{paths, SyncConfig};

pub fn run(root: &Path, recommended: bool) -> anyhow::Result<()> {
    println!("Initializing teamsync in: {}", root.display());

    let config_path = paths::config_path(root);
    if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
        return Ok(());
    }

    let mut cfg = SyncConfig::new();
    if recommended {
        cfg.schedule = ScheduleValidator::recommended();
    }
    cfg.save(root).context("failed to write config.yaml")?;
    println!("  created: {}", paths::CONFIG_FILE);

    if cfg.api.api_key().is_none() {
        println!(
            "\nSet {} before running `teamsync sync` or `teamsync serve`.",
            cfg.api.api_key_env
        );
    }
    Ok(())
}
