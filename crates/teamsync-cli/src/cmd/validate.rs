use crate::output::{print_json, print_table};
use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use teamsync_core::config::{ConfigWarning, WarnLevel};
use teamsync_core::schedule::ScheduleValidator;
use teamsync_core::SyncConfig;

#[derive(Serialize)]
struct ValidateOutput {
    valid: bool,
    warnings: Vec<ConfigWarning>,
    suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    applied_offsets: Option<BTreeMap<String, u32>>,
}

pub fn run(root: &Path, fix: bool, json: bool) -> anyhow::Result<()> {
    let mut config = SyncConfig::load(root).context("failed to load config")?;

    let applied_offsets = if fix {
        let offsets = config.validator().generate_safe_offsets(&config.schedule);
        config.schedule = ScheduleValidator::apply_offsets(&config.schedule, &offsets);
        config.save(root).context("failed to save config")?;
        Some(offsets)
    } else {
        None
    };

    let warnings = config.validate();
    let valid = warnings.iter().all(|w| w.level != WarnLevel::Error);
    let suggestions = config.validator().validate(&config.schedule).suggestions;

    if json {
        print_json(&ValidateOutput {
            valid,
            warnings,
            suggestions,
            applied_offsets,
        })?;
    } else {
        if let Some(offsets) = &applied_offsets {
            println!("Applied trigger offsets:");
            let rows = offsets
                .iter()
                .map(|(name, minute)| vec![name.clone(), format!(":{minute:02}")])
                .collect();
            print_table(&["TRIGGER", "OFFSET"], rows);
            println!();
        }
        for w in &warnings {
            let label = match w.level {
                WarnLevel::Error => "error",
                WarnLevel::Warning => "warning",
            };
            println!("{label}: {}", w.message);
        }
        for s in &suggestions {
            println!("suggestion: {s}");
        }
        if valid {
            println!("config is valid");
        }
    }

    if !valid {
        anyhow::bail!("config has errors; run `teamsync validate --fix` to stagger triggers");
    }
    Ok(())
}
