use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TEAMSYNC_DIR: &str = ".teamsync";
pub const CONFIG_FILE: &str = ".teamsync/config.yaml";
pub const SYNC_LOG_DB: &str = ".teamsync/sync-log.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn teamsync_dir(root: &Path) -> PathBuf {
    root.join(TEAMSYNC_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn sync_log_path(root: &Path) -> PathBuf {
    root.join(SYNC_LOG_DB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_live_under_dot_dir() {
        let root = Path::new("/srv/team");
        assert_eq!(config_path(root), PathBuf::from("/srv/team/.teamsync/config.yaml"));
        assert!(sync_log_path(root).starts_with(teamsync_dir(root)));
    }
}
