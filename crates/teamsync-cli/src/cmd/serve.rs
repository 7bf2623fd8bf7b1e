use std::path::Path;
use teamsync_core::SyncConfig;

pub fn run(root: &Path, port: u16, start_scheduler: bool) -> anyhow::Result<()> {
    // Fail before binding when the project was never initialized.
    SyncConfig::load(root)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(teamsync_server::serve(
        root.to_path_buf(),
        port,
        start_scheduler,
    ))
}
