use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Replace `path` with `data` via a sibling tempfile and rename, creating
/// parent directories first. Readers see the old or the new file, never a
/// truncated one.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_missing_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".teamsync/nested/config.yaml");
        atomic_write(&path, b"queue: {}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "queue: {}");
    }

    #[test]
    fn replaces_existing_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        atomic_write(&path, b"version: 1\napi: {}\n").unwrap();
        atomic_write(&path, b"version: 2\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "version: 2\n");

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
