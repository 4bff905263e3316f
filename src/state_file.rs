//! Small durable-file helpers shared by the block cursor store and the
//! keep-alive subscription-id cache: atomic temp-write + rename, exactly
//! as the teacher's `state.rs::save`.

use eyre::{eyre, Result};
use std::fs;
use std::path::Path;

/// Write `contents` to `path` via a temp file + rename so a crash mid-write
/// never leaves a truncated file behind. The last successful call is what
/// the next `read_to_string` observes, even across a restart.
pub fn atomic_write(path: impl AsRef<Path>, contents: &str) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create directory {}: {e}", parent.display()))?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .map_err(|e| eyre!("failed to write temp file {}: {e}", tmp_path.display()))?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        if cfg!(windows) {
            let _ = fs::remove_file(path);
            fs::rename(&tmp_path, path)
                .map_err(|e| eyre!("failed to replace file {}: {e}", path.display()))?;
        } else {
            return Err(eyre!("failed to replace file {}: {err}", path.display()));
        }
    }
    Ok(())
}

pub fn read_to_string_if_exists(path: impl AsRef<Path>) -> Result<Option<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| eyre!("failed to read file {}: {e}", path.display()))?;
    Ok(Some(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempdir("atomic-write");
        let path = dir.join("foo.json");
        atomic_write(&path, "hello").unwrap();
        assert_eq!(read_to_string_if_exists(&path).unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempdir("missing-file");
        let path = dir.join("missing.json");
        assert!(read_to_string_if_exists(&path).unwrap().is_none());
    }

    fn tempdir(tag: &str) -> std::path::PathBuf {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let mut p = std::env::temp_dir();
        p.push(format!(
            "fulfillment-agent-test-{tag}-{}-{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&p).unwrap();
        p
    }
}
