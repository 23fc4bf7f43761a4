//! Crash-safe file publication shared by the snapshot and result stores.
//!
//! Every record is first written to a hidden temp file in the target directory
//! and synced. It is then published either with `hard_link` (exclusive: fails
//! with `AlreadyExists` when the name is taken, which doubles as the
//! compare-and-swap for version numbers and the duplicate check for run ids) or
//! with `rename` (replace: used for the current-version pointer). A crash leaves
//! at most a stray temp file, never a half-written record.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const TEMP_PREFIX: &str = ".tmp-";

fn write_temp(dir: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    let tmp = dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
    let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(tmp)
}

fn sync_dir(dir: &Path) {
    // Directory fsync is not supported everywhere; publishing already happened.
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Publishes `value` as `dir/name`, failing with `AlreadyExists` if taken.
pub(crate) fn publish_exclusive<T: Serialize>(dir: &Path, name: &str, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = write_temp(dir, &bytes)?;
    let result = fs::hard_link(&tmp, dir.join(name));
    let _ = fs::remove_file(&tmp);
    result?;
    sync_dir(dir);
    Ok(())
}

/// Publishes `value` as `dir/name`, atomically replacing any previous file.
pub(crate) fn publish_replace<T: Serialize>(dir: &Path, name: &str, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = write_temp(dir, &bytes)?;
    if let Err(err) = fs::rename(&tmp, dir.join(name)) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    sync_dir(dir);
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<T> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(io::Error::from)
}

/// Published `*.json` files in `dir`, skipping temp files.
pub(crate) fn json_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_temp = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(TEMP_PREFIX));
        if !is_temp && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_exclusive_publish_refuses_second_writer() {
        let dir = tempdir().unwrap();
        publish_exclusive(dir.path(), "v1.json", &1_u32).unwrap();
        let err = publish_exclusive(dir.path(), "v1.json", &2_u32).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        let kept: u32 = read_json(&dir.path().join("v1.json")).unwrap();
        assert_eq!(kept, 1);
        // no temp files left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_replace_publish_overwrites() {
        let dir = tempdir().unwrap();
        publish_replace(dir.path(), "CURRENT", &1_u32).unwrap();
        publish_replace(dir.path(), "CURRENT", &2_u32).unwrap();
        let value: u32 = read_json(&dir.path().join("CURRENT")).unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_json_files_skips_temp_and_foreign_files() {
        let dir = tempdir().unwrap();
        publish_exclusive(dir.path(), "a.json", &"a").unwrap();
        fs::write(dir.path().join(".tmp-abandoned"), b"{").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        let files = json_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("a.json"));
    }
}
