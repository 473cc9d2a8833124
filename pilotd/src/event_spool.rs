//! Batched drain of collector events.
//!
//! An external syslog collector drops complete `.ev` files into the
//! submit directory. The ping loop drains them in batches: `get_events`
//! records the batch it picked in an `events.json` manifest, and
//! `remove_events` deletes exactly the files that manifest names once the
//! control plane has acknowledged the batch. The manifest exists only
//! between those two calls; the single-threaded ping loop is the guard,
//! there are no locks.

use std::fs;
use std::path::PathBuf;

use pilot_common::Event;

use crate::config::PilotPaths;
use crate::job_queue::QueueError;

const MANIFEST: &str = "events.json";

/// Collect up to `max` events in modification-time order and record the
/// in-flight batch. Returns `None` when the spool is empty, leaving no
/// manifest behind.
pub fn get_events(paths: &PilotPaths, max: usize) -> Result<Option<Vec<Event>>, QueueError> {
    let mut names: Vec<String> = Vec::new();
    let mut events: Vec<Event> = Vec::new();
    for file in list_event_files(paths)? {
        let bytes = fs::read(&file)?;
        let event = serde_json::from_slice(&bytes).map_err(|e| QueueError::Corrupt {
            file: file.clone(),
            reason: format!("cannot decode event: {e}"),
        })?;
        names.push(
            file.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
        events.push(event);
        if names.len() >= max {
            break;
        }
    }
    if names.is_empty() {
        return Ok(None);
    }
    let manifest = serde_json::to_vec(&names).expect("names serialize");
    fs::write(paths.data_dir().join(MANIFEST), manifest)?;
    Ok(Some(events))
}

/// Delete the files of the acknowledged batch and drop the manifest.
/// Without a manifest this is a no-op.
pub fn remove_events(paths: &PilotPaths) -> Result<(), QueueError> {
    let manifest = paths.data_dir().join(MANIFEST);
    let Ok(bytes) = fs::read(&manifest) else {
        return Ok(());
    };
    let names: Vec<String> = serde_json::from_slice(&bytes).map_err(|e| QueueError::Corrupt {
        file: manifest.clone(),
        reason: format!("cannot decode event manifest: {e}"),
    })?;
    for name in names {
        fs::remove_file(paths.submit_dir().join(name))?;
    }
    fs::remove_file(manifest)?;
    Ok(())
}

fn list_event_files(paths: &PilotPaths) -> Result<Vec<PathBuf>, QueueError> {
    let dir = paths.submit_dir();
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().map(|e| e != "ev").unwrap_or(true) {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        files.push((mtime, path));
    }
    files.sort_by_key(|(mtime, _)| *mtime);
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spool() -> (TempDir, PilotPaths) {
        let tmp = TempDir::new().unwrap();
        let paths = PilotPaths::at(tmp.path());
        paths.ensure_dirs().unwrap();
        (tmp, paths)
    }

    fn drop_event(paths: &PilotPaths, name: &str, tag: &str) {
        fs::write(
            paths.submit_dir().join(name),
            format!(r#"{{"tag":"{tag}","content":"m"}}"#),
        )
        .unwrap();
    }

    #[test]
    fn empty_spool_yields_none_and_no_manifest() {
        let (_tmp, paths) = spool();
        assert!(get_events(&paths, 5).unwrap().is_none());
        assert!(!paths.data_dir().join(MANIFEST).exists());
        // remove on an empty spool is a no-op
        remove_events(&paths).unwrap();
    }

    #[test]
    fn drain_is_bounded_and_manifest_driven() {
        let (_tmp, paths) = spool();
        for i in 0..7 {
            drop_event(&paths, &format!("e{i}.ev"), &format!("t{i}"));
        }

        let events = get_events(&paths, 5).unwrap().unwrap();
        assert_eq!(events.len(), 5);
        assert!(paths.data_dir().join(MANIFEST).exists());

        remove_events(&paths).unwrap();
        assert!(!paths.data_dir().join(MANIFEST).exists());
        // the two events beyond the batch limit survive for the next tick
        let leftover = list_event_files(&paths).unwrap();
        assert_eq!(leftover.len(), 2);
    }

    #[test]
    fn remove_only_touches_manifest_names() {
        let (_tmp, paths) = spool();
        drop_event(&paths, "a.ev", "a");
        let _ = get_events(&paths, 5).unwrap().unwrap();
        // a new event lands while the batch is in flight
        drop_event(&paths, "b.ev", "b");

        remove_events(&paths).unwrap();
        assert!(!paths.submit_dir().join("a.ev").exists());
        assert!(paths.submit_dir().join("b.ev").exists());
    }

    #[test]
    fn undecodable_event_is_reported() {
        let (_tmp, paths) = spool();
        fs::write(paths.submit_dir().join("bad.ev"), "not json").unwrap();
        assert!(matches!(
            get_events(&paths, 5),
            Err(QueueError::Corrupt { .. })
        ));
    }
}
