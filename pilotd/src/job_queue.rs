//! Crash-safe job pipeline state on disk.
//!
//! The process directory is a FIFO of `.job` descriptors ordered by
//! modification time. Two zero-byte markers in the data directory journal
//! each job's progress:
//!
//! - `job_<id>.started`: the job was handed to the executor.
//! - `job_<id>.submitted`: its result reached the submit spool.
//!
//! The submission sequence `result → submitted → rm(started) → rm(job)`
//! is the recovery contract: whatever step a crash lands on, the next
//! peek either re-runs the job (no result persisted yet) or purges it
//! (submitted marker present), so no job runs twice and no result is
//! lost.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use pilot_common::{CmdInfo, JobResult};

use crate::config::PilotPaths;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("cannot access job queue: {0}")]
    Io(#[from] std::io::Error),
    #[error("file {file} is corrupt: {reason}")]
    Corrupt { file: PathBuf, reason: String },
}

/// Outcome of peeking the queue head.
#[derive(Debug)]
pub enum Peeked {
    /// A decodable job; its `started` marker is already on disk.
    Ready(CmdInfo),
    /// An unreadable descriptor. When the id could be recovered from the
    /// file name, a failure result can still be posted upstream.
    Corrupt {
        file: PathBuf,
        job_id: Option<i64>,
        reason: String,
    },
}

/// Filesystem-backed job queue rooted at the pilot data directories.
#[derive(Clone, Debug)]
pub struct JobQueue {
    paths: PilotPaths,
}

impl JobQueue {
    pub fn new(paths: PilotPaths) -> Self {
        Self { paths }
    }

    fn job_file(&self, job_id: i64) -> PathBuf {
        self.paths.process_dir().join(format!("job_{job_id}.job"))
    }

    fn result_file(&self, job_id: i64) -> PathBuf {
        self.paths.submit_dir().join(format!("job_{job_id}.result"))
    }

    fn started_marker(&self, job_id: i64) -> PathBuf {
        self.paths.data_dir().join(format!("job_{job_id}.started"))
    }

    fn submitted_marker(&self, job_id: i64) -> PathBuf {
        self.paths.data_dir().join(format!("job_{job_id}.submitted"))
    }

    /// Persist a command descriptor. Re-enqueueing the same id overwrites
    /// the previous descriptor.
    pub fn enqueue(&self, cmd: &CmdInfo) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(cmd).map_err(|e| QueueError::Corrupt {
            file: self.job_file(cmd.job_id),
            reason: e.to_string(),
        })?;
        fs::write(self.job_file(cmd.job_id), bytes)?;
        Ok(())
    }

    /// Return the oldest pending job without consuming it.
    ///
    /// A clean decode gains a `started` marker. A job whose `submitted`
    /// marker survives from an interrupted cleanup is purged and the next
    /// entry peeked instead: its result is already durable in the submit
    /// spool.
    pub fn peek(&self) -> Result<Option<Peeked>, QueueError> {
        loop {
            let Some(file) = oldest_with_extension(&self.paths.process_dir(), "job")? else {
                return Ok(None);
            };
            let bytes = fs::read(&file)?;
            if bytes.is_empty() {
                return Ok(Some(Peeked::Corrupt {
                    job_id: recover_job_id(&file),
                    file,
                    reason: "job file is empty".into(),
                }));
            }
            let cmd: CmdInfo = match serde_json::from_slice(&bytes) {
                Ok(cmd) => cmd,
                Err(e) => {
                    return Ok(Some(Peeked::Corrupt {
                        job_id: recover_job_id(&file),
                        file,
                        reason: format!("cannot decode job descriptor: {e}"),
                    }));
                }
            };
            if self.submitted_marker(cmd.job_id).exists() {
                // The host halted after submitting the result but before
                // finishing cleanup; complete it and look again.
                self.remove_job(cmd.job_id)?;
                continue;
            }
            fs::write(self.started_marker(cmd.job_id), [])?;
            return Ok(Some(Peeked::Ready(cmd)));
        }
    }

    /// Remove a completed job: the `submitted` marker first, then the
    /// descriptor. Both removals must succeed.
    pub fn remove_job(&self, job_id: i64) -> Result<(), QueueError> {
        fs::remove_file(self.submitted_marker(job_id))?;
        fs::remove_file(self.job_file(job_id))?;
        Ok(())
    }

    /// Number of pending descriptors.
    pub fn job_count(&self) -> usize {
        list_with_extension(&self.paths.process_dir(), "job")
            .map(|files| files.len())
            .unwrap_or(0)
    }

    /// Persist a job result and journal the transition: result file,
    /// then `submitted` marker, then drop the `started` marker. A missing
    /// `started` marker is tolerated (the job may never have started
    /// cleanly).
    pub fn submit_result(&self, result: &JobResult) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(result).map_err(|e| QueueError::Corrupt {
            file: self.result_file(result.job_id),
            reason: e.to_string(),
        })?;
        fs::write(self.result_file(result.job_id), bytes)?;
        fs::write(self.submitted_marker(result.job_id), [])?;
        if let Err(e) = fs::remove_file(self.started_marker(result.job_id)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Oldest result awaiting delivery, if any.
    pub fn peek_result(&self) -> Result<Option<JobResult>, QueueError> {
        let Some(file) = oldest_with_extension(&self.paths.submit_dir(), "result")? else {
            return Ok(None);
        };
        let bytes = fs::read(&file)?;
        let result = serde_json::from_slice(&bytes).map_err(|e| QueueError::Corrupt {
            file,
            reason: format!("cannot decode job result: {e}"),
        })?;
        Ok(Some(result))
    }

    /// Drop a delivered result from the submit spool.
    pub fn remove_result(&self, job_id: i64) -> Result<(), QueueError> {
        fs::remove_file(self.result_file(job_id))?;
        Ok(())
    }
}

/// Recover a numeric job id from a file name such as `job_99.job`.
fn recover_job_id(file: &Path) -> Option<i64> {
    let name = file.file_name()?.to_string_lossy();
    let re = Regex::new(r"\d+").expect("static pattern");
    let id = re.find(&name)?.as_str().parse().ok();
    if id.is_none() {
        warn!(file = %file.display(), "cannot recover job id from file name");
    }
    id
}

/// Entries of `dir` carrying `ext`, sorted by modification time ascending.
fn list_with_extension(dir: &Path, ext: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().map(|e| e != ext).unwrap_or(true) {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((mtime, path));
    }
    files.sort_by_key(|(mtime, _)| *mtime);
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

fn oldest_with_extension(dir: &Path, ext: &str) -> std::io::Result<Option<PathBuf>> {
    Ok(list_with_extension(dir, ext)?.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn queue() -> (TempDir, JobQueue) {
        let tmp = TempDir::new().unwrap();
        let paths = PilotPaths::at(tmp.path());
        paths.ensure_dirs().unwrap();
        (tmp, JobQueue::new(paths))
    }

    fn cmd(job_id: i64) -> CmdInfo {
        CmdInfo {
            job_id,
            package: "pkg".into(),
            function: "fn".into(),
            ..CmdInfo::default()
        }
    }

    fn result(job_id: i64, success: bool) -> JobResult {
        JobResult {
            job_id,
            success,
            log: "out".into(),
            err: String::new(),
            time: Utc::now(),
        }
    }

    #[test]
    fn peek_on_empty_queue_is_none() {
        let (_tmp, q) = queue();
        assert!(q.peek().unwrap().is_none());
    }

    #[test]
    fn peek_marks_started_and_does_not_consume() {
        let (tmp, q) = queue();
        q.enqueue(&cmd(7)).unwrap();

        match q.peek().unwrap().unwrap() {
            Peeked::Ready(c) => assert_eq!(c.job_id, 7),
            other => panic!("unexpected peek outcome: {other:?}"),
        }
        assert!(tmp.path().join("data/job_7.started").exists());
        assert_eq!(q.job_count(), 1);
    }

    #[test]
    fn submission_sequence_updates_markers_in_order() {
        let (tmp, q) = queue();
        q.enqueue(&cmd(7)).unwrap();
        let _ = q.peek().unwrap();

        q.submit_result(&result(7, true)).unwrap();
        assert!(tmp.path().join("data/submit/job_7.result").exists());
        assert!(tmp.path().join("data/job_7.submitted").exists());
        assert!(!tmp.path().join("data/job_7.started").exists());

        q.remove_job(7).unwrap();
        assert!(!tmp.path().join("data/job_7.submitted").exists());
        assert_eq!(q.job_count(), 0);
        // the result stays until the control plane acknowledges it
        assert_eq!(q.peek_result().unwrap().unwrap().job_id, 7);
    }

    #[test]
    fn peek_purges_job_whose_submitted_marker_survived_a_crash() {
        let (tmp, q) = queue();
        q.enqueue(&cmd(9)).unwrap();
        let _ = q.peek().unwrap();
        q.submit_result(&result(9, true)).unwrap();
        // crash here: neither marker nor descriptor cleaned up

        match q.peek().unwrap() {
            None => {}
            other => panic!("expected purge, got {other:?}"),
        }
        assert!(!tmp.path().join("data/process/job_9.job").exists());
        assert!(!tmp.path().join("data/job_9.submitted").exists());
        // exactly one result survives for delivery
        assert_eq!(q.peek_result().unwrap().unwrap().job_id, 9);
    }

    #[test]
    fn purge_recurses_to_the_next_pending_job() {
        let (_tmp, q) = queue();
        q.enqueue(&cmd(1)).unwrap();
        set_job_mtime(&q, 1, 10);
        q.enqueue(&cmd(2)).unwrap();
        set_job_mtime(&q, 2, 20);
        let _ = q.peek().unwrap();
        q.submit_result(&result(1, true)).unwrap();

        match q.peek().unwrap().unwrap() {
            Peeked::Ready(c) => assert_eq!(c.job_id, 2),
            other => panic!("unexpected peek outcome: {other:?}"),
        }
    }

    #[test]
    fn corrupt_job_with_recoverable_id() {
        let (tmp, q) = queue();
        fs::write(tmp.path().join("data/process/job_99.job"), "{").unwrap();

        match q.peek().unwrap().unwrap() {
            Peeked::Corrupt { job_id, .. } => assert_eq!(job_id, Some(99)),
            other => panic!("unexpected peek outcome: {other:?}"),
        }
    }

    #[test]
    fn empty_job_file_is_corrupt() {
        let (tmp, q) = queue();
        fs::write(tmp.path().join("data/process/job_5.job"), "").unwrap();

        match q.peek().unwrap().unwrap() {
            Peeked::Corrupt { job_id, reason, .. } => {
                assert_eq!(job_id, Some(5));
                assert!(reason.contains("empty"));
            }
            other => panic!("unexpected peek outcome: {other:?}"),
        }
    }

    #[test]
    fn corrupt_job_without_numeric_name_yields_no_id() {
        let (tmp, q) = queue();
        fs::write(tmp.path().join("data/process/broken.job"), "{").unwrap();

        match q.peek().unwrap().unwrap() {
            Peeked::Corrupt { job_id, .. } => assert_eq!(job_id, None),
            other => panic!("unexpected peek outcome: {other:?}"),
        }
    }

    #[test]
    fn fifo_order_follows_mtime() {
        let (_tmp, q) = queue();
        for (id, ts) in [(30, 3), (10, 1), (20, 2)] {
            q.enqueue(&cmd(id)).unwrap();
            set_job_mtime(&q, id, ts);
        }
        match q.peek().unwrap().unwrap() {
            Peeked::Ready(c) => assert_eq!(c.job_id, 10),
            other => panic!("unexpected peek outcome: {other:?}"),
        }
    }

    #[test]
    fn enqueue_same_id_overwrites() {
        let (_tmp, q) = queue();
        q.enqueue(&cmd(4)).unwrap();
        let mut updated = cmd(4);
        updated.function = "replacement".into();
        q.enqueue(&updated).unwrap();
        assert_eq!(q.job_count(), 1);
        match q.peek().unwrap().unwrap() {
            Peeked::Ready(c) => assert_eq!(c.function, "replacement"),
            other => panic!("unexpected peek outcome: {other:?}"),
        }
    }

    /// Force distinct mtimes without sleeping between writes.
    fn set_job_mtime(q: &JobQueue, job_id: i64, secs: u64) {
        let file = fs::File::options()
            .write(true)
            .open(q.job_file(job_id))
            .unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs))
            .unwrap();
    }
}
