//! Single-consumer job worker.
//!
//! One worker drains the job queue serially; parallelism on a host is a
//! non-goal. The executor is a seam: the worker hands it a command
//! descriptor and persists whatever comes back through the crash-safe
//! submission sequence in [`crate::job_queue`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pilot_common::{CmdInfo, JobResult};

use crate::config::PilotPaths;
use crate::job_queue::{JobQueue, Peeked, QueueError};

const IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Executes a command descriptor, returning captured stdout or an error
/// description.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, cmd: &CmdInfo) -> Result<String, String>;
}

/// Default executor: runs `<package> <function>` as a host process and
/// captures its output.
pub struct CommandExecutor;

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(&self, cmd: &CmdInfo) -> Result<String, String> {
        let mut command = Command::new(&cmd.package);
        if !cmd.function.is_empty() {
            command.arg(&cmd.function);
        }
        if let Some(input) = &cmd.input {
            command.arg(input.to_string());
        }
        let output = command
            .output()
            .await
            .map_err(|e| format!("cannot spawn {}: {e}", cmd.package))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} exited with {}: {}", cmd.package, output.status, stderr.trim()))
        }
    }
}

/// The queue consumer. Cloneable handle; the loop itself runs as a tokio
/// task started by [`Worker::start`].
#[derive(Clone)]
pub struct Worker {
    queue: JobQueue,
    executor: Arc<dyn JobExecutor>,
}

impl Worker {
    pub fn new(paths: PilotPaths, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            queue: JobQueue::new(paths),
            executor,
        }
    }

    /// Enqueue a command for execution. Duplicate ids overwrite, which
    /// makes redelivered commands harmless.
    pub fn add_job(&self, cmd: &CmdInfo) -> Result<(), QueueError> {
        self.queue.enqueue(cmd)
    }

    /// Oldest unacknowledged result, if any.
    pub fn result(&self) -> Result<Option<JobResult>, QueueError> {
        self.queue.peek_result()
    }

    /// Drop a result the control plane has acknowledged.
    pub fn remove_result(&self, result: &JobResult) -> Result<(), QueueError> {
        self.queue.remove_result(result.job_id)
    }

    /// Pending job count.
    pub fn jobs(&self) -> usize {
        self.queue.job_count()
    }

    /// Spawn the consumer loop.
    pub fn start(&self) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            loop {
                if !worker.run_once().await {
                    tokio::time::sleep(IDLE_INTERVAL).await;
                }
            }
        })
    }

    /// One pass over the queue head. Returns true when a job was
    /// processed, false when the loop should idle.
    async fn run_once(&self) -> bool {
        let peeked = match self.queue.peek() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "cannot peek job queue");
                return false;
            }
        };
        let result = match peeked {
            None => return false,
            Some(Peeked::Ready(cmd)) => {
                info!(job_id = cmd.job_id, package = %cmd.package, function = %cmd.function, "processing job");
                match self.executor.execute(&cmd).await {
                    Ok(output) => JobResult {
                        job_id: cmd.job_id,
                        success: true,
                        log: output,
                        err: String::new(),
                        time: Utc::now(),
                    },
                    Err(reason) => JobResult {
                        job_id: cmd.job_id,
                        success: false,
                        log: String::new(),
                        err: reason,
                        time: Utc::now(),
                    },
                }
            }
            Some(Peeked::Corrupt {
                job_id: Some(job_id),
                reason,
                ..
            }) => {
                // Id recovered: post the failure upstream so the control
                // plane does not wait on a job that can never run.
                warn!(job_id, %reason, "corrupt job descriptor, reporting failure");
                JobResult {
                    job_id,
                    success: false,
                    log: String::new(),
                    err: reason,
                    time: Utc::now(),
                }
            }
            Some(Peeked::Corrupt { file, reason, .. }) => {
                // No id, nothing to report against; the file stays put.
                error!(file = %file.display(), %reason, "abandoning unreadable job file");
                return false;
            }
        };

        let job_id = result.job_id;
        if let Err(e) = self.queue.submit_result(&result) {
            error!(job_id, error = %e, "cannot persist job result, will retry");
            return false;
        }
        if let Err(e) = self.queue.remove_job(job_id) {
            // The submitted marker survives; the next peek finishes this
            // cleanup before anything else runs.
            error!(job_id, error = %e, "cannot remove completed job, deferring to next peek");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct EchoExecutor;

    #[async_trait]
    impl JobExecutor for EchoExecutor {
        async fn execute(&self, cmd: &CmdInfo) -> Result<String, String> {
            Ok(format!("job {} => complete", cmd.job_id))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl JobExecutor for FailingExecutor {
        async fn execute(&self, _cmd: &CmdInfo) -> Result<String, String> {
            Err("boom".into())
        }
    }

    fn worker(executor: Arc<dyn JobExecutor>) -> (TempDir, Worker) {
        let tmp = TempDir::new().unwrap();
        let paths = PilotPaths::at(tmp.path());
        paths.ensure_dirs().unwrap();
        (tmp, Worker::new(paths, executor))
    }

    fn cmd(job_id: i64) -> CmdInfo {
        CmdInfo {
            job_id,
            package: "list".into(),
            function: "show".into(),
            ..CmdInfo::default()
        }
    }

    #[tokio::test]
    async fn processes_a_job_end_to_end() {
        let (_tmp, w) = worker(Arc::new(EchoExecutor));
        w.add_job(&cmd(1010)).unwrap();
        assert_eq!(w.jobs(), 1);

        assert!(w.run_once().await);
        assert_eq!(w.jobs(), 0);

        let r = w.result().unwrap().unwrap();
        assert_eq!(r.job_id, 1010);
        assert!(r.success);
        assert_eq!(r.log, "job 1010 => complete");

        w.remove_result(&r).unwrap();
        assert!(w.result().unwrap().is_none());
    }

    #[tokio::test]
    async fn executor_failure_becomes_a_failure_result() {
        let (_tmp, w) = worker(Arc::new(FailingExecutor));
        w.add_job(&cmd(2)).unwrap();
        assert!(w.run_once().await);

        let r = w.result().unwrap().unwrap();
        assert!(!r.success);
        assert_eq!(r.err, "boom");
    }

    #[tokio::test]
    async fn corrupt_job_with_id_reports_failure_and_cleans_up() {
        let (tmp, w) = worker(Arc::new(EchoExecutor));
        fs::write(tmp.path().join("data/process/job_99.job"), "{").unwrap();

        assert!(w.run_once().await);
        assert_eq!(w.jobs(), 0);
        let r = w.result().unwrap().unwrap();
        assert_eq!(r.job_id, 99);
        assert!(!r.success);
        assert!(r.err.contains("decode"));
    }

    #[tokio::test]
    async fn unreadable_job_without_id_is_left_in_place() {
        let (tmp, w) = worker(Arc::new(EchoExecutor));
        fs::write(tmp.path().join("data/process/broken.job"), "{").unwrap();

        assert!(!w.run_once().await);
        assert!(tmp.path().join("data/process/broken.job").exists());
        assert!(w.result().unwrap().is_none());
    }

    #[tokio::test]
    async fn idle_queue_reports_nothing_processed() {
        let (_tmp, w) = worker(Arc::new(EchoExecutor));
        assert!(!w.run_once().await);
    }
}
