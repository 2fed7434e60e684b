//! Worker subprocess execution.
//!
//! A worker is an external agent program run once per claimed task. It gets
//! the task context as JSON on stdin plus `CONDUCTOR_*` env vars, runs in the
//! project root, and appends stdout/stderr to a per-task log file. Exit 0 is
//! success; anything else, including the wall-clock timeout, is a failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SubprocessError;
use crate::model::{Priority, Task, WorkerOutcome, WorkerRun};
use crate::store::Database;

/// Bytes of log output kept in the run row for crash triage.
const OUTPUT_TAIL_BYTES: u64 = 4096;

/// Everything a runner needs to execute one task.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub task: Task,
    /// Working directory (project root). None inherits the launcher's cwd.
    pub workdir: Option<PathBuf>,
}

/// Context document written to the worker's stdin.
#[derive(Debug, Serialize)]
struct TaskContext<'a> {
    project_id: &'a str,
    order_id: &'a str,
    task_id: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    priority: Priority,
    target_files: &'a [String],
    depends_on: &'a [String],
    reject_count: u32,
}

impl<'a> From<&'a Task> for TaskContext<'a> {
    fn from(task: &'a Task) -> Self {
        Self {
            project_id: &task.project_id,
            order_id: &task.order_id,
            task_id: &task.id,
            title: &task.title,
            description: task.description.as_deref(),
            priority: task.priority,
            target_files: &task.target_files,
            depends_on: &task.depends_on,
            reject_count: task.reject_count,
        }
    }
}

/// A worker that exited 0.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub run_id: String,
    pub log_path: PathBuf,
}

/// Executes worker jobs. Implementations must be safe to call concurrently.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    /// Run the job to completion. `Ok` only for a clean exit.
    async fn run(&self, job: WorkerJob) -> Result<WorkerExit, SubprocessError>;
}

/// Runs workers as OS subprocesses and records `worker_runs` telemetry.
pub struct ProcessWorkerRunner {
    db: Arc<dyn Database>,
    command: Vec<String>,
    log_dir: PathBuf,
    timeout: Duration,
    heartbeat_interval: Duration,
}

impl ProcessWorkerRunner {
    pub fn new(db: Arc<dyn Database>, command: Vec<String>, log_dir: PathBuf) -> Self {
        Self {
            db,
            command,
            log_dir,
            timeout: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    /// Set the wall-clock timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Per-task log file: `<log_dir>/<project>/<task>.log`.
    pub fn log_path(&self, task: &Task) -> PathBuf {
        log_path_for(&self.log_dir, &task.project_id, &task.id)
    }

    async fn finish(
        &self,
        run: &WorkerRun,
        log_path: &Path,
        outcome: WorkerOutcome,
        exit_code: Option<i32>,
    ) {
        let tail = read_tail(log_path, run.log_offset, OUTPUT_TAIL_BYTES).await;
        if let Err(e) = self
            .db
            .finish_worker_run(&run.id, outcome, exit_code, tail.as_deref())
            .await
        {
            warn!(run_id = %run.id, error = %e, "Failed to record worker run outcome");
        }
    }

    /// Prepare the context, open the log, and start the child.
    fn spawn(&self, job: &WorkerJob, log_path: &Path) -> Result<Spawned, SubprocessError> {
        let task = &job.task;
        let spawn_err = |reason: String| SubprocessError::Spawn {
            task_id: task.id.clone(),
            reason,
        };

        let Some((program, args)) = self.command.split_first() else {
            return Err(spawn_err("no worker command configured".into()));
        };
        let context = serde_json::to_vec(&TaskContext::from(task))
            .map_err(|e| spawn_err(format!("task context: {e}")))?;

        let log = open_log(log_path)
            .map_err(|e| spawn_err(format!("log {}: {e}", log_path.display())))?;
        let log_offset = log
            .metadata()
            .map_err(|e| spawn_err(format!("log {}: {e}", log_path.display())))?
            .len();
        let log_err = log
            .try_clone()
            .map_err(|e| spawn_err(format!("log {}: {e}", log_path.display())))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env("CONDUCTOR_PROJECT_ID", &task.project_id)
            .env("CONDUCTOR_ORDER_ID", &task.order_id)
            .env("CONDUCTOR_TASK_ID", &task.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        if let Some(dir) = &job.workdir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| spawn_err(e.to_string()))?;
        Ok(Spawned {
            child,
            log_offset,
            context,
        })
    }
}

struct Spawned {
    child: Child,
    log_offset: u64,
    context: Vec<u8>,
}

/// Log file location shared by the runner and the fault detector.
pub fn log_path_for(log_dir: &Path, project_id: &str, task_id: &str) -> PathBuf {
    log_dir.join(project_id).join(format!("{task_id}.log"))
}

/// Output written at or after byte `from`, capped to the last `max_bytes`
/// and lossily decoded. A file shorter than `from` was truncated and is
/// read from the start. None if unreadable.
pub async fn read_tail(path: &Path, from: u64, max_bytes: u64) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let len = bytes.len() as u64;
    let from = if from > len { 0 } else { from };
    let start = from.max(len.saturating_sub(max_bytes)) as usize;
    Some(String::from_utf8_lossy(&bytes[start..]).into_owned())
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

#[async_trait]
impl WorkerRunner for ProcessWorkerRunner {
    async fn run(&self, job: WorkerJob) -> Result<WorkerExit, SubprocessError> {
        let task = &job.task;
        let log_path = self.log_path(task);
        let started_at = Utc::now();

        let mut run = WorkerRun {
            id: Uuid::new_v4().to_string(),
            project_id: task.project_id.clone(),
            task_id: task.id.clone(),
            pid: None,
            log_path: Some(log_path.display().to_string()),
            log_offset: 0,
            outcome: WorkerOutcome::Running,
            exit_code: None,
            output_tail: None,
            started_at,
            last_heartbeat_at: started_at,
            finished_at: None,
        };

        let Spawned {
            mut child,
            log_offset,
            context,
        } = match self.spawn(&job, &log_path) {
            Ok(spawned) => spawned,
            Err(e) => {
                run.outcome = WorkerOutcome::SpawnFailed;
                run.output_tail = Some(e.to_string());
                run.finished_at = Some(Utc::now());
                if let Err(db_err) = self.db.insert_worker_run(&run).await {
                    warn!(task_id = %task.id, error = %db_err, "Failed to record spawn failure");
                }
                return Err(e);
            }
        };

        run.pid = child.id();
        run.log_offset = log_offset;
        if let Err(e) = self.db.insert_worker_run(&run).await {
            warn!(task_id = %task.id, error = %e, "Failed to record worker run");
        }
        info!(
            task_id = %task.id,
            project_id = %task.project_id,
            pid = ?run.pid,
            log = %log_path.display(),
            "Worker started"
        );

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&context).await {
                debug!(task_id = %task.id, error = %e, "Worker stdin closed early");
            }
            drop(stdin);
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let status = loop {
            tokio::select! {
                status = child.wait() => break Some(status),
                _ = &mut deadline => break None,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.db.touch_worker_run(&run.id).await {
                        warn!(run_id = %run.id, error = %e, "Failed to write worker heartbeat");
                    }
                }
            }
        };

        match status {
            Some(Ok(status)) if status.success() => {
                self.finish(&run, &log_path, WorkerOutcome::Succeeded, Some(0))
                    .await;
                info!(task_id = %task.id, "Worker exited cleanly");
                Ok(WorkerExit {
                    run_id: run.id,
                    log_path,
                })
            }
            Some(Ok(status)) => {
                self.finish(&run, &log_path, WorkerOutcome::Failed, status.code())
                    .await;
                warn!(task_id = %task.id, code = ?status.code(), "Worker exited with failure");
                Err(SubprocessError::NonZeroExit {
                    task_id: task.id.clone(),
                    code: status.code(),
                })
            }
            Some(Err(e)) => {
                self.finish(&run, &log_path, WorkerOutcome::Failed, None)
                    .await;
                Err(SubprocessError::Io(e))
            }
            None => {
                if let Err(e) = child.kill().await {
                    warn!(task_id = %task.id, error = %e, "Failed to kill timed-out worker");
                }
                self.finish(&run, &log_path, WorkerOutcome::TimedOut, None)
                    .await;
                warn!(task_id = %task.id, timeout = ?self.timeout, "Worker timed out");
                Err(SubprocessError::Timeout {
                    task_id: task.id.clone(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    async fn setup(script: &str) -> (Arc<dyn Database>, ProcessWorkerRunner, tempfile::TempDir) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessWorkerRunner::new(Arc::clone(&db), sh(script), dir.path().join("logs"));
        (db, runner, dir)
    }

    fn job(workdir: Option<PathBuf>) -> WorkerJob {
        WorkerJob {
            task: Task::new("p1", "O1", "T1", "Do the thing").with_files(["a.py"]),
            workdir,
        }
    }

    #[tokio::test]
    async fn clean_exit_records_success_and_log() {
        let (db, runner, dir) =
            setup("cat; echo; echo \"task=$CONDUCTOR_TASK_ID order=$CONDUCTOR_ORDER_ID\"").await;
        let exit = runner.run(job(Some(dir.path().to_path_buf()))).await.unwrap();

        let log = std::fs::read_to_string(&exit.log_path).unwrap();
        assert!(log.contains("\"task_id\":\"T1\""));
        assert!(log.contains("task=T1 order=O1"));

        let run = db.latest_worker_run("p1", "T1").await.unwrap().unwrap();
        assert_eq!(run.outcome, WorkerOutcome::Succeeded);
        assert_eq!(run.exit_code, Some(0));
        assert!(run.pid.is_some());
    }

    #[tokio::test]
    async fn runs_in_project_root() {
        let (_db, runner, dir) = setup("pwd").await;
        let root = dir.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let exit = runner.run(job(Some(root.clone()))).await.unwrap();
        let log = std::fs::read_to_string(&exit.log_path).unwrap();
        let expected = root.canonicalize().unwrap();
        assert_eq!(
            PathBuf::from(log.trim()).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let (db, runner, _dir) = setup("echo boom >&2; exit 3").await;
        let err = runner.run(job(None)).await.unwrap_err();
        assert!(matches!(
            err,
            SubprocessError::NonZeroExit { code: Some(3), .. }
        ));

        let run = db.latest_worker_run("p1", "T1").await.unwrap().unwrap();
        assert_eq!(run.outcome, WorkerOutcome::Failed);
        assert_eq!(run.exit_code, Some(3));
        assert!(run.output_tail.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn timeout_kills_worker() {
        let (db, runner, _dir) = setup("sleep 10").await;
        let runner = runner.with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = runner.run(job(None)).await.unwrap_err();
        assert!(matches!(err, SubprocessError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));

        let run = db.latest_worker_run("p1", "T1").await.unwrap().unwrap();
        assert_eq!(run.outcome, WorkerOutcome::TimedOut);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessWorkerRunner::new(
            Arc::clone(&db),
            vec!["/nonexistent/worker-binary".into()],
            dir.path().to_path_buf(),
        );
        let err = runner.run(job(None)).await.unwrap_err();
        assert!(matches!(err, SubprocessError::Spawn { .. }));

        let run = db.latest_worker_run("p1", "T1").await.unwrap().unwrap();
        assert_eq!(run.outcome, WorkerOutcome::SpawnFailed);
    }

    #[tokio::test]
    async fn unopenable_log_is_recorded_as_spawn_failure() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the log directory should be.
        let blocker = dir.path().join("logs");
        std::fs::write(&blocker, "").unwrap();
        let runner = ProcessWorkerRunner::new(Arc::clone(&db), sh("exit 0"), blocker);

        let err = runner.run(job(None)).await.unwrap_err();
        assert!(matches!(err, SubprocessError::Spawn { .. }));

        let run = db.latest_worker_run("p1", "T1").await.unwrap().unwrap();
        assert_eq!(run.outcome, WorkerOutcome::SpawnFailed);
        assert!(run.finished_at.is_some());
        assert!(run.output_tail.unwrap().contains("log"));
    }

    #[tokio::test]
    async fn each_run_tails_only_its_own_output() {
        let (db, runner, _dir) = setup("echo \"first run\"; exit 1").await;
        runner.run(job(None)).await.unwrap_err();
        let first = db.latest_worker_run("p1", "T1").await.unwrap().unwrap();
        assert_eq!(first.log_offset, 0);

        let retry = ProcessWorkerRunner::new(
            Arc::clone(&db),
            sh("cat > /dev/null; echo \"second run\""),
            runner.log_dir.clone(),
        );
        retry.run(job(None)).await.unwrap();

        let second = db.latest_worker_run("p1", "T1").await.unwrap().unwrap();
        assert_ne!(second.id, first.id);
        assert!(second.log_offset > 0);
        let tail = second.output_tail.unwrap();
        assert!(tail.contains("second run"));
        assert!(!tail.contains("first run"));
    }

    #[tokio::test]
    async fn read_tail_respects_offset_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        std::fs::write(&path, "old panic\nnew output\n").unwrap();

        assert_eq!(read_tail(&path, 10, 1024).await.unwrap(), "new output\n");
        assert_eq!(read_tail(&path, 0, 7).await.unwrap(), "output\n");
        // Offset past the end means the file was truncated since.
        assert_eq!(read_tail(&path, 4096, 1024).await.unwrap().len(), 21);
        assert!(read_tail(&dir.path().join("missing.log"), 0, 10).await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_advances_while_running() {
        let (db, runner, _dir) = setup("sleep 0.5").await;
        let runner = runner.with_heartbeat_interval(Duration::from_millis(100));
        runner.run(job(None)).await.unwrap();

        let run = db.latest_worker_run("p1", "T1").await.unwrap().unwrap();
        assert!(run.last_heartbeat_at > run.started_at);
    }

    #[test]
    fn log_path_layout() {
        let path = log_path_for(Path::new("/logs"), "p1", "T7");
        assert_eq!(path, PathBuf::from("/logs/p1/T7.log"));
    }
}
