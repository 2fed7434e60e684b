//! Integration tests for the orchestration core.
//!
//! Each test opens the same database file through separate backends, the
//! way independent orchestrator processes would, and drives real `sh`
//! workers through the launcher.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use conductor::error::LockError;
use conductor::escalation::{EscalationFilter, EscalationRecorder, EscalationType};
use conductor::faults::{FaultDetector, FaultKind};
use conductor::locks::LockManager;
use conductor::model::{Order, OrderStatus, Project, Role, Task, TaskStatus};
use conductor::safety::check_worker_safety;
use conductor::scheduler::{Launcher, ProcessWorkerRunner};
use conductor::store::{Database, LibSqlBackend};
use conductor::transitions::{RuleStore, TransitionEngine};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

async fn open(path: &Path) -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_local(path).await.unwrap())
}

async fn seed(db: &Arc<dyn Database>, root: &Path, tasks: Vec<Task>) {
    db.insert_project(&Project::new("p1", "Demo").with_root_path(root.display().to_string()))
        .await
        .unwrap();
    db.insert_order(&Order::new("p1", "O1", "Feature").with_status(OrderStatus::InProgress))
        .await
        .unwrap();
    for task in tasks {
        db.insert_task(&task).await.unwrap();
    }
}

fn launcher(
    db: &Arc<dyn Database>,
    engine: Arc<TransitionEngine>,
    script: &str,
    logs: &Path,
) -> Launcher {
    let runner = ProcessWorkerRunner::new(
        Arc::clone(db),
        vec!["sh".into(), "-c".into(), script.into()],
        logs.to_path_buf(),
    )
    .with_timeout(Duration::from_secs(10));
    Launcher::new(Arc::clone(db), engine, Arc::new(runner))
}

#[tokio::test]
async fn dependent_task_launches_after_its_dependency() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("conductor.db");
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();

        let db = open(&db_path).await;
        seed(
            &db,
            &root,
            vec![
                Task::new("p1", "O1", "T1", "models").with_files(["models.py"]),
                Task::new("p1", "O1", "T2", "views")
                    .with_files(["views.py"])
                    .with_depends_on(["T1"]),
            ],
        )
        .await;

        let engine = Arc::new(TransitionEngine::load(Arc::clone(&db)).await.unwrap());
        let launcher = launcher(
            &db,
            Arc::clone(&engine),
            "cat > /dev/null; touch \"$CONDUCTOR_TASK_ID.done\"",
            &dir.path().join("logs"),
        );

        let first = launcher.launch("p1", "O1", 3, false).await.unwrap();
        assert_eq!(first.launched_tasks, vec!["T1"]);
        assert_eq!(first.skipped[0].task_id, "T2");
        launcher.wait_all().await;

        assert!(root.join("T1.done").exists());
        let t1 = db.get_task("p1", "T1").await.unwrap().unwrap();
        assert_eq!(t1.status, TaskStatus::Done);

        let second = launcher.launch("p1", "O1", 3, false).await.unwrap();
        assert_eq!(second.launched_tasks, vec!["T2"]);
        launcher.wait_all().await;

        engine
            .transition_task("p1", "T1", TaskStatus::Completed, Role::Pm, "pm", None)
            .await
            .unwrap();

        assert_eq!(
            db.get_task("p1", "T2").await.unwrap().unwrap().status,
            TaskStatus::Done
        );
        assert!(db.list_locks(None).await.unwrap().is_empty());
        assert!(check_worker_safety(db.as_ref(), None).await.unwrap().safe);

        let history = engine
            .history(conductor::model::EntityType::Task, "p1", "T1")
            .await
            .unwrap();
        let path: Vec<&str> = history.iter().map(|h| h.to_status.as_str()).collect();
        assert_eq!(path, vec!["IN_PROGRESS", "DONE", "COMPLETED"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn separate_connections_share_locks() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("conductor.db");
        let first = open(&db_path).await;
        let second = open(&db_path).await;
        first.insert_project(&Project::new("p1", "Demo")).await.unwrap();

        let a = LockManager::new(Arc::clone(&first));
        let b = LockManager::new(Arc::clone(&second));

        let (left, right) = tokio::join!(
            a.acquire("p1", "T1", &["shared.py", "a.py"]),
            b.acquire("p1", "T2", &["b.py", "shared.py"]),
        );
        assert!(left.is_ok() != right.is_ok(), "exactly one task may win");
        let loser = if left.is_ok() { right } else { left };
        assert!(matches!(loser, Err(LockError::Conflict { ref path, .. }) if path == "shared.py"));

        // Nothing of the loser's request was written.
        let held = second.list_locks(Some("p1")).await.unwrap();
        assert_eq!(held.len(), 2);
        let winner = &held[0].task_id;
        assert!(held.iter().all(|l| &l.task_id == winner));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_worker_surfaces_as_crash_fault() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("conductor.db");
        let root = dir.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        let logs = dir.path().join("logs");

        let db = open(&db_path).await;
        seed(
            &db,
            &root,
            vec![Task::new("p1", "O1", "T1", "models").with_files(["models.py"])],
        )
        .await;

        let engine = Arc::new(TransitionEngine::load(Arc::clone(&db)).await.unwrap());
        let launcher = launcher(&db, engine, "echo 'boom' >&2; exit 3", &logs);
        launcher.launch("p1", "O1", 1, false).await.unwrap();
        launcher.wait_all().await;

        // The monitor runs as its own process.
        let monitor = open(&db_path).await;
        let task = monitor.get_task("p1", "T1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(monitor.list_locks(Some("p1")).await.unwrap().len(), 1);
        assert!(!check_worker_safety(monitor.as_ref(), Some("p1")).await.unwrap().safe);

        let rules = Arc::new(RuleStore::load(monitor.as_ref()).await.unwrap());
        let detector = FaultDetector::new(Arc::clone(&monitor), rules, logs);
        let reports = detector.detect_all(Some("p1")).await.unwrap();
        let crash = reports
            .iter()
            .find(|r| r.kind == FaultKind::SubagentCrash)
            .expect("crash reported");
        assert_eq!(crash.task_id.as_deref(), Some("T1"));

        let ids = detector.escalate(&reports).await.unwrap();
        assert!(!ids.is_empty());
        let again = detector.escalate(&reports).await.unwrap();
        assert!(again.is_empty());

        let stats = EscalationRecorder::new(monitor)
            .statistics(&EscalationFilter::for_project("p1"))
            .await
            .unwrap();
        assert_eq!(stats.by_type[EscalationType::SubagentCrash.as_str()], 1);
    })
    .await
    .expect("test timed out");
}
