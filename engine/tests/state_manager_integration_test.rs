/// Integration tests for the state store
///
/// Tests the durable side of the orchestrator:
/// - Database creation, WAL mode and schema
/// - Task state round trips and status updates
/// - Restart recovery through a fresh StateManager on the same file
/// - Checkpoint ordering and specialist metrics
use kommandant_engine::db::{CheckpointType, Database, StateManager, TaskState, TaskStatus};
use serde_json::json;
use tempfile::TempDir;

async fn open(dir: &TempDir) -> StateManager {
    StateManager::open(&dir.path().join("kommandant.db"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_database_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("kommandant.db");

    let db = Database::new(&db_path).await.unwrap();
    assert!(db_path.exists());

    // WAL file appears once WAL mode is enabled
    assert!(temp_dir.path().join("kommandant.db-wal").exists());

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap();
    for table in [
        "audit_log",
        "experiences",
        "specialist_metrics",
        "state_checkpoints",
        "task_executions",
        "task_type_confidence",
    ] {
        assert!(tables.contains(&table.to_string()), "missing table {}", table);
    }

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_task_state_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let state = open(&temp_dir).await;

    let mut task = TaskState::new("task-1", "kommandant_1", "Analysér dette dokument");
    task.room_id = Some(1);
    task.context = json!({"context_id": "chat-9", "priority": 3});
    task.metadata = json!({"source": "test"});
    state.save_task_state(&task).await.unwrap();

    let loaded = state.get_task_state("task-1").await.unwrap().unwrap();
    assert_eq!(loaded, task);

    // Saving again replaces the record
    task.status = TaskStatus::Running;
    task.started_at = Some(1_700_000_000_000);
    task.errors.push("first attempt failed".to_string());
    state.save_task_state(&task).await.unwrap();

    let loaded = state.get_task_state("task-1").await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Running);
    assert_eq!(loaded.errors, vec!["first attempt failed".to_string()]);
}

#[tokio::test]
async fn test_missing_task_is_none() {
    let temp_dir = TempDir::new().unwrap();
    let state = open(&temp_dir).await;

    assert!(state.get_task_state("nope").await.unwrap().is_none());
    assert!(!state
        .update_task_status("nope", TaskStatus::Failed, Some("boom"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_status_update_sets_completion_and_error() {
    let temp_dir = TempDir::new().unwrap();
    let state = open(&temp_dir).await;

    state
        .save_task_state(&TaskState::new("t", "owner", "p"))
        .await
        .unwrap();
    assert!(state
        .update_task_status("t", TaskStatus::Failed, Some("specialist crashed"))
        .await
        .unwrap());

    let loaded = state.get_task_state("t").await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Failed);
    assert!(loaded.completed_at.is_some());
    assert!(loaded.errors.contains(&"specialist crashed".to_string()));
}

#[tokio::test]
async fn test_restart_recovers_interrupted_tasks() {
    let temp_dir = TempDir::new().unwrap();

    {
        let state = open(&temp_dir).await;
        let mut running = TaskState::new("running", "kommandant_1", "p1");
        running.status = TaskStatus::Running;
        running.started_at = Some(10);
        let pending = TaskState::new("pending", "kommandant_1", "p2");
        let mut done = TaskState::new("done", "kommandant_1", "p3");
        done.status = TaskStatus::Completed;
        let mut other_owner = TaskState::new("elsewhere", "kommandant_2", "p4");
        other_owner.status = TaskStatus::Running;

        for task in [&running, &pending, &done, &other_owner] {
            state.save_task_state(task).await.unwrap();
        }
        state.close().await.unwrap();
    }

    // A fresh manager stands in for the restarted process
    let state = open(&temp_dir).await;
    let mut recovered: Vec<String> = state
        .recover_interrupted_tasks("kommandant_1")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.task_id)
        .collect();
    recovered.sort();
    assert_eq!(recovered, vec!["pending".to_string(), "running".to_string()]);

    let active_everywhere = state.get_active_tasks(None).await.unwrap();
    assert_eq!(active_everywhere.len(), 3);
}

#[tokio::test]
async fn test_checkpoints_newest_first() {
    let temp_dir = TempDir::new().unwrap();
    let state = open(&temp_dir).await;
    state
        .save_task_state(&TaskState::new("t", "owner", "p"))
        .await
        .unwrap();

    state
        .create_checkpoint("t", CheckpointType::TaskStart, json!({"step": 0}), "start")
        .await
        .unwrap();
    state
        .create_checkpoint(
            "t",
            CheckpointType::DelegationStart,
            json!({"step": 1}),
            "delegating",
        )
        .await
        .unwrap();
    state
        .create_checkpoint("t", CheckpointType::TaskComplete, json!({"step": 2}), "done")
        .await
        .unwrap();

    let checkpoints = state.get_checkpoints("t", 10).await.unwrap();
    assert_eq!(checkpoints.len(), 3);
    assert_eq!(checkpoints[0].checkpoint_type, CheckpointType::TaskComplete);
    assert_eq!(checkpoints[2].checkpoint_type, CheckpointType::TaskStart);

    let latest = state.get_latest_checkpoint("t").await.unwrap().unwrap();
    assert_eq!(latest.message, "done");

    let task = state.get_task_state("t").await.unwrap().unwrap();
    assert_eq!(task.last_checkpoint_at, Some(latest.created_at));

    assert_eq!(state.get_checkpoints("t", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_learned_confidence_survives_restart() {
    let temp_dir = TempDir::new().unwrap();

    {
        let state = open(&temp_dir).await;
        state
            .save_confidence("kommandant_1", "document_analysis", 0.75)
            .await
            .unwrap();
        state
            .save_confidence("kommandant_1", "document_analysis", 0.8)
            .await
            .unwrap();
        state
            .save_confidence("kommandant_2", "research", 0.3)
            .await
            .unwrap();
        state.close().await.unwrap();
    }

    let state = open(&temp_dir).await;
    let confidences = state.load_confidences("kommandant_1").await.unwrap();
    assert_eq!(confidences.len(), 1);
    assert!((confidences["document_analysis"] - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn test_stats_count_everything() {
    let temp_dir = TempDir::new().unwrap();
    let state = open(&temp_dir).await;

    let mut done = TaskState::new("a", "o", "p");
    done.status = TaskStatus::Completed;
    state.save_task_state(&done).await.unwrap();
    state
        .save_task_state(&TaskState::new("b", "o", "p"))
        .await
        .unwrap();
    state
        .create_checkpoint("a", CheckpointType::TaskComplete, json!({}), "done")
        .await
        .unwrap();

    let stats = state.stats().await.unwrap();
    assert_eq!(stats.total_tasks, 2);
    assert_eq!(stats.tasks_by_status.get("completed"), Some(&1));
    assert_eq!(stats.tasks_by_status.get("pending"), Some(&1));
    assert_eq!(stats.checkpoints, 1);
    assert_eq!(stats.experiences, 0);
}
