//! In-process task client.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use super::{RunSnapshot, TaskClient, TaskError, TaskHandler};

type Runs = Arc<Mutex<HashMap<String, RunSnapshot>>>;

/// Runs each triggered task on its own tokio task.
pub(crate) struct InlineTaskClient {
    handler: Arc<dyn TaskHandler>,
    runs: Runs,
}

impl InlineTaskClient {
    pub(crate) fn new(handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            handler,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl TaskClient for InlineTaskClient {
    async fn trigger(&self, task: &str, payload: Value) -> Result<String, TaskError> {
        if !self.handler.handles(task) {
            return Err(TaskError::unknown_task(task));
        }

        let run_id = format!("run_{}", Uuid::new_v4().simple());
        self.runs
            .lock()
            .await
            .insert(run_id.clone(), RunSnapshot::queued());

        tokio::spawn(execute(
            self.handler.clone(),
            self.runs.clone(),
            run_id.clone(),
            task.to_string(),
            payload,
        ));
        Ok(run_id)
    }

    async fn retrieve(&self, run_id: &str) -> Result<RunSnapshot, TaskError> {
        self.runs
            .lock()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| TaskError::client(format!("unknown run {run_id}")))
    }
}

/// Drives one run to a terminal status. A panic in the handler is `Crashed`.
async fn execute(handler: Arc<dyn TaskHandler>, runs: Runs, run_id: String, task: String, payload: Value) {
    transition(&runs, &run_id, RunSnapshot::executing()).await;

    let job = {
        let task = task.clone();
        tokio::spawn(async move { handler.handle(&task, payload).await })
    };

    let snapshot = match job.await {
        Ok(Ok(output)) => RunSnapshot::completed(output),
        Ok(Err(e)) => {
            warn!("Run {} of {} failed: {}", run_id, task, e);
            RunSnapshot::failed(failure_message(e))
        }
        Err(e) if e.is_panic() => {
            error!("Run {} of {} crashed", run_id, task);
            RunSnapshot::crashed("task handler panicked")
        }
        Err(e) => RunSnapshot::crashed(e.to_string()),
    };

    transition(&runs, &run_id, snapshot).await;
}

/// Terminal snapshots are final.
async fn transition(runs: &Runs, run_id: &str, next: RunSnapshot) {
    let mut runs = runs.lock().await;
    match runs.get(run_id) {
        Some(current) if current.status.is_terminal() => {
            warn!("Run {} is already {:?}, ignoring {:?}", run_id, current.status, next.status);
        }
        _ => {
            runs.insert(run_id.to_string(), next);
        }
    }
}

/// Terminal-failure errors already carry the task name; keep only their text.
fn failure_message(error: TaskError) -> String {
    match error {
        TaskError::TaskFailed { message, .. } | TaskError::TaskCrashed { message, .. } => message,
        other => other.to_string(),
    }
}
