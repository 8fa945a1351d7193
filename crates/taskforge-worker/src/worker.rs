use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use taskforge_tasks::TaskStore;

use crate::dispatch::{Dispatcher, Outcome};
use crate::error::Result;

/// Polls the shared queue, claims one task at a time, executes it, and
/// settles the status.
pub struct Worker {
    worker_id: String,
    poll_interval: Duration,
    workspace: Option<String>,
    tasks: Arc<TaskStore>,
    dispatcher: Arc<Dispatcher>,
}

/// Host-derived default worker identity: `worker-{hostname}`.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("worker-{host}")
}

impl Worker {
    pub fn new(
        worker_id: Option<String>,
        poll_interval: Duration,
        workspace: Option<String>,
        tasks: Arc<TaskStore>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            worker_id: worker_id.unwrap_or_else(default_worker_id),
            poll_interval,
            workspace,
            tasks,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Try to claim and execute one task.
    ///
    /// Returns Ok(false) when the queue was empty. Execution failures
    /// settle the task as failed and still return Ok(true); only store
    /// errors bubble up.
    ///
    /// Dispatch runs on its own spawned task so that a panic anywhere in
    /// an executor (a poisoned store mutex included) surfaces as a
    /// JoinError here instead of unwinding the loop. Every claimed task
    /// settles; a panicked one must not be stranded in `running` with no
    /// retry path.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn process_one(&self) -> Result<bool> {
        let Some(task) = self.tasks.claim(&self.worker_id)? else {
            return Ok(false);
        };

        info!(task_id = task.id, kind = task.kind.as_str(), "processing task");

        let dispatcher = self.dispatcher.clone();
        let workspace = self.workspace.clone();
        let claimed = task.clone();
        let outcome = match tokio::spawn(async move {
            dispatcher.dispatch(&claimed, workspace.as_deref()).await
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = task.id, error = %e, "task execution panicked");
                Outcome::Failure(format!("task execution panicked: {e}"))
            }
        };

        match outcome {
            Outcome::Success(result) => {
                self.tasks.complete(task.id, Some(result))?;
                info!(task_id = task.id, "task completed");
            }
            Outcome::Failure(message) => {
                self.tasks.fail(task.id, &message)?;
                info!(task_id = task.id, error = %message, "task failed");
            }
        }
        Ok(true)
    }

    /// Poll until `shutdown` flips to true.
    ///
    /// The in-flight task always settles before shutdown is honored;
    /// store errors are logged and followed by a poll-interval sleep so a
    /// transient database hiccup doesn't spin the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            poll_interval_secs = self.poll_interval.as_secs(),
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_one().await {
                Ok(true) => {}
                Ok(false) => {
                    if self.idle_or_shutdown(&mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "worker loop error");
                    if self.idle_or_shutdown(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Sleep one poll interval, waking early on shutdown. Returns true
    /// when shutdown was requested.
    async fn idle_or_shutdown(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => false,
            _ = shutdown.changed() => *shutdown.borrow(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentMessage, AgentRequest, AgentRunner, ContentBlock};
    use async_trait::async_trait;
    use base64::Engine as _;
    use rusqlite::Connection;
    use taskforge_chats::ChatStore;
    use taskforge_events::EventBus;
    use taskforge_secrets::{MasterCipher, SecretsVault};
    use taskforge_tasks::{NewTask, TaskStatus};
    use tokio::sync::mpsc;

    struct OkRunner;

    #[async_trait]
    impl AgentRunner for OkRunner {
        async fn run(
            &self,
            _req: AgentRequest,
            tx: mpsc::Sender<AgentMessage>,
        ) -> crate::error::Result<()> {
            let _ = tx
                .send(AgentMessage::Assistant {
                    blocks: vec![ContentBlock::Text { text: "ok".into() }],
                })
                .await;
            let _ = tx
                .send(AgentMessage::Result {
                    input_tokens: 1,
                    output_tokens: 2,
                })
                .await;
            Ok(())
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl AgentRunner for FailingRunner {
        async fn run(
            &self,
            _req: AgentRequest,
            _tx: mpsc::Sender<AgentMessage>,
        ) -> crate::error::Result<()> {
            Err(crate::error::WorkerError::AgentProcess("kaput".into()))
        }
    }

    struct PanickingRunner;

    #[async_trait]
    impl AgentRunner for PanickingRunner {
        async fn run(
            &self,
            _req: AgentRequest,
            _tx: mpsc::Sender<AgentMessage>,
        ) -> crate::error::Result<()> {
            panic!("executor blew up");
        }
    }

    fn worker_with(runner: Arc<dyn AgentRunner>) -> (Worker, Arc<TaskStore>) {
        let key = base64::engine::general_purpose::STANDARD.encode([5u8; 32]);
        let cipher = MasterCipher::from_base64_key(&key).unwrap();
        let tasks = Arc::new(TaskStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let dispatcher = Dispatcher {
            vault: Arc::new(
                SecretsVault::new(Connection::open_in_memory().unwrap(), cipher).unwrap(),
            ),
            chats: Arc::new(ChatStore::new(Connection::open_in_memory().unwrap()).unwrap()),
            bus: Arc::new(EventBus::new(Connection::open_in_memory().unwrap()).unwrap()),
            runner,
            model: "m".to_string(),
            script_timeout: Duration::from_secs(5),
            database_url: String::new(),
        };
        let worker = Worker::new(
            Some("worker-test".to_string()),
            Duration::from_millis(10),
            None,
            tasks.clone(),
            dispatcher,
        );
        (worker, tasks)
    }

    #[tokio::test]
    async fn process_one_returns_false_on_empty_queue() {
        let (worker, _tasks) = worker_with(Arc::new(OkRunner));
        assert!(!worker.process_one().await.unwrap());
    }

    #[tokio::test]
    async fn process_one_completes_successful_task() {
        let (worker, tasks) = worker_with(Arc::new(OkRunner));
        let id = tasks.create(NewTask::agent("hi")).unwrap();

        assert!(worker.process_one().await.unwrap());

        let task = tasks.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.claimed_by.as_deref(), Some("worker-test"));
        assert!(task.completed_at.is_some());
        let result = task.result.unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["output"], "ok");
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn process_one_settles_failures() {
        let (worker, tasks) = worker_with(Arc::new(FailingRunner));
        let id = tasks.create(NewTask::agent("hi")).unwrap();

        assert!(worker.process_one().await.unwrap());

        let task = tasks.get(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("kaput"));
        assert!(task.result.is_none());
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn panicking_execution_still_settles_the_task() {
        let key = base64::engine::general_purpose::STANDARD.encode([5u8; 32]);
        let cipher = MasterCipher::from_base64_key(&key).unwrap();
        let tasks = Arc::new(TaskStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let chats = Arc::new(ChatStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let dispatcher = Dispatcher {
            vault: Arc::new(
                SecretsVault::new(Connection::open_in_memory().unwrap(), cipher).unwrap(),
            ),
            chats: chats.clone(),
            bus: Arc::new(EventBus::new(Connection::open_in_memory().unwrap()).unwrap()),
            runner: Arc::new(PanickingRunner),
            model: "m".to_string(),
            script_timeout: Duration::from_secs(5),
            database_url: String::new(),
        };
        let worker = Worker::new(
            Some("worker-test".to_string()),
            Duration::from_millis(10),
            None,
            tasks.clone(),
            dispatcher,
        );

        // Both the chat-bound and one-shot agent paths must settle.
        let chat = chats
            .create_chat(taskforge_chats::NewChat::new("acme", "sys"))
            .unwrap();
        let bound = tasks
            .create(NewTask::agent("hi").with_chat(chat))
            .unwrap();
        let one_shot = tasks.create(NewTask::agent("hi")).unwrap();

        assert!(worker.process_one().await.unwrap());
        assert!(worker.process_one().await.unwrap());

        for id in [bound, one_shot] {
            let task = tasks.get(id).unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert!(task.error.as_deref().unwrap().contains("panic"));
            assert!(task.completed_at.is_some());
        }
    }

    #[tokio::test]
    async fn run_drains_queue_and_honors_shutdown() {
        let (worker, tasks) = worker_with(Arc::new(OkRunner));
        for _ in 0..3 {
            tasks.create(NewTask::agent("work")).unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        // Give the loop time to drain, then stop it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();

        assert_eq!(tasks.list(Some(TaskStatus::Completed), 10).unwrap().len(), 3);
        assert!(tasks.list(Some(TaskStatus::Pending), 10).unwrap().is_empty());
    }

    #[test]
    fn default_worker_id_has_host_prefix() {
        assert!(default_worker_id().starts_with("worker-"));
    }
}
