//! Cold-submit scenario: create a chat, POST a message, let the worker
//! claim and execute the turn with a scripted agent, and read the two
//! persisted messages back through the API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tokio::sync::{mpsc, watch};
use tower::ServiceExt;

use taskforge_chats::ChatStore;
use taskforge_core::config::{
    AgentConfig, DatabaseConfig, SecretsConfig, ServerConfig, WorkerConfig,
};
use taskforge_core::{db, ForgeConfig};
use taskforge_events::EventBus;
use taskforge_gateway::{build_router, AppState};
use taskforge_secrets::{MasterCipher, SecretsVault};
use taskforge_tasks::{TaskStatus, TaskStore};
use taskforge_worker::{
    AgentMessage, AgentRequest, AgentRunner, ContentBlock, Dispatcher, Worker,
};

struct PongRunner;

#[async_trait]
impl AgentRunner for PongRunner {
    async fn run(
        &self,
        _req: AgentRequest,
        tx: mpsc::Sender<AgentMessage>,
    ) -> taskforge_worker::Result<()> {
        let _ = tx
            .send(AgentMessage::Assistant {
                blocks: vec![ContentBlock::Text {
                    text: "pong".to_string(),
                }],
            })
            .await;
        let _ = tx
            .send(AgentMessage::Result {
                input_tokens: 12,
                output_tokens: 3,
            })
            .await;
        Ok(())
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body)
}

#[tokio::test]
async fn submitted_turn_lands_as_two_sequenced_messages() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forge.db").to_str().unwrap().to_string();

    let tasks = Arc::new(TaskStore::new(db::open(&path).unwrap()).unwrap());
    let chats = Arc::new(ChatStore::new(db::open(&path).unwrap()).unwrap());
    let bus = Arc::new(EventBus::new(db::open(&path).unwrap()).unwrap());
    let key = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode([1u8; 32])
    };
    let vault = Arc::new(
        SecretsVault::new(
            db::open(&path).unwrap(),
            MasterCipher::from_base64_key(&key).unwrap(),
        )
        .unwrap(),
    );

    let config = ForgeConfig {
        database: DatabaseConfig { url: path.clone() },
        server: ServerConfig::default(),
        worker: WorkerConfig::default(),
        agent: AgentConfig::default(),
        secrets: SecretsConfig { master_key: key },
    };

    let dispatcher = Dispatcher {
        vault,
        chats: chats.clone(),
        bus: bus.clone(),
        runner: Arc::new(PongRunner),
        model: "scripted".to_string(),
        script_timeout: Duration::from_secs(5),
        database_url: path.clone(),
    };
    let worker = Worker::new(
        Some("worker-e2e".to_string()),
        Duration::from_millis(20),
        None,
        tasks.clone(),
        dispatcher,
    );

    let state = Arc::new(AppState {
        config,
        tasks: tasks.clone(),
        chats,
        bus,
    });
    let app = build_router(state);

    let (_, body) = send(
        &app,
        Request::post("/chats")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"tenant": "acme", "system_prompt": "hi"}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    let chat_id = body["id"].as_i64().unwrap();

    let (status, body) = send(
        &app,
        Request::post(format!("/chats/{chat_id}/messages"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"content": "ping"}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task_id"].as_i64().unwrap();

    // Drive the worker until the task terminates.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(shutdown_rx));
    let mut settled = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let task = tasks.get(task_id).unwrap().unwrap();
        if task.status.is_terminal() {
            assert_eq!(task.status, TaskStatus::Completed);
            settled = true;
            break;
        }
    }
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    assert!(settled, "task never terminated");

    let (status, body) = send(
        &app,
        Request::get(format!("/chats/{chat_id}/messages"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = body.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["sequence"], 1);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "ping");
    assert_eq!(messages[1]["sequence"], 2);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "pong");
    assert_eq!(messages[1]["tokens_input"], 12);
    assert_eq!(messages[1]["tokens_output"], 3);

    // The chat is free for the next turn.
    let (status, _) = send(
        &app,
        Request::post(format!("/chats/{chat_id}/messages"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"content": "again"}).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}
