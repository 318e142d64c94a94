//! Submission → offline queue → reconnect drain, end to end: a task
//! submitted while the target agent is offline lands in the offline queue,
//! and a subsequent reconnect drains it in order without duplication.

use taskmesh::config::{GatewayConfig, Tunables};
use taskmesh::gateway::Gateway;
use taskmesh::models::{ChatOrigin, Task};
use taskmesh::queue::OfflineQueueStore;
use taskmesh::Result;
use std::sync::Arc;

struct NoopChatClient;

#[async_trait::async_trait]
impl taskmesh::chat::ChatClient for NoopChatClient {
    async fn post(&self, _origin: &ChatOrigin, _text: &str) -> Result<String> {
        Ok("msg-1".to_string())
    }

    async fn edit(&self, _origin: &ChatOrigin, _message_id: &str, _text: &str) -> Result<()> {
        Ok(())
    }
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        api_key: "a".repeat(32),
        allowed_origins: vec!["http://localhost".into()],
        tunables: Tunables::default(),
    }
}

fn sample_task(agent_id: &str) -> Task {
    Task::new(
        "proj-1".into(),
        agent_id.into(),
        "bot".into(),
        "implement".into(),
        "do the thing".into(),
        10.0,
        ChatOrigin {
            channel_id: "c1".into(),
            thread_ts: None,
            user_id: "u1".into(),
            message_ts: None,
        },
        "/work/proj-1".into(),
        None,
        None,
        vec![],
    )
}

#[tokio::test]
async fn task_submitted_to_offline_agent_is_queued_not_delivered() {
    let gateway = Gateway::new(test_config(), Arc::new(NoopChatClient));
    let task = sample_task("agent-offline");

    let delivered = gateway.submit(task).await.unwrap();

    assert!(!delivered, "no live connection exists for this agent");
    let pending = gateway.queue.find_pending("agent-offline").await.unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn reconnect_drains_queued_tasks_in_order() {
    let gateway = Arc::new(Gateway::new(test_config(), Arc::new(NoopChatClient)));
    gateway.spawn_background_loops();

    gateway.submit(sample_task("agent-a")).await.unwrap();
    gateway.submit(sample_task("agent-a")).await.unwrap();
    assert_eq!(
        gateway.queue.find_pending("agent-a").await.unwrap().len(),
        2
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    gateway.agents.register("agent-a", tx).await;

    // Give the background queue-drain listener a chance to run.
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        let mut received = 0;
        while received < 2 {
            if rx.recv().await.is_some() {
                received += 1;
            }
        }
    })
    .await
    .expect("queued envelopes were not drained on reconnect");

    assert!(gateway.queue.find_pending("agent-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn live_agent_receives_task_directly_without_queueing() {
    let gateway = Gateway::new(test_config(), Arc::new(NoopChatClient));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    gateway.agents.register("agent-live", tx).await;

    let delivered = gateway.submit(sample_task("agent-live")).await.unwrap();

    assert!(delivered);
    assert!(gateway
        .queue
        .find_pending("agent-live")
        .await
        .unwrap()
        .is_empty());
    assert!(rx.recv().await.is_some());
}
