//! Agent process: connects out to the gateway, admits and runs tasks.

pub mod circuit_breaker;
pub mod cli_invoker;
pub mod connection;
pub mod executor;
pub mod llm;

use crate::config::AgentConfig;
use crate::envelope::{self, EnvelopeType};
use connection::AgentConnection;
use executor::{ExecutorConfig, TaskExecutor};
use llm::LlmInvoker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

pub struct Agent {
    connection: Arc<AgentConnection>,
    executor: Arc<TaskExecutor>,
}

impl Agent {
    pub fn new(config: AgentConfig, llm: Arc<dyn LlmInvoker>) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let executor_config = ExecutorConfig {
            max_concurrent_tasks: config.tunables.max_concurrent_tasks,
            max_continuations: config.tunables.max_continuations,
            max_turns_per_invocation: config.tunables.max_turns_per_invocation,
            project_roots: config.project_roots.clone(),
            task_timeout_ms: config.tunables.task_timeout_ms,
        };
        let executor = TaskExecutor::new(executor_config, llm, outbound_tx);
        let connection = Arc::new(AgentConnection::new(config));

        (
            Self {
                connection,
                executor,
            },
            outbound_rx,
        )
    }

    /// Run the connection loop and the inbound-dispatch loop concurrently.
    /// Never returns under normal operation.
    pub async fn run(self: Arc<Self>, outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let connection = self.connection.clone();
        let conn_task = tokio::spawn(async move {
            connection.run(outbound_rx, inbound_tx).await;
        });

        let dispatch_task = {
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(bytes) = inbound_rx.recv().await {
                    if let Err(e) = this.handle_inbound(&bytes).await {
                        warn!(error = %e, "failed to handle inbound envelope");
                    }
                }
            })
        };

        let _ = tokio::join!(conn_task, dispatch_task);
    }

    async fn handle_inbound(&self, bytes: &[u8]) -> crate::Result<()> {
        let envelope = envelope::decode(bytes)?;
        match EnvelopeType::parse(&envelope.kind) {
            Some(EnvelopeType::TaskSubmit) => {
                let submit: envelope::TaskSubmit = envelope::decode_payload(&envelope)?;
                self.executor.submit(submit).await
            }
            Some(EnvelopeType::TaskCancel) => {
                let cancel: envelope::TaskCancel = envelope::decode_payload(&envelope)?;
                self.executor.cancel(&cancel.task_id, &cancel.reason).await
            }
            Some(EnvelopeType::HeartbeatPing) | Some(EnvelopeType::HeartbeatPong) => Ok(()),
            Some(EnvelopeType::SystemRestart) => {
                warn!("gateway requested restart");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
