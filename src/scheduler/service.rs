//! Wires the scheduler, the agent messenger and its RX loop, the loopback
//! agent and the notification worker into one running service.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::JobScheduler;
use crate::agent_rpc::{AgentMessenger, LoopbackAgent, LoopbackHandle};
use crate::config::SchedulerConfig;
use crate::error::JobPlanError;
use crate::state_machine::{Command, CommandId, Registry};
use crate::store::Store;

pub struct Service {
    pub scheduler: Arc<JobScheduler>,
    pub agent: LoopbackHandle,
    shutdown: CancellationToken,
    tasks: JoinSet<Result<(), JobPlanError>>,
}

impl Service {
    /// Recover leftovers from a previous run, then start every task. Must
    /// be called inside a tokio runtime.
    pub fn start(
        registry: Registry,
        store: Arc<dyn Store>,
        config: SchedulerConfig,
        agent: LoopbackAgent,
    ) -> Result<Self, JobPlanError> {
        let shutdown = CancellationToken::new();
        let (messenger, queue) = AgentMessenger::new(&config);
        let (inbound, rx_task) = messenger.spawn_rx(config.tx_queue_capacity, shutdown.clone());
        let (agent, agent_task) = agent.spawn(inbound, queue, config.max_batch_bytes, shutdown.clone());

        let scheduler = JobScheduler::new(Arc::new(registry), store, messenger, config, shutdown.clone());
        let recovered = scheduler.recover()?;
        if recovered > 0 {
            info!(recovered, "closed jobs left over from previous run");
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(scheduler.clone().run());
        let notifications = scheduler.clone();
        tasks.spawn(async move {
            notifications.run_notifications().await;
            Ok(())
        });
        tasks.spawn(watch_task("agent rx", rx_task));
        tasks.spawn(watch_task("loopback agent", agent_task));

        Ok(Self {
            scheduler,
            agent,
            shutdown,
            tasks,
        })
    }

    /// Wait for command `id` to complete. Fails early if any service task
    /// stops first.
    pub async fn await_command(&mut self, id: CommandId) -> Result<Command, JobPlanError> {
        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown.clone();
        tokio::select! {
            command = scheduler.await_command(id) => command,
            Some(joined) = self.tasks.join_next() => {
                let err = match joined {
                    Ok(Ok(())) => JobPlanError::WorkerPanic("service task exited early".into()),
                    Ok(Err(e)) => e,
                    Err(e) => JobPlanError::WorkerPanic(e.to_string()),
                };
                error!(error = %err, "service task failed");
                shutdown.cancel();
                Err(err)
            }
        }
    }

    /// Stop every task and wait for them. Returns the first failure.
    pub async fn shutdown(mut self) -> Result<(), JobPlanError> {
        self.shutdown.cancel();
        let mut result = Ok(());
        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => JobPlanError::WorkerPanic(e.to_string()),
            };
            error!(error = %failure, "service task failed");
            if result.is_ok() {
                result = Err(failure);
            }
        }
        info!("service stopped");
        result
    }
}

async fn watch_task(name: &'static str, handle: JoinHandle<()>) -> Result<(), JobPlanError> {
    handle.await.map_err(|e| {
        error!(task = name, error = %e, "task panicked");
        JobPlanError::WorkerPanic(format!("{name}: {e}"))
    })
}
