//! Runs the steps of one tasked job.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::JobScheduler;
use crate::error::StepError;
use crate::state_machine::{Job, JobId, JobOutcome, StepContext, StepPayload, StepResult, StepSpec};

/// Run `job` to an outcome and hand it back to the scheduler.
pub(super) async fn execute(scheduler: Arc<JobScheduler>, job: Job, cancel: CancellationToken) -> JobId {
    let outcome = run_steps(&scheduler, &job, &cancel).await;
    scheduler.finish_job(job.id, outcome);
    job.id
}

async fn run_steps(scheduler: &JobScheduler, job: &Job, cancel: &CancellationToken) -> JobOutcome {
    let class = match scheduler.registry.job_class(&job.spec.class_name) {
        Ok(class) => class.clone(),
        Err(e) => return JobOutcome::Errored(e.to_string()),
    };
    let steps = match class.get_steps(&job.spec, scheduler.store.as_ref()) {
        Ok(steps) => steps,
        Err(e) => {
            error!(job_id = job.id, error = %e, "could not build steps");
            return JobOutcome::Errored(format!("{e:#}"));
        }
    };
    info!(
        job_id = job.id,
        class = %job.spec.class_name,
        steps = steps.len(),
        "job started"
    );

    let retry = scheduler.config.retry();
    let count = steps.len();
    let mut prev_result: Option<Value> = None;
    for (index, spec) in steps.iter().enumerate() {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return JobOutcome::Cancelled;
            }
            match run_step(scheduler, job.id, spec, index, count, prev_result.clone(), cancel).await {
                Ok(value) => {
                    prev_result = Some(value);
                    break;
                }
                Err(StepError::Cancelled) => {
                    info!(job_id = job.id, step = index, "step cancelled");
                    return JobOutcome::Cancelled;
                }
                Err(e) if spec.step.idempotent() && attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        job_id = job.id,
                        step = index,
                        attempt,
                        max = retry.max_retries,
                        delay_ms = delay,
                        error = %e,
                        "idempotent step failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        _ = cancel.cancelled() => return JobOutcome::Cancelled,
                    }
                }
                Err(e) => {
                    error!(job_id = job.id, step = index, error = %e, "step failed");
                    return JobOutcome::Errored(e.to_string());
                }
            }
        }
    }
    JobOutcome::Success
}

/// One attempt at one step, recorded as its own `StepResult` row.
async fn run_step(
    scheduler: &JobScheduler,
    job_id: JobId,
    spec: &StepSpec,
    index: usize,
    count: usize,
    prev_result: Option<Value>,
    cancel: &CancellationToken,
) -> Result<Value, StepError> {
    let pool = if spec.step.database() {
        &scheduler.db_pool
    } else {
        &scheduler.general_pool
    };
    let _permit = tokio::select! {
        permit = pool.acquire() => permit.map_err(|_| StepError::Cancelled)?,
        _ = cancel.cancelled() => return Err(StepError::Cancelled),
    };

    let store = scheduler.store.as_ref();
    let payload = StepPayload::new(spec.step.name(), &spec.args);
    let mut result = StepResult::start(store.next_step_result_id(), job_id, payload, index, count);
    if let Err(e) = store.save_step_result(&result) {
        warn!(job_id, step = index, error = %e, "could not record step start");
    }

    let ctx = StepContext::new(
        job_id,
        index,
        count,
        prev_result,
        cancel.clone(),
        scheduler.messenger.clone(),
        scheduler.store.clone(),
    );
    debug!(job_id, step = index, "{}", spec.step.describe(&spec.args));
    let outcome = spec.step.run(&ctx, &spec.args).await;

    result.finish(ctx.take_output(), &outcome);
    if let Err(e) = store.save_step_result(&result) {
        warn!(job_id, step = index, error = %e, "could not record step result");
    }
    outcome
}
