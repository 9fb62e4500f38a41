use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::delete::delete_named;
use super::{Operation, OperationContext, Outcome, WorkerState};
use crate::http::computer;
use crate::metrics::names;
use crate::payload;
use crate::validation;

const NAME_PREFIX: &str = "PC-LOAD";

/// Insert one fresh record. Returns the name on success.
pub(crate) async fn insert(
    ctx: &OperationContext<'_>,
    state: &mut WorkerState,
    operation: &str,
) -> (Outcome, Option<String>) {
    let name = payload::unique_name(&mut state.rng, NAME_PREFIX);
    let body = payload::computer(&mut state.rng, &name);

    let exchange = ctx.send(operation, computer::create(body), |s| s == 201).await;
    ctx.metrics
        .trend(names::WRITE_LATENCY, exchange.latency_ms, &exchange.tags);

    let outcome = match exchange.response() {
        None => Outcome::TransportFailure,
        Some(response) => {
            let check = validation::created_with_id(response);
            if check.passed() {
                Outcome::Passed
            } else {
                debug!(
                    worker = ctx.worker_id,
                    status = response.status,
                    "Insert rejected: {}",
                    check.failure_reason().unwrap_or("unknown")
                );
                Outcome::ProtocolFailure
            }
        }
    };

    ctx.success(outcome.is_passed(), &exchange.tags);
    if outcome.is_passed() {
        ctx.metrics.add(names::INSERTED_TOTAL, 1, &exchange.tags);
        state.written.push(name.clone());
        (outcome, Some(name))
    } else {
        ctx.metrics.add(names::WRITE_ERRORS, 1, &exchange.tags);
        (outcome, None)
    }
}

/// `POST /computer` with a fresh unique name
pub struct Write;

#[async_trait]
impl Operation for Write {
    fn name(&self) -> &'static str {
        "write"
    }

    async fn execute(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome {
        insert(ctx, state, "insert").await.0
    }
}

/// Insert, wait `settle`, then delete what was inserted
pub struct WriteCleanup {
    pub settle: Duration,
}

#[async_trait]
impl Operation for WriteCleanup {
    fn name(&self) -> &'static str {
        "write_cleanup"
    }

    async fn execute(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome {
        let (outcome, name) = insert(ctx, state, "insert").await;
        let Some(name) = name else {
            return outcome;
        };
        // Cleaned up here, so don't leave it for a later delete
        state.written.take_named(&name);

        tokio::time::sleep(self.settle).await;
        delete_named(ctx, &name, "cleanup_delete").await
    }
}
