use async_trait::async_trait;
use tracing::debug;

use super::{Operation, OperationContext, Outcome, WorkerState};
use crate::http::computer;
use crate::metrics::names;
use crate::validation::DeleteOutcome;

/// Delete `name`; 404 counts as a valid outcome
pub(crate) async fn delete_named(ctx: &OperationContext<'_>, name: &str, operation: &str) -> Outcome {
    let exchange = ctx
        .send(operation, computer::delete(name), |s| {
            DeleteOutcome::classify(s).is_success()
        })
        .await;
    ctx.metrics
        .trend(names::DELETE_LATENCY, exchange.latency_ms, &exchange.tags);

    let outcome = match exchange.response().map(|r| DeleteOutcome::classify(r.status)) {
        None => Outcome::TransportFailure,
        Some(DeleteOutcome::Deleted) => {
            ctx.metrics.add(names::DELETED_TOTAL, 1, &exchange.tags);
            Outcome::Passed
        }
        Some(DeleteOutcome::Missing) => {
            ctx.metrics.add(names::DELETE_MISSING_TOTAL, 1, &exchange.tags);
            Outcome::Passed
        }
        Some(DeleteOutcome::Unexpected) => {
            debug!(
                worker = ctx.worker_id,
                name,
                status = exchange.response().map(|r| r.status),
                "Unexpected delete status"
            );
            Outcome::ProtocolFailure
        }
    };

    if !outcome.is_passed() {
        ctx.metrics.add(names::DELETE_ERRORS, 1, &exchange.tags);
    }
    ctx.success(outcome.is_passed(), &exchange.tags);
    outcome
}

/// Delete a name this worker wrote earlier, or one guaranteed not to exist
pub struct Delete;

#[async_trait]
impl Operation for Delete {
    fn name(&self) -> &'static str {
        "delete"
    }

    async fn execute(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome {
        let name = match state.written.take_random(&mut state.rng) {
            Some(name) => name,
            None => format!("PC-ABSENT-{}-{}-{}", ctx.run_id, ctx.worker_id, ctx.iteration),
        };
        delete_named(ctx, &name, "delete").await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::*;
    use super::*;
    use crate::metrics::{MetricsRegistry, Tags};

    #[tokio::test]
    async fn test_delete_prefers_written_names() {
        let client = ScriptedClient::new(vec![ScriptedClient::ok(204, "")]);
        let metrics = MetricsRegistry::new();
        let tags = Tags::new();
        let ctx = context(&client, &metrics, &tags, Duration::ZERO);
        let mut state = WorkerState::seeded(4);
        state.written.push("PC-LOAD-mine".into());

        assert_eq!(Delete.execute(&ctx, &mut state).await, Outcome::Passed);
        assert_eq!(client.sent()[0].path(), "/computer/PC-LOAD-mine");
        assert!(state.written.is_empty());
        assert_eq!(metrics.counter_total(names::DELETED_TOTAL), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_is_valid() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::ok(404, ""),
            ScriptedClient::ok(500, "boom"),
        ]);
        let metrics = MetricsRegistry::new();
        let tags = Tags::new();
        let ctx = context(&client, &metrics, &tags, Duration::ZERO);
        let mut state = WorkerState::seeded(5);

        assert_eq!(Delete.execute(&ctx, &mut state).await, Outcome::Passed);
        assert!(client.sent()[0].path().starts_with("/computer/PC-ABSENT-test-"));
        assert_eq!(metrics.counter_total(names::DELETE_MISSING_TOTAL), 1);

        assert_eq!(Delete.execute(&ctx, &mut state).await, Outcome::ProtocolFailure);
        assert_eq!(metrics.counter_total(names::DELETE_ERRORS), 1);
    }
}
