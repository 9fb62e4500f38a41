use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use super::{Operation, OperationContext, Outcome, WorkerState};
use crate::http::computer;
use crate::metrics::names;
use crate::payload;
use crate::validation::DuplicateOutcome;

/// Contended key for `slot` in run `run_id`
pub fn duplicate_key(run_id: &str, slot: usize) -> String {
    format!("PC-DUP-{}-{}", run_id, slot)
}

/// Concurrent inserts of the same unique name.
///
/// Exactly one insert per key may win. Double winners are detected at report
/// time from the per-key `duplicate_insert_won` counters.
#[derive(Debug, Clone)]
pub struct DuplicateProbe {
    pub pool_size: usize,
}

#[async_trait]
impl Operation for DuplicateProbe {
    fn name(&self) -> &'static str {
        "duplicate_probe"
    }

    async fn execute(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome {
        let slot = state.rng.gen_range(0..self.pool_size.max(1));
        let key = duplicate_key(ctx.run_id, slot);
        let body = payload::computer(&mut state.rng, &key);

        let exchange = ctx
            .send("duplicate_insert", computer::create(body), |s| {
                DuplicateOutcome::classify(s).is_success()
            })
            .await;
        ctx.metrics
            .add(names::DUPLICATE_ATTEMPTS, 1, &exchange.tags);

        let Some(response) = exchange.response() else {
            // Nothing reached the service, so there is no verdict on the key
            ctx.success(false, &exchange.tags);
            return Outcome::TransportFailure;
        };
        let outcome = match DuplicateOutcome::classify(response.status) {
            DuplicateOutcome::Won => {
                ctx.metrics
                    .add(names::DUPLICATE_WON, 1, &exchange.tags.with("key", key.as_str()));
                ctx.metrics.add(names::INSERTED_TOTAL, 1, &exchange.tags);
                Outcome::Passed
            }
            DuplicateOutcome::Rejected => {
                ctx.metrics
                    .add(names::DUPLICATE_REJECTED, 1, &exchange.tags);
                Outcome::Passed
            }
            DuplicateOutcome::NotRejected => {
                ctx.metrics
                    .add(names::DUPLICATE_NOT_REJECTED, 1, &exchange.tags);
                warn!(
                    worker = ctx.worker_id,
                    %key,
                    status = response.status,
                    "Duplicate insert neither won nor rejected"
                );
                Outcome::Finding
            }
        };

        ctx.success(outcome.is_passed(), &exchange.tags);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::*;
    use super::*;
    use crate::error::TransportError;
    use crate::metrics::{MetricsRegistry, Tags};

    #[tokio::test]
    async fn test_duplicate_outcomes_counted() {
        let client = ScriptedClient::new(vec![
            ScriptedClient::ok(201, r#"{"id":1}"#),
            ScriptedClient::ok(409, ""),
            ScriptedClient::ok(500, ""),
            ScriptedClient::ok(200, ""),
            Err(TransportError::Timeout),
        ]);
        let metrics = MetricsRegistry::new();
        let tags = Tags::new();
        let ctx = context(&client, &metrics, &tags, Duration::ZERO);
        let mut state = WorkerState::seeded(41);
        let probe = DuplicateProbe { pool_size: 1 };

        let outcomes = [
            Outcome::Passed,
            Outcome::Passed,
            Outcome::Passed,
            Outcome::Finding,
            Outcome::TransportFailure,
        ];
        for expected in outcomes {
            assert_eq!(probe.execute(&ctx, &mut state).await, expected);
        }

        assert_eq!(metrics.counter_total(names::DUPLICATE_ATTEMPTS), 5);
        assert_eq!(metrics.counter_total(names::DUPLICATE_REJECTED), 2);
        assert_eq!(metrics.counter_total(names::DUPLICATE_NOT_REJECTED), 1);

        let wins = metrics.counter_by_tag(names::DUPLICATE_WON, "key");
        assert_eq!(wins.get("PC-DUP-test-0"), Some(&1));
        assert!(client
            .sent()
            .iter()
            .all(|r| r.body.as_ref().unwrap()["name"] == "PC-DUP-test-0"));
    }

    #[tokio::test]
    async fn test_timeout_is_infrastructure_only() {
        let client = ScriptedClient::new(vec![Err(TransportError::Timeout)]);
        let metrics = MetricsRegistry::new();
        let tags = Tags::new();
        let ctx = context(&client, &metrics, &tags, Duration::ZERO);
        let mut state = WorkerState::seeded(42);
        let probe = DuplicateProbe { pool_size: 1 };

        assert_eq!(
            probe.execute(&ctx, &mut state).await,
            Outcome::TransportFailure
        );

        let transport = metrics.counter_by_tag(names::TRANSPORT_ERRORS, "kind");
        assert_eq!(transport.get("timeout"), Some(&1));
        assert_eq!(metrics.counter_total(names::DUPLICATE_NOT_REJECTED), 0);
        assert_eq!(metrics.counter_total(names::DUPLICATE_REJECTED), 0);
        assert!(metrics.counter_by_tag(names::DUPLICATE_WON, "key").is_empty());

    }

    #[test]
    fn test_key_format() {
        assert_eq!(duplicate_key("r1", 7), "PC-DUP-r1-7");
    }
}
