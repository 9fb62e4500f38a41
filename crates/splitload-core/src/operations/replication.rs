use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Operation, OperationContext, Outcome, WorkerState};
use crate::http::computer;
use crate::metrics::{names, Tags};
use crate::payload;
use crate::validation;

const MARKER_PREFIX: &str = "LAGTEST";
const NAME_PREFIX: &str = "PC-LAG";

/// Write to the primary, then look for the record on the replica.
///
/// The verdict (`replication_lag_rate`) is fixed by the first read. Misses are
/// followed by one retry after `first_retry` and one diagnostic read after a
/// further `final_retry`.
#[derive(Debug, Clone)]
pub struct ReplicationProbe {
    pub first_retry: Duration,
    pub final_retry: Duration,
}

impl Default for ReplicationProbe {
    fn default() -> Self {
        Self {
            first_retry: Duration::from_millis(50),
            final_retry: Duration::from_millis(200),
        }
    }
}

impl ReplicationProbe {
    /// Read the marker back. Failed reads count as not visible.
    async fn visible(&self, ctx: &OperationContext<'_>, marker: &str, operation: &str) -> bool {
        let exchange = ctx
            .send(operation, computer::search_gpu(marker), |s| s == 200)
            .await;
        match exchange.response() {
            Some(response) => {
                let check = validation::non_empty_array(response);
                if !check.status_ok || check.payload.is_none() {
                    ctx.metrics.add(names::READ_ERRORS, 1, &exchange.tags);
                }
                check.passed()
            }
            None => {
                ctx.metrics.add(names::READ_ERRORS, 1, &exchange.tags);
                false
            }
        }
    }

    async fn retry(
        &self,
        ctx: &OperationContext<'_>,
        marker: &str,
        tags: &Tags,
        attempt: u8,
    ) -> bool {
        ctx.metrics.add(names::REPLICATION_RETRY_CHECKS, 1, tags);
        let operation = if attempt == 1 {
            "repl_read_retry"
        } else {
            "repl_read_final"
        };
        let found = self.visible(ctx, marker, operation).await;
        ctx.metrics.rate(
            names::REPLICATION_RETRY_FOUND,
            found,
            &tags.with("attempt", attempt.to_string()),
        );
        found
    }
}

#[async_trait]
impl Operation for ReplicationProbe {
    fn name(&self) -> &'static str {
        "replication_probe"
    }

    async fn execute(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome {
        let marker = format!("{}-{}", MARKER_PREFIX, payload::random_suffix(&mut state.rng, 12));
        let name = payload::unique_name(&mut state.rng, NAME_PREFIX);
        let body = payload::computer_with_gpu(&mut state.rng, &name, &marker);

        let write = ctx.send("repl_write", computer::create(body), |s| s == 201).await;
        ctx.metrics
            .trend(names::WRITE_LATENCY, write.latency_ms, &write.tags);
        let written = write
            .response()
            .is_some_and(|r| validation::created_with_id(r).passed());
        ctx.success(written, &write.tags);
        if !written {
            ctx.metrics.add(names::WRITE_ERRORS, 1, &write.tags);
            return if write.is_transport_failure() {
                Outcome::TransportFailure
            } else {
                Outcome::ProtocolFailure
            };
        }
        ctx.metrics.add(names::INSERTED_TOTAL, 1, &write.tags);
        state.written.push(name);

        let tags = ctx.tags.with("operation", "replication_probe");
        ctx.metrics.add(names::REPLICATION_CHECK_TOTAL, 1, &tags);

        let found = self.visible(ctx, &marker, "repl_read_immediate").await;
        ctx.metrics.rate(names::REPLICATION_LAG_RATE, !found, &tags);
        if found {
            return Outcome::Passed;
        }

        ctx.metrics.add(names::REPLICATION_LAG_DETECTED, 1, &tags);
        debug!(worker = ctx.worker_id, %marker, "Replica missed fresh write");

        tokio::time::sleep(self.first_retry).await;
        if self.retry(ctx, &marker, &tags, 1).await {
            return Outcome::Finding;
        }

        tokio::time::sleep(self.final_retry).await;
        if !self.retry(ctx, &marker, &tags, 2).await {
            ctx.metrics
                .add(names::REPLICATION_PERSISTENT_LAG, 1, &tags);
            info!(
                worker = ctx.worker_id,
                %marker,
                "Write still not visible on replica after {:?}",
                self.first_retry + self.final_retry
            );
        }
        Outcome::Finding
    }
}
