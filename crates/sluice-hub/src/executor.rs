//! State-machine executor: applies queued mutations serially.
//!
//! A single executor task drains the durable transaction queue. Serial
//! apply gives a total order over state transitions without per-step
//! locks; per-mutation latency is small enough that the queue keeps up
//! with the fleet.
//!
//! Mutations are idempotent by construction (absolute-state updates, or
//! inserts that tolerate a duplicate id), so the at-least-once delivery
//! from the queue is safe to replay after a crash.
//!
//! Apply failures are logged and the item is discarded: the client was
//! acknowledged when the mutation was enqueued, so there is nobody left
//! to surface the error to. The affected step stays in a recoverable
//! state (`reset`/`reset-errors` clean up).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::Instrument;

use sluice_core::bucket::{step_data_key, step_key, BucketStore};
use sluice_core::observability::mutation_span;
use sluice_core::step::{Step, StepRow, StepStatus};
use sluice_core::wire::Method;

use crate::error::{Error, Result};
use crate::metrics::HubMetrics;
use crate::store::StepStore;
use crate::txqueue::{TransactionQueue, TxItem};

/// `error` request body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    step_id: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    trace: String,
}

/// Serial mutation executor.
pub struct MutationExecutor {
    store: Arc<StepStore>,
    bucket: Arc<dyn BucketStore>,
    queue: Arc<TransactionQueue>,
    metrics: HubMetrics,
}

impl MutationExecutor {
    /// Creates an executor over the given store, bucket, and queue.
    #[must_use]
    pub fn new(
        store: Arc<StepStore>,
        bucket: Arc<dyn BucketStore>,
        queue: Arc<TransactionQueue>,
    ) -> Self {
        Self {
            store,
            bucket,
            queue,
            metrics: HubMetrics::new(),
        }
    }

    /// Drains the transaction queue forever. Spawn on the runtime at
    /// startup.
    pub async fn run(&self) {
        loop {
            let (item, token) = match self.queue.next().await {
                Ok(next) => next,
                Err(err) => {
                    tracing::error!(error = %err, "transaction queue failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let span = mutation_span(&item.method, token.seq());
            match self.apply(&item).instrument(span).await {
                Ok(()) => self.metrics.record_mutation(&item.method, true),
                Err(err) => {
                    self.metrics.record_mutation(&item.method, false);
                    tracing::error!(method = %item.method, error = %err, "failed to apply mutation");
                }
            }

            if let Err(err) = self.queue.commit(token) {
                tracing::error!(error = %err, "failed to commit queue item");
            }
            self.metrics.set_queue_depth(self.queue.depth());
        }
    }

    /// Applies one mutation against the metadata store and the bucket.
    ///
    /// # Errors
    ///
    /// Returns an error when the body cannot be parsed or a required step
    /// definition is missing from the bucket; the item is still consumed.
    pub async fn apply(&self, item: &TxItem) -> Result<()> {
        let now = Utc::now().timestamp();
        match item.method()? {
            Method::Done => self.apply_done(item.payload.trim(), now).await,
            Method::Pending => {
                self.store.set_status(item.payload.trim(), StepStatus::Pending, now)?;
                Ok(())
            }
            Method::Cancel => self.apply_cancel(item.payload.trim(), now).await,
            Method::Reset => self.apply_reset(item.payload.trim(), now).await,
            Method::Error => {
                let body: ErrorBody = serde_json::from_str(&item.payload)
                    .map_err(|err| Error::serialization(format!("bad error body: {err}")))?;
                self.store.set_error(&body.step_id, now, &body.msg, &body.trace)?;
                Ok(())
            }
            Method::UploadStep => self.apply_upload_one(&item.payload, now).await,
            Method::UploadSteps => self.apply_upload_many(&item.payload, now).await,
            Method::ResetErrors => {
                let include_working = item.payload.trim() == "true";
                let changed = self.store.reset_errors(include_working, now)?;
                tracing::info!(changed, include_working, "reset errored steps");
                Ok(())
            }
            other => Err(Error::protocol(format!(
                "{other} is not a mutation; queue is corrupt"
            ))),
        }
    }

    /// `done`: the step succeeded; its children become runnable.
    async fn apply_done(&self, id: &str, now: i64) -> Result<()> {
        let step = self.require_step(id).await?;
        self.store.set_status(id, StepStatus::Success, now)?;
        if !step.children.is_empty() {
            self.store
                .set_status_many(&step.children, StepStatus::Pending, now)?;
        }
        self.collect_garbage(id).await;
        Ok(())
    }

    /// `cancel`: the whole connected component goes to `cancel`.
    async fn apply_cancel(&self, id: &str, now: i64) -> Result<()> {
        let component = self.component(id).await?;
        let ids: Vec<String> = component.keys().cloned().collect();
        self.store.set_status_many(&ids, StepStatus::Cancel, now)?;
        tracing::info!(root = id, cancelled = ids.len(), "cancelled component");
        self.collect_garbage(id).await;
        Ok(())
    }

    /// `reset`: the whole connected component returns to its initial
    /// status: `queued` behind parents, `pending` for starters.
    async fn apply_reset(&self, id: &str, now: i64) -> Result<()> {
        let component = self.component(id).await?;
        let mut starters = Vec::new();
        let mut blocked = Vec::new();
        for step in component.values() {
            if step.is_starter() {
                starters.push(step.id.clone());
            } else {
                blocked.push(step.id.clone());
            }
        }
        self.store.set_status_many(&starters, StepStatus::Pending, now)?;
        self.store.set_status_many(&blocked, StepStatus::Queued, now)?;
        tracing::info!(
            root = id,
            starters = starters.len(),
            blocked = blocked.len(),
            "reset component"
        );
        Ok(())
    }

    /// `upload-step`: body is `[definition, status_code]`.
    async fn apply_upload_one(&self, payload: &str, now: i64) -> Result<()> {
        let (step, code): (Step, i64) = serde_json::from_str(payload)
            .map_err(|err| Error::serialization(format!("bad upload-step body: {err}")))?;
        let status = StepStatus::from_code(code)
            .ok_or_else(|| Error::serialization(format!("unknown status code {code}")))?;
        self.put_definition(&step).await?;
        self.store.insert_step(&StepRow::from_step(&step, status, now))?;
        Ok(())
    }

    /// `upload-steps`: body is `[[definition, ...], [status_code, ...]]`.
    async fn apply_upload_many(&self, payload: &str, now: i64) -> Result<()> {
        let (steps, codes): (Vec<Step>, Vec<i64>) = serde_json::from_str(payload)
            .map_err(|err| Error::serialization(format!("bad upload-steps body: {err}")))?;
        if steps.len() != codes.len() {
            return Err(Error::serialization(format!(
                "upload-steps length mismatch: {} definitions, {} statuses",
                steps.len(),
                codes.len()
            )));
        }
        let mut rows = Vec::with_capacity(steps.len());
        for (step, code) in steps.iter().zip(&codes) {
            let status = StepStatus::from_code(*code)
                .ok_or_else(|| Error::serialization(format!("unknown status code {code}")))?;
            self.put_definition(step).await?;
            rows.push(StepRow::from_step(step, status, now));
        }
        self.store.insert_steps(&rows)?;
        Ok(())
    }

    async fn put_definition(&self, step: &Step) -> Result<()> {
        let encoded = serde_json::to_vec(step)
            .map_err(|err| Error::serialization(format!("cannot encode step: {err}")))?;
        self.bucket
            .put(&step_key(&step.id), encoded.into())
            .await?;
        Ok(())
    }

    /// Fetches a step definition; a miss is fatal for the mutation because
    /// DAG traversal cannot proceed without the edges.
    async fn require_step(&self, id: &str) -> Result<Step> {
        let Some(raw) = self.bucket.get(&step_key(id)).await? else {
            return Err(Error::store(format!("no definition blob for step {id}")));
        };
        serde_json::from_slice(&raw)
            .map_err(|err| Error::serialization(format!("bad definition blob for {id}: {err}")))
    }

    /// Breadth-first walk over parent and child edges from `id`, each node
    /// visited once. The DAG is assumed acyclic; the visited set guards
    /// traversal anyway.
    async fn component(&self, id: &str) -> Result<HashMap<String, Step>> {
        let mut seen: HashSet<String> = HashSet::from([id.to_string()]);
        let mut frontier: VecDeque<String> = VecDeque::from([id.to_string()]);
        let mut component = HashMap::new();

        while let Some(next) = frontier.pop_front() {
            let step = self.require_step(&next).await?;
            for neighbor in step.parents.iter().chain(&step.children) {
                if seen.insert(neighbor.clone()) {
                    frontier.push_back(neighbor.clone());
                }
            }
            component.insert(next, step);
        }
        Ok(component)
    }

    /// Deletes `step-data/<id>` payloads once every step in the component
    /// is terminal. Definitions stay; they are read-only reference data.
    ///
    /// Best effort: a failure here leaks a payload until the next terminal
    /// transition in the component, nothing worse.
    async fn collect_garbage(&self, id: &str) {
        let component = match self.component(id).await {
            Ok(component) => component,
            Err(err) => {
                tracing::warn!(step_id = id, error = %err, "skipping payload GC");
                return;
            }
        };
        let ids: Vec<String> = component.keys().cloned().collect();
        let rows = match self.store.fetch_rows(&ids) {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(step_id = id, error = %err, "skipping payload GC");
                return;
            }
        };
        if rows.len() != ids.len() || !rows.iter().all(|row| row.status.is_terminal()) {
            return;
        }

        for id in &ids {
            if let Err(err) = self.bucket.delete(&step_data_key(id)).await {
                tracing::warn!(step_id = %id, error = %err, "failed to delete step payload");
            }
        }
        tracing::debug!(root = id, reclaimed = ids.len(), "collected step payloads");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sluice_core::bucket::MemoryBucket;
    use tempfile::TempDir;

    struct Harness {
        executor: MutationExecutor,
        store: Arc<StepStore>,
        bucket: Arc<MemoryBucket>,
        _queue_dir: TempDir,
    }

    fn harness() -> Harness {
        let store = Arc::new(StepStore::open_in_memory().expect("open store"));
        let bucket = Arc::new(MemoryBucket::new());
        let queue_dir = TempDir::new().expect("tempdir");
        let queue = Arc::new(TransactionQueue::open(queue_dir.path()).expect("open queue"));
        Harness {
            executor: MutationExecutor::new(store.clone(), bucket.clone(), queue),
            store,
            bucket,
            _queue_dir: queue_dir,
        }
    }

    fn item(method: Method, payload: impl Into<String>) -> TxItem {
        TxItem {
            method: method.as_str().to_string(),
            payload: payload.into(),
        }
    }

    async fn upload(harness: &Harness, step: &Step) {
        let payload =
            serde_json::to_string(&(step, step.initial_status().code())).expect("encode");
        harness
            .executor
            .apply(&item(Method::UploadStep, payload))
            .await
            .expect("upload");
    }

    fn status_of(harness: &Harness, id: &str) -> StepStatus {
        harness
            .store
            .fetch_rows(&[id.to_string()])
            .expect("fetch")
            .pop()
            .expect("row")
            .status
    }

    /// A→B chain used by several tests.
    async fn upload_chain(harness: &Harness) {
        let a = Step::new("a", "scope", "tag").with_children(["b"]);
        let b = Step::new("b", "scope", "tag").with_parents(["a"]);
        upload(harness, &a).await;
        upload(harness, &b).await;
    }

    #[tokio::test]
    async fn upload_inserts_row_and_definition() {
        let harness = harness();
        let step = Step::new("a", "production", "etl").with_priority(3);
        upload(&harness, &step).await;

        assert_eq!(status_of(&harness, "a"), StepStatus::Pending);
        let blob = harness
            .bucket
            .get("step/a")
            .await
            .expect("get")
            .expect("definition stored");
        let stored: Step = serde_json::from_slice(&blob).expect("decode");
        assert_eq!(stored.priority, 3);
    }

    #[tokio::test]
    async fn upload_batch_uses_caller_statuses() {
        let harness = harness();
        let a = Step::new("a", "scope", "tag").with_children(["b"]);
        let b = Step::new("b", "scope", "tag").with_parents(["a"]);
        let payload = serde_json::to_string(&(
            vec![a.clone(), b.clone()],
            vec![a.initial_status().code(), b.initial_status().code()],
        ))
        .expect("encode");
        harness
            .executor
            .apply(&item(Method::UploadSteps, payload))
            .await
            .expect("upload batch");

        assert_eq!(status_of(&harness, "a"), StepStatus::Pending);
        assert_eq!(status_of(&harness, "b"), StepStatus::Queued);
    }

    #[tokio::test]
    async fn done_promotes_children() {
        let harness = harness();
        upload_chain(&harness).await;

        harness
            .executor
            .apply(&item(Method::Done, "a"))
            .await
            .expect("done");

        assert_eq!(status_of(&harness, "a"), StepStatus::Success);
        assert_eq!(status_of(&harness, "b"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn done_without_definition_is_fatal_for_the_mutation() {
        let harness = harness();
        let step = Step::new("a", "scope", "tag");
        upload(&harness, &step).await;
        harness.bucket.delete("step/a").await.expect("delete");

        let err = harness
            .executor
            .apply(&item(Method::Done, "a"))
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("no definition blob"));
        // The row transition was skipped.
        assert_eq!(status_of(&harness, "a"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_propagates_both_directions() {
        let harness = harness();
        let a = Step::new("a", "scope", "tag").with_children(["b"]);
        let b = Step::new("b", "scope", "tag")
            .with_parents(["a"])
            .with_children(["c"]);
        let c = Step::new("c", "scope", "tag").with_parents(["b"]);
        upload(&harness, &a).await;
        upload(&harness, &b).await;
        upload(&harness, &c).await;

        harness
            .executor
            .apply(&item(Method::Cancel, "b"))
            .await
            .expect("cancel");

        for id in ["a", "b", "c"] {
            assert_eq!(status_of(&harness, id), StepStatus::Cancel);
        }
    }

    #[tokio::test]
    async fn reset_restores_initial_statuses() {
        let harness = harness();
        let a = Step::new("a", "scope", "tag").with_children(["b"]);
        let b = Step::new("b", "scope", "tag")
            .with_parents(["a"])
            .with_children(["c"]);
        let c = Step::new("c", "scope", "tag").with_parents(["b"]);
        upload(&harness, &a).await;
        upload(&harness, &b).await;
        upload(&harness, &c).await;

        harness
            .executor
            .apply(&item(Method::Cancel, "b"))
            .await
            .expect("cancel");
        harness
            .executor
            .apply(&item(Method::Reset, "b"))
            .await
            .expect("reset");

        assert_eq!(status_of(&harness, "a"), StepStatus::Pending);
        assert_eq!(status_of(&harness, "b"), StepStatus::Queued);
        assert_eq!(status_of(&harness, "c"), StepStatus::Queued);
    }

    #[tokio::test]
    async fn error_records_message_and_trace() {
        let harness = harness();
        upload(&harness, &Step::new("a", "scope", "tag")).await;

        let payload = serde_json::json!({
            "step_id": "a",
            "msg": "KeyError: 'date'",
            "trace": "Traceback (most recent call last): ...",
        })
        .to_string();
        harness
            .executor
            .apply(&item(Method::Error, payload))
            .await
            .expect("error");

        let row = harness
            .store
            .fetch_rows(&["a".to_string()])
            .expect("fetch")
            .pop()
            .expect("row");
        assert_eq!(row.status, StepStatus::Error);
        assert_eq!(row.msg, "KeyError: 'date'");
        assert!(row.trace.starts_with("Traceback"));
    }

    #[tokio::test]
    async fn pending_returns_a_step_to_the_pool() {
        let harness = harness();
        upload(&harness, &Step::new("a", "scope", "tag")).await;
        harness
            .store
            .set_status("a", StepStatus::Working, 1)
            .expect("lease");

        harness
            .executor
            .apply(&item(Method::Pending, "a"))
            .await
            .expect("pending");
        assert_eq!(status_of(&harness, "a"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn reset_errors_flips_errored_rows() {
        let harness = harness();
        upload(&harness, &Step::new("a", "scope", "tag")).await;
        harness.store.set_error("a", 1, "boom", "").expect("error");

        harness
            .executor
            .apply(&item(Method::ResetErrors, "false"))
            .await
            .expect("reset-errors");
        assert_eq!(status_of(&harness, "a"), StepStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_component_reclaims_payloads() {
        let harness = harness();
        upload_chain(&harness).await;
        for id in ["a", "b"] {
            harness
                .bucket
                .put(&step_data_key(id), Bytes::from_static(b"payload"))
                .await
                .expect("put");
        }

        harness
            .executor
            .apply(&item(Method::Done, "a"))
            .await
            .expect("done a");
        // b is still pending: nothing reclaimed yet.
        assert!(harness
            .bucket
            .get("step-data/a")
            .await
            .expect("get")
            .is_some());

        harness
            .executor
            .apply(&item(Method::Done, "b"))
            .await
            .expect("done b");
        for id in ["a", "b"] {
            assert!(harness
                .bucket
                .get(&step_data_key(id))
                .await
                .expect("get")
                .is_none());
            // Definitions are kept.
            assert!(harness
                .bucket
                .get(&step_key(id))
                .await
                .expect("get")
                .is_some());
        }
    }

    #[tokio::test]
    async fn replayed_mutation_is_a_no_op() {
        let harness = harness();
        upload_chain(&harness).await;

        let done = item(Method::Done, "a");
        harness.executor.apply(&done).await.expect("first apply");
        harness.executor.apply(&done).await.expect("replay");

        assert_eq!(status_of(&harness, "a"), StepStatus::Success);
        assert_eq!(status_of(&harness, "b"), StepStatus::Pending);
    }
}
