//! KL-005: Apply engine — dependency-gated concurrent convergence.
//!
//! One task per resource, all spawned up front:
//! wait on predecessors → apply → record terminal state → forward errors.
//! A single aggregator task logs forwarded errors. The run succeeds at the
//! top level even when individual resources fail; per-resource outcomes are
//! returned in the `RunReport`.

use super::error::{Error, Result};
use super::graph::Graph;
use super::types::ResourceState;
use crate::resources::{ApplyContext, SharedResource};
use indexmap::IndexMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Final state per identity key, catalog order
    pub states: IndexMap<String, ResourceState>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Left pending only if a task died without recording a state
    pub pending: usize,
    /// Errors forwarded to the aggregator
    pub errors_logged: usize,
    pub duration: Duration,
}

impl RunReport {
    fn collect(graph: &Graph, errors_logged: usize, duration: Duration) -> Self {
        let mut report = Self {
            errors_logged,
            duration,
            ..Self::default()
        };
        for resource in graph.resources() {
            let state = resource.state();
            match state {
                ResourceState::Completed => report.completed += 1,
                ResourceState::Failed => report.failed += 1,
                ResourceState::Skipped => report.skipped += 1,
                ResourceState::Pending => report.pending += 1,
            }
            report.states.insert(resource.identity_key(), state);
        }
        report
    }

    /// No resource ended Failed or stuck Pending.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.pending == 0
    }
}

/// A predecessor as seen by a dependent: its key and, if it exists, the resource.
type Predecessor = (String, Option<SharedResource>);

impl Graph {
    /// Converge every resource, honoring ordering constraints.
    pub async fn apply(&self, cancel: &CancellationToken) -> Result<RunReport> {
        self.apply_with(ApplyContext::new(cancel.clone())).await
    }

    /// `apply` with an explicit context (identity database, caller token).
    pub async fn apply_with(&self, ctx: ApplyContext) -> Result<RunReport> {
        let start = Instant::now();
        let run = ApplyContext {
            cancel: ctx.cancel.child_token(),
            identities: ctx.identities.clone(),
        };
        info!(resources = self.len(), "applying catalog");

        let (err_tx, err_rx) = mpsc::unbounded_channel::<Forwarded>();
        let aggregator = tokio::spawn(aggregate_errors(err_rx));

        let mut tasks = JoinSet::new();
        for resource in self.resources() {
            let ordering = &resource.metadata().ordering;
            let after_ok = self.lookup_all(&ordering.after_ok);
            let after_fail = self.lookup_all(&ordering.after_fail);
            tasks.spawn(apply_resource(
                resource.clone(),
                after_ok,
                after_fail,
                run.clone(),
                err_tx.clone(),
            ));
        }
        // The aggregator stops once every task has dropped its sender.
        drop(err_tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "resource task died");
            }
        }
        run.cancel.cancel();

        let errors_logged = aggregator.await.unwrap_or_else(|e| {
            error!(error = %e, "error aggregator died");
            0
        });

        let report = RunReport::collect(self, errors_logged, start.elapsed());
        info!(
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "applied catalog in {:.2}s",
            report.duration.as_secs_f64()
        );
        Ok(report)
    }

    fn lookup_all(&self, keys: &[String]) -> Vec<Predecessor> {
        keys.iter()
            .map(|k| (k.clone(), self.get(k).cloned()))
            .collect()
    }
}

/// An error raised by one resource, tagged with its identity key.
type Forwarded = (String, Error);

/// Drain forwarded errors until every sender is gone. Returns how many were logged.
async fn aggregate_errors(mut rx: mpsc::UnboundedReceiver<Forwarded>) -> usize {
    let mut count = 0;
    while let Some((key, err)) = rx.recv().await {
        error!(resource = %key, error = %err, "resource failed");
        count += 1;
    }
    count
}

/// What a dependent does after observing one predecessor.
enum Gate {
    Proceed,
    Skip,
    Fail(Error),
}

/// Wait for `pred` to reach a terminal state. Unknown keys and cancellation are errors.
async fn await_terminal(
    key: &str,
    (pred_key, pred): &Predecessor,
    cancel: &CancellationToken,
) -> Result<ResourceState> {
    let pred = pred
        .as_ref()
        .ok_or_else(|| Error::InvalidSpec(format!("unable to find resource {} in graph", pred_key)))?;
    debug!(resource = %key, predecessor = %pred_key, "waiting");
    pred.metadata()
        .state
        .wait_terminal(cancel)
        .await
        .ok_or_else(|| Error::Cancelled(format!("run cancelled while waiting for {}", pred_key)))
}

async fn gate_after_ok(key: &str, pred: &Predecessor, cancel: &CancellationToken) -> Gate {
    match await_terminal(key, pred, cancel).await {
        Ok(ResourceState::Completed) => {
            debug!(resource = %key, predecessor = %pred.0, "predecessor completed");
            Gate::Proceed
        }
        Ok(ResourceState::Failed) => {
            Gate::Fail(Error::DependencyFailed(format!("predecessor {} failed", pred.0)))
        }
        Ok(ResourceState::Skipped) | Ok(ResourceState::Pending) => Gate::Skip,
        Err(e) => Gate::Fail(e),
    }
}

async fn gate_after_fail(key: &str, pred: &Predecessor, cancel: &CancellationToken) -> Gate {
    match await_terminal(key, pred, cancel).await {
        Ok(ResourceState::Failed) => {
            debug!(resource = %key, predecessor = %pred.0, "predecessor failed as required");
            Gate::Proceed
        }
        Ok(_) => Gate::Skip,
        Err(e) => Gate::Fail(e),
    }
}

/// Drive one resource from waiting to a terminal state.
async fn apply_resource(
    resource: SharedResource,
    after_ok: Vec<Predecessor>,
    after_fail: Vec<Predecessor>,
    ctx: ApplyContext,
    errors: mpsc::UnboundedSender<Forwarded>,
) {
    let key = resource.identity_key();
    let fail = |err: Error| {
        if let Some(err) = resource.fail(err.with_key(&key)) {
            // Receiver outlives every task.
            let _ = errors.send((key.clone(), err));
        }
    };

    for pred in &after_ok {
        match gate_after_ok(&key, pred, &ctx.cancel).await {
            Gate::Proceed => {}
            Gate::Skip => {
                info!(resource = %key, predecessor = %pred.0, "skipped: predecessor did not complete");
                resource.skip();
                return;
            }
            Gate::Fail(err) => return fail(err),
        }
    }
    for pred in &after_fail {
        match gate_after_fail(&key, pred, &ctx.cancel).await {
            Gate::Proceed => {}
            Gate::Skip => {
                info!(resource = %key, predecessor = %pred.0, "skipped: predecessor did not fail");
                resource.skip();
                return;
            }
            Gate::Fail(err) => return fail(err),
        }
    }

    info!(resource = %key, "start applying");
    let applying = {
        let resource = resource.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { resource.apply(&ctx).await })
    };
    let outcome = match applying.await {
        Ok(outcome) => outcome,
        Err(e) => Err(Error::Convergence(format!("apply aborted: {}", e))),
    };

    match outcome {
        Ok(()) => {
            resource.done();
            info!(resource = %key, "applied");
        }
        Err(err) => {
            warn!(resource = %key, error = %err, "apply failed");
            fail(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{parse_catalog, Catalog};
    use crate::core::types::Metadata;
    use crate::resources::Resource;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Start,
        End,
    }

    type Journal = Arc<Mutex<Vec<(String, Phase, Instant)>>>;

    /// Test resource: sleeps, records start/end, then succeeds or fails.
    #[derive(Debug)]
    struct Probe {
        metadata: Metadata,
        delay: Duration,
        succeed: bool,
        journal: Journal,
    }

    impl Probe {
        fn new(name: &str, succeed: bool, delay_ms: u64, journal: &Journal) -> Self {
            Self {
                metadata: Metadata {
                    name: name.to_string(),
                    ..Metadata::default()
                },
                delay: Duration::from_millis(delay_ms),
                succeed,
                journal: journal.clone(),
            }
        }

        fn after_ok(mut self, keys: &[&str]) -> Self {
            self.metadata.ordering.after_ok = keys.iter().map(|k| k.to_string()).collect();
            self
        }

        fn after_fail(mut self, keys: &[&str]) -> Self {
            self.metadata.ordering.after_fail = keys.iter().map(|k| k.to_string()).collect();
            self
        }

        fn record(&self, phase: Phase) {
            self.journal
                .lock()
                .unwrap()
                .push((self.metadata.name.clone(), phase, Instant::now()));
        }
    }

    #[async_trait]
    impl Resource for Probe {
        fn api(&self) -> &str {
            "test"
        }

        fn kind(&self) -> &str {
            "probe"
        }

        fn metadata(&self) -> &Metadata {
            &self.metadata
        }

        async fn apply(&self, ctx: &ApplyContext) -> Result<()> {
            self.record(Phase::Start);
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = ctx.cancel.cancelled() => {
                    self.record(Phase::End);
                    return Err(Error::Cancelled("probe interrupted".into()));
                }
            }
            self.record(Phase::End);
            if self.succeed {
                Ok(())
            } else {
                Err(Error::Convergence("probe failed".into()))
            }
        }
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn graph_of(probes: Vec<Probe>) -> Graph {
        let resources: Vec<SharedResource> = probes
            .into_iter()
            .map(|p| Arc::new(p) as SharedResource)
            .collect();
        Graph::new(Catalog::from_resources(resources)).unwrap()
    }

    fn at(journal: &Journal, name: &str, phase: Phase) -> Option<Instant> {
        journal
            .lock()
            .unwrap()
            .iter()
            .find(|(n, p, _)| n == name && *p == phase)
            .map(|(_, _, t)| *t)
    }

    #[tokio::test]
    async fn test_kl005_independent_resources_run_concurrently() {
        let j = journal();
        let g = graph_of(vec![
            Probe::new("a", true, 200, &j),
            Probe::new("b", true, 200, &j),
            Probe::new("c", true, 200, &j),
        ]);
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.completed, 3);

        let first_end = ["a", "b", "c"]
            .iter()
            .filter_map(|n| at(&j, n, Phase::End))
            .min()
            .unwrap();
        for n in ["a", "b", "c"] {
            assert!(at(&j, n, Phase::Start).unwrap() < first_end, "{} started late", n);
        }
        assert!(report.duration < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_kl005_after_ok_waits_for_completion() {
        let j = journal();
        let g = graph_of(vec![
            Probe::new("b", true, 10, &j).after_ok(&["Probe::a"]),
            Probe::new("a", true, 100, &j),
        ]);
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.states["Probe::a"], ResourceState::Completed);
        assert_eq!(report.states["Probe::b"], ResourceState::Completed);
        assert!(at(&j, "b", Phase::Start).unwrap() >= at(&j, "a", Phase::End).unwrap());
    }

    #[tokio::test]
    async fn test_kl005_after_ok_predecessor_failed() {
        let j = journal();
        let g = graph_of(vec![
            Probe::new("a", false, 20, &j),
            Probe::new("b", true, 10, &j).after_ok(&["Probe::a"]),
            Probe::new("c", true, 10, &j).after_ok(&["Probe::b"]),
        ]);
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.states["Probe::a"], ResourceState::Failed);
        assert_eq!(report.states["Probe::b"], ResourceState::Failed);
        assert_eq!(report.states["Probe::c"], ResourceState::Failed);
        assert!(at(&j, "b", Phase::Start).is_none());
        assert!(at(&j, "c", Phase::Start).is_none());
        assert_eq!(report.errors_logged, 3);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_kl005_after_fail_runs_on_failure() {
        let j = journal();
        let g = graph_of(vec![
            Probe::new("a", false, 20, &j),
            Probe::new("rollback", true, 10, &j).after_fail(&["Probe::a"]),
        ]);
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.states["Probe::rollback"], ResourceState::Completed);
        assert!(at(&j, "rollback", Phase::Start).unwrap() >= at(&j, "a", Phase::End).unwrap());
    }

    #[tokio::test]
    async fn test_kl005_after_fail_skipped_on_success() {
        let j = journal();
        let g = graph_of(vec![
            Probe::new("a", true, 20, &j),
            Probe::new("rollback", true, 10, &j).after_fail(&["Probe::a"]),
            Probe::new("notify", true, 10, &j).after_ok(&["Probe::rollback"]),
        ]);
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.states["Probe::rollback"], ResourceState::Skipped);
        assert_eq!(report.states["Probe::notify"], ResourceState::Skipped);
        assert!(at(&j, "rollback", Phase::Start).is_none());
        assert!(at(&j, "notify", Phase::Start).is_none());
        assert_eq!(report.skipped, 2);
        assert_eq!(report.errors_logged, 0);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_kl005_unknown_predecessor_fails_resource() {
        let j = journal();
        let g = graph_of(vec![Probe::new("a", true, 10, &j).after_ok(&["File::ghost"])]);
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.states["Probe::a"], ResourceState::Failed);
        assert!(at(&j, "a", Phase::Start).is_none());
    }

    #[tokio::test]
    async fn test_kl005_external_cancellation_fails_waiters() {
        let j = journal();
        let g = graph_of(vec![
            Probe::new("slow", true, 10_000, &j),
            Probe::new("waiter", true, 10, &j).after_ok(&["Probe::slow"]),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let report = g.apply(&cancel).await.unwrap();
        assert_eq!(report.states["Probe::slow"], ResourceState::Failed);
        assert_eq!(report.states["Probe::waiter"], ResourceState::Failed);
        assert!(at(&j, "waiter", Phase::Start).is_none());
        assert!(report.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_kl005_run_token_does_not_cancel_caller() {
        let j = journal();
        let g = graph_of(vec![Probe::new("a", true, 1, &j)]);
        let cancel = CancellationToken::new();
        g.apply(&cancel).await.unwrap();
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_kl005_empty_graph() {
        let g = graph_of(vec![]);
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert!(report.states.is_empty());
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_kl005_exec_fail_ok_unblocks_dependents() {
        let catalog = parse_catalog(
            r#"[
                {"kind": "exec", "metadata": {"name": "flaky"},
                 "spec": {"path": "/bin/sh", "args": ["-c", "exit 1"], "failOk": true}},
                {"kind": "exec", "metadata": {"name": "strict"},
                 "spec": {"path": "/bin/sh", "args": ["-c", "exit 1"]}},
                {"kind": "exec", "metadata": {"name": "next", "ordering": {"afterOk": ["Exec::flaky"]}},
                 "spec": {"path": "/bin/true"}}
            ]"#,
        )
        .unwrap();
        let g = Graph::new(catalog).unwrap();
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.states["Exec::flaky"], ResourceState::Completed);
        assert_eq!(report.states["Exec::strict"], ResourceState::Failed);
        assert_eq!(report.states["Exec::next"], ResourceState::Completed);
        assert_eq!(report.errors_logged, 1);
    }

    #[tokio::test]
    async fn test_kl005_file_then_exec_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeting");
        let json = format!(
            r#"[
                {{"kind": "exec", "metadata": {{"name": "check", "ordering": {{"afterOk": ["File::greeting"]}}}},
                  "spec": {{"path": "/bin/sh", "args": ["-c", "test \"$(cat {p})\" = hello"]}}}},
                {{"kind": "file", "metadata": {{"name": "greeting"}},
                  "spec": {{"ensure": "present", "path": "{p}", "mode": "0644",
                           "content": {{"type": "string", "string": "hello"}}}}}}
            ]"#,
            p = path.display()
        );
        let g = Graph::new(parse_catalog(&json).unwrap()).unwrap();
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.states["File::greeting"], ResourceState::Completed);
        assert_eq!(report.states["Exec::check"], ResourceState::Completed);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    /// Drive one resource directly and collect what it forwards.
    async fn forwarded(resource: SharedResource, after_ok: Vec<Predecessor>) -> Vec<Forwarded> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        apply_resource(
            resource,
            after_ok,
            vec![],
            ApplyContext::new(CancellationToken::new()),
            tx,
        )
        .await;
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_kl005_forwarded_timeout_names_resource() {
        let catalog = parse_catalog(
            r#"[{"kind": "exec", "metadata": {"name": "hang"},
                 "spec": {"path": "/bin/sh", "args": ["-c", "exec sleep 1"], "timeout": "10ms"}}]"#,
        )
        .unwrap();
        let hang = catalog.resources[0].clone();
        let errors = forwarded(hang, vec![]).await;
        assert_eq!(errors.len(), 1);
        let (key, err) = &errors[0];
        assert_eq!(key, "Exec::hang");
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.to_string().contains("Exec::hang"), "{}", err);
    }

    #[tokio::test]
    async fn test_kl005_failed_predecessor_is_not_a_cancellation() {
        let j = journal();
        let upstream: SharedResource = Arc::new(Probe::new("upstream", false, 1, &j));
        upstream.fail(Error::Convergence("boom".into()));
        let downstream: SharedResource =
            Arc::new(Probe::new("downstream", true, 1, &j).after_ok(&["Probe::upstream"]));

        let errors = forwarded(
            downstream.clone(),
            vec![("Probe::upstream".to_string(), Some(upstream))],
        )
        .await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].1, Error::DependencyFailed(_)));
        assert!(errors[0].1.to_string().contains("Probe::downstream"));
        assert_eq!(downstream.state(), ResourceState::Failed);
        assert!(at(&j, "downstream", Phase::Start).is_none());
    }

    #[tokio::test]
    async fn test_kl005_exec_timeout_fails_resource() {
        let catalog = parse_catalog(
            r#"[{"kind": "exec", "metadata": {"name": "hang"},
                 "spec": {"path": "/bin/sh", "args": ["-c", "exec sleep 1"], "timeout": "10ms"}}]"#,
        )
        .unwrap();
        let g = Graph::new(catalog).unwrap();
        let report = g.apply(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.states["Exec::hang"], ResourceState::Failed);
        assert!(report.duration < Duration::from_secs(1));
    }
}
