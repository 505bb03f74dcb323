//! Bounded parallel walk over a dependency graph.
//!
//! The scheduler owns all completion bookkeeping: handlers only report
//! whether their node succeeded.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::{KeelError, Result};

use super::dag::Graph;

/// Outcome of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// The handler ran and succeeded.
    Succeeded,
    /// The handler ran and failed.
    Failed,
    /// A predecessor failed; the node did not run.
    DependencyFailed {
        /// The failed direct predecessor.
        dependency: String,
    },
    /// The run was cancelled before the node started.
    Cancelled,
}

impl NodeOutcome {
    /// Returns true if the node succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::DependencyFailed { dependency } => write!(f, "skipped ({dependency} failed)"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcomes of a graph walk, by node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Outcome per node.
    pub outcomes: BTreeMap<String, NodeOutcome>,
}

impl RunReport {
    /// Returns true if every node succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(NodeOutcome::is_success)
    }

    /// Returns the outcome of a node.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(key)
    }

    /// Returns the nodes that did not succeed.
    pub fn unsuccessful(&self) -> impl Iterator<Item = (&str, &NodeOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_success())
            .map(|(k, o)| (k.as_str(), o))
    }

    /// Returns true if any node was cancelled.
    #[must_use]
    pub fn was_cancelled(&self) -> bool {
        self.outcomes.values().any(|o| *o == NodeOutcome::Cancelled)
    }
}

/// Walks a graph with a bounded number of concurrent handlers.
#[derive(Debug, Clone)]
pub struct Scheduler {
    parallelism: usize,
    cancel: Option<watch::Receiver<bool>>,
}

impl Scheduler {
    /// Creates a scheduler. A parallelism of zero is treated as one.
    #[must_use]
    pub fn new(parallelism: usize) -> Self {
        Self {
            parallelism: parallelism.max(1),
            cancel: None,
        }
    }

    /// Stops starting new nodes once the receiver reads `true`.
    #[must_use]
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Returns the parallelism.
    #[must_use]
    pub const fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Runs `handler` once per node, after all of the node's predecessors
    /// have completed. Ready nodes start in key order.
    ///
    /// The handler receives the node key and, if a predecessor did not
    /// succeed, that predecessor's key. In that case it must not perform
    /// the real operation and the node is reported as
    /// [`NodeOutcome::DependencyFailed`] whatever it returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph has a cycle or a worker task is lost.
    pub async fn run<F, Fut>(&self, graph: &Graph, handler: F) -> Result<RunReport>
    where
        F: Fn(String, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        graph.check_acyclic()?;

        let handler = Arc::new(handler);
        let mut pending: BTreeMap<&str, usize> = graph
            .nodes()
            .map(|n| (n, graph.predecessors(n).count()))
            .collect();
        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut failed_dependency: BTreeMap<&str, String> = BTreeMap::new();
        let mut report = RunReport::default();
        let mut workers: JoinSet<(String, bool)> = JoinSet::new();

        loop {
            while workers.len() < self.parallelism && !self.is_cancelled() {
                let Some(node) = ready.pop_first() else {
                    break;
                };
                let key = node.to_string();
                let failed = failed_dependency.get(node).cloned();
                debug!("Starting {key}");
                let task = handler(key.clone(), failed);
                workers.spawn(async move {
                    // Run the handler in its own task so a panic is
                    // attributed to its node.
                    let ok = match tokio::spawn(task).await {
                        Ok(ok) => ok,
                        Err(e) => {
                            error!("Handler for {key} aborted: {e}");
                            false
                        }
                    };
                    (key, ok)
                });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let (key, ok) =
                joined.map_err(|e| KeelError::internal(format!("scheduler worker lost: {e}")))?;

            let outcome = match failed_dependency.get(key.as_str()) {
                Some(dependency) => NodeOutcome::DependencyFailed {
                    dependency: dependency.clone(),
                },
                None if ok => NodeOutcome::Succeeded,
                None => NodeOutcome::Failed,
            };
            debug!("{key} {outcome}");

            for (next, _) in graph.successors(&key) {
                if !outcome.is_success() {
                    failed_dependency
                        .entry(next)
                        .or_insert_with(|| key.clone());
                }
                if let Some(count) = pending.get_mut(next) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(next);
                    }
                }
            }
            report.outcomes.insert(key, outcome);
        }

        let mut cancelled = 0;
        for node in graph.nodes() {
            if !report.outcomes.contains_key(node) {
                report.outcomes.insert(node.to_string(), NodeOutcome::Cancelled);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("Cancelled {cancelled} node(s) before they started");
        }

        Ok(report)
    }
}
