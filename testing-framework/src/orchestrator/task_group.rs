// File: testing-framework/src/orchestrator/task_group.rs
//
// Parallel Task Group
//
// One provisioning phase = one TaskGroup: a task is spawned per independent
// unit of work (funding transfer, channel-side deposit), then `join` waits for
// all of them as a barrier. The first failure cancels every task still
// running: a worker that leased a nonce and never submitted leaves a gap that
// stalls the account's later transactions forever. Every failure is kept,
// including panics and the cancelled tasks, and the phase fails with the
// complete list.

use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;
use tokio::task::{Id, JoinSet};

/// One failed unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Label given at spawn time
    pub label: String,
    /// Error or panic message
    pub cause: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.cause)
    }
}

/// A phase in which at least one task failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub struct PhaseFailure {
    /// Phase name
    pub phase: String,
    /// Number of tasks in the phase
    pub total: usize,
    /// Every failed task, in spawn order
    pub failures: Vec<TaskFailure>,
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} of {} tasks failed: ",
            self.phase,
            self.failures.len(),
            self.total
        )?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

type Outcome<T> = (usize, String, Result<T, String>);

/// Spawn-then-join group of tasks for one phase
pub struct TaskGroup<T> {
    phase: String,
    set: JoinSet<Outcome<T>>,
    labels: HashMap<Id, (usize, String)>,
    spawned: usize,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Empty group for `phase`
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            set: JoinSet::new(),
            labels: HashMap::new(),
            spawned: 0,
        }
    }

    /// Spawn one unit of work
    pub fn spawn<F, E>(&mut self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let index = self.spawned;
        let label = label.into();
        self.spawned += 1;
        let tracked = label.clone();
        let handle = self.set.spawn(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.to_string()),
                Err(payload) => Err(panic_message(payload)),
            };
            (index, label, result)
        });
        self.labels.insert(handle.id(), (index, tracked));
    }

    /// Number of spawned tasks
    pub fn len(&self) -> usize {
        self.spawned
    }

    /// Whether nothing was spawned
    pub fn is_empty(&self) -> bool {
        self.spawned == 0
    }

    /// Wait for every task; results come back in spawn order
    ///
    /// The first failed task aborts the others, which are then reported as
    /// cancelled.
    pub async fn join(mut self) -> Result<Vec<T>, PhaseFailure> {
        let mut outcomes: Vec<Outcome<T>> = Vec::with_capacity(self.spawned);
        let mut first_failure: Option<String> = None;

        while let Some(joined) = self.set.join_next_with_id().await {
            let outcome = match joined {
                Ok((id, outcome)) => {
                    self.labels.remove(&id);
                    outcome
                }
                Err(e) => {
                    let (index, label) = self
                        .labels
                        .remove(&e.id())
                        .unwrap_or((usize::MAX, "<unknown>".to_string()));
                    let cause = match &first_failure {
                        Some(first) if e.is_cancelled() => format!("cancelled after {} failed", first),
                        _ => format!("task aborted: {}", e),
                    };
                    (index, label, Err(cause))
                }
            };

            if first_failure.is_none() {
                if let Err(cause) = &outcome.2 {
                    log::error!(
                        "{}: {} failed ({}), cancelling {} remaining tasks",
                        self.phase,
                        outcome.1,
                        cause,
                        self.set.len()
                    );
                    first_failure = Some(outcome.1.clone());
                    self.set.abort_all();
                }
            }
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut values = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (_, label, result) in outcomes {
            match result {
                Ok(value) => values.push(value),
                Err(cause) => failures.push(TaskFailure { label, cause }),
            }
        }

        if failures.is_empty() {
            Ok(values)
        } else {
            Err(PhaseFailure {
                phase: self.phase,
                total: self.spawned,
                failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_in_spawn_order() {
        let mut group = TaskGroup::new("ordering");
        for i in 0..5u64 {
            group.spawn(format!("task-{}", i), async move {
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                Ok::<_, String>(i)
            });
        }
        assert_eq!(group.len(), 5);
        assert_eq!(group.join().await.unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_all_failures_collected() {
        let mut group = TaskGroup::<()>::new("deposits");
        group.spawn("bad-1", async { Err("insufficient allowance".to_string()) });
        group.spawn("bad-2", async { Err("nonce too low".to_string()) });

        let failure = group.join().await.unwrap_err();
        assert_eq!(failure.total, 2);
        let labels: Vec<_> = failure.failures.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, vec!["bad-1", "bad-2"]);
        assert!(failure.to_string().contains("2 of 2 tasks failed"));
    }

    #[tokio::test]
    async fn test_failure_cancels_stalled_tasks() {
        let mut group = TaskGroup::<()>::new("funding");
        group.spawn("waiting on a nonce gap", std::future::pending::<Result<(), String>>());
        group.spawn("send", async { Err("connection reset".to_string()) });

        let failure = tokio::time::timeout(Duration::from_secs(5), group.join())
            .await
            .expect("join must not wait for stalled tasks")
            .unwrap_err();
        assert_eq!(
            failure.failures,
            vec![
                TaskFailure {
                    label: "waiting on a nonce gap".into(),
                    cause: "cancelled after send failed".into()
                },
                TaskFailure {
                    label: "send".into(),
                    cause: "connection reset".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let mut group = TaskGroup::<u8>::new("funding");
        group.spawn("boom", async {
            if true {
                panic!("worker exploded");
            }
            Ok::<_, String>(1)
        });
        let failure = group.join().await.unwrap_err();
        assert_eq!(failure.failures[0].label, "boom");
        assert!(failure.failures[0].cause.contains("worker exploded"));
    }

    #[tokio::test]
    async fn test_empty_group_joins() {
        let group = TaskGroup::<()>::new("nothing");
        assert!(group.is_empty());
        assert!(group.join().await.unwrap().is_empty());
    }
}
