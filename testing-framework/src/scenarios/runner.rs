// File: testing-framework/src/scenarios/runner.rs
//
// Crash/Restart Scenario Runner
//
// Drives one scenario through its states:
//
//   Idle -> NodesStarting -> TransferTriggered -> AwaitingCrash -> CrashVerified
//        -> StateCapturedPreRestart -> Restarting -> AwaitingRecovery
//        -> StateCapturedPostRestart -> Evaluated(Pass | Fail)
//
// NodesStarting ends once every started node answers on its API.
// With `verify_idempotent_restart` the Restarting / AwaitingRecovery /
// StateCapturedPostRestart leg runs a second time before the verdict.
// Any error at a transition ends the run in Evaluated(Fail) with the state in
// which it happened; nothing is retried.

use super::parser::ScenarioSpec;
use super::result::{
    describe_snapshots, FailureCause, ScenarioResult, ScenarioState, StateVisit, Verdict,
};
use crate::invariants::evaluate_outcomes;
use crate::node::{NodeApi, NodeController, NodeError};
use crate::orchestrator::Clock;
use crate::probe::{ChannelSnapshot, ChannelStateProbe};
use crate::provisioning::{NodeDescriptor, TestTopology};
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::time::Instant;

/// Runs crash scenarios against a provisioned topology
pub struct ScenarioRunner {
    topology: Arc<TestTopology>,
    nodes: Arc<dyn NodeController>,
    api: Arc<dyn NodeApi>,
    probe: ChannelStateProbe,
    clock: Arc<dyn Clock>,
    kill_nodes_after: bool,
}

/// Bookkeeping of one run
struct Run<'a> {
    clock: &'a dyn Clock,
    started: Instant,
    states: Vec<StateVisit>,
}

impl<'a> Run<'a> {
    fn new(clock: &'a dyn Clock) -> Self {
        let mut run = Self {
            clock,
            started: clock.now(),
            states: Vec::new(),
        };
        run.enter(ScenarioState::Idle);
        run
    }

    fn enter(&mut self, state: ScenarioState) {
        let at_ms = self.clock.elapsed_since(self.started).as_millis() as u64;
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("-> {} at {} ms", state, at_ms);
        }
        self.states.push(StateVisit { state, at_ms });
    }

    fn current(&self) -> ScenarioState {
        self.states
            .last()
            .map(|v| v.state)
            .unwrap_or(ScenarioState::Idle)
    }

    fn step_failed(&self, cause: impl ToString) -> FailureCause {
        FailureCause::StepFailed {
            state: self.current(),
            cause: cause.to_string(),
        }
    }
}

/// Snapshots gathered by a successful run
#[derive(Default)]
struct Captured {
    before: Vec<ChannelSnapshot>,
    after: Vec<ChannelSnapshot>,
    after_second: Option<Vec<ChannelSnapshot>>,
    matched: Option<String>,
}

impl ScenarioRunner {
    /// Runner over `topology`
    ///
    /// Nodes are left running after each case; see [`Self::kill_nodes_after`].
    pub fn new(
        topology: Arc<TestTopology>,
        nodes: Arc<dyn NodeController>,
        api: Arc<dyn NodeApi>,
        probe: ChannelStateProbe,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            topology,
            nodes,
            api,
            probe,
            clock,
            kill_nodes_after: false,
        }
    }

    /// Kill every node once a case ends (non-debug environments)
    pub fn kill_nodes_after(mut self, enabled: bool) -> Self {
        self.kill_nodes_after = enabled;
        self
    }

    /// Topology the runner works on
    pub fn topology(&self) -> &TestTopology {
        &self.topology
    }

    /// Run `spec` to a verdict
    pub async fn run(&self, spec: &ScenarioSpec) -> ScenarioResult {
        let started_at = Utc::now();
        let mut run = Run::new(self.clock.as_ref());
        let mut captured = Captured::default();

        info!("{} BEGIN ====>", spec.name);
        match self.topology.to_pretty_json() {
            Ok(json) => info!("{} topology:\n{}", spec.name, json),
            Err(e) => warn!("Failed to serialize topology: {}", e),
        }

        let outcome = self.drive(spec, &mut run, &mut captured).await;
        let (verdict, cause) = match outcome {
            Ok(()) => (Verdict::Pass, None),
            Err(cause) => {
                error!("{}: {}", spec.name, cause);
                (Verdict::Fail, Some(cause))
            }
        };
        run.enter(ScenarioState::Evaluated(verdict));

        let result = ScenarioResult {
            case_name: spec.name.clone(),
            verdict,
            cause,
            matched_outcome: captured.matched,
            before_restart: captured.before,
            after_restart: captured.after,
            after_second_restart: captured.after_second,
            duration_ms: run.clock.elapsed_since(run.started).as_millis() as u64,
            states: run.states,
            started_at,
        };
        info!("{} END ====> {}", spec.name, result.status_word());

        if self.kill_nodes_after {
            if let Err(e) = self.nodes.kill_all().await {
                warn!("Failed to kill nodes after {}: {}", spec.name, e);
            }
        }
        result
    }

    async fn drive(
        &self,
        spec: &ScenarioSpec,
        run: &mut Run<'_>,
        captured: &mut Captured,
    ) -> Result<(), FailureCause> {
        spec.validate_against(&self.topology)
            .map_err(|e| run.step_failed(e))?;
        let crash_node = self.node(&spec.crash.node, run)?;

        run.enter(ScenarioState::NodesStarting);
        for name in &spec.start {
            let node = self.node(name, run)?;
            self.nodes.start(node).await.map_err(|e| run.step_failed(e))?;
        }
        self.nodes
            .start_with_crash_condition(crash_node, &spec.crash.checkpoint)
            .await
            .map_err(|e| run.step_failed(e))?;
        info!(
            "{} armed with crash checkpoint {}",
            crash_node.name, spec.crash.checkpoint
        );
        for name in spec.start.iter().chain([&spec.crash.node]) {
            let node = self.node(name, run)?;
            self.await_ready(spec, node)
                .await
                .map_err(|e| run.step_failed(e))?;
        }

        run.enter(ScenarioState::TransferTriggered);
        let source = self.node(&spec.transfer.source, run)?;
        let target = self.node(&spec.transfer.target, run)?;
        let token = self
            .topology
            .token(&spec.transfer.token)
            .ok_or_else(|| run.step_failed(format!("unknown token {}", spec.transfer.token)))?;
        self.api
            .transfer(source, &target.address, &token.address, spec.transfer.amount)
            .await
            .map_err(|e| run.step_failed(e))?;
        info!(
            "{} sends {} {} to {}",
            source.name, spec.transfer.amount, token.name, target.name
        );

        run.enter(ScenarioState::AwaitingCrash);
        if self.await_crash(spec, crash_node, run).await? {
            return Err(FailureCause::NodeDidNotCrash {
                node: crash_node.name.clone(),
                grace_ms: spec.timing.crash_grace_ms,
            });
        }
        run.enter(ScenarioState::CrashVerified);
        info!("{} exited at checkpoint {}", crash_node.name, spec.crash.checkpoint);

        captured.before = self.capture(spec, run).await?;
        run.enter(ScenarioState::StateCapturedPreRestart);
        for snapshot in &captured.before {
            info!("after crash: {}", snapshot);
        }

        captured.after = self.restart_and_capture(spec, crash_node, run).await?;
        for snapshot in &captured.after {
            info!("after restart: {}", snapshot);
        }

        let amount = spec.transfer.amount;
        match evaluate_outcomes(&captured.after, &spec.outcomes, amount) {
            Ok(index) => {
                let name = spec.outcomes[index].display_name(index);
                info!("{} matches {}", spec.name, name);
                captured.matched = Some(name);
            }
            Err(rejected) => {
                for (name, reasons) in &rejected {
                    warn!("{} rejected: {}", name, reasons.join("; "));
                }
                return Err(FailureCause::InvariantViolated {
                    observed: describe_snapshots(&captured.after),
                    expected: spec
                        .outcomes
                        .iter()
                        .map(|o| o.describe(amount))
                        .collect::<Vec<_>>()
                        .join(" | "),
                });
            }
        }

        if spec.verify_idempotent_restart {
            let again = self.restart_and_capture(spec, crash_node, run).await?;
            let stable = captured.after.len() == again.len()
                && captured
                    .after
                    .iter()
                    .zip(&again)
                    .all(|(x, y)| x.lock_state() == y.lock_state());
            let after = describe_snapshots(&again);
            captured.after_second = Some(again);
            if !stable {
                return Err(FailureCause::UnstableAfterRestart {
                    before: describe_snapshots(&captured.after),
                    after,
                });
            }
            info!("{} state unchanged after another restart", crash_node.name);
        }
        Ok(())
    }

    /// Poll until `node` answers on its API
    async fn await_ready(&self, spec: &ScenarioSpec, node: &NodeDescriptor) -> Result<(), NodeError> {
        let poll = spec.timing.liveness_poll();
        let deadline = self.clock.now() + spec.timing.startup();

        loop {
            if !self.nodes.is_running(node).await? {
                return Err(NodeError::ExitedDuringStartup(node.name.clone()));
            }
            if self.api.is_ready(node).await {
                if log::log_enabled!(log::Level::Debug) {
                    log::debug!("{} is ready", node.name);
                }
                return Ok(());
            }
            let now = self.clock.now();
            if now >= deadline {
                return Err(NodeError::NotReady {
                    node: node.name.clone(),
                    waited_ms: spec.timing.startup_ms,
                });
            }
            self.clock.sleep(poll.min(deadline - now)).await;
        }
    }

    /// Poll liveness inside the grace window; returns whether the node is still up
    async fn await_crash(
        &self,
        spec: &ScenarioSpec,
        node: &NodeDescriptor,
        run: &mut Run<'_>,
    ) -> Result<bool, FailureCause> {
        let grace = spec.timing.crash_grace();
        let poll = spec.timing.liveness_poll();
        let deadline = self.clock.now() + grace;

        loop {
            let alive = self
                .nodes
                .is_running(node)
                .await
                .map_err(|e| run.step_failed(e))?;
            if !alive {
                return Ok(false);
            }
            let now = self.clock.now();
            if now >= deadline {
                error!(
                    "Node {} should be exited, but it is still running",
                    node.name
                );
                return Ok(true);
            }
            self.clock.sleep(poll.min(deadline - now)).await;
        }
    }

    async fn restart_and_capture(
        &self,
        spec: &ScenarioSpec,
        node: &NodeDescriptor,
        run: &mut Run<'_>,
    ) -> Result<Vec<ChannelSnapshot>, FailureCause> {
        run.enter(ScenarioState::Restarting);
        self.nodes
            .restart(node)
            .await
            .map_err(|e| run.step_failed(e))?;

        run.enter(ScenarioState::AwaitingRecovery);
        self.clock.sleep(spec.timing.recovery()).await;

        let snapshots = self.capture(spec, run).await?;
        run.enter(ScenarioState::StateCapturedPostRestart);
        Ok(snapshots)
    }

    async fn capture(
        &self,
        spec: &ScenarioSpec,
        run: &Run<'_>,
    ) -> Result<Vec<ChannelSnapshot>, FailureCause> {
        let token = self
            .topology
            .token(&spec.transfer.token)
            .ok_or_else(|| run.step_failed(format!("unknown token {}", spec.transfer.token)))?;
        let mut snapshots = Vec::with_capacity(spec.probe.len());
        for pair in &spec.probe {
            let a = self.node(&pair.0, run)?;
            let b = self.node(&pair.1, run)?;
            let snapshot = self
                .probe
                .snapshot(a, b, &token.address)
                .await
                .map_err(|e| run.step_failed(e))?;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    fn node(&self, name: &str, run: &Run<'_>) -> Result<&NodeDescriptor, FailureCause> {
        self.topology
            .node(name)
            .ok_or_else(|| run.step_failed(format!("unknown node {}", name)))
    }
}
