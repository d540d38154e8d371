//! Deployment plan and step sequencer.
//!
//! The sequencer is a pure state machine. It never performs I/O itself: each
//! transition hands back a [`Dispatch`] telling the caller what to run next,
//! and the caller reports completion (or failure) of that step back. Because
//! the only way to advance is to report on the step currently running, step
//! `i + 1` can never be dispatched before step `i` has finished.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Where a deployment step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Local,
    Remote,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Local => write!(f, "local"),
            Target::Remote => write!(f, "remote"),
        }
    }
}

/// A single command in the deployment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub command: String,
    pub target: Target,
}

impl DeploymentStep {
    pub fn local(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            target: Target::Local,
        }
    }

    pub fn remote(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            target: Target::Remote,
        }
    }
}

/// Ordered, immutable list of deployment steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentPlan {
    steps: Vec<DeploymentStep>,
}

impl DeploymentPlan {
    pub fn new(steps: Vec<DeploymentStep>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeploymentStep> {
        self.steps.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeploymentStep> {
        self.steps.iter()
    }
}

/// Mutable progress through the plan.
///
/// `current_index` never decreases and `running` is set for at most one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploymentCursor {
    pub current_index: usize,
    pub running: bool,
    pub complete: bool,
}

/// Sequencer lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    Running(usize),
    Complete,
    Aborted { index: usize, reason: String },
}

impl SequencerState {
    /// Complete and Aborted accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SequencerState::Complete | SequencerState::Aborted { .. })
    }
}

/// What the caller has to do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Run `command` with the local runner and report back on completion.
    Local { index: usize, command: String },
    /// Write `command` to the remote shell and report back after the settle delay.
    Remote { index: usize, command: String },
    /// Nothing left to run.
    Complete,
}

/// Sequencer transition errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequencerError {
    #[error("deployment plan has already been started")]
    AlreadyStarted,

    #[error("no deployment step is running")]
    NotRunning,

    #[error("step {got} reported while step {expected} is running")]
    StaleStep { expected: usize, got: usize },
}

/// Drives a [`DeploymentPlan`] one step at a time.
#[derive(Debug)]
pub struct Sequencer {
    plan: DeploymentPlan,
    state: SequencerState,
    cursor: DeploymentCursor,
}

impl Sequencer {
    pub fn new(plan: DeploymentPlan) -> Self {
        Self {
            plan,
            state: SequencerState::Idle,
            cursor: DeploymentCursor::default(),
        }
    }

    pub fn plan(&self) -> &DeploymentPlan {
        &self.plan
    }

    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    pub fn cursor(&self) -> DeploymentCursor {
        self.cursor
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SequencerState::Running(_))
    }

    /// Leaves Idle. Only one execution per sequencer is allowed.
    pub fn start(&mut self) -> Result<Dispatch, SequencerError> {
        if self.state != SequencerState::Idle {
            return Err(SequencerError::AlreadyStarted);
        }

        info!(steps = self.plan.len(), "Starting deployment plan");
        if self.plan.is_empty() {
            self.finish();
            return Ok(Dispatch::Complete);
        }

        Ok(self.enter(0))
    }

    /// Reports that step `index` completed and returns the next dispatch.
    pub fn step_finished(&mut self, index: usize) -> Result<Dispatch, SequencerError> {
        let current = self.running_index()?;
        if current != index {
            warn!(expected = current, got = index, "Ignoring stale step completion");
            return Err(SequencerError::StaleStep {
                expected: current,
                got: index,
            });
        }

        debug!(step = index, "Deployment step finished");
        let next = index + 1;
        if next >= self.plan.len() {
            self.finish();
            return Ok(Dispatch::Complete);
        }

        Ok(self.enter(next))
    }

    /// Reports that step `index` failed. The plan is aborted and the cursor
    /// stays on the failing step.
    pub fn step_failed(
        &mut self,
        index: usize,
        reason: impl Into<String>,
    ) -> Result<(), SequencerError> {
        let current = self.running_index()?;
        if current != index {
            return Err(SequencerError::StaleStep {
                expected: current,
                got: index,
            });
        }

        let reason = reason.into();
        warn!(step = index, %reason, "Deployment aborted");
        self.cursor.running = false;
        self.state = SequencerState::Aborted { index, reason };
        Ok(())
    }

    fn running_index(&self) -> Result<usize, SequencerError> {
        match self.state {
            SequencerState::Running(i) => Ok(i),
            _ => Err(SequencerError::NotRunning),
        }
    }

    fn enter(&mut self, index: usize) -> Dispatch {
        self.state = SequencerState::Running(index);
        self.cursor.current_index = index;
        self.cursor.running = true;

        // enter() is only called with an index inside the plan
        let step = &self.plan.steps[index];
        info!(step = index, target = %step.target, command = %step.command, "Dispatching deployment step");
        match step.target {
            Target::Local => Dispatch::Local {
                index,
                command: step.command.clone(),
            },
            Target::Remote => Dispatch::Remote {
                index,
                command: step.command.clone(),
            },
        }
    }

    fn finish(&mut self) {
        self.state = SequencerState::Complete;
        self.cursor = DeploymentCursor {
            current_index: self.plan.len(),
            running: false,
            complete: true,
        };
        info!("Deployment plan complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_step_plan() -> DeploymentPlan {
        DeploymentPlan::new(vec![
            DeploymentStep::local("echo a"),
            DeploymentStep::remote("echo b"),
            DeploymentStep::local("echo c"),
        ])
    }

    #[test]
    fn test_empty_plan_completes_immediately() {
        let mut seq = Sequencer::new(DeploymentPlan::default());
        assert_eq!(seq.start().unwrap(), Dispatch::Complete);
        assert_eq!(seq.state(), &SequencerState::Complete);
        assert_eq!(
            seq.cursor(),
            DeploymentCursor {
                current_index: 0,
                running: false,
                complete: true
            }
        );
    }

    #[test]
    fn test_full_run() {
        let mut seq = Sequencer::new(three_step_plan());

        assert_eq!(
            seq.start().unwrap(),
            Dispatch::Local {
                index: 0,
                command: "echo a".into()
            }
        );
        assert!(seq.cursor().running);

        assert_eq!(
            seq.step_finished(0).unwrap(),
            Dispatch::Remote {
                index: 1,
                command: "echo b".into()
            }
        );
        assert_eq!(seq.cursor().current_index, 1);

        assert_eq!(
            seq.step_finished(1).unwrap(),
            Dispatch::Local {
                index: 2,
                command: "echo c".into()
            }
        );

        assert_eq!(seq.step_finished(2).unwrap(), Dispatch::Complete);
        assert_eq!(seq.state(), &SequencerState::Complete);

        let cursor = seq.cursor();
        assert_eq!(cursor.current_index, 3);
        assert!(cursor.complete);
        assert!(!cursor.running);
    }

    #[test]
    fn test_start_only_once() {
        let mut seq = Sequencer::new(three_step_plan());
        seq.start().unwrap();
        assert_eq!(seq.start(), Err(SequencerError::AlreadyStarted));

        let mut empty = Sequencer::new(DeploymentPlan::default());
        empty.start().unwrap();
        assert_eq!(empty.start(), Err(SequencerError::AlreadyStarted));
    }

    #[test]
    fn test_next_step_requires_current_completion() {
        let mut seq = Sequencer::new(three_step_plan());
        seq.start().unwrap();

        // Reporting a later step does not skip ahead.
        assert_eq!(
            seq.step_finished(1),
            Err(SequencerError::StaleStep {
                expected: 0,
                got: 1
            })
        );
        assert_eq!(seq.state(), &SequencerState::Running(0));
        assert_eq!(seq.cursor().current_index, 0);
    }

    #[test]
    fn test_failure_aborts_and_keeps_index() {
        let mut seq = Sequencer::new(three_step_plan());
        seq.start().unwrap();
        seq.step_finished(0).unwrap();
        seq.step_finished(1).unwrap();

        seq.step_failed(2, "exit status 1").unwrap();
        assert_eq!(
            seq.state(),
            &SequencerState::Aborted {
                index: 2,
                reason: "exit status 1".into()
            }
        );

        let cursor = seq.cursor();
        assert_eq!(cursor.current_index, 2);
        assert!(!cursor.running);
        assert!(!cursor.complete);
        assert!(seq.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let mut seq = Sequencer::new(three_step_plan());
        seq.start().unwrap();
        seq.step_failed(0, "boom").unwrap();

        assert_eq!(seq.step_finished(0), Err(SequencerError::NotRunning));
        assert_eq!(seq.step_failed(0, "again"), Err(SequencerError::NotRunning));
        assert_eq!(seq.cursor().current_index, 0);
    }

    #[test]
    fn test_idle_rejects_reports() {
        let mut seq = Sequencer::new(three_step_plan());
        assert_eq!(seq.step_finished(0), Err(SequencerError::NotRunning));
        assert!(!seq.is_running());
        assert!(!seq.state().is_terminal());
    }

    #[test]
    fn test_cursor_never_decreases() {
        let mut seq = Sequencer::new(three_step_plan());
        let mut last = seq.cursor().current_index;
        let mut dispatch = seq.start().unwrap();

        loop {
            let index = match dispatch {
                Dispatch::Local { index, .. } | Dispatch::Remote { index, .. } => index,
                Dispatch::Complete => break,
            };
            assert!(seq.cursor().current_index >= last);
            last = seq.cursor().current_index;
            dispatch = seq.step_finished(index).unwrap();
        }
        assert_eq!(seq.cursor().current_index, 3);
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::Local.to_string(), "local");
        assert_eq!(Target::Remote.to_string(), "remote");
    }
}
