//! Boot milestone state machine.
//!
//! Pure bookkeeping: the orchestrator feeds console lines and control-channel
//! results in, and acts on the returned [`Step`]. The machine guarantees the
//! key is injected at most once and only after the idle milestone.

use std::time::Duration;

use crate::error::{HarnessError, TestOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    AwaitingIdle,
    ChannelOpen,
    KeySent,
    AwaitingConfirm,
    Pass,
    Fail,
}

impl BootState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Pass | Self::Fail)
    }
}

/// Console substrings that mark guest progress.
#[derive(Debug, Clone)]
pub struct Markers {
    /// Guest enabled interrupts and parked in its idle loop.
    pub idle: String,
    /// Keyboard driver reported a received scancode.
    pub confirm: String,
}

/// What the orchestrator has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Connect, negotiate and inject the key now.
    OpenChannel,
    /// A verdict has been reached.
    Finished,
}

pub struct BootMilestones {
    markers: Markers,
    state: BootState,
    keys_sent: u32,
    outcome: Option<TestOutcome>,
}

impl BootMilestones {
    pub fn new(markers: Markers) -> Self {
        Self {
            markers,
            state: BootState::AwaitingIdle,
            keys_sent: 0,
            outcome: None,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    pub fn keys_sent(&self) -> u32 {
        self.keys_sent
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Matches one console line against the marker the current state waits for.
    pub fn observe_line(&mut self, line: &str) -> Step {
        match self.state {
            BootState::AwaitingIdle if line.contains(&self.markers.idle) => {
                self.transition(BootState::ChannelOpen);
                Step::OpenChannel
            }
            BootState::AwaitingConfirm if line.contains(&self.markers.confirm) => {
                self.transition(BootState::Pass);
                self.outcome = Some(TestOutcome::Pass);
                Step::Finished
            }
            state if state.is_terminal() => Step::Finished,
            _ => Step::Continue,
        }
    }

    /// The key was acknowledged by the control channel.
    pub fn key_delivered(&mut self) {
        if self.state != BootState::ChannelOpen {
            tracing::warn!(state = ?self.state, "ignoring key delivery outside channel-open state");
            return;
        }
        self.keys_sent += 1;
        self.transition(BootState::KeySent);
        self.transition(BootState::AwaitingConfirm);
    }

    /// Records a failure unless a verdict already exists.
    pub fn fail(&mut self, error: HarnessError) {
        if self.is_finished() {
            return;
        }
        tracing::info!(reason = %error.kind(), "{}", error);
        self.transition(BootState::Fail);
        self.outcome = Some(TestOutcome::Fail(error));
    }

    pub fn deadline_elapsed(&mut self, deadline: Duration) {
        self.fail(HarnessError::Timeout(deadline));
    }

    pub fn process_exited(&mut self, status: String) {
        self.fail(HarnessError::ProcessExited(status));
    }

    /// Consumes the machine. `None` while no verdict has been reached.
    pub fn into_outcome(self) -> Option<TestOutcome> {
        self.outcome
    }

    fn transition(&mut self, to: BootState) {
        tracing::info!(from = ?self.state, to = ?to, "milestone");
        self.state = to;
    }
}
