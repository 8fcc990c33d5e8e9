//! Per-payment state machine
//!
//! Every outgoing payment embeds a [`PaymentState`] that walks the ordered
//! sending priority one plugin at a time: `INITIAL → IN_PROGRESS →
//! {COMPLETED | FAILED}` with `CANCELLED` reachable from any non-terminal
//! state. Terminal states are absorbing.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::unix_time_ms;

/// State machine error
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Transition is not defined for the current state
    #[error("Invalid state transition from `{0}`")]
    InvalidState(InternalState),
    /// A plugin is already engaged for this payment
    #[error("Plugin `{0}` is in progress")]
    PluginInProgress(String),
    /// No plugin is currently engaged
    #[error("No plugin is in progress")]
    NoPluginInProgress,
    /// Sending priority must name at least one plugin
    #[error("No plugins provided")]
    NoPluginsProvided,
}

/// Direction of a payment
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentDirection {
    /// Incoming payment
    In,
    /// Outgoing payment
    Out,
}

impl fmt::Display for PaymentDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentDirection::In => write!(f, "IN"),
            PaymentDirection::Out => write!(f, "OUT"),
        }
    }
}

/// Internal lifecycle state of a payment
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalState {
    /// Created but not yet processed
    Initial,
    /// A plugin attempt is underway or pending
    InProgress,
    /// A plugin confirmed the payment
    Completed,
    /// Every plugin in the sending priority failed
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl InternalState {
    /// Whether the state is terminal
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            InternalState::Completed | InternalState::Failed | InternalState::Cancelled
        )
    }
}

impl fmt::Display for InternalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InternalState::Initial => write!(f, "INITIAL"),
            InternalState::InProgress => write!(f, "IN_PROGRESS"),
            InternalState::Completed => write!(f, "COMPLETED"),
            InternalState::Failed => write!(f, "FAILED"),
            InternalState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Outcome state of a single plugin attempt
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginRunState {
    /// Attempt handed to the plugin
    Submitted,
    /// Plugin reported failure
    Failed,
    /// Plugin reported success
    Success,
}

/// Record of a single plugin attempt
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRun {
    /// Plugin name
    pub name: String,
    /// Attempt start, milliseconds since epoch
    pub start_at: u64,
    /// Attempt end, set when the attempt resolves
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_at: Option<u64>,
    /// Attempt outcome
    pub state: PluginRunState,
}

/// Per-payment state machine driving plugin attempts
///
/// The pending queue, the current attempt, the tried log and the completing
/// attempt always form a permutation of the payment's sending priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentState {
    internal_state: InternalState,
    pending_plugins: Vec<String>,
    tried_plugins: Vec<PluginRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_plugin: Option<PluginRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_by_plugin: Option<PluginRun>,
}

impl PaymentState {
    /// New state machine over an ordered sending priority
    pub fn new(sending_priority: &[String]) -> Result<Self, Error> {
        if sending_priority.is_empty() {
            return Err(Error::NoPluginsProvided);
        }
        Ok(Self {
            internal_state: InternalState::Initial,
            pending_plugins: sending_priority.to_vec(),
            tried_plugins: Vec::new(),
            current_plugin: None,
            completed_by_plugin: None,
        })
    }

    /// Current lifecycle state
    pub fn internal_state(&self) -> InternalState {
        self.internal_state
    }

    /// Plugins not yet attempted, in priority order
    pub fn pending_plugins(&self) -> &[String] {
        &self.pending_plugins
    }

    /// Resolved attempts, oldest first
    pub fn tried_plugins(&self) -> &[PluginRun] {
        &self.tried_plugins
    }

    /// Attempt currently underway
    pub fn current_plugin(&self) -> Option<&PluginRun> {
        self.current_plugin.as_ref()
    }

    /// The attempt that completed the payment
    pub fn completed_by_plugin(&self) -> Option<&PluginRun> {
        self.completed_by_plugin.as_ref()
    }

    /// Whether the payment reached a terminal state
    pub fn is_final(&self) -> bool {
        self.internal_state.is_final()
    }

    /// Whether the payment failed
    pub fn is_failed(&self) -> bool {
        self.internal_state == InternalState::Failed
    }

    /// Whether a plugin attempt is underway or pending
    pub fn is_in_progress(&self) -> bool {
        self.internal_state == InternalState::InProgress
    }

    /// Whether the payment completed
    pub fn is_completed(&self) -> bool {
        self.internal_state == InternalState::Completed
    }

    /// Combined driver: engage the next pending plugin, or fail the payment
    /// once the queue is exhausted
    ///
    /// Returns `true` when a plugin was engaged and `false` when the payment
    /// transitioned to `FAILED`.
    pub fn process(&mut self) -> Result<bool, Error> {
        match self.internal_state {
            InternalState::Initial | InternalState::InProgress => {
                if let Some(current) = &self.current_plugin {
                    return Err(Error::PluginInProgress(current.name.clone()));
                }
                if self.pending_plugins.is_empty() {
                    self.internal_state = InternalState::Failed;
                    return Ok(false);
                }
                let name = self.pending_plugins.remove(0);
                self.current_plugin = Some(PluginRun {
                    name,
                    start_at: unix_time_ms(),
                    end_at: None,
                    state: PluginRunState::Submitted,
                });
                self.internal_state = InternalState::InProgress;
                Ok(true)
            }
            state => Err(Error::InvalidState(state)),
        }
    }

    /// Engage the next pending plugin of a payment already in progress
    pub fn try_next(&mut self) -> Result<bool, Error> {
        if self.internal_state != InternalState::InProgress {
            return Err(Error::InvalidState(self.internal_state));
        }
        self.process()
    }

    /// Resolve the current attempt as failed and clear it
    pub fn fail_current_plugin(&mut self) -> Result<(), Error> {
        if self.internal_state != InternalState::InProgress {
            return Err(Error::InvalidState(self.internal_state));
        }
        let mut run = self.current_plugin.take().ok_or(Error::NoPluginInProgress)?;
        run.state = PluginRunState::Failed;
        run.end_at = Some(unix_time_ms());
        self.tried_plugins.push(run);
        Ok(())
    }

    /// Resolve the current attempt as the completing one
    pub fn complete(&mut self) -> Result<(), Error> {
        if self.internal_state != InternalState::InProgress {
            return Err(Error::InvalidState(self.internal_state));
        }
        let mut run = self.current_plugin.take().ok_or(Error::NoPluginInProgress)?;
        run.state = PluginRunState::Success;
        run.end_at = Some(unix_time_ms());
        self.completed_by_plugin = Some(run);
        self.internal_state = InternalState::Completed;
        Ok(())
    }

    /// Cancel a payment that has not reached a terminal state
    pub fn cancel(&mut self) -> Result<(), Error> {
        match self.internal_state {
            InternalState::Initial | InternalState::InProgress => {
                self.internal_state = InternalState::Cancelled;
                Ok(())
            }
            state => Err(Error::InvalidState(state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn priority() -> Vec<String> {
        ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_walks_priority_to_failure() {
        let mut state = PaymentState::new(&priority()).unwrap();
        for name in ["a", "b", "c", "d"] {
            assert!(state.process().unwrap());
            assert_eq!(state.internal_state(), InternalState::InProgress);
            assert_eq!(state.current_plugin().unwrap().name, name);
            state.fail_current_plugin().unwrap();
        }
        // Queue exhausted, the fifth drive fails the payment
        assert!(!state.process().unwrap());
        assert_eq!(state.internal_state(), InternalState::Failed);
        assert_eq!(state.tried_plugins().len(), 4);
        assert!(state
            .tried_plugins()
            .iter()
            .all(|run| run.state == PluginRunState::Failed && run.end_at.is_some()));
    }

    #[test]
    fn test_complete_first_attempt() {
        let mut state = PaymentState::new(&priority()).unwrap();
        assert!(state.process().unwrap());
        state.complete().unwrap();
        assert_eq!(state.internal_state(), InternalState::Completed);
        assert_eq!(state.completed_by_plugin().unwrap().name, "a");
        assert!(state.current_plugin().is_none());
        assert!(state.tried_plugins().is_empty());
    }

    #[test]
    fn test_process_with_plugin_engaged() {
        let mut state = PaymentState::new(&priority()).unwrap();
        state.process().unwrap();
        assert_eq!(
            state.process(),
            Err(Error::PluginInProgress("a".to_string()))
        );
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut state = PaymentState::new(&priority()).unwrap();
        state.cancel().unwrap();
        assert_eq!(state.internal_state(), InternalState::Cancelled);
        assert_eq!(
            state.cancel(),
            Err(Error::InvalidState(InternalState::Cancelled))
        );
        assert_eq!(
            state.process(),
            Err(Error::InvalidState(InternalState::Cancelled))
        );
    }

    #[test]
    fn test_fail_from_initial_is_invalid() {
        let mut state = PaymentState::new(&priority()).unwrap();
        assert_eq!(
            state.fail_current_plugin(),
            Err(Error::InvalidState(InternalState::Initial))
        );
    }

    #[test]
    fn test_empty_priority_rejected() {
        assert_eq!(PaymentState::new(&[]), Err(Error::NoPluginsProvided));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut state = PaymentState::new(&priority()).unwrap();
        state.process().unwrap();
        state.fail_current_plugin().unwrap();
        state.process().unwrap();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["internalState"], "IN_PROGRESS");
        let back: PaymentState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
