//! Lifecycle state machine for a job.
//!
//! The state gates input admission, completion, and result reads. It only
//! ever advances:
//!
//! ```text
//! Created -> ReceivingInputs -> AllInputReceived -> AllOutputReceived
//! ```
//!
//! Any transition outside that chain lands the job in [`JobState::Error`],
//! which is absorbing: no further operation succeeds.
//!
//! The state lives in an atomic cell. Transitions load the current state,
//! validate the edge, then store the new state. Each edge is driven by a
//! single actor (the producer closes inputs, the completion waiter marks
//! output done), so load/validate/store without compare-and-swap is
//! sufficient; concurrent contenders for the same edge observe identical
//! preconditions.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

/// The lifecycle state of a job, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum JobState {
    /// Initial state, no inputs yet.
    Created = 0,

    /// At least one input has been accepted.
    ReceivingInputs = 1,

    /// The producer declared the input set closed.
    AllInputReceived = 2,

    /// The collector drained all outputs; results are readable.
    AllOutputReceived = 3,

    /// An invalid transition was observed; the job rejects further
    /// operations.
    Error = 4,
}

impl JobState {
    fn from_u8(v: u8) -> JobState {
        match v {
            0 => JobState::Created,
            1 => JobState::ReceivingInputs,
            2 => JobState::AllInputReceived,
            3 => JobState::AllOutputReceived,
            _ => JobState::Error,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Created => "created",
            JobState::ReceivingInputs => "receiving-inputs",
            JobState::AllInputReceived => "all-input-received",
            JobState::AllOutputReceived => "all-output-received",
            JobState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Error returned when an operation is issued against a job in the wrong
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {operation} in state {state}")]
pub struct StateError {
    /// The operation that was rejected.
    pub operation: &'static str,

    /// The state the job was in when the operation arrived.
    pub state: JobState,
}

/// Atomic holder of a job's [`JobState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// A new cell in [`JobState::Created`].
    pub fn new() -> Self {
        StateCell(AtomicU8::new(JobState::Created as u8))
    }

    /// Reads the current state.
    pub fn get(&self) -> JobState {
        JobState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: JobState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Admits an input batch: `Created` or `ReceivingInputs` advance to
    /// `ReceivingInputs`; anything else is rejected without changing state.
    pub fn admit_input(&self) -> Result<(), StateError> {
        match self.get() {
            JobState::Created | JobState::ReceivingInputs => {
                self.set(JobState::ReceivingInputs);
                Ok(())
            }
            state => Err(StateError {
                operation: "accept inputs",
                state,
            }),
        }
    }

    /// Closes the input set: `ReceivingInputs` advances to
    /// `AllInputReceived`. From any other state the cell moves to `Error`
    /// and the call fails.
    pub fn close_inputs(&self) -> Result<(), StateError> {
        match self.get() {
            JobState::ReceivingInputs => {
                self.set(JobState::AllInputReceived);
                Ok(())
            }
            state => {
                self.set(JobState::Error);
                Err(StateError {
                    operation: "close inputs",
                    state,
                })
            }
        }
    }

    /// Marks all outputs received: `AllInputReceived` advances to
    /// `AllOutputReceived`. `Error` is left untouched; any other source
    /// state is itself an invalid transition and moves the cell to `Error`.
    pub fn mark_all_output(&self) {
        match self.get() {
            JobState::AllInputReceived => self.set(JobState::AllOutputReceived),
            JobState::Error => {}
            _ => self.set(JobState::Error),
        }
    }

    /// Moves the cell to `Error` unconditionally.
    pub fn mark_error(&self) {
        self.set(JobState::Error);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_cell_is_created() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), JobState::Created);
    }

    #[test]
    fn admit_moves_created_to_receiving() {
        let cell = StateCell::new();
        cell.admit_input().unwrap();
        assert_eq!(cell.get(), JobState::ReceivingInputs);
    }

    #[test]
    fn admit_is_reentrant_while_receiving() {
        let cell = StateCell::new();
        cell.admit_input().unwrap();
        cell.admit_input().unwrap();
        assert_eq!(cell.get(), JobState::ReceivingInputs);
    }

    #[test]
    fn admit_after_close_fails_without_corrupting_state() {
        let cell = StateCell::new();
        cell.admit_input().unwrap();
        cell.close_inputs().unwrap();

        let err = cell.admit_input().unwrap_err();
        assert_eq!(err.state, JobState::AllInputReceived);
        // Rejected admission does not disturb the lifecycle.
        assert_eq!(cell.get(), JobState::AllInputReceived);
    }

    #[test]
    fn close_from_created_is_an_error_transition() {
        let cell = StateCell::new();
        let err = cell.close_inputs().unwrap_err();
        assert_eq!(err.state, JobState::Created);
        assert_eq!(cell.get(), JobState::Error);
    }

    #[test]
    fn close_twice_lands_in_error() {
        let cell = StateCell::new();
        cell.admit_input().unwrap();
        cell.close_inputs().unwrap();

        let err = cell.close_inputs().unwrap_err();
        assert_eq!(err.state, JobState::AllInputReceived);
        assert_eq!(cell.get(), JobState::Error);
    }

    #[test]
    fn full_lifecycle_reaches_all_output_received() {
        let cell = StateCell::new();
        cell.admit_input().unwrap();
        cell.close_inputs().unwrap();
        cell.mark_all_output();
        assert_eq!(cell.get(), JobState::AllOutputReceived);
    }

    #[test]
    fn mark_all_output_before_close_is_invalid() {
        let cell = StateCell::new();
        cell.admit_input().unwrap();
        cell.mark_all_output();
        assert_eq!(cell.get(), JobState::Error);
    }

    #[test]
    fn error_state_is_absorbing() {
        let cell = StateCell::new();
        cell.mark_error();

        assert!(cell.admit_input().is_err());
        assert!(cell.close_inputs().is_err());
        cell.mark_all_output();
        assert_eq!(cell.get(), JobState::Error);
    }

    #[test]
    fn state_error_message_names_operation_and_state() {
        let cell = StateCell::new();
        cell.admit_input().unwrap();
        cell.close_inputs().unwrap();
        let err = cell.admit_input().unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot accept inputs in state all-input-received"
        );
    }

    /// The operations a caller can drive, for the property test below.
    #[derive(Debug, Clone, Copy)]
    enum Op {
        Admit,
        Close,
        MarkAllOutput,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Admit), Just(Op::Close), Just(Op::MarkAllOutput)]
    }

    proptest! {
        /// The state never moves backward along the lifecycle ordering,
        /// whatever sequence of operations is applied.
        #[test]
        fn prop_state_never_regresses(ops in prop::collection::vec(arb_op(), 0..30)) {
            let cell = StateCell::new();
            let mut prev = cell.get();

            for op in ops {
                match op {
                    Op::Admit => { let _ = cell.admit_input(); }
                    Op::Close => { let _ = cell.close_inputs(); }
                    Op::MarkAllOutput => cell.mark_all_output(),
                }
                let current = cell.get();
                prop_assert!(current >= prev, "state went backward: {} -> {}", prev, current);
                prev = current;
            }
        }
    }
}
