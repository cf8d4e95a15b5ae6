//! Per-column state machine.
//!
//! The phases mirror the processing steps of one column. The machine is
//! monotonic: there is no edge from the final validation back to any OCR
//! phase, and the remote pass can be entered at most once. This is what
//! bounds the validate → remote → validate cycle.

use crate::core::ExtractError;

/// Processing phase of a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnPhase {
    Init,
    LocalOcrDone,
    ValidatedStage1,
    Stage1Gaps,
    RemoteOcrDone,
    Reconciled,
    ValidatedFinal,
    CompleteOk,
    CompletePartial,
    Failed,
}

impl ColumnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ColumnPhase::CompleteOk | ColumnPhase::CompletePartial | ColumnPhase::Failed
        )
    }
}

/// Tracks the phase of one column plus the remote-used bit.
#[derive(Debug, Clone)]
pub struct ColumnState {
    phase: ColumnPhase,
    remote_used: bool,
}

impl ColumnState {
    pub fn new() -> Self {
        Self {
            phase: ColumnPhase::Init,
            remote_used: false,
        }
    }

    pub fn phase(&self) -> ColumnPhase {
        self.phase
    }

    pub fn remote_used(&self) -> bool {
        self.remote_used
    }

    /// Moves to the next phase, rejecting transitions the machine does not
    /// have. A rejected transition is a bug in the orchestrator, so it maps
    /// to an internal error rather than being papered over.
    pub fn advance(&mut self, next: ColumnPhase) -> Result<(), ExtractError> {
        if next == ColumnPhase::RemoteOcrDone && self.remote_used {
            return Err(ExtractError::internal(
                "remote OCR invoked twice for the same column",
            ));
        }
        if !allowed(self.phase, next) {
            return Err(ExtractError::internal(format!(
                "illegal column transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        if next == ColumnPhase::RemoteOcrDone {
            self.remote_used = true;
        }
        self.phase = next;
        Ok(())
    }
}

impl Default for ColumnState {
    fn default() -> Self {
        Self::new()
    }
}

fn allowed(from: ColumnPhase, to: ColumnPhase) -> bool {
    use ColumnPhase::*;
    if to == Failed {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Init, LocalOcrDone)
            // A second local pass with relaxed gates stays in the same phase.
            | (LocalOcrDone, LocalOcrDone)
            | (LocalOcrDone, ValidatedStage1)
            | (ValidatedStage1, CompleteOk)
            | (ValidatedStage1, CompletePartial)
            | (ValidatedStage1, Stage1Gaps)
            | (Stage1Gaps, RemoteOcrDone)
            | (Stage1Gaps, CompletePartial)
            | (RemoteOcrDone, Reconciled)
            | (Reconciled, ValidatedFinal)
            | (ValidatedFinal, CompleteOk)
            | (ValidatedFinal, CompletePartial)
    )
}
