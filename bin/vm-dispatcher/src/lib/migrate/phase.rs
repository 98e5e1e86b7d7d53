// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The step machine both migration tasks are driven by.
//!
//! A task runs the work of its current phase, reports the outcome as a
//! [`StepEvent`] and asks [`transition`] where to go next. The function is
//! pure so every (phase, event) pair can be checked in isolation.

use std::fmt::{Debug, Display};

/// Outcome of running one phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumIter)]
pub enum StepEvent {
    StepSucceeded,
    StepFailed,
    CancelRequested,
}

/// What the task does after a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Run the work of the new phase.
    RunStep,
    /// Undo every recorded step, then stop.
    Rollback,
    /// Stop without undoing anything.
    Finish,
    /// The event was ignored; keep going in the same phase.
    Continue,
}

/// A migration task's phase list.
pub trait Phase: Copy + Eq + Debug + Display {
    const FAILED: Self;
    const CANCELLED: Self;
    const DONE: Self;

    /// The phase entered when this one succeeds.
    fn next(self) -> Self;

    fn is_terminal(self) -> bool {
        self == Self::DONE || self == Self::FAILED || self == Self::CANCELLED
    }

    /// Past this point the peer has committed and local cancellation is no
    /// longer honoured.
    fn ignores_cancel(self) -> bool;
}

pub fn transition<P: Phase>(phase: P, event: StepEvent) -> (P, Effect) {
    if phase.is_terminal() {
        return (phase, Effect::Finish);
    }
    match event {
        StepEvent::StepSucceeded => {
            let next = phase.next();
            if next == P::DONE {
                (next, Effect::Finish)
            } else {
                (next, Effect::RunStep)
            }
        }
        // A failure after the point of no return cannot be undone.
        StepEvent::StepFailed if phase.ignores_cancel() => {
            (P::FAILED, Effect::Finish)
        }
        StepEvent::StepFailed => (P::FAILED, Effect::Rollback),
        StepEvent::CancelRequested if phase.ignores_cancel() => {
            (phase, Effect::Continue)
        }
        StepEvent::CancelRequested => (P::CANCELLED, Effect::Rollback),
    }
}
