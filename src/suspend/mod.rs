//! Suspend State Machine (§4.E): a pure transition table plus a runtime that
//! drives it on a dedicated OS thread.

mod machine;

pub use machine::{CoreEvent, SuspendMachine};

use crate::hal::ResumeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendState {
    On,
    OnIdle,
    SuspendRequest,
    PrepareSuspend,
    Sleep,
    KernelResume,
    ActivityResume,
    AbortSuspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    IdleTick { idle: bool, display_on: bool, charger_blocks: bool },
    ForceSuspendRequested,
    AllAckedOrTimedOut,
    AnyNacked,
    ActivityFreezeFailed,
    RtcArmFailed,
    PlatformSuspendReturned,
    ResumeHandled,
}

/// Side effects a transition names; the runtime interprets them. Keeping the
/// table itself pure means it is unit-testable without a HAL (§9 "Design
/// Notes": callback-wired flow -> explicit state table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    VoteInit,
    BroadcastSuspendRequest,
    BroadcastPrepareSuspend,
    FreezeActivity,
    ArmRtcAndSuspend,
    ThawActivity,
    BroadcastSuspended,
    BroadcastResume(ResumeType),
}

/// Pure transition function: `(current state, event) -> (next state, effects)`.
pub fn transition(state: SuspendState, event: Event) -> (SuspendState, Vec<Action>) {
    use SuspendState::*;

    match (state, event) {
        (On, Event::IdleTick { idle: true, display_on: false, charger_blocks: false }) => {
            (OnIdle, vec![])
        }
        (On, Event::IdleTick { .. }) => (On, vec![]),
        (On, Event::ForceSuspendRequested) => {
            (SuspendRequest, vec![Action::VoteInit, Action::BroadcastSuspendRequest])
        }

        (OnIdle, Event::IdleTick { charger_blocks: true, .. }) => (On, vec![]),
        (OnIdle, Event::IdleTick { idle: true, .. }) => {
            (SuspendRequest, vec![Action::VoteInit, Action::BroadcastSuspendRequest])
        }
        (OnIdle, Event::IdleTick { idle: false, .. }) => (On, vec![]),
        (OnIdle, Event::ForceSuspendRequested) => {
            (SuspendRequest, vec![Action::VoteInit, Action::BroadcastSuspendRequest])
        }

        (SuspendRequest, Event::AllAckedOrTimedOut) => {
            (PrepareSuspend, vec![Action::BroadcastPrepareSuspend])
        }
        (SuspendRequest, Event::AnyNacked) => (On, vec![]),

        (PrepareSuspend, Event::AllAckedOrTimedOut) => {
            (Sleep, vec![Action::FreezeActivity])
        }
        (PrepareSuspend, Event::AnyNacked) => {
            (AbortSuspend, vec![Action::BroadcastResume(ResumeType::Abort)])
        }

        (Sleep, Event::ActivityFreezeFailed) => {
            (ActivityResume, vec![Action::BroadcastResume(ResumeType::Activity)])
        }
        (Sleep, Event::RtcArmFailed) => {
            (AbortSuspend, vec![Action::ThawActivity, Action::BroadcastResume(ResumeType::Abort)])
        }
        (Sleep, Event::PlatformSuspendReturned) => (
            KernelResume,
            vec![
                Action::ThawActivity,
                Action::BroadcastSuspended,
                Action::BroadcastResume(ResumeType::Kernel),
            ],
        ),

        (KernelResume, Event::ResumeHandled)
        | (ActivityResume, Event::ResumeHandled)
        | (AbortSuspend, Event::ResumeHandled) => (On, vec![]),

        // Any other (state, event) pair is a no-op: the machine never
        // fails (§7 propagation policy); an unmodeled event simply does
        // not advance the state.
        (s, _) => (s, vec![]),
    }
}
