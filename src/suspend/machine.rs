//! Runtime that drives the pure transition table (§4.E) on a dedicated OS
//! thread, so a blocked suspend syscall never stalls the IPC event loop
//! (§5 "Scheduling model").

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{transition, Action, Event, SuspendState};
use crate::activity::ActivityRegistry;
use crate::alarms::AlarmEngine;
use crate::clients::{ClientRegistry, Round};
use crate::clock::ReferenceClock;
use crate::config::DaemonConfig;
use crate::hal::PlatformHal;
use crate::ipc::{OutgoingSignal, SignalSink};
use crate::time_saver::TimeSaver;

/// Events the IPC/alarm event loop posts across to the suspend thread.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    IdleTick,
    ForceSuspend,
    VoteSignal(Round),
    Shutdown,
}

/// A condvar paired with a dummy mutex, used purely as a wakeup signal for
/// the voting rounds (§5 "Shared state and locks": one condvar pair per
/// round).
#[derive(Default)]
struct RoundSignal {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl RoundSignal {
    fn notify(&self) {
        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Blocks until `predicate` is true or `deadline` passes.
    fn wait_until<F: Fn() -> bool>(&self, deadline: Instant, predicate: F) {
        let mut guard = self.lock.lock().unwrap();
        while !predicate() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (g, _timeout) = self
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
            if predicate() {
                return;
            }
        }
    }
}

/// Diagnostics: consecutive denial counter with an exponentially-backed-off
/// logging schedule (§4.E "Diagnostics").
struct DenialCounter {
    count: AtomicU32,
    next_log_at: AtomicU32,
}

impl Default for DenialCounter {
    fn default() -> Self {
        Self { count: AtomicU32::new(0), next_log_at: AtomicU32::new(8) }
    }
}

impl DenialCounter {
    fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
        self.next_log_at.store(8, Ordering::SeqCst);
    }

    /// Increments and returns true if this count should be logged.
    fn record_denial(&self) -> u32 {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let threshold = self.next_log_at.load(Ordering::SeqCst);
        if count >= threshold {
            let next = (threshold * 2).min(threshold.saturating_add(512));
            self.next_log_at.store(next.max(threshold + 1), Ordering::SeqCst);
        }
        count
    }

    fn should_log(&self, count: u32) -> bool {
        let threshold = self.next_log_at.load(Ordering::SeqCst);
        // Logs fire at 8, 16, 32, ... (the schedule recorded in record_denial).
        count == 8 || (count.is_power_of_two() && count >= 8) || count == threshold
    }
}

pub struct SuspendMachine {
    config: DaemonConfig,
    activity: Arc<ActivityRegistry>,
    clients: Arc<ClientRegistry>,
    alarms: Arc<AlarmEngine>,
    clock: Arc<ReferenceClock>,
    hal: Arc<dyn PlatformHal>,
    signals: Arc<dyn SignalSink>,
    time_saver: Arc<TimeSaver>,
    ready_token_path: String,

    suspend_request_signal: RoundSignal,
    prepare_suspend_signal: RoundSignal,
    suspend_request_denials: DenialCounter,
    prepare_suspend_denials: DenialCounter,

    /// Earliest instant the next idle tick may actually run; pushed out by
    /// `wait_idle_ms` (extended to cover the longest remaining activity
    /// lease) after every processed tick (§4.E "Idle watcher").
    next_idle_check_at: Mutex<Instant>,
    /// Set after a resume completes; idle ticks are a no-op until this
    /// passes (§4.E: "idle checking is suppressed for `after_resume_idle_ms`
    /// following a resume").
    idle_suppressed_until: Mutex<Option<Instant>>,
}

impl SuspendMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DaemonConfig,
        activity: Arc<ActivityRegistry>,
        clients: Arc<ClientRegistry>,
        alarms: Arc<AlarmEngine>,
        clock: Arc<ReferenceClock>,
        hal: Arc<dyn PlatformHal>,
        signals: Arc<dyn SignalSink>,
        time_saver: Arc<TimeSaver>,
    ) -> Self {
        let ready_token_path = config.ready_token_path.clone();
        Self {
            config,
            activity,
            clients,
            alarms,
            clock,
            hal,
            signals,
            time_saver,
            ready_token_path,
            suspend_request_signal: RoundSignal::default(),
            prepare_suspend_signal: RoundSignal::default(),
            suspend_request_denials: DenialCounter::default(),
            prepare_suspend_denials: DenialCounter::default(),
            next_idle_check_at: Mutex::new(Instant::now()),
            idle_suppressed_until: Mutex::new(None),
        }
    }

    /// Call from an IPC callback thread once `vote()` returns true for
    /// `round`, to wake the state machine thread out of its condvar wait.
    pub fn notify_vote(&self, round: Round) {
        match round {
            Round::SuspendRequest => self.suspend_request_signal.notify(),
            Round::PrepareSuspend => self.prepare_suspend_signal.notify(),
        }
    }

    fn ready_token_present(&self) -> bool {
        std::path::Path::new(&self.ready_token_path).exists()
    }

    /// Runs the dedicated suspend-machine loop; blocks the calling thread.
    /// Intended to be spawned via `std::thread::spawn` (§5).
    pub fn run(self: Arc<Self>, events: Receiver<CoreEvent>) {
        let mut state = SuspendState::On;
        loop {
            let event = match events.recv() {
                Ok(e) => e,
                Err(_) => return,
            };

            match event {
                CoreEvent::Shutdown => return,
                CoreEvent::VoteSignal(_) => {
                    // Condvars already woke the waiting thread; nothing
                    // further to do here.
                }
                CoreEvent::IdleTick => {
                    state = self.handle_idle_tick(state);
                }
                CoreEvent::ForceSuspend => {
                    state = self.attempt_suspend(state, true);
                }
            }
        }
    }

    fn handle_idle_tick(&self, state: SuspendState) -> SuspendState {
        if self.hal.display_on() {
            return state;
        }

        let now_inst = Instant::now();
        if let Some(until) = *self.idle_suppressed_until.lock().unwrap() {
            if now_inst < until {
                return state;
            }
        }
        if now_inst < *self.next_idle_check_at.lock().unwrap() {
            return state;
        }

        let result = self.handle_idle_tick_inner(state);

        // Mirrors the original's unconditional reschedule after every idle
        // check: `wait_idle_ms`, extended to cover the longest remaining
        // activity lease.
        let now = self.clock.reference_time();
        let wait_ms = self
            .config
            .suspend
            .wait_idle_ms
            .max(self.activity.max_remaining(now));
        *self.next_idle_check_at.lock().unwrap() =
            Instant::now() + Duration::from_millis(wait_ms);

        result
    }

    fn handle_idle_tick_inner(&self, state: SuspendState) -> SuspendState {
        let now = self.clock.reference_time();

        // §8 invariant 3 / S6: an imminent alarm blocks idle-initiated
        // suspend entirely.
        let next_wake = self
            .alarms
            .run_cycle(now, &self.activity)
            .ok()
            .and_then(|o| o.next_wake_capable_expiry);
        if let Some(next_wake) = next_wake {
            if next_wake - now <= self.config.suspend.wait_alarms_s as i64 {
                return state;
            }
        }

        if !self.ready_token_present() {
            return state;
        }

        // A present charger blocks the idle-tick transition outright (unless
        // configured otherwise); this is resolved here rather than inside
        // `attempt_suspend`, which always attempts relative to the charger
        // being absent.
        if !self.config.suspend.suspend_with_charger && self.hal.charger_present() {
            let (next, actions) = transition(
                state,
                Event::IdleTick { idle: true, display_on: false, charger_blocks: true },
            );
            self.run_actions(&actions);
            return next;
        }

        // Idle-ness itself is judged upstream by the watcher's timer
        // cadence (§4.E "Idle watcher"); reaching here means it already
        // considers the device idle. `attempt_suspend` performs its own
        // `transition()` from this pre-transition state (On -> OnIdle on the
        // first tick, OnIdle -> SuspendRequest on the next) and only enters
        // the voting rounds once it actually lands on SuspendRequest.
        self.attempt_suspend(state, false)
    }

    /// Drives one full suspend attempt to completion (both voting rounds,
    /// freeze, RTC arm, platform suspend), returning the resulting state.
    fn attempt_suspend(&self, mut state: SuspendState, forced: bool) -> SuspendState {
        if !matches!(state, SuspendState::On | SuspendState::OnIdle) {
            return state;
        }

        let (next, actions) = transition(
            state,
            if forced { Event::ForceSuspendRequested } else {
                Event::IdleTick { idle: true, display_on: false, charger_blocks: false }
            },
        );
        state = next;
        self.run_actions(&actions);

        if state != SuspendState::SuspendRequest {
            // On -> OnIdle only: the idle-tick dance hasn't actually opened
            // a voting round yet (§4.E requires a subsequent tick from
            // OnIdle to reach SuspendRequest).
            return state;
        }

        // --- Round 1: suspend_request ---
        let deadline = Instant::now()
            + Duration::from_millis(self.config.suspend.wait_suspend_response_ms);
        self.suspend_request_signal.wait_until(deadline, || {
            self.clients.approved(Round::SuspendRequest)
                || self.clients.nacked(Round::SuspendRequest)
        });

        if !self.voters_all_acked_or_silent(Round::SuspendRequest) {
            self.suspend_request_denials.record_denial();
            log_if_scheduled(&self.suspend_request_denials, "suspendRequest", &self.clients, Round::SuspendRequest);
            let (next, actions) = transition(state, Event::AnyNacked);
            self.run_actions(&actions);
            return next;
        }
        self.suspend_request_denials.reset();
        log_unresponsive(&self.clients, Round::SuspendRequest);

        let (next, actions) = transition(state, Event::AllAckedOrTimedOut);
        state = next;
        self.run_actions(&actions);

        // --- Round 2: prepare_suspend ---
        let deadline = Instant::now()
            + Duration::from_millis(self.config.suspend.wait_prepare_suspend_ms);
        self.prepare_suspend_signal.wait_until(deadline, || {
            self.clients.approved(Round::PrepareSuspend)
                || self.clients.nacked(Round::PrepareSuspend)
        });

        if !self.voters_all_acked_or_silent(Round::PrepareSuspend) {
            self.prepare_suspend_denials.record_denial();
            log_if_scheduled(&self.prepare_suspend_denials, "prepareSuspend", &self.clients, Round::PrepareSuspend);
            let (next, actions) = transition(state, Event::AnyNacked);
            self.run_actions(&actions);
            return next;
        }
        self.prepare_suspend_denials.reset();
        log_unresponsive(&self.clients, Round::PrepareSuspend);

        let (next, actions) = transition(state, Event::AllAckedOrTimedOut);
        state = next;
        self.run_actions(&actions);

        // --- Freeze / arm / suspend ---
        let now = self.clock.reference_time();

        // Persisted ahead of the actual suspend call so a battery pull mid-
        // suspend still leaves a recent wall-time reading on disk (§6
        // "Persisted state").
        if let Err(e) = self.time_saver.write(now) {
            warn!(target: "clock", error = %e, "failed to persist time_saver before suspend");
        }

        let freeze_required = !forced;
        let guard = self.activity.freeze(now);

        if freeze_required && !guard.held() {
            let (next, actions) = transition(state, Event::ActivityFreezeFailed);
            self.run_actions(&actions);
            return next;
        }

        if let Some(delta) = self.clock.update_rtc() {
            let _ = self.alarms.apply_clock_delta(delta);
        }

        let armed = if self.config.suspend.disable_rtc_alarms {
            Ok(None)
        } else {
            self.alarms
                .arm_next_wakeup(self.hal.as_ref(), |t| self.clock.to_rtc(t), false)
        };

        if let Err(e) = &armed {
            if crate::error::is_transient(e) {
                warn!(target: "suspend", error = %e, "transient RTC arm failure; suspend attempt aborted, will retry next idle tick");
            } else {
                tracing::error!(target: "suspend", error = %e, "RTC arm failed");
            }
            drop(guard);
            let (next, actions) = transition(state, Event::RtcArmFailed);
            self.run_actions(&actions);
            return next;
        }

        let suspend_ok = self.hal.suspend();
        drop(guard);

        if !suspend_ok {
            let (next, actions) = transition(state, Event::RtcArmFailed);
            self.run_actions(&actions);
            return next;
        }

        let (next, actions) = transition(state, Event::PlatformSuspendReturned);
        state = next;
        self.run_actions(&actions);

        let (next, actions) = transition(state, Event::ResumeHandled);
        self.run_actions(&actions);

        *self.idle_suppressed_until.lock().unwrap() = Some(
            Instant::now() + Duration::from_millis(self.config.suspend.after_resume_idle_ms),
        );

        next
    }

    fn voters_all_acked_or_silent(&self, round: Round) -> bool {
        // Timeout is not an error (§5 "Cancellation and timeouts"): proceed
        // as if remaining clients had Acked. A real Nack is the only thing
        // that blocks the round; silence just gets logged.
        !self.clients.nacked(round)
    }

    fn run_actions(&self, actions: &[Action]) {
        for action in actions {
            match action {
                Action::VoteInit => self.clients.vote_init(),
                Action::BroadcastSuspendRequest => {
                    self.signals.broadcast(OutgoingSignal::SuspendRequest {})
                }
                Action::BroadcastPrepareSuspend => {
                    self.signals.broadcast(OutgoingSignal::PrepareSuspend {})
                }
                Action::FreezeActivity | Action::ThawActivity => {
                    // Freeze/thaw is handled explicitly around the suspend
                    // call via the `FreezeGuard` RAII handle, not here; the
                    // transition table still names the action for callers
                    // reasoning about the pure state diagram.
                }
                Action::ArmRtcAndSuspend => {}
                Action::BroadcastSuspended => {
                    self.signals.broadcast(OutgoingSignal::Suspended {})
                }
                Action::BroadcastResume(kind) => {
                    info!(target: "suspend", resume_type = ?kind, "resume");
                    self.signals.broadcast(OutgoingSignal::resume(*kind));
                }
            }
        }
    }
}

fn log_unresponsive(clients: &ClientRegistry, round: Round) {
    let silent = clients.unresponsive(round);
    if !silent.is_empty() {
        warn!(target: "suspend", round = ?round, clients = ?silent, "clients unresponsive by deadline");
    }
}

fn log_if_scheduled(counter: &DenialCounter, label: &str, clients: &ClientRegistry, round: Round) {
    let count = counter.count.load(Ordering::SeqCst);
    if counter.should_log(count) {
        warn!(
            target: "suspend",
            round = label,
            consecutive_denials = count,
            table = %clients.snapshot(round),
            "repeated suspend denial"
        );
    }
}

/// Spawns the suspend machine on a dedicated OS thread and returns a sender
/// for posting events to it, plus the join handle.
pub fn spawn(
    machine: Arc<SuspendMachine>,
) -> (Sender<CoreEvent>, std::thread::JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || machine.run(rx));
    (tx, handle)
}
