//! `Core`: the explicit struct that wires every component together (§9
//! Design Note "global mutable state -> passed Core"). The IPC dispatcher and
//! the periodic heartbeat both hold an `Arc<Core>` instead of reaching into
//! statics.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};
use uuid::Uuid;

use crate::activity::ActivityRegistry;
use crate::alarms::{AlarmEngine, AlarmEntry, EntryKey};
use crate::clients::{ClientRegistry, Round};
use crate::clock::ReferenceClock;
use crate::config::DaemonConfig;
use crate::error::{CoreError, Result};
use crate::hal::PlatformHal;
use crate::ipc::{OutgoingSignal, SignalSink};
use crate::suspend::{CoreEvent, SuspendMachine};
use crate::time_saver::TimeSaver;

pub struct Core {
    pub config: DaemonConfig,
    pub clock: Arc<ReferenceClock>,
    pub activity: Arc<ActivityRegistry>,
    pub clients: Arc<ClientRegistry>,
    pub alarms: Arc<AlarmEngine>,
    pub hal: Arc<dyn PlatformHal>,
    pub time_saver: Arc<TimeSaver>,

    suspend_machine: Arc<SuspendMachine>,
    suspend_events: std::sync::mpsc::Sender<CoreEvent>,
    /// Maps an issued client id to its human-readable name, separate from
    /// `ClientRegistry` so identify/unregister bookkeeping doesn't need a
    /// registry round-trip just to log a name.
    client_names: Mutex<std::collections::HashMap<String, String>>,
}

impl Core {
    pub fn new(
        config: DaemonConfig,
        hal: Arc<dyn PlatformHal>,
        signals: Arc<dyn SignalSink>,
        clock_source: Box<dyn crate::clock::ClockSource>,
    ) -> Result<Arc<Self>> {
        // Sampled before `clock_source` moves into `ReferenceClock`, so the
        // startup time_saver check reads the same wall clock the daemon will
        // track from here on rather than a second independent source.
        let observed_wall = clock_source.wall_time();

        let clock = Arc::new(ReferenceClock::new(clock_source));
        let activity = Arc::new(ActivityRegistry::new());
        let clients = Arc::new(ClientRegistry::new());
        let alarms = Arc::new(AlarmEngine::open(
            &config.alarm_store_path,
            &config.legacy_alarm_path,
        )?);
        let time_saver = Arc::new(TimeSaver::new(&config.time_saver_path));

        if let (Some(last_saved), Some(now_wall)) = (time_saver.read(), observed_wall) {
            if now_wall < last_saved {
                warn!(
                    target: "clock",
                    last_saved,
                    now_wall,
                    "wall clock behind last persisted time_saver reading; possible backward clock jump across restart"
                );
            }
        }

        let suspend_machine = Arc::new(SuspendMachine::new(
            config.clone(),
            activity.clone(),
            clients.clone(),
            alarms.clone(),
            clock.clone(),
            hal.clone(),
            signals,
            time_saver.clone(),
        ));
        let (suspend_events, suspend_rx) = std::sync::mpsc::channel();
        {
            let machine = suspend_machine.clone();
            std::thread::spawn(move || machine.run(suspend_rx));
        }

        let core = Arc::new(Self {
            config,
            clock,
            activity,
            clients,
            alarms,
            hal,
            time_saver,
            suspend_machine,
            suspend_events,
            client_names: Mutex::new(std::collections::HashMap::new()),
        });

        let notify_tx = core.suspend_events.clone();
        core.activity.set_idle_recheck_notifier(move || {
            let _ = notify_tx.send(CoreEvent::IdleTick);
        });

        Ok(core)
    }

    /// Posts an idle-watcher tick (§4.E "Idle watcher"). Called on the
    /// configured cadence by the event loop.
    pub fn post_idle_tick(&self) {
        let _ = self.suspend_events.send(CoreEvent::IdleTick);
    }

    pub fn post_force_suspend(&self) {
        let _ = self.suspend_events.send(CoreEvent::ForceSuspend);
    }

    pub fn shutdown(&self) {
        let _ = self.suspend_events.send(CoreEvent::Shutdown);
    }

    pub fn identify(&self, client_name: &str) -> String {
        let uid = Uuid::new_v4().to_string();
        self.clients.register(&uid, client_name);
        self.client_names
            .lock()
            .unwrap()
            .insert(uid.clone(), client_name.to_string());
        uid
    }

    pub fn unregister_client(&self, client_id: &str) {
        self.clients.unregister(client_id);
        self.client_names.lock().unwrap().remove(client_id);
    }

    pub fn round_register(&self, client_id: &str, round: Round, enabled: bool) {
        self.clients.opt_in(client_id, round, enabled);
    }

    /// Records a vote and, if it closed out the round, wakes the suspend
    /// machine thread waiting on that round's condvar.
    pub fn ack(&self, client_id: &str, round: Round, ack: bool) -> bool {
        let handled = self.clients.vote(client_id, round, ack);
        if handled {
            self.suspend_machine.notify_vote(round);
        }
        handled
    }

    pub fn force_suspend(&self) {
        self.post_force_suspend();
    }

    pub fn activity_start(&self, id: &str, duration_ms: u64) -> bool {
        self.activity.start(id, duration_ms)
    }

    pub fn activity_end(&self, id: &str) {
        self.activity.stop(id);
    }

    /// `timeout/set`: validates, upserts, and returns whether an existing
    /// row was kept as-is (`keep_existing` and a row already present).
    pub fn timeout_set(
        &self,
        app_id: &str,
        key: &str,
        uri: &str,
        params: &serde_json::Value,
        wakeup: bool,
        at: Option<i64>,
        in_seconds: Option<i64>,
        activity_id: Option<String>,
        activity_duration_ms: Option<u64>,
        public_channel: bool,
        keep_existing: bool,
    ) -> Result<bool> {
        let now = self.clock.reference_time();
        let entry_key = EntryKey { app_id, key, public_channel };

        if keep_existing {
            if self.alarms.read(entry_key)?.is_some() {
                return Ok(true);
            }
        }

        let (expiry, calendar) = match (at, in_seconds) {
            (Some(at), _) => (at, true),
            (None, Some(rel)) => (now + rel, false),
            (None, None) => {
                return Err(CoreError::Validation(
                    "timeout/set requires one of `at` or `in`".into(),
                ))
            }
        };

        let entry = AlarmEntry {
            id: 0,
            app_id: app_id.to_string(),
            key: key.to_string(),
            uri: uri.to_string(),
            params: params.to_string(),
            public_channel,
            wakeup,
            calendar,
            expiry,
            activity_id,
            activity_duration_ms,
        };

        self.alarms.set(entry, now)?;
        Ok(false)
    }

    pub fn timeout_clear(&self, app_id: &str, key: &str, public_channel: bool) -> Result<bool> {
        self.alarms
            .clear(EntryKey { app_id, key, public_channel })
    }

    /// `time/alarmAdd` (legacy): `relative_time` is a `"HH:MM:SS"` duration
    /// from now.
    pub fn legacy_alarm_add(
        &self,
        key: &str,
        service_name: &str,
        relative_time: &str,
    ) -> Result<u32> {
        let delta = crate::alarms::parse_hms(relative_time)?;
        let now = self.clock.reference_time();
        self.alarms.legacy_add(crate::alarms::LegacyAlarm {
            alarm_id: 0,
            key: key.to_string(),
            service_name: service_name.to_string(),
            expiry: now + delta,
            calendar: false,
        })
    }

    /// `time/alarmAddCalendar` (legacy): `date`/`time` are UTC wall-clock,
    /// `"MM-DD-YYYY"`/`"HH:MM:SS"`.
    pub fn legacy_alarm_add_calendar(
        &self,
        key: &str,
        service_name: &str,
        date: &str,
        time: &str,
    ) -> Result<u32> {
        let expiry = crate::alarms::parse_calendar(date, time)?;
        self.alarms.legacy_add(crate::alarms::LegacyAlarm {
            alarm_id: 0,
            key: key.to_string(),
            service_name: service_name.to_string(),
            expiry,
            calendar: true,
        })
    }

    pub fn legacy_alarm_remove(&self, alarm_id: u32) -> bool {
        self.alarms.legacy_remove(alarm_id)
    }

    pub fn legacy_alarm_query(
        &self,
        service_name: &str,
        key: Option<&str>,
    ) -> Result<Vec<crate::alarms::AlarmQueryRow>> {
        self.alarms.legacy_alarm_query(service_name, key)
    }

    /// Runs one alarm-engine heartbeat: fires due entries, re-arms the RTC,
    /// and checks liveness. Called on the configured cadence (§4.D).
    pub fn alarm_heartbeat(&self) {
        let now = self.clock.reference_time();
        match self.alarms.run_cycle(now, &self.activity) {
            Ok(outcome) => {
                for fired in &outcome.fired {
                    info!(target: "core", key = %fired.entry.key, "alarm delivered");
                }
                let to_rtc = |t: i64| self.clock.to_rtc(t);
                if let Err(e) = self.alarms.arm_next_wakeup(self.hal.as_ref(), to_rtc, true) {
                    if crate::error::is_transient(&e) {
                        warn!(target: "core", error = %e, "failed to arm next wakeup; will retry at next heartbeat");
                    } else {
                        tracing::error!(target: "core", error = %e, "failed to arm next wakeup");
                    }
                }
            }
            Err(e) => warn!(target: "core", error = %e, "alarm heartbeat failed"),
        }

        if let Some(rtc) = self.hal.read_rtc() {
            self.alarms.check_rtc_liveness(rtc);
        }
    }

    pub fn suspend_machine(&self) -> &Arc<SuspendMachine> {
        &self.suspend_machine
    }
}
