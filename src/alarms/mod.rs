//! Alarm/Timeout Engine (§4.D): persistent calendar/relative alarms, RTC
//! programming, and the firing cycle.

mod legacy;
mod store;

pub use legacy::{parse_calendar, parse_hms, LegacyAlarm, LegacyStore};
pub use store::AlarmStore;

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::activity::ActivityRegistry;
use crate::error::{CoreError, Result};
use crate::hal::PlatformHal;

/// Legacy handset minimum for relative durations, enforced as a warning
/// only (§4.D "Input validation").
pub const LEGACY_MIN_RELATIVE_SECONDS: i64 = 5 * 60;
/// Hard floor below which a relative duration is rejected outright.
pub const MIN_RELATIVE_SECONDS: i64 = 5;
/// Default activity duration substituted when a caller omits one.
pub const DEFAULT_ACTIVITY_DURATION_MS: u64 = 5_000;
pub const DEFAULT_ACTIVITY_ID_PREFIX: &str = "alarm";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEntry {
    pub id: u64,
    pub app_id: String,
    pub key: String,
    pub uri: String,
    pub params: String,
    pub public_channel: bool,
    pub wakeup: bool,
    pub calendar: bool,
    pub expiry: i64,
    pub activity_id: Option<String>,
    pub activity_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey<'a> {
    pub app_id: &'a str,
    pub key: &'a str,
    pub public_channel: bool,
}

/// One firing: the entry that expired plus the fields a caller needs to
/// deliver the callback.
pub struct FiredAlarm {
    pub entry: AlarmEntry,
}

/// The result of one update cycle (§4.D "Firing").
#[derive(Default)]
pub struct CycleOutcome {
    pub fired: Vec<FiredAlarm>,
    pub next_wake_capable_expiry: Option<i64>,
    pub next_any_expiry: Option<i64>,
}

pub struct AlarmEngine {
    store: AlarmStore,
    legacy: Mutex<LegacyStore>,
    last_rtc_sample: Mutex<Option<i64>>,
}

impl AlarmEngine {
    pub fn open(store_path: &str, legacy_path: &str) -> Result<Self> {
        Ok(Self {
            store: AlarmStore::open(store_path)?,
            legacy: Mutex::new(LegacyStore::open(legacy_path)?),
            last_rtc_sample: Mutex::new(None),
        })
    }

    /// Validates and inserts an entry, deleting any prior row with the same
    /// `(app_id, key, public_channel)` first (§4.D "Upsert uniqueness",
    /// §8 invariant 6).
    pub fn set(&self, mut entry: AlarmEntry, now: i64) -> Result<()> {
        if entry.expiry < 0 {
            return Err(CoreError::Validation("expiry must be >= 0".into()));
        }

        if !entry.calendar {
            let delta = entry.expiry - now;
            if delta < MIN_RELATIVE_SECONDS {
                return Err(CoreError::Validation(format!(
                    "relative duration {delta}s is below the {MIN_RELATIVE_SECONDS}s floor"
                )));
            }
            if delta < LEGACY_MIN_RELATIVE_SECONDS {
                warn!(
                    target: "alarms",
                    delta,
                    "relative duration below legacy 5-minute minimum"
                );
            }
        }

        if let Some(dur) = entry.activity_duration_ms {
            if dur < DEFAULT_ACTIVITY_DURATION_MS {
                return Err(CoreError::Validation(format!(
                    "activity_duration_ms must be >= {DEFAULT_ACTIVITY_DURATION_MS}"
                )));
            }
        } else {
            entry.activity_duration_ms = Some(DEFAULT_ACTIVITY_DURATION_MS);
            entry.activity_id = entry
                .activity_id
                .or_else(|| Some(format!("{DEFAULT_ACTIVITY_ID_PREFIX}:{}", entry.key)));
        }

        self.store.upsert(entry)
    }

    /// Deletes the row if present and re-evaluates the next wakeup (the
    /// caller is expected to re-query `next_wakeup` afterward).
    pub fn clear(&self, key: EntryKey<'_>) -> Result<bool> {
        self.store.remove_by_triple(key)
    }

    pub fn read(&self, key: EntryKey<'_>) -> Result<Option<AlarmEntry>> {
        self.store.find_by_triple(key)
    }

    /// Deletes only; unlike `clear`, callers are not expected to re-evaluate
    /// the next wakeup immediately (§4.D "Public contract").
    pub fn delete(&self, key: EntryKey<'_>) -> Result<bool> {
        self.store.remove_by_triple(key)
    }

    /// Shifts every non-calendar entry's expiry by `delta`; calendar entries
    /// are untouched (§4.D "Time semantics", §8 invariant 4).
    pub fn apply_clock_delta(&self, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        self.store.shift_relative_entries(delta)?;
        self.legacy.lock().unwrap().shift_relative_entries(delta);
        Ok(())
    }

    /// Runs one update cycle: selects and fires expired rows, deletes them,
    /// and recomputes the next wakeup. The Activity Registry receives a
    /// lease request per fired row so the device stays awake long enough to
    /// process the callback (§4.D step 2).
    pub fn run_cycle(&self, now: i64, activity: &ActivityRegistry) -> Result<CycleOutcome> {
        let due = self.store.take_due(now)?;

        let mut fired = Vec::with_capacity(due.len());
        for entry in due {
            let activity_id = entry
                .activity_id
                .clone()
                .unwrap_or_else(|| format!("{DEFAULT_ACTIVITY_ID_PREFIX}:{}", entry.key));
            let duration_ms = entry
                .activity_duration_ms
                .unwrap_or(DEFAULT_ACTIVITY_DURATION_MS);
            activity.start(&activity_id, duration_ms);

            info!(
                target: "alarms",
                app_id = %entry.app_id,
                key = %entry.key,
                uri = %entry.uri,
                "firing alarm"
            );
            fired.push(FiredAlarm { entry });
        }

        let next_wake_capable_expiry = self.store.earliest_wake_capable_expiry()?;
        let next_any_expiry = self.store.earliest_expiry()?;

        Ok(CycleOutcome {
            fired,
            next_wake_capable_expiry,
            next_any_expiry,
        })
    }

    /// Programs the RTC for the next wake-capable alarm, or clears it if
    /// none exists (§4.D "RTC programming contract", §8 invariant 2).
    pub fn arm_next_wakeup(
        &self,
        hal: &dyn PlatformHal,
        to_rtc: impl Fn(i64) -> i64,
        awake: bool,
    ) -> Result<Option<i64>> {
        let next = self.store.earliest_wake_capable_expiry()?;
        match next {
            Some(expiry) => {
                let rtc_value = to_rtc(expiry);
                if !hal.arm_rtc(Some(rtc_value), awake) {
                    return Err(CoreError::PlatformHal("arm_rtc rejected wakeup".into()));
                }
                Ok(Some(rtc_value))
            }
            None => {
                if !hal.arm_rtc(None, awake) {
                    return Err(CoreError::PlatformHal("arm_rtc rejected clear".into()));
                }
                Ok(None)
            }
        }
    }

    /// Every 5 minutes the engine samples the RTC; an unchanged sample is
    /// logged as a suspected-stuck RTC (§4.D "RTC liveness check").
    pub fn check_rtc_liveness(&self, sample: i64) {
        let mut last = self.last_rtc_sample.lock().unwrap();
        if let Some(prev) = *last {
            if prev == sample {
                warn!(target: "alarms", sample, "RTC sample unchanged; suspected stuck");
            }
        }
        *last = Some(sample);
    }

    pub fn legacy_add(&self, alarm: LegacyAlarm) -> Result<u32> {
        self.legacy.lock().unwrap().add(alarm)
    }

    pub fn legacy_remove(&self, alarm_id: u32) -> bool {
        self.legacy.lock().unwrap().remove(alarm_id)
    }

    pub fn legacy_query(&self, service_name: &str, key: Option<&str>) -> Vec<LegacyAlarm> {
        self.legacy.lock().unwrap().query(service_name, key)
    }

    /// `time/alarmQuery`: a flattened view across the legacy store and the
    /// modern store (treating `service_name` as `app_id`), since a legacy
    /// caller has no triple to look up directly (§6).
    pub fn legacy_alarm_query(
        &self,
        service_name: &str,
        key: Option<&str>,
    ) -> Result<Vec<AlarmQueryRow>> {
        let mut rows: Vec<AlarmQueryRow> = self
            .legacy_query(service_name, key)
            .into_iter()
            .map(|a| AlarmQueryRow {
                alarm_id: a.alarm_id as u64,
                key: a.key,
                expiry: a.expiry,
                calendar: a.calendar,
            })
            .collect();

        rows.extend(
            self.store
                .scan_by_app(service_name, key)?
                .into_iter()
                .map(|e| AlarmQueryRow {
                    alarm_id: e.id,
                    key: e.key,
                    expiry: e.expiry,
                    calendar: e.calendar,
                }),
        );

        Ok(rows)
    }
}

/// One row of a flattened `alarmQuery` response, spanning both the legacy
/// and modern stores.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmQueryRow {
    pub alarm_id: u64,
    pub key: String,
    pub expiry: i64,
    pub calendar: bool,
}
