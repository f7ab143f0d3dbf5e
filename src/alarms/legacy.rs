//! Legacy `time/alarmAdd` / `time/alarmAddCalendar` support (§6).
//!
//! The original implementation persisted these as a flat XML file
//! (`alarms.xml`, elements `<alarm id=… key=… expiry=… calendar=…
//! serviceName=… applicationName=…/>`). Legacy rows share the modern
//! engine's earliest-expiry-first ordering and the same clock-delta
//! shifting rule for non-calendar entries (§4.D "Time semantics").

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAlarm {
    pub alarm_id: u32,
    pub key: String,
    pub service_name: String,
    pub expiry: i64,
    pub calendar: bool,
}

pub struct LegacyStore {
    path: String,
    next_id: AtomicU32,
    alarms: std::sync::Mutex<Vec<LegacyAlarm>>,
}

impl LegacyStore {
    pub fn open(path: &str) -> Result<Self> {
        let alarms = match std::fs::read_to_string(path) {
            Ok(content) => match parse(&content) {
                Ok(alarms) => alarms,
                Err(e) => {
                    warn!(target: "alarms", error = %e, path, "legacy alarm file corrupt; discarding");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        let max_id = alarms.iter().map(|a| a.alarm_id).max().unwrap_or(0);

        Ok(Self {
            path: path.to_string(),
            next_id: AtomicU32::new(max_id + 1),
            alarms: std::sync::Mutex::new(alarms),
        })
    }

    pub fn add(&self, mut alarm: LegacyAlarm) -> Result<u32> {
        alarm.alarm_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = alarm.alarm_id;
        let mut alarms = self.alarms.lock().unwrap();
        alarms.push(alarm);
        alarms.sort_by_key(|a| a.expiry);
        drop(alarms);
        self.persist()?;
        Ok(id)
    }

    pub fn remove(&self, alarm_id: u32) -> bool {
        let mut alarms = self.alarms.lock().unwrap();
        let before = alarms.len();
        alarms.retain(|a| a.alarm_id != alarm_id);
        let changed = alarms.len() != before;
        drop(alarms);
        if changed {
            let _ = self.persist();
        }
        changed
    }

    pub fn query(&self, service_name: &str, key: Option<&str>) -> Vec<LegacyAlarm> {
        let alarms = self.alarms.lock().unwrap();
        alarms
            .iter()
            .filter(|a| a.service_name == service_name)
            .filter(|a| key.map(|k| a.key == k).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn shift_relative_entries(&self, delta: i64) {
        let mut alarms = self.alarms.lock().unwrap();
        for alarm in alarms.iter_mut() {
            if !alarm.calendar {
                alarm.expiry += delta;
            }
        }
        alarms.sort_by_key(|a| a.expiry);
        drop(alarms);
        let _ = self.persist();
    }

    /// Writes the full table back to disk, atomically (write `.tmp`, then
    /// rename, per §6 "Persisted state").
    fn persist(&self) -> Result<()> {
        let alarms = self.alarms.lock().unwrap();
        let mut out = String::from("<alarms>\n");
        for alarm in alarms.iter() {
            out.push_str(&format!(
                "  <alarm id={} key={} expiry={} calendar={} serviceName={} applicationName={}/>\n",
                alarm.alarm_id, alarm.key, alarm.expiry, alarm.calendar, alarm.service_name, alarm.service_name
            ));
        }
        out.push_str("</alarms>\n");
        drop(alarms);

        let tmp_path = format!("{}.tmp", self.path);
        std::fs::write(&tmp_path, out)
            .map_err(|e| CoreError::Persistence(format!("write {tmp_path}: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| CoreError::Persistence(format!("rename {tmp_path}: {e}")))?;
        Ok(())
    }
}

/// Parses a `"HH:MM:SS"` duration string (the legacy `time/alarmAdd`
/// `relative_time` field and the time-of-day half of `alarmAddCalendar`)
/// into total seconds.
pub fn parse_hms(s: &str) -> Result<i64> {
    let parts: Vec<&str> = s.split(':').collect();
    let [h, m, sec]: [&str; 3] = parts
        .try_into()
        .map_err(|_| CoreError::Validation(format!("expected HH:MM:SS, got {s}")))?;
    let h: i64 = h
        .parse()
        .map_err(|_| CoreError::Validation(format!("bad hour in {s}")))?;
    let m: i64 = m
        .parse()
        .map_err(|_| CoreError::Validation(format!("bad minute in {s}")))?;
    let sec: i64 = sec
        .parse()
        .map_err(|_| CoreError::Validation(format!("bad second in {s}")))?;
    if !(0..=24).contains(&h) || !(0..=59).contains(&m) || !(0..=59).contains(&sec) {
        return Err(CoreError::Validation(format!("time out of range: {s}")));
    }
    Ok(h * 3600 + m * 60 + sec)
}

/// Parses `"MM-DD-YYYY"` date + `"HH:MM:SS"` time (both UTC wall-clock, per
/// the original's `timegm`-based conversion) into Unix epoch seconds.
pub fn parse_calendar(date: &str, time: &str) -> Result<i64> {
    let date_parts: Vec<&str> = date.split('-').collect();
    let [mm, dd, yyyy]: [&str; 3] = date_parts
        .try_into()
        .map_err(|_| CoreError::Validation(format!("expected MM-DD-YYYY, got {date}")))?;
    let month: i64 = mm
        .parse()
        .map_err(|_| CoreError::Validation(format!("bad month in {date}")))?;
    let day: i64 = dd
        .parse()
        .map_err(|_| CoreError::Validation(format!("bad day in {date}")))?;
    let year: i64 = yyyy
        .parse()
        .map_err(|_| CoreError::Validation(format!("bad year in {date}")))?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(CoreError::Validation(format!("date out of range: {date}")));
    }

    let seconds_of_day = parse_hms(time)?;
    Ok(days_from_civil(year, month, day) * 86_400 + seconds_of_day)
}

/// Howard Hinnant's days-from-civil algorithm: maps a Gregorian (year,
/// month, day) to a day count relative to the Unix epoch (1970-01-01),
/// the same conversion `timegm` performs.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn parse(content: &str) -> std::result::Result<Vec<LegacyAlarm>, String> {
    let mut alarms = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if !line.starts_with("<alarm ") {
            continue;
        }
        let mut id = None;
        let mut key = None;
        let mut expiry = None;
        let mut calendar = None;
        let mut service_name = None;

        let body = line
            .trim_start_matches("<alarm ")
            .trim_end_matches("/>")
            .trim();
        for field in body.split_whitespace() {
            let Some((name, value)) = field.split_once('=') else {
                continue;
            };
            match name {
                "id" => id = value.parse::<u32>().ok(),
                "key" => key = Some(value.to_string()),
                "expiry" => expiry = value.parse::<i64>().ok(),
                "calendar" => calendar = value.parse::<bool>().ok(),
                "serviceName" => service_name = Some(value.to_string()),
                _ => {}
            }
        }

        let (Some(id), Some(key), Some(expiry), Some(calendar), Some(service_name)) =
            (id, key, expiry, calendar, service_name)
        else {
            return Err(format!("malformed alarm element: {line}"));
        };

        alarms.push(LegacyAlarm {
            alarm_id: id,
            key,
            expiry,
            calendar,
            service_name,
        });
    }
    Ok(alarms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hms_converts_to_seconds() {
        assert_eq!(parse_hms("01:02:03").unwrap(), 3_723);
        assert_eq!(parse_hms("00:00:00").unwrap(), 0);
    }

    #[test]
    fn parse_hms_rejects_out_of_range() {
        assert!(parse_hms("25:00:00").is_err());
        assert!(parse_hms("bad").is_err());
    }

    #[test]
    fn parse_calendar_matches_known_epoch_seconds() {
        assert_eq!(parse_calendar("01-01-1970", "00:00:00").unwrap(), 0);
        // 2024-03-01 00:00:00 UTC.
        assert_eq!(
            parse_calendar("03-01-2024", "00:00:00").unwrap(),
            1_709_251_200
        );
    }

    #[test]
    fn add_assigns_monotonic_ids_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.xml");
        let store = LegacyStore::open(path.to_str().unwrap()).unwrap();

        let id1 = store
            .add(LegacyAlarm {
                alarm_id: 0,
                key: "k1".into(),
                service_name: "svc".into(),
                expiry: 1000,
                calendar: false,
            })
            .unwrap();
        let id2 = store
            .add(LegacyAlarm {
                alarm_id: 0,
                key: "k2".into(),
                service_name: "svc".into(),
                expiry: 2000,
                calendar: true,
            })
            .unwrap();

        assert!(id2 > id1);
        assert!(path.exists());

        let reopened = LegacyStore::open(path.to_str().unwrap()).unwrap();
        let results = reopened.query("svc", None);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn shift_relative_entries_skips_calendar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.xml");
        let store = LegacyStore::open(path.to_str().unwrap()).unwrap();
        store
            .add(LegacyAlarm {
                alarm_id: 0,
                key: "rel".into(),
                service_name: "svc".into(),
                expiry: 1000,
                calendar: false,
            })
            .unwrap();
        store
            .add(LegacyAlarm {
                alarm_id: 0,
                key: "cal".into(),
                service_name: "svc".into(),
                expiry: 1000,
                calendar: true,
            })
            .unwrap();

        store.shift_relative_entries(50);

        let results = store.query("svc", None);
        let rel = results.iter().find(|a| a.key == "rel").unwrap();
        let cal = results.iter().find(|a| a.key == "cal").unwrap();
        assert_eq!(rel.expiry, 1050);
        assert_eq!(cal.expiry, 1000);
    }
}
