//! Property-based coverage for the alarm engine's upsert-uniqueness and
//! clock-jump invariants (§8 invariants 4 and 6), run over randomly
//! generated deltas and expiries rather than a handful of fixed cases.

use proptest::prelude::*;
use suspend_core::alarms::{AlarmEngine, AlarmEntry, EntryKey};

fn entry(app_id: &str, key: &str, expiry: i64, calendar: bool) -> AlarmEntry {
    AlarmEntry {
        id: 0,
        app_id: app_id.to_string(),
        key: key.to_string(),
        uri: "x://y".to_string(),
        params: "{}".to_string(),
        public_channel: false,
        wakeup: true,
        calendar,
        expiry,
        activity_id: None,
        activity_duration_ms: None,
    }
}

fn open_engine(dir: &std::path::Path) -> AlarmEngine {
    AlarmEngine::open(
        dir.join("db").to_str().unwrap(),
        dir.join("legacy.xml").to_str().unwrap(),
    )
    .unwrap()
}

proptest! {
    /// Invariant 4: after `apply_clock_delta(delta)`, every calendar entry's
    /// expiry is untouched and every relative entry's expiry has moved by
    /// exactly `delta`.
    #[test]
    fn clock_delta_shifts_only_relative_entries(
        delta in -200_000i64..200_000,
        cal_expiry in 1_700_000_000i64..1_800_000_000,
        rel_offset in 300i64..100_000,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());
        let now = 1_000_000;

        engine.set(entry("app", "cal", cal_expiry, true), now).unwrap();
        engine.set(entry("app", "rel", now + rel_offset, false), now).unwrap();

        engine.apply_clock_delta(delta).unwrap();

        let cal = engine
            .read(EntryKey { app_id: "app", key: "cal", public_channel: false })
            .unwrap()
            .unwrap();
        let rel = engine
            .read(EntryKey { app_id: "app", key: "rel", public_channel: false })
            .unwrap()
            .unwrap();

        prop_assert_eq!(cal.expiry, cal_expiry);
        prop_assert_eq!(rel.expiry, now + rel_offset + delta);
    }

    /// Invariant 6: repeated `set` calls on the same `(app_id, key,
    /// public_channel)` triple never leave more than one matching row, and
    /// the surviving row always reflects the most recent `set`.
    #[test]
    fn repeated_upserts_on_same_triple_leave_exactly_one_row(
        offsets in proptest::collection::vec(300i64..100_000, 1..8),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());
        let now = 1_000_000;

        let mut last_expiry = None;
        for offset in &offsets {
            let expiry = now + *offset;
            engine.set(entry("app", "k", expiry, false), now).unwrap();
            last_expiry = Some(expiry);
        }

        let found = engine
            .read(EntryKey { app_id: "app", key: "k", public_channel: false })
            .unwrap();
        prop_assert!(found.is_some());
        prop_assert_eq!(found.unwrap().expiry, last_expiry.unwrap());
    }
}
