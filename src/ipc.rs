//! IPC surface (§6): typed payload records for the inbound JSON operations
//! and the outgoing broadcast signals, plus a `Dispatcher` that turns one
//! into the other against a `Core`.
//!
//! Transport itself (the Unix-domain-socket line protocol) lives in
//! `transport.rs`; this module is transport-agnostic so it can be unit
//! tested without sockets, mirroring the teacher's "typed payload records"
//! design note (§9).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clients::Round;
use crate::core::Core;
use crate::hal::ResumeType;

/// Broadcast signals fanned out to subscribed clients (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal")]
pub enum OutgoingSignal {
    SuspendRequest {},
    PrepareSuspend {},
    Suspended {},
    Resume { resumetype: i32 },
}

impl OutgoingSignal {
    pub fn resume(kind: ResumeType) -> Self {
        OutgoingSignal::Resume { resumetype: kind as i32 }
    }
}

/// Receives broadcast signals; implemented by the transport layer, which
/// fans them out to every subscribed connection.
pub trait SignalSink: Send + Sync {
    fn broadcast(&self, signal: OutgoingSignal);
}

/// A `SignalSink` that does nothing, for tests that don't care about
/// broadcasts.
pub struct NullSignalSink;
impl SignalSink for NullSignalSink {
    fn broadcast(&self, _signal: OutgoingSignal) {}
}

#[derive(Debug, Deserialize)]
pub struct IdentifyRequest {
    #[serde(rename = "clientName")]
    pub client_name: String,
    #[serde(default)]
    pub subscribe: bool,
}

#[derive(Debug, Serialize)]
pub struct IdentifyResponse {
    #[serde(rename = "returnValue")]
    pub return_value: bool,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub subscribed: bool,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub register: bool,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub ack: bool,
}

#[derive(Debug, Deserialize)]
pub struct ActivityStartRequest {
    pub id: String,
    pub duration_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct ActivityEndRequest {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct TimeoutSetRequest {
    pub key: String,
    pub uri: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub wakeup: bool,
    /// Exactly one of `at` (absolute wall seconds) or `in` (relative
    /// seconds) must be present.
    #[serde(default)]
    pub at: Option<i64>,
    #[serde(default, rename = "in")]
    pub in_seconds: Option<i64>,
    #[serde(default)]
    pub activity_id: Option<String>,
    #[serde(default)]
    pub activity_duration_ms: Option<u64>,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub public_channel: bool,
    #[serde(default)]
    pub keep_existing: bool,
}

#[derive(Debug, Deserialize)]
pub struct TimeoutClearRequest {
    pub key: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub public_channel: bool,
}

#[derive(Debug, Deserialize)]
pub struct LegacyAlarmAddRequest {
    pub key: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub relative_time: String,
    #[serde(default)]
    pub subscribe: bool,
}

#[derive(Debug, Deserialize)]
pub struct LegacyAlarmAddCalendarRequest {
    pub key: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub date: String,
    pub time: String,
    #[serde(default)]
    pub subscribe: bool,
}

#[derive(Debug, Deserialize)]
pub struct LegacyAlarmQueryRequest {
    #[serde(rename = "serviceName")]
    pub service_name: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LegacyAlarmRemoveRequest {
    #[serde(rename = "alarmId")]
    pub alarm_id: u32,
}

#[derive(Debug, Serialize)]
pub struct GenericResponse {
    #[serde(rename = "returnValue")]
    pub return_value: bool,
    #[serde(rename = "errorText", skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl GenericResponse {
    pub fn ok() -> Self {
        Self { return_value: true, error_text: None }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { return_value: false, error_text: Some(text.into()) }
    }
}

pub fn round_from_method(method: &str) -> Option<Round> {
    match method {
        "suspendRequestRegister" | "suspendRequestAck" => Some(Round::SuspendRequest),
        "prepareSuspendRegister" | "prepareSuspendAck" => Some(Round::PrepareSuspend),
        _ => None,
    }
}

/// Matches a `method` name against a deserialized `params` value and drives
/// `Core` (§9 "Dynamic JSON ingress -> typed payload records"): every
/// operation parses its payload into a typed struct exactly once, here, and
/// nothing downstream touches raw JSON again.
pub struct Dispatcher {
    core: Arc<Core>,
}

impl Dispatcher {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// Returns the response body to serialize back to the caller, plus the
    /// client id the transport should treat as newly-subscribed, if any
    /// (`identify` only).
    pub fn dispatch(&self, method: &str, params: Value) -> Value {
        match method {
            "identify" => self.identify(params),
            "suspendRequestRegister" => self.round_register(params, Round::SuspendRequest),
            "prepareSuspendRegister" => self.round_register(params, Round::PrepareSuspend),
            "suspendRequestAck" => self.ack(params, Round::SuspendRequest),
            "prepareSuspendAck" => self.ack(params, Round::PrepareSuspend),
            "forceSuspend" => {
                self.core.force_suspend();
                serde_json::to_value(GenericResponse::ok()).unwrap()
            }
            "activityStart" => self.activity_start(params),
            "activityEnd" => self.activity_end(params),
            "timeout/set" => self.timeout_set(params),
            "timeout/clear" => self.timeout_clear(params),
            "time/alarmAdd" => self.legacy_alarm_add(params),
            "time/alarmAddCalendar" => self.legacy_alarm_add_calendar(params),
            "time/alarmQuery" => self.legacy_alarm_query(params),
            "time/alarmRemove" => self.legacy_alarm_remove(params),
            other => {
                serde_json::to_value(GenericResponse::error(format!("unknown method: {other}")))
                    .unwrap()
            }
        }
    }

    fn identify(&self, params: Value) -> Value {
        let Ok(req) = serde_json::from_value::<IdentifyRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad identify payload")).unwrap();
        };
        let client_id = self.core.identify(&req.client_name);
        serde_json::to_value(IdentifyResponse {
            return_value: true,
            client_id,
            subscribed: req.subscribe,
        })
        .unwrap()
    }

    fn round_register(&self, params: Value, round: Round) -> Value {
        let Ok(req) = serde_json::from_value::<RegisterRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad register payload")).unwrap();
        };
        self.core.round_register(&req.client_id, round, req.register);
        serde_json::to_value(GenericResponse::ok()).unwrap()
    }

    fn ack(&self, params: Value, round: Round) -> Value {
        let Ok(req) = serde_json::from_value::<AckRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad ack payload")).unwrap();
        };
        let handled = self.core.ack(&req.client_id, round, req.ack);
        if handled {
            serde_json::to_value(GenericResponse::ok()).unwrap()
        } else {
            serde_json::to_value(GenericResponse::error("unknown clientId")).unwrap()
        }
    }

    fn activity_start(&self, params: Value) -> Value {
        let Ok(req) = serde_json::from_value::<ActivityStartRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad activityStart payload"))
                .unwrap();
        };
        if self.core.activity_start(&req.id, req.duration_ms) {
            serde_json::to_value(GenericResponse::ok()).unwrap()
        } else {
            serde_json::to_value(GenericResponse::error("activity registry frozen")).unwrap()
        }
    }

    fn activity_end(&self, params: Value) -> Value {
        let Ok(req) = serde_json::from_value::<ActivityEndRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad activityEnd payload"))
                .unwrap();
        };
        self.core.activity_end(&req.id);
        serde_json::to_value(GenericResponse::ok()).unwrap()
    }

    fn timeout_set(&self, params: Value) -> Value {
        let Ok(req) = serde_json::from_value::<TimeoutSetRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad timeout/set payload"))
                .unwrap();
        };

        let result = self.core.timeout_set(
            &req.app_id,
            &req.key,
            &req.uri,
            &req.params,
            req.wakeup,
            req.at,
            req.in_seconds,
            req.activity_id,
            req.activity_duration_ms,
            req.public_channel,
            req.keep_existing,
        );

        match result {
            Ok(kept_existing) => serde_json::json!({
                "returnValue": true,
                "key": req.key,
                "kept_existing": kept_existing,
            }),
            Err(e) => {
                serde_json::to_value(GenericResponse::error(e.to_string())).unwrap()
            }
        }
    }

    fn timeout_clear(&self, params: Value) -> Value {
        let Ok(req) = serde_json::from_value::<TimeoutClearRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad timeout/clear payload"))
                .unwrap();
        };

        match self.core.timeout_clear(&req.app_id, &req.key, req.public_channel) {
            Ok(_) => serde_json::json!({ "returnValue": true, "key": req.key }),
            Err(e) => serde_json::to_value(GenericResponse::error(e.to_string())).unwrap(),
        }
    }

    fn legacy_alarm_add(&self, params: Value) -> Value {
        let Ok(req) = serde_json::from_value::<LegacyAlarmAddRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad time/alarmAdd payload"))
                .unwrap();
        };

        match self
            .core
            .legacy_alarm_add(&req.key, &req.service_name, &req.relative_time)
        {
            Ok(alarm_id) => serde_json::json!({
                "returnValue": true,
                "alarmId": alarm_id,
                "subscribed": req.subscribe,
            }),
            Err(e) => serde_json::to_value(GenericResponse::error(e.to_string())).unwrap(),
        }
    }

    fn legacy_alarm_add_calendar(&self, params: Value) -> Value {
        let Ok(req) = serde_json::from_value::<LegacyAlarmAddCalendarRequest>(params) else {
            return serde_json::to_value(GenericResponse::error(
                "bad time/alarmAddCalendar payload",
            ))
            .unwrap();
        };

        match self.core.legacy_alarm_add_calendar(
            &req.key,
            &req.service_name,
            &req.date,
            &req.time,
        ) {
            Ok(alarm_id) => serde_json::json!({
                "returnValue": true,
                "alarmId": alarm_id,
            }),
            Err(e) => serde_json::to_value(GenericResponse::error(e.to_string())).unwrap(),
        }
    }

    fn legacy_alarm_query(&self, params: Value) -> Value {
        let Ok(req) = serde_json::from_value::<LegacyAlarmQueryRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad time/alarmQuery payload"))
                .unwrap();
        };

        match self
            .core
            .legacy_alarm_query(&req.service_name, req.key.as_deref())
        {
            Ok(rows) => serde_json::json!({ "returnValue": true, "alarms": rows }),
            Err(e) => serde_json::to_value(GenericResponse::error(e.to_string())).unwrap(),
        }
    }

    fn legacy_alarm_remove(&self, params: Value) -> Value {
        let Ok(req) = serde_json::from_value::<LegacyAlarmRemoveRequest>(params) else {
            return serde_json::to_value(GenericResponse::error("bad time/alarmRemove payload"))
                .unwrap();
        };

        let removed = self.core.legacy_alarm_remove(req.alarm_id);
        if removed {
            serde_json::to_value(GenericResponse::ok()).unwrap()
        } else {
            serde_json::to_value(GenericResponse::error("unknown alarmId")).unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_set_request_parses_relative() {
        let json = r#"{"key":"t","uri":"x://y","wakeup":true,"in":10}"#;
        let req: TimeoutSetRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.in_seconds, Some(10));
        assert!(req.at.is_none());
        assert!(req.wakeup);
    }

    #[test]
    fn resume_signal_carries_int_code() {
        let signal = OutgoingSignal::resume(ResumeType::Activity);
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["resumetype"], 1);
    }

    #[test]
    fn round_from_method_maps_both_rounds() {
        assert_eq!(round_from_method("suspendRequestAck"), Some(Round::SuspendRequest));
        assert_eq!(round_from_method("prepareSuspendAck"), Some(Round::PrepareSuspend));
        assert_eq!(round_from_method("forceSuspend"), None);
    }

    fn test_dispatcher() -> (Dispatcher, std::path::PathBuf) {
        use crate::clock::SystemClockSource;
        use crate::config::DaemonConfig;
        use crate::hal::NullHal;

        let dir = tempfile::tempdir().unwrap().into_path();
        let mut config = DaemonConfig::default();
        config.alarm_store_path = dir.join("db").to_str().unwrap().to_string();
        config.legacy_alarm_path = dir.join("legacy.xml").to_str().unwrap().to_string();
        config.time_saver_path = dir.join("time_saver").to_str().unwrap().to_string();
        config.ready_token_path = dir.join("ready").to_str().unwrap().to_string();

        let core = Core::new(
            config,
            Arc::new(NullHal::default()),
            Arc::new(NullSignalSink),
            Box::new(SystemClockSource),
        )
        .unwrap();

        (Dispatcher::new(core), dir)
    }

    #[test]
    fn dispatch_identify_returns_client_id() {
        let (dispatcher, _dir) = test_dispatcher();
        let resp = dispatcher.dispatch(
            "identify",
            serde_json::json!({"clientName": "tester", "subscribe": true}),
        );
        assert_eq!(resp["returnValue"], true);
        assert!(resp["clientId"].is_string());
    }

    #[test]
    fn dispatch_unknown_method_errors() {
        let (dispatcher, _dir) = test_dispatcher();
        let resp = dispatcher.dispatch("bogus", serde_json::json!({}));
        assert_eq!(resp["returnValue"], false);
    }

    #[test]
    fn dispatch_timeout_set_then_clear() {
        let (dispatcher, _dir) = test_dispatcher();
        let resp = dispatcher.dispatch(
            "timeout/set",
            serde_json::json!({"key": "t", "uri": "x://y", "wakeup": true, "in": 60}),
        );
        assert_eq!(resp["returnValue"], true);

        let resp = dispatcher.dispatch("timeout/clear", serde_json::json!({"key": "t"}));
        assert_eq!(resp["returnValue"], true);
    }

    #[test]
    fn dispatch_legacy_alarm_add_query_remove_round_trips() {
        let (dispatcher, _dir) = test_dispatcher();

        let resp = dispatcher.dispatch(
            "time/alarmAdd",
            serde_json::json!({
                "key": "k",
                "serviceName": "svc",
                "relative_time": "00:01:00",
            }),
        );
        assert_eq!(resp["returnValue"], true);
        let alarm_id = resp["alarmId"].as_u64().unwrap();

        let resp = dispatcher.dispatch(
            "time/alarmQuery",
            serde_json::json!({"serviceName": "svc"}),
        );
        assert_eq!(resp["returnValue"], true);
        assert_eq!(resp["alarms"].as_array().unwrap().len(), 1);

        let resp = dispatcher.dispatch(
            "time/alarmRemove",
            serde_json::json!({"alarmId": alarm_id}),
        );
        assert_eq!(resp["returnValue"], true);

        let resp = dispatcher.dispatch(
            "time/alarmQuery",
            serde_json::json!({"serviceName": "svc"}),
        );
        assert_eq!(resp["alarms"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn dispatch_legacy_alarm_add_calendar() {
        let (dispatcher, _dir) = test_dispatcher();

        let resp = dispatcher.dispatch(
            "time/alarmAddCalendar",
            serde_json::json!({
                "key": "k",
                "serviceName": "svc",
                "date": "01-01-1970",
                "time": "00:00:00",
            }),
        );
        assert_eq!(resp["returnValue"], true);
        assert!(resp["alarmId"].is_number());
    }
}
