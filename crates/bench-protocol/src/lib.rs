//! Client/server wire protocol for the instrument control server.
//!
//! Every frame is a single JSON object discriminated by a top-level `type`
//! field. Variant payloads are flattened into the same object (the teacher's
//! convention of one struct per message kind, dispatched through the tag,
//! carries over unchanged; only the tag's name and case follow this
//! protocol's own message names instead of the teacher's `kind`/snake_case).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use bench_core::device::{DeviceCapabilities, DeviceInfo};
use bench_core::scope::{ChannelConfig, OscilloscopeStatus, WaveformData};
use bench_core::sequence::{RunConfig, SequenceDefinition, SequenceState};
use bench_core::trigger::{TriggerScript, TriggerState};

/// Frozen wire error codes (spec.md §6). Kept as string constants rather
/// than an enum so a client library generated from this crate's schema can
/// treat unrecognized future codes as opaque strings instead of failing to
/// deserialize.
pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "UNKNOWN_MESSAGE_TYPE";
    pub const DEVICE_NOT_FOUND: &str = "DEVICE_NOT_FOUND";
    pub const WRONG_DEVICE_TYPE: &str = "WRONG_DEVICE_TYPE";
    pub const SUBSCRIBE_FAILED: &str = "SUBSCRIBE_FAILED";
    pub const SET_MODE_FAILED: &str = "SET_MODE_FAILED";
    pub const SET_OUTPUT_FAILED: &str = "SET_OUTPUT_FAILED";
    pub const SET_VALUE_FAILED: &str = "SET_VALUE_FAILED";
    pub const SCOPE_RUN_FAILED: &str = "SCOPE_RUN_FAILED";
    pub const SCOPE_STOP_FAILED: &str = "SCOPE_STOP_FAILED";
    pub const SCOPE_ACQUIRE_FAILED: &str = "SCOPE_ACQUIRE_FAILED";
    pub const SCOPE_CONFIGURE_FAILED: &str = "SCOPE_CONFIGURE_FAILED";
    pub const SCOPE_STREAM_FAILED: &str = "SCOPE_STREAM_FAILED";
    pub const SEQUENCE_NOT_AVAILABLE: &str = "SEQUENCE_NOT_AVAILABLE";
    pub const SEQUENCE_SAVE_FAILED: &str = "SEQUENCE_SAVE_FAILED";
    pub const SEQUENCE_UPDATE_FAILED: &str = "SEQUENCE_UPDATE_FAILED";
    pub const SEQUENCE_DELETE_FAILED: &str = "SEQUENCE_DELETE_FAILED";
    pub const SEQUENCE_RUN_FAILED: &str = "SEQUENCE_RUN_FAILED";
    pub const SEQUENCE_ALREADY_RUNNING: &str = "SEQUENCE_ALREADY_RUNNING";
    pub const TRIGGER_SCRIPT_NOT_AVAILABLE: &str = "TRIGGER_SCRIPT_NOT_AVAILABLE";
    pub const TRIGGER_SCRIPT_SAVE_FAILED: &str = "TRIGGER_SCRIPT_SAVE_FAILED";
    pub const TRIGGER_SCRIPT_UPDATE_FAILED: &str = "TRIGGER_SCRIPT_UPDATE_FAILED";
    pub const TRIGGER_SCRIPT_DELETE_FAILED: &str = "TRIGGER_SCRIPT_DELETE_FAILED";
    pub const TRIGGER_SCRIPT_RUN_FAILED: &str = "TRIGGER_SCRIPT_RUN_FAILED";
    pub const TRIGGER_SCRIPT_ALREADY_RUNNING: &str = "TRIGGER_SCRIPT_ALREADY_RUNNING";
    pub const DEVICE_ALIAS_SET_FAILED: &str = "DEVICE_ALIAS_SET_FAILED";
    pub const DEVICE_ALIAS_CLEAR_FAILED: &str = "DEVICE_ALIAS_CLEAR_FAILED";
    pub const SETTINGS_EXPORT_FAILED: &str = "SETTINGS_EXPORT_FAILED";
    pub const SETTINGS_IMPORT_FAILED: &str = "SETTINGS_IMPORT_FAILED";
    pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
    pub const TRANSPORT_DISCONNECTED: &str = "TRANSPORT_DISCONNECTED";
}

/// A device entry as sent in `deviceList`, enriched with the alias store
/// (spec.md §4.8: "attach `alias`" when one is recorded under the device's
/// IDN key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListEntry {
    #[serde(flatten)]
    pub info: DeviceInfo,
    pub capabilities: DeviceCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Snapshot sent in `subscribed` — the full known state at subscription
/// time, so the client never has to wait for a poll tick to populate its UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateSnapshot {
    pub connection_status: String,
    pub mode: Option<String>,
    pub output_enabled: bool,
    pub setpoints: BTreeMap<String, f64>,
    pub measurements: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementUpdate {
    pub timestamp: i64,
    pub measurements: BTreeMap<String, f64>,
}

/// A settable channel/timebase/trigger parameter for the oscilloscope
/// setters; modelled as a single JSON value so new instrument-specific
/// fields don't require a protocol change (spec.md leaves the exact
/// timebase/trigger shape to the driver).
pub type ScopeParam = serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetValueRequest {
    pub device_id: String,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub immediate: bool,
}

/// All client → server frames (spec.md §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    GetDevices,
    Scan,
    Subscribe { device_id: String },
    Unsubscribe { device_id: String },
    SetMode { device_id: String, mode: String },
    SetOutput { device_id: String, enabled: bool },
    SetValue(SetValueRequest),
    StartList { device_id: String },
    StopList { device_id: String },

    ScopeRun { device_id: String },
    ScopeStop { device_id: String },
    ScopeSingle { device_id: String },
    ScopeAutoSetup { device_id: String },
    ScopeGetWaveform { device_id: String, channel: String },
    ScopeGetMeasurement {
        device_id: String,
        channel: String,
        measurement_type: String,
    },
    ScopeGetScreenshot { device_id: String },
    ScopeSetChannel {
        device_id: String,
        channel: String,
        config: ChannelConfig,
    },
    ScopeSetTimebase { device_id: String, timebase: f64 },
    ScopeSetTrigger { device_id: String, trigger: ScopeParam },
    ScopeStartStreaming {
        device_id: String,
        channels: Vec<String>,
        interval_ms: u64,
        #[serde(default)]
        measurements: Option<Vec<String>>,
    },
    ScopeStopStreaming { device_id: String },

    SequenceLibraryList,
    SequenceLibrarySave { definition: SequenceDefinition },
    SequenceLibraryUpdate { definition: SequenceDefinition },
    SequenceLibraryDelete { id: String },
    SequenceRun { config: RunConfig },
    SequenceAbort,

    TriggerScriptLibraryList,
    TriggerScriptLibrarySave { script: TriggerScript },
    TriggerScriptLibraryUpdate { script: TriggerScript },
    TriggerScriptLibraryDelete { id: String },
    TriggerScriptRun { script_id: String },
    TriggerScriptStop,
    TriggerScriptPause,
    TriggerScriptResume,

    DeviceAliasList,
    DeviceAliasSet { idn: String, alias: String },
    DeviceAliasClear { idn: String },

    SettingsExport,
    SettingsImport { document: SettingsDocument },
}

/// All settings namespaces bundled together by `settingsExport`/`settingsImport`
/// (spec.md §4.9: "a single document containing all three").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDocument {
    pub sequences: Vec<SequenceDefinition>,
    pub trigger_scripts: Vec<TriggerScript>,
    pub aliases: BTreeMap<String, String>,
}

/// All server → client frames (spec.md §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    DeviceList { devices: Vec<DeviceListEntry> },
    Subscribed { device_id: String, state: DeviceStateSnapshot },
    Unsubscribed { device_id: String },
    Measurement { device_id: String, update: MeasurementUpdate },
    Field {
        device_id: String,
        field: String,
        value: serde_json::Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        code: String,
        message: String,
    },

    ScopeStatusUpdate { device_id: String, status: OscilloscopeStatus },
    ScopeWaveform { device_id: String, waveform: WaveformData },
    ScopeMeasurement {
        device_id: String,
        channel: String,
        measurement_type: String,
        value: f64,
    },
    ScopeScreenshot {
        device_id: String,
        image_base64: String,
    },

    SequenceStarted { state: SequenceState },
    SequenceProgress { state: SequenceState },
    SequenceCompleted { sequence_id: String },
    SequenceAborted { sequence_id: String },
    SequenceError { sequence_id: String, error: String },

    TriggerFired {
        script_id: String,
        trigger_id: String,
        state: TriggerState,
    },
    TriggerActionFailed {
        script_id: String,
        trigger_id: String,
        error: String,
    },
    TriggerScriptStopped { script_id: String },

    SequenceLibrary { sequences: Vec<SequenceDefinition> },
    TriggerScriptLibrary { scripts: Vec<TriggerScript> },

    DeviceAliases { aliases: BTreeMap<String, String> },
    DeviceAliasChanged { idn: String, alias: Option<String> },

    SettingsExported { document: SettingsDocument },
    SettingsImported,
}

impl ServerMessage {
    pub fn error(device_id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            device_id,
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_tag_round_trips() {
        let msg = ClientMessage::Subscribe {
            device_id: "psu-1".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["deviceId"], "psu-1");
        let back: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn set_value_flattens_immediate_default() {
        let json = serde_json::json!({"type": "setValue", "deviceId": "psu-1", "name": "voltage", "value": 12.0});
        let msg: ClientMessage = serde_json::from_value(json).unwrap();
        match msg {
            ClientMessage::SetValue(req) => {
                assert!(!req.immediate);
                assert_eq!(req.value, 12.0);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_fails_to_deserialize() {
        let json = serde_json::json!({"type": "doesNotExist"});
        let result: Result<ClientMessage, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }

    #[test]
    fn server_error_message_omits_missing_device_id() {
        let msg = ServerMessage::error(None, error_codes::INVALID_MESSAGE, "bad frame");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("deviceId").is_none());
    }
}
