//! Shared fixture builders for device identity/capability metadata used
//! across `bench-core`, `bench-driver` and `bench-server` test suites.

use bench_core::device::{DeviceCapabilities, DeviceClass, DeviceInfo, DeviceType, ValueDescriptor};
use bench_core::scope::{ChannelConfig, OscilloscopeStatus};
use std::collections::BTreeMap;

pub fn psu_info() -> DeviceInfo {
    DeviceInfo::new(DeviceType::PowerSupply, "Keysight", "E36313A", Some("MY1".to_string()))
}

pub fn psu_capabilities() -> DeviceCapabilities {
    DeviceCapabilities {
        device_class: DeviceClass::Psu,
        features: vec![],
        modes: vec!["CV".into()],
        modes_settable: false,
        outputs: vec![
            ValueDescriptor::new("voltage", "V", 3).with_range(0.0, 30.0),
            ValueDescriptor::new("current", "A", 3).with_range(0.0, 5.0),
        ],
        measurements: vec![
            ValueDescriptor::new("voltage", "V", 3),
            ValueDescriptor::new("current", "A", 3),
            ValueDescriptor::new("power", "W", 3),
        ],
        list_mode: None,
    }
}

pub fn load_info() -> DeviceInfo {
    DeviceInfo::new(DeviceType::ElectronicLoad, "BK Precision", "8600", Some("BK1".to_string()))
}

pub fn load_capabilities() -> DeviceCapabilities {
    DeviceCapabilities {
        device_class: DeviceClass::Load,
        features: vec![],
        modes: vec!["CC".into(), "CV".into(), "CR".into(), "CP".into()],
        modes_settable: true,
        outputs: vec![
            ValueDescriptor::new("current", "A", 3).with_range(0.0, 30.0).with_modes(["CC"]),
            ValueDescriptor::new("voltage", "V", 3).with_range(0.0, 150.0).with_modes(["CV"]),
        ],
        measurements: vec![
            ValueDescriptor::new("voltage", "V", 3),
            ValueDescriptor::new("current", "A", 3),
        ],
        list_mode: Some(true),
    }
}

pub fn scope_info() -> DeviceInfo {
    DeviceInfo::new(DeviceType::Oscilloscope, "Rigol", "DS1054Z", Some("DS1".to_string()))
}

pub fn scope_capabilities() -> DeviceCapabilities {
    DeviceCapabilities {
        device_class: DeviceClass::Oscilloscope,
        features: vec![],
        modes: vec![],
        modes_settable: false,
        outputs: vec![],
        measurements: vec![],
        list_mode: None,
    }
}

pub fn scope_status() -> OscilloscopeStatus {
    let mut channels = BTreeMap::new();
    channels.insert("CHAN1".to_owned(), ChannelConfig::new(1.0, 0.0));
    OscilloscopeStatus {
        running: true,
        trigger_status: "AUTO".into(),
        sample_rate: 1_000_000.0,
        memory_depth: 12_000_000,
        channels,
        timebase: 0.001,
        trigger: "EDGE".into(),
        measurements: BTreeMap::new(),
    }
}
