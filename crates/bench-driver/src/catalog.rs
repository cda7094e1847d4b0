//! Manufacturer/model -> `ScpiDialect` lookup table (spec.md §4.5:
//! "instantiate the appropriate driver + session" once a candidate port's
//! `*IDN?` reply has been parsed).
//!
//! `ScpiDriver` is dialect-agnostic by design (see `scpi.rs`), which means
//! discovery can't build one until it already knows which instrument family
//! it is talking to. This table is the small, explicit set of families this
//! driver crate actually knows how to drive; an instrument that identifies
//! but isn't listed here is left unrecognized rather than guessed at.

use bench_core::device::{DeviceCapabilities, DeviceClass, DeviceType, ValueDescriptor};
use std::collections::BTreeMap;

use crate::scpi::ScpiDialect;

pub struct CatalogEntry {
    pub device_type: DeviceType,
    pub dialect: ScpiDialect,
    pub capabilities: DeviceCapabilities,
}

/// Looks up a dialect by exact manufacturer/model match. Case-sensitive:
/// `*IDN?` replies from a given family are consistent about casing, and a
/// fuzzy match risks silently wiring the wrong command set to a device.
pub fn lookup(manufacturer: &str, model: &str) -> Option<CatalogEntry> {
    match (manufacturer, model) {
        ("Keysight", "E36313A") => Some(keysight_e36313a()),
        ("BK Precision", "8600") => Some(bk_precision_8600()),
        _ => None,
    }
}

fn keysight_e36313a() -> CatalogEntry {
    let mut measurement_queries = BTreeMap::new();
    measurement_queries.insert("voltage".to_owned(), "MEAS:VOLT?".to_owned());
    measurement_queries.insert("current".to_owned(), "MEAS:CURR?".to_owned());

    let mut setpoint_commands = BTreeMap::new();
    setpoint_commands.insert("voltage".to_owned(), ("VOLT {value}".to_owned(), "VOLT?".to_owned()));
    setpoint_commands.insert("current".to_owned(), ("CURR {value}".to_owned(), "CURR?".to_owned()));

    CatalogEntry {
        device_type: DeviceType::PowerSupply,
        dialect: ScpiDialect {
            idn_query: "*IDN?".to_owned(),
            measurement_queries,
            setpoint_commands,
            mode_set_command: "FUNC {mode}".to_owned(),
            mode_get_command: "FUNC?".to_owned(),
            output_on_command: "OUTP ON".to_owned(),
            output_off_command: "OUTP OFF".to_owned(),
            output_get_command: "OUTP?".to_owned(),
        },
        capabilities: DeviceCapabilities {
            device_class: DeviceClass::Psu,
            features: vec![],
            modes: vec!["CV".into()],
            modes_settable: false,
            outputs: vec![
                ValueDescriptor::new("voltage", "V", 3).with_range(0.0, 30.0),
                ValueDescriptor::new("current", "A", 3).with_range(0.0, 5.0),
            ],
            measurements: vec![ValueDescriptor::new("voltage", "V", 3), ValueDescriptor::new("current", "A", 3)],
            list_mode: None,
        },
    }
}

fn bk_precision_8600() -> CatalogEntry {
    let mut measurement_queries = BTreeMap::new();
    measurement_queries.insert("voltage".to_owned(), "MEAS:VOLT?".to_owned());
    measurement_queries.insert("current".to_owned(), "MEAS:CURR?".to_owned());

    let mut setpoint_commands = BTreeMap::new();
    setpoint_commands.insert("current".to_owned(), ("CURR {value}".to_owned(), "CURR?".to_owned()));
    setpoint_commands.insert("voltage".to_owned(), ("VOLT {value}".to_owned(), "VOLT?".to_owned()));

    CatalogEntry {
        device_type: DeviceType::ElectronicLoad,
        dialect: ScpiDialect {
            idn_query: "*IDN?".to_owned(),
            measurement_queries,
            setpoint_commands,
            mode_set_command: "FUNC {mode}".to_owned(),
            mode_get_command: "FUNC?".to_owned(),
            output_on_command: "INP ON".to_owned(),
            output_off_command: "INP OFF".to_owned(),
            output_get_command: "INP?".to_owned(),
        },
        capabilities: DeviceCapabilities {
            device_class: DeviceClass::Load,
            features: vec![],
            modes: vec!["CC".into(), "CV".into(), "CR".into(), "CP".into()],
            modes_settable: true,
            outputs: vec![
                ValueDescriptor::new("current", "A", 3).with_range(0.0, 30.0).with_modes(["CC"]),
                ValueDescriptor::new("voltage", "V", 3).with_range(0.0, 150.0).with_modes(["CV"]),
            ],
            measurements: vec![ValueDescriptor::new("voltage", "V", 3), ValueDescriptor::new("current", "A", 3)],
            list_mode: Some(true),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_resolve() {
        assert!(lookup("Keysight", "E36313A").is_some());
        assert!(lookup("BK Precision", "8600").is_some());
    }

    #[test]
    fn unknown_model_is_unrecognized() {
        assert!(lookup("Acme", "Mystery-1").is_none());
    }
}
