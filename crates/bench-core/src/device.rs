//! Device identity and capability metadata (spec.md §3 DeviceInfo / DeviceCapabilities).

use serde::{Deserialize, Serialize};

use crate::id::DeviceId;

/// The instrument category a session was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    PowerSupply,
    ElectronicLoad,
    Oscilloscope,
}

/// Identity of a device, immutable after session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceIdString,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub manufacturer: String,
    pub model: String,
    pub serial: Option<String>,
}

/// Wire representation of `DeviceId`: plain string, serializable, still
/// constructed only through `DeviceId::derive`.
pub type DeviceIdString = String;

impl DeviceInfo {
    pub fn new(
        device_type: DeviceType,
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        serial: Option<String>,
    ) -> Self {
        let manufacturer = manufacturer.into();
        let model = model.into();
        let id = DeviceId::derive(&manufacturer, &model, serial.as_deref()).to_string();
        DeviceInfo {
            id,
            device_type,
            manufacturer,
            model,
            serial,
        }
    }
}

/// The broad capability class used for routing and UI presentation.
/// Distinct from `DeviceType` in that `Awg` has no corresponding
/// `DeviceType` variant yet (reserved, spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    Psu,
    Load,
    Oscilloscope,
    Awg,
}

/// A single settable output or readable measurement channel's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDescriptor {
    pub name: String,
    pub unit: String,
    pub decimals: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Operating modes this setpoint applies to (e.g. CC/CV/CR/CP). `None`
    /// means it applies in every mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modes: Option<Vec<String>>,
}

impl ValueDescriptor {
    pub fn new(name: impl Into<String>, unit: impl Into<String>, decimals: u8) -> Self {
        ValueDescriptor {
            name: name.into(),
            unit: unit.into(),
            decimals,
            min: None,
            max: None,
            modes: None,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.modes = Some(modes.into_iter().map(Into::into).collect());
        self
    }

    /// Whether this descriptor is active for the given operating mode.
    /// A `None` mode filter means "applies to every mode".
    pub fn applies_to_mode(&self, mode: &str) -> bool {
        match &self.modes {
            None => true,
            Some(modes) => modes.iter().any(|m| m == mode),
        }
    }

    /// Clamp `value` to `[min, max]` when both bounds are present.
    pub fn clamp(&self, value: f64) -> f64 {
        match (self.min, self.max) {
            (Some(min), Some(max)) => value.clamp(min, max),
            _ => value,
        }
    }
}

/// Static capability description returned once per session by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub device_class: DeviceClass,
    pub features: Vec<String>,
    pub modes: Vec<String>,
    pub modes_settable: bool,
    pub outputs: Vec<ValueDescriptor>,
    pub measurements: Vec<ValueDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_mode: Option<bool>,
}

impl DeviceCapabilities {
    /// The outputs whose `modes` filter admits `mode` (spec.md invariant:
    /// "a setpoint ... only carries the setpoint(s) whose modes? includes
    /// the current mode").
    pub fn outputs_for_mode<'a>(&'a self, mode: &'a str) -> impl Iterator<Item = &'a ValueDescriptor> {
        self.outputs.iter().filter(move |o| o.applies_to_mode(mode))
    }

    pub fn output(&self, name: &str) -> Option<&ValueDescriptor> {
        self.outputs.iter().find(|o| o.name == name)
    }
}
