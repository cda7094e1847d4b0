//! Oscilloscope status and waveform types (spec.md §3 OscilloscopeStatus).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Coupling {
    Ac,
    Dc,
    Gnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Probe {
    #[serde(rename = "1")]
    X1,
    #[serde(rename = "10")]
    X10,
    #[serde(rename = "100")]
    X100,
}

impl Probe {
    pub fn attenuation(self) -> f64 {
        match self {
            Probe::X1 => 1.0,
            Probe::X10 => 10.0,
            Probe::X100 => 100.0,
        }
    }
}

/// Per-channel front-end configuration, e.g. `CHAN1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub scale: f64,
    pub offset: f64,
    pub coupling: Coupling,
    pub probe: Probe,
    pub bw_limit: bool,
}

impl ChannelConfig {
    pub fn new(scale: f64, offset: f64) -> Self {
        ChannelConfig {
            enabled: true,
            scale,
            offset,
            coupling: Coupling::Dc,
            probe: Probe::X1,
            bw_limit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OscilloscopeStatus {
    pub running: bool,
    pub trigger_status: String,
    pub sample_rate: f64,
    pub memory_depth: u64,
    pub channels: BTreeMap<String, ChannelConfig>,
    pub timebase: f64,
    pub trigger: String,
    pub measurements: BTreeMap<String, f64>,
}

/// Acquired waveform trace, expressed in the instrument's native
/// scale/offset convention rather than pre-converted float samples, so a
/// client can reconstruct `voltage[i] = (points[i] - yReference) * yIncrement + yOrigin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformData {
    pub channel: String,
    pub points: Vec<f64>,
    pub x_increment: f64,
    pub x_origin: f64,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_attenuation_matches_label() {
        assert_eq!(Probe::X1.attenuation(), 1.0);
        assert_eq!(Probe::X10.attenuation(), 10.0);
        assert_eq!(Probe::X100.attenuation(), 100.0);
    }

    #[test]
    fn channel_config_default_is_enabled_dc_1x() {
        let c = ChannelConfig::new(1.0, 0.0);
        assert!(c.enabled);
        assert_eq!(c.coupling, Coupling::Dc);
        assert_eq!(c.probe, Probe::X1);
    }
}
