//! Generic table-driven SCPI driver (spec.md §4.2 non-goal: "concrete SCPI
//! dialects... encapsulated behind a `Driver` interface").
//!
//! `ScpiDriver` never hardcodes a vendor's command strings. A `ScpiDialect`
//! supplies the query/command templates for a given instrument family;
//! `ScpiDriver` only knows how to run them over the transport mutex and
//! parse the generic reply shapes (CSV identity, bare floats, `0`/`1`
//! booleans). Per-vendor quirks stay out of this crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use bench_core::device::{DeviceCapabilities, DeviceInfo, DeviceType};

use crate::driver::{Driver, StatusFields};
use crate::error::DriverError;
use crate::transport::Transport;

/// Query/command templates for one instrument family. `{value}` and
/// `{mode}` are substituted literally before the command is sent.
#[derive(Debug, Clone)]
pub struct ScpiDialect {
    pub idn_query: String,
    /// Measurement name -> query command, e.g. `"voltage" -> "MEAS:VOLT?"`.
    pub measurement_queries: BTreeMap<String, String>,
    /// Setpoint name -> (set command with `{value}`, get query).
    pub setpoint_commands: BTreeMap<String, (String, String)>,
    pub mode_set_command: String,
    pub mode_get_command: String,
    pub output_on_command: String,
    pub output_off_command: String,
    pub output_get_command: String,
}

/// A driver for any instrument speaking a `ScpiDialect` over a `Transport`.
pub struct ScpiDriver {
    transport: Arc<Transport>,
    dialect: ScpiDialect,
    device_type: DeviceType,
    capabilities: DeviceCapabilities,
}

impl ScpiDriver {
    pub fn new(transport: Arc<Transport>, dialect: ScpiDialect, device_type: DeviceType, capabilities: DeviceCapabilities) -> Self {
        ScpiDriver {
            transport,
            dialect,
            device_type,
            capabilities,
        }
    }

    fn parse_float(reply: &str) -> Result<f64, DriverError> {
        reply
            .trim()
            .parse::<f64>()
            .map_err(|_| DriverError::InvalidReply(reply.to_owned()))
    }

    fn parse_bool01(reply: &str) -> Result<bool, DriverError> {
        match reply.trim() {
            "1" | "ON" | "on" => Ok(true),
            "0" | "OFF" | "off" => Ok(false),
            other => Err(DriverError::InvalidReply(other.to_owned())),
        }
    }
}

/// Split a `*IDN?` reply into its manufacturer/model/serial fields without
/// needing a dialect or a device type yet. Discovery uses this directly on a
/// bare `Transport` to find out what's plugged into a port before picking
/// the `ScpiDialect` to talk to it with; `ScpiDriver::identify` reuses it
/// once a dialect is already bound.
pub fn parse_idn_reply(reply: &str) -> (String, String, Option<String>) {
    let fields: Vec<&str> = reply.split(',').map(str::trim).collect();
    let manufacturer = fields.first().copied().unwrap_or("unknown").to_owned();
    let model = fields.get(1).copied().unwrap_or("unknown").to_owned();
    let serial = fields.get(2).map(|s| (*s).to_owned()).filter(|s| !s.is_empty());
    (manufacturer, model, serial)
}

#[async_trait]
impl Driver for ScpiDriver {
    async fn identify(&self) -> Result<DeviceInfo, DriverError> {
        let reply = self.transport.query(&self.dialect.idn_query).await?;
        let (manufacturer, model, serial) = parse_idn_reply(&reply);
        Ok(DeviceInfo::new(self.device_type, manufacturer, model, serial))
    }

    async fn get_capabilities(&self) -> Result<DeviceCapabilities, DriverError> {
        Ok(self.capabilities.clone())
    }

    async fn read_measurements(&self) -> Result<BTreeMap<String, f64>, DriverError> {
        let mut out = BTreeMap::new();
        for (name, query) in &self.dialect.measurement_queries {
            let reply = self.transport.query(query).await?;
            out.insert(name.clone(), Self::parse_float(&reply)?);
        }
        Ok(out)
    }

    async fn read_status_fields(&self) -> Result<StatusFields, DriverError> {
        let mode_reply = self.transport.query(&self.dialect.mode_get_command).await?;
        let output_reply = self.transport.query(&self.dialect.output_get_command).await?;
        let mut setpoints = BTreeMap::new();
        for (name, (_, get_cmd)) in &self.dialect.setpoint_commands {
            let reply = self.transport.query(get_cmd).await?;
            setpoints.insert(name.clone(), Self::parse_float(&reply)?);
        }
        Ok(StatusFields {
            mode: mode_reply.trim().to_owned(),
            output_enabled: Self::parse_bool01(&output_reply)?,
            setpoints,
        })
    }

    async fn set_mode(&self, mode: &str) -> Result<(), DriverError> {
        let cmd = self.dialect.mode_set_command.replace("{mode}", mode);
        self.transport.write(&cmd).await?;
        Ok(())
    }

    async fn set_output(&self, enabled: bool) -> Result<(), DriverError> {
        let cmd = if enabled {
            &self.dialect.output_on_command
        } else {
            &self.dialect.output_off_command
        };
        self.transport.write(cmd).await?;
        Ok(())
    }

    async fn set_value(&self, name: &str, value: f64) -> Result<(), DriverError> {
        let (set_template, _) = self
            .dialect
            .setpoint_commands
            .get(name)
            .ok_or_else(|| DriverError::Unsupported(format!("no setpoint named {name}")))?;
        let cmd = set_template.replace("{value}", &value.to_string());
        self.transport.write(&cmd).await?;
        Ok(())
    }
}
