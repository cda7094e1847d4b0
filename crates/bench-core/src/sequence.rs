//! Sequence definitions and run state (spec.md §3 SequenceDefinition / SequenceState).

use serde::{Deserialize, Serialize};

use crate::waveform::{PostProcessConfig, Waveform};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub id: String,
    pub name: String,
    pub unit: String,
    pub waveform: Waveform,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_value: Option<f64>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_clamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_clamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slew_rate: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn default_scale() -> f64 {
    1.0
}

impl SequenceDefinition {
    pub fn post_process_config(&self) -> PostProcessConfig {
        PostProcessConfig {
            scale: self.scale,
            offset: self.offset,
            min_clamp: self.min_clamp,
            max_clamp: self.max_clamp,
            max_slew_rate: self.max_slew_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    Once,
    Count,
    Continuous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub sequence_id: String,
    pub device_id: String,
    pub parameter: String,
    pub repeat_mode: RepeatMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceState {
    pub sequence_id: String,
    pub run_config: RunConfig,
    pub execution_state: ExecutionState,
    pub current_step_index: u32,
    pub total_steps: u32,
    pub current_cycle: u32,
    pub total_cycles: Option<u32>,
    pub started_at: Option<i64>,
    pub elapsed_ms: i64,
    pub commanded_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SequenceState {
    pub fn new(run_config: RunConfig, total_steps: u32, started_at: i64) -> Self {
        let total_cycles = match run_config.repeat_mode {
            RepeatMode::Once => Some(1),
            RepeatMode::Count => run_config.repeat_count,
            RepeatMode::Continuous => None,
        };
        SequenceState {
            sequence_id: run_config.sequence_id.clone(),
            run_config,
            execution_state: ExecutionState::Running,
            current_step_index: 0,
            total_steps,
            current_cycle: 0,
            total_cycles,
            started_at: Some(started_at),
            elapsed_ms: 0,
            commanded_value: None,
            error: None,
        }
    }

    /// Whether the engine should stop scheduling after the current cycle
    /// completes (spec.md §4.6 step 6).
    pub fn cycle_limit_reached(&self) -> bool {
        match self.run_config.repeat_mode {
            RepeatMode::Once => true,
            RepeatMode::Count => self
                .total_cycles
                .is_some_and(|total| self.current_cycle + 1 >= total),
            RepeatMode::Continuous => false,
        }
    }
}
