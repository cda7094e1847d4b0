//! Trigger scripts and pure condition-evaluation logic (spec.md §3/§4.7).
//!
//! The edge/debounce/repeat discipline itself lives here as a pure function
//! over `TriggerState` so `TriggerScriptEngine` (in `bench-server`) only has
//! to own the measurement subscriptions and the coarse time ticker.

use serde::{Deserialize, Serialize};

use crate::sequence::RepeatMode as SequenceRepeatMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn evaluate(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Operator::Gt => lhs > rhs,
            Operator::Lt => lhs < rhs,
            Operator::Ge => lhs >= rhs,
            Operator::Le => lhs <= rhs,
            Operator::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Operator::Ne => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Condition {
    Value {
        device_id: String,
        parameter: String,
        operator: Operator,
        value: f64,
    },
    Time {
        seconds: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    SetValue {
        device_id: String,
        parameter: String,
        value: f64,
    },
    SetOutput {
        device_id: String,
        enabled: bool,
    },
    StartSequence {
        sequence_id: String,
        device_id: String,
        parameter: String,
        repeat_mode: SequenceRepeatMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat_count: Option<u32>,
    },
    StopSequence,
    PauseSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerRepeatMode {
    Once,
    Repeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub condition: Condition,
    pub action: Action,
    pub repeat_mode: TriggerRepeatMode,
    pub debounce_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerScript {
    pub id: String,
    pub name: String,
    pub triggers: Vec<Trigger>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerState {
    pub trigger_id: String,
    pub fired_count: u32,
    pub last_fired_at: Option<i64>,
    pub condition_met: bool,
}

impl TriggerState {
    pub fn new(trigger_id: impl Into<String>) -> Self {
        TriggerState {
            trigger_id: trigger_id.into(),
            fired_count: 0,
            last_fired_at: None,
            condition_met: false,
        }
    }
}

/// Result of evaluating one condition observation against a trigger's
/// current state: whether to fire, and the state to carry forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOutcome {
    pub should_fire: bool,
}

/// Apply the edge/debounce/repeat discipline from spec.md §4.7 to a single
/// condition observation. `met` is the raw (already-evaluated) predicate
/// result for this tick; `now_ms` is the current time; `state` is mutated in
/// place to reflect the new `conditionMet` regardless of whether it fires.
pub fn evaluate_edge(state: &mut TriggerState, repeat_mode: TriggerRepeatMode, met: bool, now_ms: i64, debounce_ms: i64) -> EvalOutcome {
    let rising_edge = met && !state.condition_met;
    let debounce_elapsed = match state.last_fired_at {
        None => true,
        Some(last) => now_ms - last >= debounce_ms,
    };
    let repeat_allows = match repeat_mode {
        TriggerRepeatMode::Once => state.fired_count == 0,
        TriggerRepeatMode::Repeat => true,
    };

    let should_fire = rising_edge && debounce_elapsed && repeat_allows;

    if should_fire {
        state.fired_count += 1;
        state.last_fired_at = Some(now_ms);
    }
    state.condition_met = met;

    EvalOutcome { should_fire }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_evaluation() {
        assert!(Operator::Gt.evaluate(5.0, 3.0));
        assert!(!Operator::Gt.evaluate(3.0, 5.0));
        assert!(Operator::Eq.evaluate(1.0, 1.0));
        assert!(Operator::Ne.evaluate(1.0, 2.0));
    }

    #[test]
    fn fires_only_on_rising_edge() {
        let mut state = TriggerState::new("t1");
        let first = evaluate_edge(&mut state, TriggerRepeatMode::Repeat, true, 0, 0);
        assert!(first.should_fire);
        let second = evaluate_edge(&mut state, TriggerRepeatMode::Repeat, true, 10, 0);
        assert!(!second.should_fire, "should not re-fire while condition stays met");
    }

    #[test]
    fn refires_after_condition_clears_and_resets() {
        let mut state = TriggerState::new("t1");
        evaluate_edge(&mut state, TriggerRepeatMode::Repeat, true, 0, 0);
        evaluate_edge(&mut state, TriggerRepeatMode::Repeat, false, 5, 0);
        let third = evaluate_edge(&mut state, TriggerRepeatMode::Repeat, true, 10, 0);
        assert!(third.should_fire);
    }

    #[test]
    fn debounce_blocks_rapid_refire() {
        let mut state = TriggerState::new("t1");
        evaluate_edge(&mut state, TriggerRepeatMode::Repeat, true, 0, 100);
        evaluate_edge(&mut state, TriggerRepeatMode::Repeat, false, 1, 100);
        let blocked = evaluate_edge(&mut state, TriggerRepeatMode::Repeat, true, 50, 100);
        assert!(!blocked.should_fire, "debounce window has not elapsed");
        let allowed = evaluate_edge(&mut state, TriggerRepeatMode::Repeat, false, 60, 100);
        assert!(!allowed.should_fire);
        evaluate_edge(&mut state, TriggerRepeatMode::Repeat, false, 60, 100);
        let refire = evaluate_edge(&mut state, TriggerRepeatMode::Repeat, true, 150, 100);
        assert!(refire.should_fire);
    }

    #[test]
    fn once_mode_never_fires_twice() {
        let mut state = TriggerState::new("t1");
        evaluate_edge(&mut state, TriggerRepeatMode::Once, true, 0, 0);
        evaluate_edge(&mut state, TriggerRepeatMode::Once, false, 10, 0);
        let second = evaluate_edge(&mut state, TriggerRepeatMode::Once, true, 20, 0);
        assert!(!second.should_fire);
        assert_eq!(state.fired_count, 1);
    }
}
