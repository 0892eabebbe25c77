//! Tanker loading interlock panel.
//!
//! Aggregates the grounding and overfill interlocks with a deadman button
//! into a single system-safe permissive. The deadman is edge-triggered:
//! each fresh press restarts the countdown, holding the button does not.
//! A warning output fires partway through the countdown so the operator
//! gets a nudge before loading is cut.

use super::{ChannelValue, TickContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TankbilParams {
    pub deadman_enabled: bool,
    pub deadman_warning_sec: f64,
    pub deadman_timeout_sec: f64,
}

impl Default for TankbilParams {
    fn default() -> Self {
        Self {
            deadman_enabled: true,
            deadman_warning_sec: 2.0,
            deadman_timeout_sec: 5.0,
        }
    }
}

impl TankbilParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.deadman_warning_sec > 0.0) {
            return Err("deadman_warning_sec must be positive".into());
        }
        if !(self.deadman_timeout_sec > 0.0) {
            return Err("deadman_timeout_sec must be positive".into());
        }
        if self.deadman_warning_sec >= self.deadman_timeout_sec {
            return Err("deadman_warning_sec must come before deadman_timeout_sec".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlockStatus {
    /// Grounding or overfill interlock missing.
    Unsafe,
    /// Interlocks made up, waiting on a deadman press.
    ReadyCheck,
    Safe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TankbilDisplay {
    pub status: InterlockStatus,
    pub ground_ok: bool,
    pub overfill_ok: bool,
    pub deadman_pressed: bool,
    pub deadman_warning: bool,
    pub deadman_timer_s: f64,
    pub system_safe: bool,
}

#[derive(Debug, Clone)]
pub struct TankbilModel {
    params: TankbilParams,
    ground_ok: bool,
    overfill_ok: bool,
    pressed: bool,
    timer_s: f64,
}

impl TankbilModel {
    pub fn new(params: TankbilParams) -> Self {
        Self {
            params,
            ground_ok: false,
            overfill_ok: false,
            pressed: false,
            timer_s: 0.0,
        }
    }

    pub fn tick(&mut self, ctx: &TickContext) -> TankbilDisplay {
        self.ground_ok = ctx.inputs.digital("ground_ok");
        self.overfill_ok = ctx.inputs.digital("overfill_ok");

        let pressed = ctx.inputs.digital("deadman");
        let press_edge = pressed && !self.pressed;
        self.pressed = pressed;

        if press_edge {
            self.timer_s = 0.0;
        } else {
            self.timer_s += ctx.dt;
        }

        self.display()
    }

    pub fn display(&self) -> TankbilDisplay {
        let deadman_ok = !self.params.deadman_enabled || self.timer_s < self.params.deadman_timeout_sec;
        let interlocks_ok = self.ground_ok && self.overfill_ok;
        let status = if !interlocks_ok {
            InterlockStatus::Unsafe
        } else if !deadman_ok {
            InterlockStatus::ReadyCheck
        } else {
            InterlockStatus::Safe
        };
        TankbilDisplay {
            status,
            ground_ok: self.ground_ok,
            overfill_ok: self.overfill_ok,
            deadman_pressed: self.pressed,
            deadman_warning: self.params.deadman_enabled
                && self.timer_s > self.params.deadman_warning_sec,
            deadman_timer_s: self.timer_s,
            system_safe: interlocks_ok && deadman_ok,
        }
    }
}

pub(super) fn outputs(display: &TankbilDisplay, out: &mut Vec<(&'static str, ChannelValue)>) {
    out.push(("warning", ChannelValue::Digital(display.deadman_warning)));
    out.push(("system_safe", ChannelValue::Digital(display.system_safe)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{InputSet, NoLinks};

    fn tick(model: &mut TankbilModel, inputs: &InputSet) -> TankbilDisplay {
        model.tick(&TickContext {
            dt: 0.1,
            inputs,
            links: &NoLinks,
        })
    }

    fn interlocks(ground: bool, overfill: bool, deadman: bool) -> InputSet {
        let mut inputs = InputSet::new();
        inputs.insert("ground_ok", ChannelValue::Digital(ground));
        inputs.insert("overfill_ok", ChannelValue::Digital(overfill));
        inputs.insert("deadman", ChannelValue::Digital(deadman));
        inputs
    }

    #[test]
    fn missing_ground_forces_unsafe() {
        let mut model = TankbilModel::new(TankbilParams::default());
        let display = tick(&mut model, &interlocks(false, true, true));
        assert_eq!(display.status, InterlockStatus::Unsafe);
        assert!(!display.system_safe);
    }

    #[test]
    fn all_interlocks_made_up_is_safe() {
        let mut model = TankbilModel::new(TankbilParams::default());
        let display = tick(&mut model, &interlocks(true, true, true));
        assert_eq!(display.status, InterlockStatus::Safe);
        assert!(display.system_safe);
    }

    #[test]
    fn holding_the_deadman_does_not_restart_the_countdown() {
        let mut model = TankbilModel::new(TankbilParams::default());
        let held = interlocks(true, true, true);

        // Press edge on the first tick, then held for 6 s.
        let mut display = tick(&mut model, &held);
        for _ in 0..60 {
            display = tick(&mut model, &held);
        }
        assert_eq!(display.status, InterlockStatus::ReadyCheck);
        assert!(!display.system_safe);
    }

    #[test]
    fn fresh_press_restarts_the_countdown() {
        let mut model = TankbilModel::new(TankbilParams::default());
        let held = interlocks(true, true, true);
        let released = interlocks(true, true, false);

        tick(&mut model, &held);
        for _ in 0..40 {
            tick(&mut model, &held);
        }
        assert!(model.display().deadman_warning);

        tick(&mut model, &released);
        let display = tick(&mut model, &held);
        assert!(display.deadman_timer_s < 0.2);
        assert!(!display.deadman_warning);
        assert_eq!(display.status, InterlockStatus::Safe);
    }

    #[test]
    fn warning_precedes_expiry() {
        let mut model = TankbilModel::new(TankbilParams::default());
        let held = interlocks(true, true, true);

        tick(&mut model, &held);
        for _ in 0..25 {
            tick(&mut model, &held);
        }
        let display = model.display();
        // 2.5 s in: warned but still safe.
        assert!(display.deadman_warning);
        assert!(display.system_safe);
    }

    #[test]
    fn disabled_deadman_never_expires() {
        let mut model = TankbilModel::new(TankbilParams {
            deadman_enabled: false,
            ..TankbilParams::default()
        });
        let inputs = interlocks(true, true, false);
        let mut display = model.display();
        for _ in 0..200 {
            display = tick(&mut model, &inputs);
        }
        assert_eq!(display.status, InterlockStatus::Safe);
        assert!(!display.deadman_warning);
    }

    #[test]
    fn warning_must_precede_timeout_in_params() {
        let params = TankbilParams {
            deadman_warning_sec: 6.0,
            deadman_timeout_sec: 5.0,
            ..TankbilParams::default()
        };
        assert!(params.validate().is_err());
    }
}
