//! Regulating valve with position feedback.
//!
//! The setpoint comes from the analog input when one is assigned, with the
//! configured actuator polarity (raise-to-open or raise-to-close); otherwise
//! digital open/close commands latch the setpoint to the end positions.
//! Travel is stroke-time bounded, a hold input freezes it, and a configured
//! minimum position floors any nonzero setpoint (anti-cavitation stop). The
//! published pressure is a simple drop curve across the plug.

use super::{ChannelValue, TickContext};
use serde::{Deserialize, Serialize};

/// Below this travel the closed-limit switch reports.
const CLOSED_LIMIT_PERCENT: f64 = 5.0;
/// Line pressure against a fully closed plug.
const CLOSED_PRESSURE_BAR: f64 = 10.0;

/// Actuator polarity of the analog setpoint signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegValveActuation {
    /// Full signal drives the valve open.
    RaiseToOpen,
    /// Full signal drives the valve closed (reverse acting).
    RaiseToClose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegValveParams {
    pub actuation: RegValveActuation,
    pub open_speed_sec: f64,
    pub close_speed_sec: f64,
    /// Nonzero setpoints are floored to this travel. Zero disables the stop.
    pub min_position_percent: f64,
}

impl Default for RegValveParams {
    fn default() -> Self {
        Self {
            actuation: RegValveActuation::RaiseToOpen,
            open_speed_sec: 10.0,
            close_speed_sec: 10.0,
            min_position_percent: 0.0,
        }
    }
}

impl RegValveParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.open_speed_sec > 0.0) {
            return Err("open_speed_sec must be positive".into());
        }
        if !(self.close_speed_sec > 0.0) {
            return Err("close_speed_sec must be positive".into());
        }
        if !(0.0..=100.0).contains(&self.min_position_percent) {
            return Err("min_position_percent must be within 0..=100".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegValveDisplay {
    pub position_percent: f64,
    pub setpoint_percent: f64,
    pub pressure_bar: f64,
    pub at_closed_limit: bool,
    pub holding: bool,
}

#[derive(Debug, Clone)]
pub struct RegValveModel {
    params: RegValveParams,
    position: f64,
    setpoint: f64,
    holding: bool,
}

impl RegValveModel {
    pub fn new(params: RegValveParams) -> Self {
        Self {
            params,
            position: 0.0,
            setpoint: 0.0,
            holding: false,
        }
    }

    pub fn tick(&mut self, ctx: &TickContext) -> RegValveDisplay {
        if ctx.inputs.has("setpoint") {
            let signal = ctx.inputs.analog("setpoint") * 100.0;
            self.setpoint = match self.params.actuation {
                RegValveActuation::RaiseToOpen => signal,
                RegValveActuation::RaiseToClose => 100.0 - signal,
            };
        } else if ctx.inputs.digital("open") {
            self.setpoint = 100.0;
        } else if ctx.inputs.digital("close") {
            self.setpoint = 0.0;
        }

        if self.setpoint > 0.0 && self.setpoint < self.params.min_position_percent {
            self.setpoint = self.params.min_position_percent;
        }

        self.holding = ctx.inputs.digital("hold");
        if !self.holding {
            if self.position < self.setpoint {
                let rate = 100.0 / self.params.open_speed_sec * ctx.dt;
                self.position = (self.position + rate).min(self.setpoint);
            } else if self.position > self.setpoint {
                let rate = 100.0 / self.params.close_speed_sec * ctx.dt;
                self.position = (self.position - rate).max(self.setpoint);
            }
        }
        self.position = self.position.clamp(0.0, 100.0);

        self.display()
    }

    pub fn display(&self) -> RegValveDisplay {
        let pressure_bar = if self.position <= 0.0 {
            CLOSED_PRESSURE_BAR
        } else {
            2.0 * (1.0 - self.position / 100.0)
        };
        RegValveDisplay {
            position_percent: self.position,
            setpoint_percent: self.setpoint,
            pressure_bar,
            at_closed_limit: self.position < CLOSED_LIMIT_PERCENT,
            holding: self.holding,
        }
    }
}

pub(super) fn outputs(display: &RegValveDisplay, out: &mut Vec<(&'static str, ChannelValue)>) {
    out.push((
        "closed_limit",
        ChannelValue::Digital(display.at_closed_limit),
    ));
    out.push((
        "position",
        ChannelValue::Analog((display.position_percent / 100.0).clamp(0.0, 1.0)),
    ));
}
