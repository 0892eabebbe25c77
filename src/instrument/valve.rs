//! On/off process valve with stroke-time travel.
//!
//! Driven by open/close solenoid commands; position slews at the configured
//! stroke rate rather than jumping. Optional hold solenoid freezes travel
//! mid-stroke, and an optional return spring drives the valve closed
//! whenever the open command is absent.

use super::TickContext;
use serde::{Deserialize, Serialize};

const OPEN_LIMIT_PERCENT: f64 = 99.0;
const CLOSED_LIMIT_PERCENT: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValveParams {
    pub open_speed_sec: f64,
    pub close_speed_sec: f64,
    pub has_hold_solenoid: bool,
    pub has_return_spring: bool,
}

impl Default for ValveParams {
    fn default() -> Self {
        Self {
            open_speed_sec: 5.0,
            close_speed_sec: 5.0,
            has_hold_solenoid: false,
            has_return_spring: false,
        }
    }
}

impl ValveParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.open_speed_sec > 0.0) {
            return Err("open_speed_sec must be positive".into());
        }
        if !(self.close_speed_sec > 0.0) {
            return Err("close_speed_sec must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValveStatus {
    Closed,
    Opening,
    Open,
    Closing,
    Holding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValveDisplay {
    pub position_percent: f64,
    pub status: ValveStatus,
    pub open_cmd: bool,
    pub close_cmd: bool,
    pub hold_cmd: bool,
}

#[derive(Debug, Clone)]
pub struct ValveModel {
    params: ValveParams,
    position: f64,
    status: ValveStatus,
    open_cmd: bool,
    close_cmd: bool,
    hold_cmd: bool,
}

impl ValveModel {
    pub fn new(params: ValveParams) -> Self {
        Self {
            params,
            position: 0.0,
            status: ValveStatus::Closed,
            open_cmd: false,
            close_cmd: false,
            hold_cmd: false,
        }
    }

    pub fn tick(&mut self, ctx: &TickContext) -> ValveDisplay {
        self.open_cmd = ctx.inputs.digital("open");
        self.close_cmd = ctx.inputs.digital("close");
        self.hold_cmd = ctx.inputs.digital("hold");

        let open_rate = 100.0 / self.params.open_speed_sec * ctx.dt;
        let close_rate = 100.0 / self.params.close_speed_sec * ctx.dt;

        if self.hold_cmd && self.params.has_hold_solenoid {
            self.status = ValveStatus::Holding;
        } else if self.open_cmd {
            self.position = (self.position + open_rate).min(100.0);
            self.status = if self.position >= 100.0 {
                ValveStatus::Open
            } else {
                ValveStatus::Opening
            };
        } else if self.close_cmd {
            self.position = (self.position - close_rate).max(0.0);
            self.status = if self.position <= 0.0 {
                ValveStatus::Closed
            } else {
                ValveStatus::Closing
            };
        } else if self.params.has_return_spring && self.position > 0.0 {
            // Spring drives closed on loss of command.
            self.position = (self.position - close_rate).max(0.0);
            self.status = if self.position <= 0.0 {
                ValveStatus::Closed
            } else {
                ValveStatus::Closing
            };
        } else {
            self.status = if self.position >= OPEN_LIMIT_PERCENT {
                ValveStatus::Open
            } else if self.position <= CLOSED_LIMIT_PERCENT {
                ValveStatus::Closed
            } else {
                ValveStatus::Holding
            };
        }

        self.display()
    }

    pub fn display(&self) -> ValveDisplay {
        ValveDisplay {
            position_percent: self.position,
            status: self.status,
            open_cmd: self.open_cmd,
            close_cmd: self.close_cmd,
            hold_cmd: self.hold_cmd,
        }
    }
}
