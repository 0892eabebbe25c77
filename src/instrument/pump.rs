//! Centrifugal pump with ramped speed and a latched overpressure trip.
//!
//! Two control styles: digital (run contact, full speed) and analog (speed
//! setpoint in). Discharge pressure follows speed against the linked back
//! pressure; delivering into a pressure at or above the configured maximum
//! latches a fault that drops the pump and stays until a rising edge on the
//! reset input.

use super::{ChannelValue, Quantity, TickContext};
use serde::{Deserialize, Serialize};

/// Speed below which the run feedback drops out.
const RUNNING_THRESHOLD_PERCENT: f64 = 1.0;
/// Speed-vs-target band treated as "on setpoint".
const SETTLED_BAND_PERCENT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpControl {
    Digital,
    Analog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PumpParams {
    pub control: PumpControl,
    pub max_pressure_bar: f64,
    pub set_pressure_bar: f64,
    pub max_flow_lpm: f64,
    pub ramp_time_sec: f64,
}

impl Default for PumpParams {
    fn default() -> Self {
        Self {
            control: PumpControl::Digital,
            max_pressure_bar: 10.0,
            set_pressure_bar: 8.0,
            max_flow_lpm: 100.0,
            ramp_time_sec: 5.0,
        }
    }
}

impl PumpParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_pressure_bar > 0.0) {
            return Err("max_pressure_bar must be positive".into());
        }
        if !(self.set_pressure_bar > 0.0) {
            return Err("set_pressure_bar must be positive".into());
        }
        if !(self.max_flow_lpm > 0.0) {
            return Err("max_flow_lpm must be positive".into());
        }
        if !(self.ramp_time_sec > 0.0) {
            return Err("ramp_time_sec must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpStatus {
    Stopped,
    Ramping,
    Running,
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpDisplay {
    pub status: PumpStatus,
    pub running: bool,
    pub speed_percent: f64,
    pub pressure_bar: f64,
    pub flow_lpm: f64,
    pub fault: bool,
}

#[derive(Debug, Clone)]
pub struct PumpModel {
    params: PumpParams,
    speed_percent: f64,
    target_percent: f64,
    pressure_bar: f64,
    flow_lpm: f64,
    faulted: bool,
    reset_latch: bool,
}

impl PumpModel {
    pub fn new(params: PumpParams) -> Self {
        Self {
            params,
            speed_percent: 0.0,
            target_percent: 0.0,
            pressure_bar: 0.0,
            flow_lpm: 0.0,
            faulted: false,
            reset_latch: false,
        }
    }

    pub fn tick(&mut self, ctx: &TickContext) -> PumpDisplay {
        let reset = ctx.inputs.digital("reset");
        let reset_edge = reset && !self.reset_latch;
        self.reset_latch = reset;

        if self.faulted && reset_edge {
            self.faulted = false;
        }

        // Enable gates both control styles; analog pumps without an enable
        // contact wired run on the setpoint alone.
        let enabled = !ctx.inputs.has("enable") || ctx.inputs.digital("enable");
        self.target_percent = if self.faulted {
            0.0
        } else {
            match self.params.control {
                PumpControl::Digital => {
                    if ctx.inputs.digital("enable") {
                        100.0
                    } else {
                        0.0
                    }
                }
                PumpControl::Analog => {
                    if enabled {
                        ctx.inputs.analog("speed") * 100.0
                    } else {
                        0.0
                    }
                }
            }
        };

        let ramp = 100.0 / self.params.ramp_time_sec * ctx.dt;
        if self.speed_percent < self.target_percent {
            self.speed_percent = (self.speed_percent + ramp).min(self.target_percent);
        } else if self.speed_percent > self.target_percent {
            self.speed_percent = (self.speed_percent - ramp).max(self.target_percent);
        }

        let speed_factor = self.speed_percent / 100.0;
        let back_pressure = ctx.link("back_pressure", Quantity::PressureBar);

        let raw_pressure = self.params.set_pressure_bar * speed_factor - back_pressure * 0.5;
        self.pressure_bar = raw_pressure.clamp(0.0, self.params.max_pressure_bar);

        if !self.faulted && raw_pressure >= self.params.max_pressure_bar {
            // Deadheaded over the limit: trip and stay tripped.
            self.faulted = true;
            self.target_percent = 0.0;
        }

        let pressure_diff = self.pressure_bar - back_pressure;
        self.flow_lpm = if pressure_diff > 0.0 {
            pressure_diff / self.params.max_pressure_bar * self.params.max_flow_lpm * speed_factor
        } else {
            0.0
        };

        self.display()
    }

    pub fn display(&self) -> PumpDisplay {
        let running = self.speed_percent > RUNNING_THRESHOLD_PERCENT;
        let status = if self.faulted {
            PumpStatus::Faulted
        } else if !running && self.target_percent <= RUNNING_THRESHOLD_PERCENT {
            PumpStatus::Stopped
        } else if (self.speed_percent - self.target_percent).abs() > SETTLED_BAND_PERCENT {
            PumpStatus::Ramping
        } else {
            PumpStatus::Running
        };
        PumpDisplay {
            status,
            running,
            speed_percent: self.speed_percent,
            pressure_bar: self.pressure_bar,
            flow_lpm: self.flow_lpm,
            fault: self.faulted,
        }
    }
}

pub(super) fn outputs(display: &PumpDisplay, out: &mut Vec<(&'static str, ChannelValue)>) {
    out.push(("running", ChannelValue::Digital(display.running)));
    out.push(("fault", ChannelValue::Digital(display.fault)));
    out.push((
        "feedback",
        ChannelValue::Analog((display.speed_percent / 100.0).clamp(0.0, 1.0)),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{InputSet, LinkSource, NoLinks};

    struct BackPressure(f64);

    impl LinkSource for BackPressure {
        fn value(&self, role: &str, quantity: Quantity) -> Option<f64> {
            (role == "back_pressure" && quantity == Quantity::PressureBar).then_some(self.0)
        }
    }

    fn enabled() -> InputSet {
        let mut inputs = InputSet::new();
        inputs.insert("enable", ChannelValue::Digital(true));
        inputs
    }

    fn tick(model: &mut PumpModel, inputs: &InputSet, links: &dyn LinkSource) -> PumpDisplay {
        model.tick(&TickContext {
            dt: 0.1,
            inputs,
            links,
        })
    }

    #[test]
    fn digital_pump_ramps_to_full_speed() {
        let mut model = PumpModel::new(PumpParams::default());
        let inputs = enabled();

        let mut display = model.display();
        assert_eq!(display.status, PumpStatus::Stopped);

        // 5 s ramp at 10 Hz.
        for _ in 0..25 {
            display = tick(&mut model, &inputs, &NoLinks);
        }
        assert_eq!(display.status, PumpStatus::Ramping);
        assert!((display.speed_percent - 50.0).abs() < 1e-9);

        for _ in 0..25 {
            display = tick(&mut model, &inputs, &NoLinks);
        }
        assert_eq!(display.speed_percent, 100.0);
        assert!(display.running);
        assert_eq!(display.status, PumpStatus::Running);
        assert!((display.pressure_bar - 8.0).abs() < 1e-9);
    }

    #[test]
    fn analog_pump_tracks_setpoint() {
        let mut model = PumpModel::new(PumpParams {
            control: PumpControl::Analog,
            ..PumpParams::default()
        });
        let mut inputs = InputSet::new();
        inputs.insert("speed", ChannelValue::Analog(0.6));

        let mut display = model.display();
        for _ in 0..100 {
            display = tick(&mut model, &inputs, &NoLinks);
        }
        assert!((display.speed_percent - 60.0).abs() < 1e-9);
        assert_eq!(display.status, PumpStatus::Running);
    }

    #[test]
    fn analog_pump_obeys_the_enable_contact() {
        let mut model = PumpModel::new(PumpParams {
            control: PumpControl::Analog,
            ..PumpParams::default()
        });
        let mut inputs = InputSet::new();
        inputs.insert("speed", ChannelValue::Analog(0.8));
        inputs.insert("enable", ChannelValue::Digital(false));

        // Setpoint present but the run contact is open: stays stopped.
        let mut display = model.display();
        for _ in 0..100 {
            display = tick(&mut model, &inputs, &NoLinks);
        }
        assert_eq!(display.speed_percent, 0.0);
        assert_eq!(display.status, PumpStatus::Stopped);

        inputs.insert("enable", ChannelValue::Digital(true));
        for _ in 0..100 {
            display = tick(&mut model, &inputs, &NoLinks);
        }
        assert!((display.speed_percent - 80.0).abs() < 1e-9);
        assert_eq!(display.status, PumpStatus::Running);
    }

    #[test]
    fn ramp_down_on_disable() {
        let mut model = PumpModel::new(PumpParams::default());
        let inputs = enabled();
        for _ in 0..50 {
            tick(&mut model, &inputs, &NoLinks);
        }

        let idle = InputSet::new();
        let display = tick(&mut model, &idle, &NoLinks);
        assert_eq!(display.status, PumpStatus::Ramping);
        for _ in 0..50 {
            tick(&mut model, &idle, &NoLinks);
        }
        let display = model.display();
        assert_eq!(display.speed_percent, 0.0);
        assert_eq!(display.status, PumpStatus::Stopped);
    }

    #[test]
    fn back_pressure_lowers_discharge_and_flow() {
        let mut model = PumpModel::new(PumpParams::default());
        let inputs = enabled();
        let links = BackPressure(4.0);

        let mut display = model.display();
        for _ in 0..100 {
            display = tick(&mut model, &inputs, &links);
        }
        // 8 - 0.5*4 = 6 bar; diff 2 bar -> 20 L/min at full speed.
        assert!((display.pressure_bar - 6.0).abs() < 1e-9);
        assert!((display.flow_lpm - 20.0).abs() < 1e-9);
    }

    #[test]
    fn overpressure_latches_until_reset_edge() {
        let mut model = PumpModel::new(PumpParams {
            set_pressure_bar: 12.0,
            ..PumpParams::default()
        });
        let inputs = enabled();
        for _ in 0..100 {
            tick(&mut model, &inputs, &NoLinks);
        }
        let display = model.display();
        assert_eq!(display.status, PumpStatus::Faulted);
        assert!(display.fault);

        // Still faulted while the trip is latched, even with enable held.
        for _ in 0..100 {
            tick(&mut model, &inputs, &NoLinks);
        }
        assert_eq!(model.display().status, PumpStatus::Faulted);
        assert_eq!(model.display().speed_percent, 0.0);

        // Held reset level is not enough; the latch wants an edge.
        let mut reset_held = enabled();
        reset_held.insert("reset", ChannelValue::Digital(true));
        let display = tick(&mut model, &reset_held, &NoLinks);
        assert!(!display.fault);

        // After the edge the pump restarts, trips again at speed.
        let mut saw_fault = false;
        for _ in 0..200 {
            let display = tick(&mut model, &reset_held, &NoLinks);
            saw_fault |= display.fault;
        }
        assert!(saw_fault);
        // reset stayed high the whole time: no second edge, still latched.
        assert!(model.display().fault);
    }
}
