//! Pulse-output flow meter with totalizer.
//!
//! Flow comes from the linked source instrument. Volume accumulates into a
//! fractional pulse accumulator against the K-factor; every whole pulse in
//! a tick is emitted, so high flow against a long tick still totals
//! correctly. The pulse trains are derived from the lifetime pulse count:
//! in quadrature mode B lags A by one pulse event (a fixed quarter of the
//! four-event cycle), in single mode both lines carry the same square wave.
//!
//! The noise input models a flaky pickup: while asserted, each tick may
//! start a dropout window that freezes the pulse lines. The totalizer and
//! pulse count keep accumulating through a dropout, so totals stay
//! monotonic no matter how bad the pickup gets.

use super::{ChannelValue, Quantity, TickContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulseMode {
    Single,
    Quadrature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowParams {
    pub pulse_mode: PulseMode,
    /// K-factor.
    pub pulses_per_liter: f64,
    pub dropout_probability: f64,
    pub noise_dropout_ms: f64,
    pub noise_seed: u64,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            pulse_mode: PulseMode::Quadrature,
            pulses_per_liter: 100.0,
            dropout_probability: 0.1,
            noise_dropout_ms: 50.0,
            noise_seed: 0x1234_5678_9ABC_DEF0,
        }
    }
}

impl FlowParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.pulses_per_liter > 0.0) {
            return Err("pulses_per_liter must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.dropout_probability) {
            return Err("dropout_probability must be within 0..=1".into());
        }
        if !(self.noise_dropout_ms >= 0.0) {
            return Err("noise_dropout_ms must not be negative".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDisplay {
    pub flow_lpm: f64,
    pub total_volume_l: f64,
    pub pulse_count: u64,
    pub pulse_rate_hz: f64,
    pub pulse_a: bool,
    pub pulse_b: bool,
    pub running: bool,
}

#[derive(Debug, Clone)]
pub struct FlowModel {
    params: FlowParams,
    flow_lpm: f64,
    total_volume_l: f64,
    pulse_count: u64,
    pulse_accumulator: f64,
    pulse_rate_hz: f64,
    pulse_a: bool,
    pulse_b: bool,
    running: bool,
    dropout_remaining_s: f64,
    rng_state: u64,
}

impl FlowModel {
    pub fn new(params: FlowParams) -> Self {
        let rng_state = params.noise_seed;
        Self {
            params,
            flow_lpm: 0.0,
            total_volume_l: 0.0,
            pulse_count: 0,
            pulse_accumulator: 0.0,
            pulse_rate_hz: 0.0,
            pulse_a: false,
            pulse_b: false,
            running: false,
            dropout_remaining_s: 0.0,
            rng_state,
        }
    }

    pub fn tick(&mut self, ctx: &TickContext) -> FlowDisplay {
        if ctx.inputs.digital("reset") {
            self.total_volume_l = 0.0;
            self.pulse_count = 0;
            self.pulse_accumulator = 0.0;
        }

        self.running = ctx.inputs.digital("start");
        self.flow_lpm = if self.running {
            ctx.link("source", Quantity::FlowLpm).max(0.0)
        } else {
            0.0
        };

        let mut whole_pulses = 0u64;
        if self.running && self.flow_lpm > 0.0 {
            let delta_l = self.flow_lpm / 60.0 * ctx.dt;
            self.total_volume_l += delta_l;
            self.pulse_accumulator += delta_l * self.params.pulses_per_liter;
            whole_pulses = self.pulse_accumulator as u64;
            self.pulse_accumulator -= whole_pulses as f64;
            self.pulse_count += whole_pulses;
        }
        self.pulse_rate_hz = if ctx.dt > 0.0 {
            whole_pulses as f64 / ctx.dt
        } else {
            0.0
        };

        if self.dropout_remaining_s > 0.0 {
            self.dropout_remaining_s = (self.dropout_remaining_s - ctx.dt).max(0.0);
        } else if self.running
            && ctx.inputs.digital("noise")
            && self.next_float() < self.params.dropout_probability
        {
            self.dropout_remaining_s = self.params.noise_dropout_ms / 1000.0;
        }

        // A dropout freezes the lines; counting continues underneath.
        if self.dropout_remaining_s <= 0.0 {
            let (a, b) = match self.params.pulse_mode {
                PulseMode::Quadrature => match self.pulse_count % 4 {
                    0 => (false, false),
                    1 => (true, false),
                    2 => (true, true),
                    _ => (false, true),
                },
                PulseMode::Single => {
                    let a = self.pulse_count % 2 == 1;
                    (a, a)
                }
            };
            self.pulse_a = a;
            self.pulse_b = b;
        }

        self.display()
    }

    pub fn display(&self) -> FlowDisplay {
        FlowDisplay {
            flow_lpm: self.flow_lpm,
            total_volume_l: self.total_volume_l,
            pulse_count: self.pulse_count,
            pulse_rate_hz: self.pulse_rate_hz,
            pulse_a: self.pulse_a,
            pulse_b: self.pulse_b,
            running: self.running,
        }
    }

    // Numerical Recipes LCG; fixed seed keeps dropout timing reproducible.
    fn next_float(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(1664525)
            .wrapping_add(1013904223);
        self.rng_state as f64 / u64::MAX as f64
    }
}

pub(super) fn outputs(display: &FlowDisplay, out: &mut Vec<(&'static str, ChannelValue)>) {
    out.push(("pulse_a", ChannelValue::Digital(display.pulse_a)));
    out.push(("pulse_b", ChannelValue::Digital(display.pulse_b)));
}
