//! Instrument models.
//!
//! Each instrument is a small state machine advanced once per tick. The
//! contract is uniform: the scheduler hands the model a [`TickContext`] with
//! the latched inputs, the tick delta and a view of linked instruments, and
//! the model returns its [`DisplayState`] for the snapshot. Channel writes
//! are projected afterwards from that display state by [`outputs`], so a
//! model never touches the bank and publishing is a pure function of what
//! was displayed.
//!
//! The set of instrument types is closed: adding one means a new variant
//! here, a module alongside the existing six, and entries in the role
//! tables. The compiler then walks you through every match that needs a new
//! arm.

pub mod flow;
pub mod level;
pub mod pump;
pub mod reg_valve;
pub mod tankbil;
pub mod valve;

use crate::channel::{ChannelKind, ChannelValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use flow::{FlowDisplay, FlowModel, FlowParams, PulseMode};
pub use level::{LevelDisplay, LevelModel, LevelParams};
pub use pump::{PumpControl, PumpDisplay, PumpModel, PumpParams, PumpStatus};
pub use reg_valve::{RegValveActuation, RegValveDisplay, RegValveModel, RegValveParams};
pub use tankbil::{InterlockStatus, TankbilDisplay, TankbilModel, TankbilParams};
pub use valve::{ValveDisplay, ValveModel, ValveParams, ValveStatus};

/// The closed set of instrument types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Level,
    Valve,
    Pump,
    Flow,
    RegValve,
    Tankbil,
}

impl InstrumentKind {
    pub fn name(self) -> &'static str {
        match self {
            InstrumentKind::Level => "level",
            InstrumentKind::Valve => "valve",
            InstrumentKind::Pump => "pump",
            InstrumentKind::Flow => "flow",
            InstrumentKind::RegValve => "reg_valve",
            InstrumentKind::Tankbil => "tankbil",
        }
    }
}

/// A physical quantity one instrument can observe on another through a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    FlowLpm,
    PressureBar,
    PositionPercent,
    LevelMm,
    SpeedPercent,
}

/// Published per-instrument state, tagged by instrument type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayState {
    Level(LevelDisplay),
    Valve(ValveDisplay),
    Pump(PumpDisplay),
    Flow(FlowDisplay),
    RegValve(RegValveDisplay),
    Tankbil(TankbilDisplay),
}

impl DisplayState {
    /// Read a quantity off a display state, if the instrument publishes it.
    pub fn quantity(&self, quantity: Quantity) -> Option<f64> {
        match (self, quantity) {
            (DisplayState::Level(d), Quantity::LevelMm) => Some(d.level_mm),
            (DisplayState::Valve(d), Quantity::PositionPercent) => Some(d.position_percent),
            (DisplayState::Pump(d), Quantity::FlowLpm) => Some(d.flow_lpm),
            (DisplayState::Pump(d), Quantity::PressureBar) => Some(d.pressure_bar),
            (DisplayState::Pump(d), Quantity::SpeedPercent) => Some(d.speed_percent),
            (DisplayState::Flow(d), Quantity::FlowLpm) => Some(d.flow_lpm),
            (DisplayState::RegValve(d), Quantity::PositionPercent) => Some(d.position_percent),
            (DisplayState::RegValve(d), Quantity::PressureBar) => Some(d.pressure_bar),
            _ => None,
        }
    }
}

/// Typed parameters for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentParams {
    Level(LevelParams),
    Valve(ValveParams),
    Pump(PumpParams),
    Flow(FlowParams),
    RegValve(RegValveParams),
    Tankbil(TankbilParams),
}

impl InstrumentParams {
    /// Parse the raw parameter map of a record into the typed set for `kind`.
    ///
    /// Unknown keys and type mismatches are malformed-parameter errors; the
    /// caller folds the message into its rejection.
    pub fn parse(
        kind: InstrumentKind,
        raw: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, String> {
        let value = serde_json::Value::Object(raw.clone());
        let params = match kind {
            InstrumentKind::Level => {
                InstrumentParams::Level(serde_json::from_value(value).map_err(|e| e.to_string())?)
            }
            InstrumentKind::Valve => {
                InstrumentParams::Valve(serde_json::from_value(value).map_err(|e| e.to_string())?)
            }
            InstrumentKind::Pump => {
                InstrumentParams::Pump(serde_json::from_value(value).map_err(|e| e.to_string())?)
            }
            InstrumentKind::Flow => {
                InstrumentParams::Flow(serde_json::from_value(value).map_err(|e| e.to_string())?)
            }
            InstrumentKind::RegValve => InstrumentParams::RegValve(
                serde_json::from_value(value).map_err(|e| e.to_string())?,
            ),
            InstrumentKind::Tankbil => InstrumentParams::Tankbil(
                serde_json::from_value(value).map_err(|e| e.to_string())?,
            ),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn kind(&self) -> InstrumentKind {
        match self {
            InstrumentParams::Level(_) => InstrumentKind::Level,
            InstrumentParams::Valve(_) => InstrumentKind::Valve,
            InstrumentParams::Pump(_) => InstrumentKind::Pump,
            InstrumentParams::Flow(_) => InstrumentKind::Flow,
            InstrumentParams::RegValve(_) => InstrumentKind::RegValve,
            InstrumentParams::Tankbil(_) => InstrumentKind::Tankbil,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            InstrumentParams::Level(p) => p.validate(),
            InstrumentParams::Valve(p) => p.validate(),
            InstrumentParams::Pump(p) => p.validate(),
            InstrumentParams::Flow(p) => p.validate(),
            InstrumentParams::RegValve(p) => p.validate(),
            InstrumentParams::Tankbil(p) => p.validate(),
        }
    }
}

/// Channel roles an instrument type exposes, with the expected kind.
///
/// Role assignment is optional per role; an unassigned input reads neutral
/// and an unassigned output is simply not written.
pub fn channel_roles(kind: InstrumentKind) -> &'static [(&'static str, ChannelKind)] {
    use ChannelKind::{AnalogIn, AnalogOut, DigitalIn, DigitalOut};
    match kind {
        InstrumentKind::Level => &[("level", AnalogOut), ("hh_alarm", DigitalOut)],
        InstrumentKind::Valve => &[
            ("open", DigitalIn),
            ("close", DigitalIn),
            ("hold", DigitalIn),
        ],
        InstrumentKind::Pump => &[
            ("enable", DigitalIn),
            ("speed", AnalogIn),
            ("reset", DigitalIn),
            ("running", DigitalOut),
            ("fault", DigitalOut),
            ("feedback", AnalogOut),
        ],
        InstrumentKind::Flow => &[
            ("start", DigitalIn),
            ("reset", DigitalIn),
            ("noise", DigitalIn),
            ("pulse_a", DigitalOut),
            ("pulse_b", DigitalOut),
        ],
        InstrumentKind::RegValve => &[
            ("setpoint", AnalogIn),
            ("open", DigitalIn),
            ("close", DigitalIn),
            ("hold", DigitalIn),
            ("closed_limit", DigitalOut),
            ("position", AnalogOut),
        ],
        InstrumentKind::Tankbil => &[
            ("ground_ok", DigitalIn),
            ("overfill_ok", DigitalIn),
            ("deadman", DigitalIn),
            ("warning", DigitalOut),
            ("system_safe", DigitalOut),
        ],
    }
}

/// Link roles an instrument type may declare.
pub fn link_roles(kind: InstrumentKind) -> &'static [&'static str] {
    match kind {
        InstrumentKind::Level => &["flow_in", "flow_out"],
        InstrumentKind::Pump => &["back_pressure"],
        InstrumentKind::Flow => &["source"],
        _ => &[],
    }
}

/// Input values latched at the start of a tick, keyed by channel role.
///
/// Roles without an assigned channel are absent; accessors return the
/// neutral value so models read them unconditionally.
#[derive(Debug, Clone, Default)]
pub struct InputSet {
    values: HashMap<&'static str, ChannelValue>,
}

impl InputSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: &'static str, value: ChannelValue) {
        self.values.insert(role, value);
    }

    pub fn has(&self, role: &str) -> bool {
        self.values.contains_key(role)
    }

    pub fn digital(&self, role: &str) -> bool {
        match self.values.get(role) {
            Some(ChannelValue::Digital(v)) => *v,
            _ => false,
        }
    }

    /// Normalized 0.0..=1.0.
    pub fn analog(&self, role: &str) -> f64 {
        match self.values.get(role) {
            Some(ChannelValue::Analog(v)) => *v,
            _ => 0.0,
        }
    }
}

/// Source of linked-instrument values.
///
/// `None` means the link role is undeclared, dangling, or (under the
/// neutral back-edge policy) not yet evaluated this tick; callers substitute
/// the neutral value.
pub trait LinkSource {
    fn value(&self, role: &str, quantity: Quantity) -> Option<f64>;
}

/// A link source with nothing behind it.
pub struct NoLinks;

impl LinkSource for NoLinks {
    fn value(&self, _role: &str, _quantity: Quantity) -> Option<f64> {
        None
    }
}

/// Everything a model sees during one tick.
pub struct TickContext<'a> {
    /// Seconds since the previous tick.
    pub dt: f64,
    pub inputs: &'a InputSet,
    pub links: &'a dyn LinkSource,
}

impl TickContext<'_> {
    /// Linked value for `role`, or the neutral 0.0.
    pub fn link(&self, role: &str, quantity: Quantity) -> f64 {
        self.links.value(role, quantity).unwrap_or(0.0)
    }
}

/// One live instrument.
#[derive(Debug, Clone)]
pub enum InstrumentModel {
    Level(LevelModel),
    Valve(ValveModel),
    Pump(PumpModel),
    Flow(FlowModel),
    RegValve(RegValveModel),
    Tankbil(TankbilModel),
}

impl InstrumentModel {
    pub fn new(params: &InstrumentParams) -> Self {
        match params {
            InstrumentParams::Level(p) => InstrumentModel::Level(LevelModel::new(p.clone())),
            InstrumentParams::Valve(p) => InstrumentModel::Valve(ValveModel::new(p.clone())),
            InstrumentParams::Pump(p) => InstrumentModel::Pump(PumpModel::new(p.clone())),
            InstrumentParams::Flow(p) => InstrumentModel::Flow(FlowModel::new(p.clone())),
            InstrumentParams::RegValve(p) => {
                InstrumentModel::RegValve(RegValveModel::new(p.clone()))
            }
            InstrumentParams::Tankbil(p) => {
                InstrumentModel::Tankbil(TankbilModel::new(p.clone()))
            }
        }
    }

    pub fn kind(&self) -> InstrumentKind {
        match self {
            InstrumentModel::Level(_) => InstrumentKind::Level,
            InstrumentModel::Valve(_) => InstrumentKind::Valve,
            InstrumentModel::Pump(_) => InstrumentKind::Pump,
            InstrumentModel::Flow(_) => InstrumentKind::Flow,
            InstrumentModel::RegValve(_) => InstrumentKind::RegValve,
            InstrumentModel::Tankbil(_) => InstrumentKind::Tankbil,
        }
    }

    /// Advance one tick and return the state to publish.
    pub fn tick(&mut self, ctx: &TickContext) -> DisplayState {
        match self {
            InstrumentModel::Level(m) => DisplayState::Level(m.tick(ctx)),
            InstrumentModel::Valve(m) => DisplayState::Valve(m.tick(ctx)),
            InstrumentModel::Pump(m) => DisplayState::Pump(m.tick(ctx)),
            InstrumentModel::Flow(m) => DisplayState::Flow(m.tick(ctx)),
            InstrumentModel::RegValve(m) => DisplayState::RegValve(m.tick(ctx)),
            InstrumentModel::Tankbil(m) => DisplayState::Tankbil(m.tick(ctx)),
        }
    }

    /// Render the current state without advancing it. Used for the very
    /// first snapshot and as the republished value when a tick is aborted.
    pub fn display(&self) -> DisplayState {
        match self {
            InstrumentModel::Level(m) => DisplayState::Level(m.display()),
            InstrumentModel::Valve(m) => DisplayState::Valve(m.display()),
            InstrumentModel::Pump(m) => DisplayState::Pump(m.display()),
            InstrumentModel::Flow(m) => DisplayState::Flow(m.display()),
            InstrumentModel::RegValve(m) => DisplayState::RegValve(m.display()),
            InstrumentModel::Tankbil(m) => DisplayState::Tankbil(m.display()),
        }
    }
}

/// Project channel writes from a published display state.
///
/// Pure with respect to the display: two instruments publishing the same
/// state drive their outputs identically.
pub fn outputs(display: &DisplayState, out: &mut Vec<(&'static str, ChannelValue)>) {
    match display {
        DisplayState::Level(d) => level::outputs(d, out),
        DisplayState::Valve(_) => {}
        DisplayState::Pump(d) => pump::outputs(d, out),
        DisplayState::Flow(d) => flow::outputs(d, out),
        DisplayState::RegValve(d) => reg_valve::outputs(d, out),
        DisplayState::Tankbil(d) => tankbil::outputs(d, out),
    }
}
