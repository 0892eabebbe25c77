//! Hydrostatic level transmitter on a tank.
//!
//! The tank is a straight-walled vessel: cross-section is derived from the
//! configured volume and height, and the level follows the volume integral
//! of linked in/out flows. The transmitter publishes level plus a high-high
//! alarm bit, the way a 4-20 mA head with a trip amplifier would.

use super::{ChannelValue, Quantity, TickContext};
use serde::{Deserialize, Serialize};

const LITERS_PER_M3: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LevelParams {
    pub tank_height_mm: f64,
    /// Level reading 100% at this height; may sit below the physical top.
    pub height_100_percent: f64,
    pub height_hh_alarm: f64,
    pub tank_volume_m3: f64,
    pub initial_level_percent: f64,
}

impl Default for LevelParams {
    fn default() -> Self {
        Self {
            tank_height_mm: 2000.0,
            height_100_percent: 2000.0,
            height_hh_alarm: 1800.0,
            tank_volume_m3: 10.0,
            initial_level_percent: 0.0,
        }
    }
}

impl LevelParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.tank_height_mm > 0.0) {
            return Err("tank_height_mm must be positive".into());
        }
        if !(self.height_100_percent > 0.0) {
            return Err("height_100_percent must be positive".into());
        }
        if !(self.height_hh_alarm > 0.0) {
            return Err("height_hh_alarm must be positive".into());
        }
        if !(self.tank_volume_m3 > 0.0) {
            return Err("tank_volume_m3 must be positive".into());
        }
        if !(0.0..=100.0).contains(&self.initial_level_percent) {
            return Err("initial_level_percent must be within 0..=100".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelDisplay {
    pub level_mm: f64,
    pub level_percent: f64,
    pub volume_m3: f64,
    pub hh_alarm: bool,
}

#[derive(Debug, Clone)]
pub struct LevelModel {
    params: LevelParams,
    cross_section_m2: f64,
    volume_m3: f64,
}

impl LevelModel {
    pub fn new(params: LevelParams) -> Self {
        let cross_section_m2 = params.tank_volume_m3 / (params.tank_height_mm / 1000.0);
        let initial_mm = params.initial_level_percent / 100.0 * params.height_100_percent;
        let volume_m3 =
            (cross_section_m2 * initial_mm / 1000.0).clamp(0.0, params.tank_volume_m3);
        Self {
            params,
            cross_section_m2,
            volume_m3,
        }
    }

    pub fn tick(&mut self, ctx: &TickContext) -> LevelDisplay {
        let inflow_lpm = ctx.link("flow_in", Quantity::FlowLpm);
        let outflow_lpm = ctx.link("flow_out", Quantity::FlowLpm);
        let net_m3 = (inflow_lpm - outflow_lpm) / LITERS_PER_M3 / 60.0 * ctx.dt;

        self.volume_m3 = (self.volume_m3 + net_m3).clamp(0.0, self.params.tank_volume_m3);
        self.display()
    }

    pub fn display(&self) -> LevelDisplay {
        let level_mm =
            (self.volume_m3 / self.cross_section_m2 * 1000.0).clamp(0.0, self.params.tank_height_mm);
        LevelDisplay {
            level_mm,
            level_percent: level_mm / self.params.height_100_percent * 100.0,
            volume_m3: self.volume_m3,
            hh_alarm: level_mm >= self.params.height_hh_alarm,
        }
    }
}

pub(super) fn outputs(display: &LevelDisplay, out: &mut Vec<(&'static str, ChannelValue)>) {
    out.push((
        "level",
        ChannelValue::Analog((display.level_percent / 100.0).clamp(0.0, 1.0)),
    ));
    out.push(("hh_alarm", ChannelValue::Digital(display.hh_alarm)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{InputSet, LinkSource, NoLinks};
    use std::collections::HashMap;

    struct FixedLinks(HashMap<&'static str, f64>);

    impl LinkSource for FixedLinks {
        fn value(&self, role: &str, _quantity: Quantity) -> Option<f64> {
            self.0.get(role).copied()
        }
    }

    fn ctx<'a>(dt: f64, inputs: &'a InputSet, links: &'a dyn LinkSource) -> TickContext<'a> {
        TickContext { dt, inputs, links }
    }

    #[test]
    fn fills_from_linked_inflow() {
        let mut model = LevelModel::new(LevelParams::default());
        let inputs = InputSet::new();
        let links = FixedLinks(HashMap::from([("flow_in", 600.0)]));

        // 600 L/min for 60 s = 0.6 m3; 2000 mm over 10 m3 -> 120 mm.
        for _ in 0..600 {
            model.tick(&ctx(0.1, &inputs, &links));
        }
        let display = model.display();
        assert!((display.volume_m3 - 0.6).abs() < 1e-6);
        assert!((display.level_mm - 120.0).abs() < 1e-6);
        assert!(!display.hh_alarm);
    }

    #[test]
    fn outflow_drains_and_volume_never_goes_negative() {
        let mut model = LevelModel::new(LevelParams {
            initial_level_percent: 5.0,
            ..LevelParams::default()
        });
        let inputs = InputSet::new();
        let links = FixedLinks(HashMap::from([("flow_out", 6000.0)]));

        for _ in 0..600 {
            model.tick(&ctx(0.1, &inputs, &links));
        }
        let display = model.display();
        assert_eq!(display.volume_m3, 0.0);
        assert_eq!(display.level_mm, 0.0);
    }

    #[test]
    fn hh_alarm_trips_at_configured_height() {
        let mut model = LevelModel::new(LevelParams {
            initial_level_percent: 89.0,
            ..LevelParams::default()
        });
        let inputs = InputSet::new();
        let links = FixedLinks(HashMap::from([("flow_in", 6000.0)]));

        assert!(!model.display().hh_alarm);
        for _ in 0..100 {
            model.tick(&ctx(0.1, &inputs, &links));
        }
        // 6000 L/min * 10 s = 1 m3 on top of 8.9 m3 -> 1980 mm >= 1800 mm.
        assert!(model.display().hh_alarm);
    }

    #[test]
    fn level_saturates_at_tank_top() {
        let mut model = LevelModel::new(LevelParams {
            initial_level_percent: 100.0,
            ..LevelParams::default()
        });
        let inputs = InputSet::new();
        let links = FixedLinks(HashMap::from([("flow_in", 1000.0)]));

        for _ in 0..100 {
            model.tick(&ctx(0.1, &inputs, &links));
        }
        let display = model.display();
        assert_eq!(display.volume_m3, 10.0);
        assert_eq!(display.level_mm, 2000.0);
    }

    #[test]
    fn unlinked_tank_holds_level() {
        let mut model = LevelModel::new(LevelParams {
            initial_level_percent: 50.0,
            ..LevelParams::default()
        });
        let inputs = InputSet::new();
        let before = model.display();
        model.tick(&ctx(0.1, &inputs, &NoLinks));
        assert_eq!(model.display(), before);
    }

    #[test]
    fn rejects_nonpositive_geometry() {
        let params = LevelParams {
            tank_volume_m3: 0.0,
            ..LevelParams::default()
        };
        assert!(params.validate().is_err());
    }
}
