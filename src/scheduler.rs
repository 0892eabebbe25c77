//! Fixed-rate simulation scheduler.
//!
//! One `tick()` advances the whole plant: activate any pending topology,
//! latch inputs through the channel bank, evaluate every instrument in
//! dependency order, drive outputs, publish a snapshot. The loop is
//! single-threaded by construction; instruments never see each other's
//! in-tick state except through link reads.
//!
//! A misbehaving instrument must not take the plant down. Each model tick
//! runs under a panic guard: on a panic the instrument republishes its
//! previous display with the fault flag set and everything else proceeds.
//!
//! Snapshots deliberately carry no wall-clock time. Two runs from the same
//! topology and the same input script publish bit-identical snapshots,
//! which is what makes regression scripts against PLC logic trustworthy.
//! Timing lives in [`SchedulerStats`], which is observability only.

use crate::channel::{ChannelBank, ChannelStats, ChannelValue};
use crate::instrument::{
    self, channel_roles, DisplayState, InputSet, InstrumentModel, TickContext,
};
use crate::linking::{BackEdgePolicy, LinkView};
use crate::topology::Topology;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulatorConfig {
    pub tick_interval_ms: u64,
    pub back_edge_policy: BackEdgePolicy,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            back_edge_policy: BackEdgePolicy::default(),
        }
    }
}

/// Per-instrument entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentStatus {
    pub display: DisplayState,
    /// At least one declared link has no target.
    pub degraded: bool,
    /// This tick was aborted and `display` is the republished prior state.
    pub faulted: bool,
}

/// Immutable published plant state for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub generation: u64,
    pub seq: u64,
    pub instruments: BTreeMap<String, InstrumentStatus>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub overruns: u64,
    pub instrument_faults: u64,
    pub last_tick_us: u64,
}

/// Full stats report for the `stats` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub generation: u64,
    pub instruments: usize,
    pub scheduler: SchedulerStats,
    pub channels: ChannelStats,
}

pub struct Simulator {
    config: SimulatorConfig,
    bank: ChannelBank,
    topology: Arc<Topology>,
    pending: Option<Arc<Topology>>,
    models: Vec<InstrumentModel>,
    previous: Vec<DisplayState>,
    faulted: Vec<bool>,
    snapshot: Arc<Snapshot>,
    stats: SchedulerStats,
}

impl Simulator {
    pub fn new(bank: ChannelBank, topology: Arc<Topology>, config: SimulatorConfig) -> Self {
        let models: Vec<InstrumentModel> = topology
            .specs()
            .iter()
            .map(|spec| InstrumentModel::new(&spec.params))
            .collect();
        let previous: Vec<DisplayState> = models.iter().map(InstrumentModel::display).collect();
        let faulted = vec![false; models.len()];
        let snapshot = Arc::new(Self::assemble(&topology, 0, &previous, &faulted));
        Self {
            config,
            bank,
            topology,
            pending: None,
            models,
            previous,
            faulted,
            snapshot,
            stats: SchedulerStats::default(),
        }
    }

    /// Seconds advanced per tick.
    pub fn dt(&self) -> f64 {
        self.config.tick_interval_ms as f64 / 1000.0
    }

    pub fn tick_interval_ms(&self) -> u64 {
        self.config.tick_interval_ms
    }

    pub fn topology(&self) -> Arc<Topology> {
        Arc::clone(&self.topology)
    }

    /// Last published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn stats(&self) -> StatsReport {
        StatsReport {
            generation: self.topology.generation(),
            instruments: self.topology.len(),
            scheduler: self.stats,
            channels: self.bank.stats(),
        }
    }

    /// Queue a validated topology; it becomes active at the next tick
    /// boundary, never mid-tick.
    pub fn submit_topology(&mut self, topology: Arc<Topology>) {
        self.pending = Some(topology);
    }

    /// Run one simulation step and publish the resulting snapshot.
    pub fn tick(&mut self) -> Arc<Snapshot> {
        let started = Instant::now();
        if let Some(next) = self.pending.take() {
            self.activate(next);
        }

        let seq = self.snapshot.seq + 1;
        self.bank.set_tick(seq);
        let dt = self.dt();
        let n = self.topology.len();

        // Phase 1: latch every input channel once.
        let inputs: Vec<InputSet> = self
            .topology
            .specs()
            .iter()
            .map(|spec| {
                let mut set = InputSet::new();
                for (role, kind) in channel_roles(spec.kind()) {
                    if !kind.is_input() {
                        continue;
                    }
                    if let Some(channel) = spec.channels.get(*role) {
                        set.insert(role, self.bank.read(channel));
                    }
                }
                set
            })
            .collect();

        // Phase 2: evaluate in dependency order under the panic guard.
        let mut current: Vec<Option<DisplayState>> = vec![None; n];
        for &i in self.topology.eval_order() {
            let display = {
                let view = LinkView {
                    handles: self.topology.link_handles(i),
                    current: &current,
                    previous: &self.previous,
                    policy: self.config.back_edge_policy,
                };
                let ctx = TickContext {
                    dt,
                    inputs: &inputs[i],
                    links: &view,
                };
                let model = &mut self.models[i];
                let (display, tick_faulted) = run_guarded(|| model.tick(&ctx), &self.previous[i]);
                if tick_faulted {
                    self.stats.instrument_faults += 1;
                    tracing::error!(
                        id = %self.topology.specs()[i].id,
                        seq,
                        "instrument tick aborted; republishing prior state"
                    );
                }
                self.faulted[i] = tick_faulted;
                display
            };
            current[i] = Some(display);
        }

        // Phase 3: drive outputs from what was published.
        let mut writes: Vec<(&'static str, ChannelValue)> = Vec::new();
        for (i, spec) in self.topology.specs().iter().enumerate() {
            let Some(display) = &current[i] else { continue };
            writes.clear();
            instrument::outputs(display, &mut writes);
            for (role, value) in &writes {
                if let Some(channel) = spec.channels.get(*role) {
                    self.bank.write(channel, *value);
                }
            }
        }

        for (i, slot) in current.iter_mut().enumerate() {
            if let Some(display) = slot.take() {
                self.previous[i] = display;
            }
        }

        self.snapshot = Arc::new(Self::assemble(
            &self.topology,
            seq,
            &self.previous,
            &self.faulted,
        ));

        self.stats.ticks += 1;
        let elapsed = started.elapsed();
        self.stats.last_tick_us = elapsed.as_micros() as u64;
        if elapsed.as_millis() as u64 > self.config.tick_interval_ms {
            // Overruns reschedule immediately; they are not an error.
            self.stats.overruns += 1;
            tracing::warn!(
                seq,
                elapsed_us = self.stats.last_tick_us,
                "tick overran its interval"
            );
        }

        self.snapshot()
    }

    fn activate(&mut self, next: Arc<Topology>) {
        let old_topology = std::mem::replace(&mut self.topology, next);
        let mut old_models: Vec<Option<InstrumentModel>> =
            self.models.drain(..).map(Some).collect();
        let old_previous = std::mem::take(&mut self.previous);

        for spec in self.topology.specs() {
            // Carry private state when the instrument is unchanged in id,
            // type and parameters; channel and link edits alone do not
            // reset a totalizer or a valve position.
            let carried = old_topology.index_of(&spec.id).and_then(|j| {
                (old_topology.specs()[j].params == spec.params)
                    .then(|| old_models[j].take().map(|m| (m, old_previous[j].clone())))
                    .flatten()
            });
            match carried {
                Some((model, display)) => {
                    self.previous.push(display);
                    self.models.push(model);
                }
                None => {
                    let model = InstrumentModel::new(&spec.params);
                    self.previous.push(model.display());
                    self.models.push(model);
                }
            }
        }
        self.faulted = vec![false; self.models.len()];
        tracing::info!(
            generation = self.topology.generation(),
            instruments = self.topology.len(),
            "topology activated"
        );
    }

    fn assemble(
        topology: &Topology,
        seq: u64,
        displays: &[DisplayState],
        faulted: &[bool],
    ) -> Snapshot {
        let instruments = topology
            .specs()
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                (
                    spec.id.clone(),
                    InstrumentStatus {
                        display: displays[i].clone(),
                        degraded: topology.is_degraded(i),
                        faulted: faulted.get(i).copied().unwrap_or(false),
                    },
                )
            })
            .collect();
        Snapshot {
            generation: topology.generation(),
            seq,
            instruments,
        }
    }
}

/// Run one model tick under a panic guard; on abort, fall back to the prior
/// display and report the fault.
fn run_guarded<F>(tick: F, fallback: &DisplayState) -> (DisplayState, bool)
where
    F: FnOnce() -> DisplayState,
{
    match panic::catch_unwind(AssertUnwindSafe(tick)) {
        Ok(display) => (display, false),
        Err(_) => (fallback.clone(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{ValveDisplay, ValveStatus};

    fn valve_display(position: f64) -> DisplayState {
        DisplayState::Valve(ValveDisplay {
            position_percent: position,
            status: ValveStatus::Opening,
            open_cmd: true,
            close_cmd: false,
            hold_cmd: false,
        })
    }

    #[test]
    fn guard_passes_through_normal_ticks() {
        let fallback = valve_display(10.0);
        let (display, faulted) = run_guarded(|| valve_display(42.0), &fallback);
        assert!(!faulted);
        assert_eq!(display, valve_display(42.0));
    }

    #[test]
    fn guard_republishes_fallback_on_panic() {
        let fallback = valve_display(10.0);
        let (display, faulted) = run_guarded(|| panic!("boom"), &fallback);
        assert!(faulted);
        assert_eq!(display, fallback);
    }
}
