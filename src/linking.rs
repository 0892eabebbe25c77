//! Linking resolver.
//!
//! Links form a directed dependency graph: a dependent instrument reads a
//! quantity off its target, so targets want evaluating first. Resolution
//! runs once per topology build and produces an evaluation order plus a
//! handle per declared link; the per-tick read through a handle is then a
//! couple of indexed loads with no name lookups against live state.
//!
//! Cycles are legal. Kahn's algorithm orders the acyclic part (ready nodes
//! taken smallest-index first, so the result is stable); when it deadlocks,
//! one member of a cycle is force-placed and the march continues. Any link
//! whose target does not come strictly earlier in the final order is marked
//! a back edge and reads the previous tick's published value, one tick of
//! transport delay around the loop. Dangling links resolve to handles with
//! no target: reads come back neutral and the dependent is flagged degraded
//! in the snapshot.

use crate::instrument::{DisplayState, LinkSource, Quantity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// What a back-edge read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackEdgePolicy {
    /// Previous tick's published value (one-tick transport delay).
    #[default]
    PreviousTick,
    /// The neutral value, as if the link were dangling.
    Neutral,
}

/// One resolved link declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHandle {
    /// Index of the target instrument; `None` for a dangling link.
    pub target: Option<usize>,
    /// True when the target is not evaluated earlier in the same tick.
    pub back_edge: bool,
}

/// Evaluation order plus per-instrument link handles.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub order: Vec<usize>,
    pub handles: Vec<HashMap<String, LinkHandle>>,
}

/// Resolve `links[i]` (role -> target id) against `index` (id -> position).
pub fn resolve(links: &[HashMap<String, String>], index: &HashMap<String, usize>) -> Resolution {
    let n = links.len();

    // Dependency edges in role order, so resolution is a pure function of
    // the declarations and not of map iteration order.
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (dependent, declared) in links.iter().enumerate() {
        let mut roles: Vec<(&String, &String)> = declared.iter().collect();
        roles.sort();
        for (_, target_id) in roles {
            if let Some(&target) = index.get(target_id) {
                deps[dependent].push(target);
            }
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for (dependent, targets) in deps.iter().enumerate() {
        for &target in targets {
            dependents[target].push(dependent);
            indegree[dependent] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    let mut placed = vec![false; n];
    while order.len() < n {
        let next = match ready.iter().next().copied() {
            Some(next) => {
                ready.remove(&next);
                next
            }
            // Deadlocked: everything left depends on a cycle. Break it at
            // one of the cycle's members.
            None => find_cycle_member(&deps, &placed),
        };
        if placed[next] {
            continue;
        }
        order.push(next);
        placed[next] = true;
        for &dependent in &dependents[next] {
            indegree[dependent] = indegree[dependent].saturating_sub(1);
            if indegree[dependent] == 0 && !placed[dependent] {
                ready.insert(dependent);
            }
        }
    }

    let mut position = vec![0usize; n];
    for (pos, &i) in order.iter().enumerate() {
        position[i] = pos;
    }

    let handles = links
        .iter()
        .enumerate()
        .map(|(dependent, declared)| {
            declared
                .iter()
                .map(|(role, target_id)| {
                    let target = index.get(target_id).copied();
                    let back_edge = target.is_some_and(|t| position[t] >= position[dependent]);
                    (role.clone(), LinkHandle { target, back_edge })
                })
                .collect()
        })
        .collect();

    Resolution { order, handles }
}

/// Walk unplaced dependency edges from the smallest unplaced node until a
/// node repeats; the repeated node sits on a cycle.
fn find_cycle_member(deps: &[Vec<usize>], placed: &[bool]) -> usize {
    let start = (0..placed.len()).find(|&i| !placed[i]).unwrap_or(0);
    let mut seen = vec![false; placed.len()];
    let mut node = start;
    loop {
        if seen[node] {
            return node;
        }
        seen[node] = true;
        // An unplaced node off the ready set always has an unplaced
        // dependency; the fallback only guards degenerate input.
        node = deps[node]
            .iter()
            .copied()
            .find(|&t| !placed[t])
            .unwrap_or(node);
    }
}

/// Per-tick read side of the resolution.
///
/// `current` holds the displays already produced this tick; `previous`
/// always holds one display per instrument.
pub struct LinkView<'a> {
    pub handles: &'a HashMap<String, LinkHandle>,
    pub current: &'a [Option<DisplayState>],
    pub previous: &'a [DisplayState],
    pub policy: BackEdgePolicy,
}

impl LinkSource for LinkView<'_> {
    fn value(&self, role: &str, quantity: Quantity) -> Option<f64> {
        let handle = self.handles.get(role)?;
        let target = handle.target?;
        if handle.back_edge {
            return match self.policy {
                BackEdgePolicy::PreviousTick => self.previous.get(target)?.quantity(quantity),
                BackEdgePolicy::Neutral => None,
            };
        }
        // Forward edge: the target was evaluated earlier this tick.
        self.current.get(target)?.as_ref()?.quantity(quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linkset(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(role, target)| (role.to_string(), target.to_string()))
            .collect()
    }

    fn index(ids: &[&str]) -> HashMap<String, usize> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), i))
            .collect()
    }

    #[test]
    fn targets_evaluate_before_dependents() {
        // tank reads meter, meter reads pump; declared most-downstream first.
        let links = vec![
            linkset(&[("flow_in", "meter")]),
            linkset(&[("source", "pump")]),
            linkset(&[]),
        ];
        let resolution = resolve(&links, &index(&["tank", "meter", "pump"]));

        assert_eq!(resolution.order, vec![2, 1, 0]);
        assert!(resolution
            .handles
            .iter()
            .flat_map(|h| h.values())
            .all(|h| !h.back_edge));
    }

    #[test]
    fn independent_instruments_keep_declaration_order() {
        let links = vec![linkset(&[]), linkset(&[]), linkset(&[])];
        let resolution = resolve(&links, &index(&["a", "b", "c"]));
        assert_eq!(resolution.order, vec![0, 1, 2]);
    }

    #[test]
    fn cycle_closes_with_exactly_one_back_edge() {
        let links = vec![
            linkset(&[("back_pressure", "valve")]),
            linkset(&[("source", "pump")]),
        ];
        let resolution = resolve(&links, &index(&["pump", "valve"]));

        assert_eq!(resolution.order.len(), 2);
        let back_edges: usize = resolution
            .handles
            .iter()
            .flat_map(|h| h.values())
            .filter(|h| h.back_edge)
            .count();
        assert_eq!(back_edges, 1);
    }

    #[test]
    fn node_downstream_of_a_cycle_is_not_dragged_into_it() {
        let links = vec![
            linkset(&[("flow_in", "meter")]),
            linkset(&[("source", "pump")]),
            linkset(&[("back_pressure", "meter")]),
        ];
        // meter <-> pump cycle feeding tank.
        let resolution = resolve(&links, &index(&["tank", "meter", "pump"]));
        let pos: HashMap<usize, usize> = resolution
            .order
            .iter()
            .enumerate()
            .map(|(p, &i)| (i, p))
            .collect();
        // tank's only dependency is meter: that edge must stay forward.
        assert!(pos[&0] > pos[&1]);
        assert!(!resolution.handles[0]["flow_in"].back_edge);
        // The cycle itself closes with a single back edge.
        let back_edges: usize = resolution
            .handles
            .iter()
            .flat_map(|h| h.values())
            .filter(|h| h.back_edge)
            .count();
        assert_eq!(back_edges, 1);
    }

    #[test]
    fn resolution_is_deterministic() {
        let links = vec![
            linkset(&[("flow_in", "meter"), ("flow_out", "drain")]),
            linkset(&[("source", "pump")]),
            linkset(&[("back_pressure", "meter")]),
            linkset(&[("source", "pump")]),
        ];
        let idx = index(&["tank", "meter", "pump", "drain"]);
        let first = resolve(&links, &idx);
        for _ in 0..10 {
            let again = resolve(&links, &idx);
            assert_eq!(again.order, first.order);
            assert_eq!(again.handles, first.handles);
        }
    }

    #[test]
    fn dangling_target_yields_handle_without_index() {
        let links = vec![linkset(&[("source", "ghost")])];
        let resolution = resolve(&links, &index(&["meter"]));
        let handle = resolution.handles[0]["source"];
        assert_eq!(handle.target, None);
        assert!(!handle.back_edge);
    }

    #[test]
    fn self_link_is_a_back_edge() {
        let links = vec![linkset(&[("source", "meter")])];
        let resolution = resolve(&links, &index(&["meter"]));
        let handle = resolution.handles[0]["source"];
        assert_eq!(handle.target, Some(0));
        assert!(handle.back_edge);
    }

    fn pump_display(flow: f64) -> DisplayState {
        use crate::instrument::{PumpDisplay, PumpStatus};
        DisplayState::Pump(PumpDisplay {
            status: PumpStatus::Running,
            running: true,
            speed_percent: 100.0,
            pressure_bar: 8.0,
            flow_lpm: flow,
            fault: false,
        })
    }

    #[test]
    fn forward_edge_reads_the_current_tick() {
        let handles = HashMap::from([(
            "source".to_string(),
            LinkHandle {
                target: Some(0),
                back_edge: false,
            },
        )]);
        let current = vec![Some(pump_display(70.0))];
        let previous = vec![pump_display(55.0)];

        let view = LinkView {
            handles: &handles,
            current: &current,
            previous: &previous,
            policy: BackEdgePolicy::PreviousTick,
        };
        assert_eq!(view.value("source", Quantity::FlowLpm), Some(70.0));
    }

    #[test]
    fn back_edge_reads_previous_tick_under_default_policy() {
        let handles = HashMap::from([(
            "source".to_string(),
            LinkHandle {
                target: Some(0),
                back_edge: true,
            },
        )]);
        let current = vec![None];
        let previous = vec![pump_display(55.0)];

        let view = LinkView {
            handles: &handles,
            current: &current,
            previous: &previous,
            policy: BackEdgePolicy::PreviousTick,
        };
        assert_eq!(view.value("source", Quantity::FlowLpm), Some(55.0));

        let view = LinkView {
            handles: &handles,
            current: &current,
            previous: &previous,
            policy: BackEdgePolicy::Neutral,
        };
        assert_eq!(view.value("source", Quantity::FlowLpm), None);
    }
}
