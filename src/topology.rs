//! Topology: the validated set of configured instruments.
//!
//! Raw [`InstrumentRecord`]s (the JSON shape of the config file and the
//! runtime edit commands) are checked and lowered into an immutable
//! [`Topology`]: typed parameters, channel assignments, resolved link
//! handles and the evaluation order, all computed once at build time.
//! Validation is all-or-nothing; a proposal with any problem is rejected
//! whole and the active topology stays untouched.
//!
//! Each successfully built topology carries a generation number, so
//! snapshots and logs can say exactly which configuration produced them.

use crate::channel::{ChannelAddress, ChannelKind, IoChannel};
use crate::error::ConfigError;
use crate::instrument::{channel_roles, link_roles, InstrumentKind, InstrumentParams};
use crate::linking::{self, LinkHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Raw channel assignment as it appears in a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelRecord {
    pub kind: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i2c_address: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
}

impl ChannelRecord {
    fn address(&self) -> Result<ChannelAddress, String> {
        match (self.pin, self.i2c_address) {
            (Some(pin), None) => {
                if self.channel.is_some() {
                    return Err("`channel` only applies to i2c assignments".into());
                }
                Ok(ChannelAddress::Pin(pin))
            }
            (None, Some(address)) => {
                let channel = self.channel.ok_or("i2c assignment needs `channel`")?;
                Ok(ChannelAddress::Bus { address, channel })
            }
            (Some(_), Some(_)) => Err("give either `pin` or `i2c_address`, not both".into()),
            (None, None) => Err("missing `pin` or `i2c_address`".into()),
        }
    }
}

/// One instrument as declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrumentRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: InstrumentKind,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub io: HashMap<String, ChannelRecord>,
    #[serde(default)]
    pub links: HashMap<String, String>,
}

/// On-disk topology file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyFile {
    pub instruments: Vec<InstrumentRecord>,
}

/// A validated instrument: typed params, checked channels, declared links.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSpec {
    pub id: String,
    pub params: InstrumentParams,
    pub channels: HashMap<String, IoChannel>,
    pub links: HashMap<String, String>,
}

impl InstrumentSpec {
    pub fn kind(&self) -> InstrumentKind {
        self.params.kind()
    }
}

/// An immutable, validated instrument set.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    generation: u64,
    specs: Vec<InstrumentSpec>,
    index: HashMap<String, usize>,
    eval_order: Vec<usize>,
    link_handles: Vec<HashMap<String, LinkHandle>>,
    degraded: Vec<bool>,
}

impl Topology {
    /// The empty generation-zero topology.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            specs: Vec::new(),
            index: HashMap::new(),
            eval_order: Vec::new(),
            link_handles: Vec::new(),
            degraded: Vec::new(),
        }
    }

    /// Validate `records` and build generation `generation`.
    pub fn build(generation: u64, records: &[InstrumentRecord]) -> Result<Self, ConfigError> {
        let mut specs = Vec::with_capacity(records.len());
        let mut index = HashMap::with_capacity(records.len());
        let mut claimed: HashMap<(ChannelKind, ChannelAddress), String> = HashMap::new();

        for record in records {
            if index.contains_key(&record.id) {
                return Err(ConfigError::DuplicateId(record.id.clone()));
            }

            let params = InstrumentParams::parse(record.kind, &record.parameters).map_err(
                |reason| ConfigError::InvalidParameters {
                    id: record.id.clone(),
                    reason,
                },
            )?;

            let roles = channel_roles(record.kind);
            let mut channels = HashMap::with_capacity(record.io.len());
            for (role, channel_record) in &record.io {
                let Some((_, expected)) = roles.iter().find(|(name, _)| name == role) else {
                    return Err(ConfigError::UnknownChannelRole {
                        id: record.id.clone(),
                        kind: record.kind.name(),
                        role: role.clone(),
                    });
                };
                if channel_record.kind != *expected {
                    return Err(ConfigError::ChannelKindMismatch {
                        id: record.id.clone(),
                        role: role.clone(),
                        expected: *expected,
                        actual: channel_record.kind,
                    });
                }
                let address =
                    channel_record
                        .address()
                        .map_err(|reason| ConfigError::BadChannelRecord {
                            id: record.id.clone(),
                            role: role.clone(),
                            reason,
                        })?;
                let channel = IoChannel {
                    kind: channel_record.kind,
                    address,
                };
                if let Some(owner) = claimed.insert((channel.kind, address), record.id.clone()) {
                    return Err(ConfigError::ChannelCollision {
                        kind: channel.kind,
                        address,
                        first: owner,
                        second: record.id.clone(),
                    });
                }
                channels.insert(role.clone(), channel);
            }

            let allowed_links = link_roles(record.kind);
            for role in record.links.keys() {
                if !allowed_links.contains(&role.as_str()) {
                    return Err(ConfigError::UnknownLinkRole {
                        id: record.id.clone(),
                        kind: record.kind.name(),
                        role: role.clone(),
                    });
                }
            }

            index.insert(record.id.clone(), specs.len());
            specs.push(InstrumentSpec {
                id: record.id.clone(),
                params,
                channels,
                links: record.links.clone(),
            });
        }

        let link_sets: Vec<HashMap<String, String>> =
            specs.iter().map(|s| s.links.clone()).collect();
        let resolution = linking::resolve(&link_sets, &index);

        let degraded: Vec<bool> = resolution
            .handles
            .iter()
            .map(|handles| handles.values().any(|h| h.target.is_none()))
            .collect();
        for (i, spec) in specs.iter().enumerate() {
            if degraded[i] {
                for (role, handle) in &resolution.handles[i] {
                    if handle.target.is_none() {
                        tracing::warn!(
                            id = %spec.id,
                            role = %role,
                            target = %spec.links[role],
                            "link target missing; reads will be neutral"
                        );
                    }
                }
            }
        }

        Ok(Self {
            generation,
            specs,
            index,
            eval_order: resolution.order,
            link_handles: resolution.handles,
            degraded,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn specs(&self) -> &[InstrumentSpec] {
        &self.specs
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Indices in dependency-respecting evaluation order.
    pub fn eval_order(&self) -> &[usize] {
        &self.eval_order
    }

    pub fn link_handles(&self, i: usize) -> &HashMap<String, LinkHandle> {
        &self.link_handles[i]
    }

    /// True when instrument `i` declares at least one dangling link.
    pub fn is_degraded(&self, i: usize) -> bool {
        self.degraded[i]
    }
}

/// Owner of the active topology; every accepted edit builds a fresh
/// generation and swaps it in atomically.
#[derive(Debug)]
pub struct TopologyManager {
    records: Vec<InstrumentRecord>,
    current: Arc<Topology>,
    next_generation: u64,
}

impl TopologyManager {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            current: Arc::new(Topology::empty()),
            next_generation: 1,
        }
    }

    pub fn current(&self) -> Arc<Topology> {
        Arc::clone(&self.current)
    }

    pub fn records(&self) -> &[InstrumentRecord] {
        &self.records
    }

    /// Replace the whole instrument set.
    pub fn replace(
        &mut self,
        records: Vec<InstrumentRecord>,
    ) -> Result<Arc<Topology>, ConfigError> {
        let topology = Topology::build(self.next_generation, &records)?;
        self.commit(records, topology)
    }

    /// Add one instrument; its id must be fresh.
    pub fn add(&mut self, record: InstrumentRecord) -> Result<Arc<Topology>, ConfigError> {
        let mut records = self.records.clone();
        records.push(record);
        let topology = Topology::build(self.next_generation, &records)?;
        self.commit(records, topology)
    }

    /// Reconfigure an existing instrument in place.
    pub fn update(&mut self, record: InstrumentRecord) -> Result<Arc<Topology>, ConfigError> {
        let mut records = self.records.clone();
        let slot = records
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| ConfigError::UnknownInstrument(record.id.clone()))?;
        *slot = record;
        let topology = Topology::build(self.next_generation, &records)?;
        self.commit(records, topology)
    }

    /// Remove an instrument. Links pointing at it become dangling, which is
    /// a degradation, not an error.
    pub fn remove(&mut self, id: &str) -> Result<Arc<Topology>, ConfigError> {
        if !self.records.iter().any(|r| r.id == id) {
            return Err(ConfigError::UnknownInstrument(id.to_string()));
        }
        let records: Vec<InstrumentRecord> =
            self.records.iter().filter(|r| r.id != id).cloned().collect();
        let topology = Topology::build(self.next_generation, &records)?;
        self.commit(records, topology)
    }

    fn commit(
        &mut self,
        records: Vec<InstrumentRecord>,
        topology: Topology,
    ) -> Result<Arc<Topology>, ConfigError> {
        tracing::info!(
            generation = topology.generation(),
            instruments = topology.len(),
            "topology accepted"
        );
        self.records = records;
        self.current = Arc::new(topology);
        self.next_generation += 1;
        Ok(self.current())
    }
}

impl Default for TopologyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience check used by tests and the CLI: are all link targets
/// present?
pub fn dangling_links(topology: &Topology) -> Vec<(String, String)> {
    let mut missing = Vec::new();
    for (i, spec) in topology.specs().iter().enumerate() {
        for (role, handle) in topology.link_handles(i) {
            if handle.target.is_none() {
                missing.push((spec.id.clone(), role.clone()));
            }
        }
    }
    missing.sort();
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, kind: InstrumentKind) -> InstrumentRecord {
        InstrumentRecord {
            id: id.to_string(),
            kind,
            parameters: serde_json::Map::new(),
            io: HashMap::new(),
            links: HashMap::new(),
        }
    }

    fn pin(kind: ChannelKind, pin: u8) -> ChannelRecord {
        ChannelRecord {
            kind,
            pin: Some(pin),
            i2c_address: None,
            channel: None,
        }
    }

    #[test]
    fn record_json_shape_round_trips() {
        let json = r#"{
            "id": "lt101",
            "type": "level",
            "parameters": {"tank_volume_m3": 5.0},
            "io": {
                "level": {"kind": "analog_out", "i2c_address": 72, "channel": 0},
                "hh_alarm": {"kind": "digital_out", "pin": 21}
            },
            "links": {"flow_in": "ft101"}
        }"#;
        let record: InstrumentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, InstrumentKind::Level);
        assert_eq!(record.links["flow_in"], "ft101");

        let topology = Topology::build(1, &[record]).unwrap();
        assert_eq!(topology.len(), 1);
        assert!(topology.is_degraded(0));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let records = vec![
            record("v1", InstrumentKind::Valve),
            record("v1", InstrumentKind::Pump),
        ];
        assert_eq!(
            Topology::build(1, &records),
            Err(ConfigError::DuplicateId("v1".into()))
        );
    }

    #[test]
    fn channel_collision_is_rejected() {
        let mut a = record("v1", InstrumentKind::Valve);
        a.io.insert("open".into(), pin(ChannelKind::DigitalIn, 4));
        let mut b = record("v2", InstrumentKind::Valve);
        b.io.insert("close".into(), pin(ChannelKind::DigitalIn, 4));

        let err = Topology::build(1, &[a, b]).unwrap_err();
        assert!(matches!(err, ConfigError::ChannelCollision { .. }));
    }

    #[test]
    fn same_address_different_kind_is_allowed() {
        let mut a = record("v1", InstrumentKind::Valve);
        a.io.insert("open".into(), pin(ChannelKind::DigitalIn, 4));
        let mut b = record("p1", InstrumentKind::Pump);
        b.io.insert("running".into(), pin(ChannelKind::DigitalOut, 4));

        assert!(Topology::build(1, &[a, b]).is_ok());
    }

    #[test]
    fn unknown_channel_role_is_rejected() {
        let mut a = record("v1", InstrumentKind::Valve);
        a.io.insert("warp".into(), pin(ChannelKind::DigitalIn, 4));
        let err = Topology::build(1, &[a]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownChannelRole { .. }));
    }

    #[test]
    fn channel_kind_mismatch_is_rejected() {
        let mut a = record("v1", InstrumentKind::Valve);
        a.io.insert("open".into(), pin(ChannelKind::DigitalOut, 4));
        let err = Topology::build(1, &[a]).unwrap_err();
        assert!(matches!(err, ConfigError::ChannelKindMismatch { .. }));
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        let mut a = record("p1", InstrumentKind::Pump);
        a.parameters
            .insert("ramp_time_sec".into(), serde_json::json!(-1.0));
        let err = Topology::build(1, &[a]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameters { .. }));
    }

    #[test]
    fn unknown_link_role_is_rejected() {
        let mut a = record("v1", InstrumentKind::Valve);
        a.links.insert("source".into(), "x".into());
        let err = Topology::build(1, &[a]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownLinkRole { .. }));
    }

    #[test]
    fn manager_keeps_old_topology_on_rejection() {
        let mut manager = TopologyManager::new();
        manager
            .replace(vec![record("v1", InstrumentKind::Valve)])
            .unwrap();
        let before = manager.current();
        assert_eq!(before.generation(), 1);

        let err = manager.add(record("v1", InstrumentKind::Pump));
        assert!(err.is_err());

        let after = manager.current();
        assert_eq!(after.generation(), 1);
        assert_eq!(after.len(), 1);
        assert_eq!(after.specs()[0].kind(), InstrumentKind::Valve);
    }

    #[test]
    fn generation_increments_per_accepted_swap() {
        let mut manager = TopologyManager::new();
        assert_eq!(manager.current().generation(), 0);

        manager
            .replace(vec![record("v1", InstrumentKind::Valve)])
            .unwrap();
        assert_eq!(manager.current().generation(), 1);

        manager.add(record("p1", InstrumentKind::Pump)).unwrap();
        assert_eq!(manager.current().generation(), 2);

        // Rejected edits do not consume a generation.
        let _ = manager.add(record("p1", InstrumentKind::Pump));
        manager.remove("p1").unwrap();
        assert_eq!(manager.current().generation(), 3);
    }

    #[test]
    fn removing_a_link_target_degrades_the_dependent() {
        let mut manager = TopologyManager::new();
        let mut meter = record("ft1", InstrumentKind::Flow);
        meter.links.insert("source".into(), "p1".into());
        manager
            .replace(vec![record("p1", InstrumentKind::Pump), meter])
            .unwrap();
        assert!(dangling_links(&manager.current()).is_empty());

        manager.remove("p1").unwrap();
        let topology = manager.current();
        let meter_idx = topology.index_of("ft1").unwrap();
        assert!(topology.is_degraded(meter_idx));
        assert_eq!(
            dangling_links(&topology),
            vec![("ft1".to_string(), "source".to_string())]
        );
    }

    #[test]
    fn update_requires_existing_id() {
        let mut manager = TopologyManager::new();
        let err = manager.update(record("ghost", InstrumentKind::Valve));
        assert_eq!(err.unwrap_err(), ConfigError::UnknownInstrument("ghost".into()));
    }
}
