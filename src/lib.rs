//! # PLC Instrument Simulator
//!
//! A real-time simulation engine for industrial field instruments, built for
//! bench-testing PLC control logic without physical devices on the wire.
//!
//! ## Features
//!
//! - **Six instrument models**: tank level, on/off valve, pump, pulse flow
//!   meter, regulating valve, and a tanker-loading interlock panel
//! - **Mock I/O**: digital and analog channels behind a pluggable backend,
//!   with last-known-value fallback on channel faults
//! - **Instrument linking**: dependency-ordered evaluation with one-tick
//!   delay around feedback loops
//! - **Atomic topology edits**: all-or-nothing validation, generation
//!   numbers, swaps only at tick boundaries
//! - **Deterministic snapshots**: same topology plus same inputs gives
//!   bit-identical published state, tick for tick
//!
//! ## Quick Start
//!
//! ```rust
//! use plcsim::channel::{ChannelBank, MockIo};
//! use plcsim::scheduler::{Simulator, SimulatorConfig};
//! use plcsim::topology::{InstrumentRecord, TopologyManager};
//!
//! let mut manager = TopologyManager::new();
//! let record: InstrumentRecord =
//!     serde_json::from_str(r#"{"id": "v101", "type": "valve"}"#).unwrap();
//! let topology = manager.replace(vec![record]).unwrap();
//!
//! let bank = ChannelBank::new(Box::new(MockIo::new()));
//! let mut sim = Simulator::new(bank, topology, SimulatorConfig::default());
//! let snapshot = sim.tick();
//! assert_eq!(snapshot.seq, 1);
//! ```
//!
//! ## Architecture
//!
//! - [`channel`] - I/O channels, backends, and the fault-tolerant bank
//! - [`instrument`] - the closed set of instrument models
//! - [`linking`] - dependency resolution between instruments
//! - [`topology`] - validated instrument sets and atomic reconfiguration
//! - [`scheduler`] - the fixed-rate tick loop and snapshot publication
//! - [`protocol`] - the TCP line protocol spoken by the server binary
//! - [`error`] - configuration and channel error taxonomy

#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod error;
pub mod instrument;
pub mod linking;
pub mod protocol;
pub mod scheduler;
pub mod topology;

// Re-export main public types for convenience
pub use channel::{ChannelBank, IoBackend, MockIo};
pub use error::{ChannelError, ConfigError};
pub use instrument::{DisplayState, InstrumentKind};
pub use scheduler::{Simulator, SimulatorConfig, Snapshot};
pub use topology::{InstrumentRecord, Topology, TopologyManager};
