//! Wire protocol for the TCP server.
//!
//! Line-delimited JSON both ways. A client sends one [`ServerCommand`] per
//! line and gets one [`ServerResponse`] per command; in between, the server
//! pushes a `snapshot`-status line after every tick to every connected
//! client.

use crate::channel::ChannelAddress;
use crate::scheduler::{Snapshot, StatsReport};
use crate::topology::InstrumentRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ServerCommand {
    /// Current snapshot without waiting for the next tick.
    Snapshot,
    Stats,
    ListInstruments,
    /// Drive a mock digital input.
    SetDigitalInput { address: ChannelAddress, value: bool },
    /// Drive a mock analog input (normalized 0.0..=1.0).
    SetAnalogInput { address: ChannelAddress, value: f64 },
    AddInstrument { record: InstrumentRecord },
    UpdateInstrument { record: InstrumentRecord },
    RemoveInstrument { id: String },
    ReplaceTopology { records: Vec<InstrumentRecord> },
    /// Resume ticking after a `Stop`.
    Start,
    /// Pause ticking; the server stays up and keeps answering commands.
    Stop,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerResponse {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Snapshot {
        snapshot: Snapshot,
    },
    Stats {
        stats: StatsReport,
    },
    Instruments {
        records: Vec<InstrumentRecord>,
    },
    Error {
        message: String,
    },
}

impl ServerResponse {
    pub fn ok() -> Self {
        ServerResponse::Ok { detail: None }
    }

    pub fn ok_with(detail: impl Into<String>) -> Self {
        ServerResponse::Ok {
            detail: Some(detail.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerResponse::Error {
            message: message.into(),
        }
    }
}
