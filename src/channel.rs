//! I/O channel abstraction.
//!
//! Instruments never touch hardware directly: every digital or analog signal
//! crossing the simulator boundary goes through a [`ChannelBank`], which owns
//! a pluggable [`IoBackend`]. The bank latches the last good value of every
//! read channel and converts backend failures into channel-local fault
//! records, so a flaky bus degrades a signal instead of stopping the tick
//! loop.
//!
//! Analog values are normalized to `0.0..=1.0` at this boundary; scaling to
//! engineering units (4-20 mA, 0-10 V) is the instruments' business.

use crate::error::ChannelError;
use heapless::Vec as BoundedVec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Most recent channel faults retained for the stats report.
const MAX_FAULT_RECORDS: usize = 16;

/// Direction and signal class of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    DigitalIn,
    DigitalOut,
    AnalogIn,
    AnalogOut,
}

impl ChannelKind {
    pub fn is_input(self) -> bool {
        matches!(self, ChannelKind::DigitalIn | ChannelKind::AnalogIn)
    }

    pub fn is_digital(self) -> bool {
        matches!(self, ChannelKind::DigitalIn | ChannelKind::DigitalOut)
    }
}

/// Physical location of a channel: a GPIO pin, or a converter channel behind
/// a bus address (DAC/ADC expanders).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelAddress {
    Pin(u8),
    Bus { address: u8, channel: u8 },
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelAddress::Pin(pin) => write!(f, "pin {pin}"),
            ChannelAddress::Bus { address, channel } => {
                write!(f, "bus 0x{address:02x}/{channel}")
            }
        }
    }
}

/// A fully specified channel: what it is plus where it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoChannel {
    pub kind: ChannelKind,
    pub address: ChannelAddress,
}

/// A latched signal value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelValue {
    Digital(bool),
    Analog(f64),
}

impl ChannelValue {
    /// Neutral value for a channel kind: false / 0.0.
    pub fn neutral(kind: ChannelKind) -> Self {
        if kind.is_digital() {
            ChannelValue::Digital(false)
        } else {
            ChannelValue::Analog(0.0)
        }
    }
}

/// Backend contract for channel access.
///
/// Implementations must be bounded and non-blocking; a slow or wedged bus
/// should surface as a `ChannelError`, never as a stall.
pub trait IoBackend: Send {
    fn read_digital(&mut self, channel: &IoChannel) -> Result<bool, ChannelError>;
    fn write_digital(&mut self, channel: &IoChannel, value: bool) -> Result<(), ChannelError>;
    /// Normalized 0.0..=1.0.
    fn read_analog(&mut self, channel: &IoChannel) -> Result<f64, ChannelError>;
    /// Normalized 0.0..=1.0.
    fn write_analog(&mut self, channel: &IoChannel, value: f64) -> Result<(), ChannelError>;
}

/// In-memory backend with immediate echo.
///
/// Cloning yields another handle to the same shared state, so tests and the
/// server's input-injection commands can flip inputs while the simulator
/// holds its own handle inside the bank. Unset inputs read as false / 0.0.
#[derive(Debug, Clone, Default)]
pub struct MockIo {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    digital: HashMap<IoChannel, bool>,
    analog: HashMap<IoChannel, f64>,
}

impl MockIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_digital_input(&self, address: ChannelAddress, value: bool) {
        let channel = IoChannel {
            kind: ChannelKind::DigitalIn,
            address,
        };
        if let Ok(mut state) = self.state.lock() {
            state.digital.insert(channel, value);
        }
    }

    pub fn set_analog_input(&self, address: ChannelAddress, value: f64) {
        let channel = IoChannel {
            kind: ChannelKind::AnalogIn,
            address,
        };
        if let Ok(mut state) = self.state.lock() {
            state.analog.insert(channel, value.clamp(0.0, 1.0));
        }
    }

    /// Last value written to a digital output, if any.
    pub fn digital_output(&self, address: ChannelAddress) -> Option<bool> {
        let channel = IoChannel {
            kind: ChannelKind::DigitalOut,
            address,
        };
        self.state.lock().ok()?.digital.get(&channel).copied()
    }

    /// Last value written to an analog output, if any.
    pub fn analog_output(&self, address: ChannelAddress) -> Option<f64> {
        let channel = IoChannel {
            kind: ChannelKind::AnalogOut,
            address,
        };
        self.state.lock().ok()?.analog.get(&channel).copied()
    }
}

impl IoBackend for MockIo {
    fn read_digital(&mut self, channel: &IoChannel) -> Result<bool, ChannelError> {
        let state = self
            .state
            .lock()
            .map_err(|_| ChannelError::Bus("mock state poisoned".into()))?;
        Ok(state.digital.get(channel).copied().unwrap_or(false))
    }

    fn write_digital(&mut self, channel: &IoChannel, value: bool) -> Result<(), ChannelError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ChannelError::Bus("mock state poisoned".into()))?;
        state.digital.insert(*channel, value);
        Ok(())
    }

    fn read_analog(&mut self, channel: &IoChannel) -> Result<f64, ChannelError> {
        let state = self
            .state
            .lock()
            .map_err(|_| ChannelError::Bus("mock state poisoned".into()))?;
        Ok(state.analog.get(channel).copied().unwrap_or(0.0))
    }

    fn write_analog(&mut self, channel: &IoChannel, value: f64) -> Result<(), ChannelError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ChannelError::Bus("mock state poisoned".into()))?;
        state.analog.insert(*channel, value.clamp(0.0, 1.0));
        Ok(())
    }
}

/// One recorded backend failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFaultRecord {
    pub channel: IoChannel,
    pub detail: String,
    pub tick: u64,
}

/// Channel access counters for the stats report.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChannelStats {
    pub reads: u64,
    pub writes: u64,
    pub read_faults: u64,
    pub write_faults: u64,
}

/// Sole owner of channel traffic.
///
/// Read faults fall back to the last known value (neutral if the channel was
/// never read successfully); write faults drop the value, which the next
/// tick rewrites anyway. Neither interrupts the caller.
pub struct ChannelBank {
    backend: Box<dyn IoBackend>,
    last_known: HashMap<IoChannel, ChannelValue>,
    faults: BoundedVec<ChannelFaultRecord, MAX_FAULT_RECORDS>,
    stats: ChannelStats,
    tick: u64,
}

impl ChannelBank {
    pub fn new(backend: Box<dyn IoBackend>) -> Self {
        Self {
            backend,
            last_known: HashMap::new(),
            faults: BoundedVec::new(),
            stats: ChannelStats::default(),
            tick: 0,
        }
    }

    /// Tick number stamped onto fault records, set by the scheduler.
    pub fn set_tick(&mut self, tick: u64) {
        self.tick = tick;
    }

    pub fn read(&mut self, channel: &IoChannel) -> ChannelValue {
        self.stats.reads += 1;
        let result = if channel.kind.is_digital() {
            self.backend.read_digital(channel).map(ChannelValue::Digital)
        } else {
            self.backend.read_analog(channel).map(ChannelValue::Analog)
        };
        match result {
            Ok(value) => {
                self.last_known.insert(*channel, value);
                value
            }
            Err(err) => {
                self.stats.read_faults += 1;
                self.record_fault(channel, &err);
                self.last_known
                    .get(channel)
                    .copied()
                    .unwrap_or_else(|| ChannelValue::neutral(channel.kind))
            }
        }
    }

    pub fn write(&mut self, channel: &IoChannel, value: ChannelValue) {
        self.stats.writes += 1;
        let result = match value {
            ChannelValue::Digital(v) => self.backend.write_digital(channel, v),
            ChannelValue::Analog(v) => self.backend.write_analog(channel, v),
        };
        if let Err(err) = result {
            self.stats.write_faults += 1;
            self.record_fault(channel, &err);
        }
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn recent_faults(&self) -> &[ChannelFaultRecord] {
        &self.faults
    }

    fn record_fault(&mut self, channel: &IoChannel, err: &ChannelError) {
        tracing::warn!(channel = %channel.address, error = %err, "channel fault");
        let record = ChannelFaultRecord {
            channel: *channel,
            detail: err.to_string(),
            tick: self.tick,
        };
        if self.faults.is_full() {
            self.faults.remove(0);
        }
        let _ = self.faults.push(record);
    }
}

impl fmt::Debug for ChannelBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBank")
            .field("stats", &self.stats)
            .field("faults", &self.faults.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend whose reads can be forced to fail, for fallback tests.
    #[derive(Clone, Default)]
    struct FlakyIo {
        inner: MockIo,
        failing: Arc<Mutex<bool>>,
    }

    impl FlakyIo {
        fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }

        fn check(&self) -> Result<(), ChannelError> {
            if *self.failing.lock().unwrap() {
                Err(ChannelError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    impl IoBackend for FlakyIo {
        fn read_digital(&mut self, channel: &IoChannel) -> Result<bool, ChannelError> {
            self.check()?;
            self.inner.read_digital(channel)
        }

        fn write_digital(&mut self, channel: &IoChannel, value: bool) -> Result<(), ChannelError> {
            self.check()?;
            self.inner.write_digital(channel, value)
        }

        fn read_analog(&mut self, channel: &IoChannel) -> Result<f64, ChannelError> {
            self.check()?;
            self.inner.read_analog(channel)
        }

        fn write_analog(&mut self, channel: &IoChannel, value: f64) -> Result<(), ChannelError> {
            self.check()?;
            self.inner.write_analog(channel, value)
        }
    }

    fn din(pin: u8) -> IoChannel {
        IoChannel {
            kind: ChannelKind::DigitalIn,
            address: ChannelAddress::Pin(pin),
        }
    }

    #[test]
    fn mock_inputs_default_to_neutral() {
        let mock = MockIo::new();
        let mut bank = ChannelBank::new(Box::new(mock));

        assert_eq!(bank.read(&din(4)), ChannelValue::Digital(false));
        let ain = IoChannel {
            kind: ChannelKind::AnalogIn,
            address: ChannelAddress::Bus {
                address: 0x48,
                channel: 1,
            },
        };
        assert_eq!(bank.read(&ain), ChannelValue::Analog(0.0));
    }

    #[test]
    fn mock_outputs_echo() {
        let mock = MockIo::new();
        let mut bank = ChannelBank::new(Box::new(mock.clone()));

        let dout = IoChannel {
            kind: ChannelKind::DigitalOut,
            address: ChannelAddress::Pin(17),
        };
        bank.write(&dout, ChannelValue::Digital(true));
        assert_eq!(mock.digital_output(ChannelAddress::Pin(17)), Some(true));
    }

    #[test]
    fn analog_values_clamp_to_unit_range() {
        let mock = MockIo::new();
        mock.set_analog_input(ChannelAddress::Pin(2), 3.5);
        let mut bank = ChannelBank::new(Box::new(mock));

        let ain = IoChannel {
            kind: ChannelKind::AnalogIn,
            address: ChannelAddress::Pin(2),
        };
        assert_eq!(bank.read(&ain), ChannelValue::Analog(1.0));
    }

    #[test]
    fn read_fault_falls_back_to_last_known() {
        let flaky = FlakyIo::default();
        flaky.inner.set_digital_input(ChannelAddress::Pin(9), true);
        let handle = flaky.clone();
        let mut bank = ChannelBank::new(Box::new(flaky));

        // Good read latches the value.
        assert_eq!(bank.read(&din(9)), ChannelValue::Digital(true));

        handle.set_failing(true);
        handle.inner.set_digital_input(ChannelAddress::Pin(9), false);

        // Backend failure: latched value survives, fault recorded.
        assert_eq!(bank.read(&din(9)), ChannelValue::Digital(true));
        assert_eq!(bank.stats().read_faults, 1);
        assert_eq!(bank.recent_faults().len(), 1);

        handle.set_failing(false);
        assert_eq!(bank.read(&din(9)), ChannelValue::Digital(false));
    }

    #[test]
    fn read_fault_with_no_history_yields_neutral() {
        let flaky = FlakyIo::default();
        flaky.set_failing(true);
        let mut bank = ChannelBank::new(Box::new(flaky));

        assert_eq!(bank.read(&din(1)), ChannelValue::Digital(false));
        assert_eq!(bank.stats().read_faults, 1);
    }

    #[test]
    fn write_fault_is_swallowed_and_counted() {
        let flaky = FlakyIo::default();
        flaky.set_failing(true);
        let handle = flaky.clone();
        let mut bank = ChannelBank::new(Box::new(flaky));

        let dout = IoChannel {
            kind: ChannelKind::DigitalOut,
            address: ChannelAddress::Pin(3),
        };
        bank.write(&dout, ChannelValue::Digital(true));
        assert_eq!(bank.stats().write_faults, 1);
        assert_eq!(handle.inner.digital_output(ChannelAddress::Pin(3)), None);

        // Next tick's write goes through once the backend recovers.
        handle.set_failing(false);
        bank.write(&dout, ChannelValue::Digital(true));
        assert_eq!(handle.inner.digital_output(ChannelAddress::Pin(3)), Some(true));
    }

    #[test]
    fn fault_list_is_bounded() {
        let flaky = FlakyIo::default();
        flaky.set_failing(true);
        let mut bank = ChannelBank::new(Box::new(flaky));

        for pin in 0..40 {
            bank.read(&din(pin));
        }
        assert_eq!(bank.recent_faults().len(), MAX_FAULT_RECORDS);
        // Oldest records dropped first.
        assert_eq!(
            bank.recent_faults()[0].channel.address,
            ChannelAddress::Pin(40 - MAX_FAULT_RECORDS as u8)
        );
    }
}
