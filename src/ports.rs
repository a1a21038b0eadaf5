//! Port traits — the boundary between the control plane and the hardware.
//!
//! ```text
//!   Adapter (ESP-IDF / simulation) ──▶ Port trait ──▶ control plane
//! ```
//!
//! The sensor pipeline, heater bank, power arbiter and command dispatcher
//! consume these traits via generics, so the whole control plane compiles
//! and tests on the host. Real implementations live in [`crate::adapters`]
//! and are guarded by `#[cfg(target_os = "espidf")]`.

use core::fmt;
use std::sync::Arc;

// ───────────────────────────────────────────────────────────────
// Sensor ports (driven adapters: hardware → control plane)
// ───────────────────────────────────────────────────────────────

/// One reading from the bus power monitor.
#[derive(Debug, Clone, Copy)]
pub struct BusSample {
    /// Bus voltage in volts.
    pub voltage_v: f32,
    /// Bus current in milliamps.
    pub current_ma: f32,
}

/// One reading from the ambient temperature/humidity sensor.
#[derive(Debug, Clone, Copy)]
pub struct ClimateSample {
    /// Ambient temperature in °C.
    pub temperature_c: f32,
    /// Relative humidity in percent.
    pub humidity_pct: f32,
}

/// Bus voltage/current monitor.
pub trait BusMonitorPort {
    fn read(&mut self) -> Result<BusSample, SensorError>;
}

/// Ambient temperature/humidity sensor with an on-chip heater.
pub trait ClimatePort {
    fn read(&mut self) -> Result<ClimateSample, SensorError>;

    /// Fire a one-second high-power burst of the on-chip heater.
    ///
    /// The implementation triggers the heated measurement, discards its
    /// result, and restores the no-heater state before returning.
    fn heater_burst(&mut self) -> Result<(), SensorError>;
}

/// External lens temperature probe. Returns °C.
pub trait LensProbePort {
    fn read(&mut self) -> Result<f32, SensorError>;
}

// ───────────────────────────────────────────────────────────────
// Actuator ports (control plane → hardware)
// ───────────────────────────────────────────────────────────────

/// Bank of plain GPIO power switches, addressed by table index.
pub trait SwitchBankPort {
    fn set_output(&mut self, index: usize, on: bool);
}

/// A single PWM channel. The resolution (and therefore the meaning of
/// `duty`) is fixed per channel at construction time.
pub trait PwmChannelPort {
    fn set_duty(&mut self, duty: u32);
}

// ───────────────────────────────────────────────────────────────
// Serial boundary
// ───────────────────────────────────────────────────────────────

/// Inbound byte stream from the serial link. `read` returns the number of
/// bytes placed in `buf` and must not block for more than ~10 ms.
pub trait ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// Outbound line sink. Implementations own the serial write mutex: a call
/// to `send_line` emits one complete line, never interleaved with another.
pub trait LineSink {
    fn send_line(&self, line: &str);
}

/// Shared, clonable handle to the protocol output stream.
#[derive(Clone)]
pub struct ProtocolOut(Arc<dyn LineSink + Send + Sync>);

impl ProtocolOut {
    pub fn new(sink: Arc<dyn LineSink + Send + Sync>) -> Self {
        Self(sink)
    }

    pub fn send_line(&self, line: &str) {
        self.0.send_line(line);
    }
}

// ───────────────────────────────────────────────────────────────
// System services
// ───────────────────────────────────────────────────────────────

/// Heap telemetry snapshot, reported verbatim over the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub free: u32,
    pub min_free: u32,
    pub max_alloc: u32,
    pub size: u32,
}

/// Device-level services consumed by the dispatcher and telemetry task.
pub trait SystemPort {
    /// Restart the device. On hardware this does not return.
    fn restart(&mut self);

    fn heap_stats(&self) -> HeapStats;
}

// ───────────────────────────────────────────────────────────────
// Persistence
// ───────────────────────────────────────────────────────────────

/// Opaque named-blob store. The config store layers its fixed-size record
/// checks on top of this.
pub trait BlobStore {
    /// Load the blob, returning all of its bytes.
    fn load(&mut self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Store the blob atomically, replacing any previous contents.
    fn store(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Sensor acquisition failures. All variants map to the same recovery:
/// blank the affected cache entries and keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// The device did not respond on its bus.
    NotConnected,
    /// The bus transaction failed mid-way.
    BusError,
    /// The device answered with an implausible or non-finite value.
    InvalidReading,
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::BusError => write!(f, "bus error"),
            Self::InvalidReading => write!(f, "invalid reading"),
        }
    }
}

/// Blob store failures. Persistence errors are non-fatal everywhere; the
/// in-memory state stays authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// No blob with that name exists.
    NotFound,
    /// Generic I/O error from the backend.
    IoError,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "blob not found"),
            Self::IoError => write!(f, "I/O error"),
        }
    }
}
