//! Fixed-layout binary image of the configuration record.
//!
//! The persisted blob is a little-endian field-by-field dump with no
//! framing: its only integrity check is the exact length. A loader MUST
//! reject any blob whose length differs from [`RECORD_SIZE`] — that is
//! how images from older firmware layouts are detected and discarded.

use super::{
    AutoDryConfig, AveragingCounts, Config, HeaterConfig, HeaterMode, OutputStartup,
    SensorOffsets, StartupStates, UpdateIntervals, HEATER_NAME_MAX, MAX_HEATERS,
};
use crate::ports::StorageError;

/// Bytes per heater block: 32-byte name cell, four u8 fields,
/// target_offset, three f64 gains, four f32 parameters.
const HEATER_BLOCK: usize = 32 + 4 + 4 + 24 + 16;

/// Total image size:
/// offsets (5×f32) + intervals (3×u32) + startup (8×u8) +
/// averaging (5×i32) + preset (f32) + auto-dry (u8 + f32 + u32) +
/// two heater blocks.
pub const RECORD_SIZE: usize = 20 + 12 + 8 + 20 + 4 + 9 + MAX_HEATERS * HEATER_BLOCK;

// ── Cursor helpers ────────────────────────────────────────────

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }
    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }
    fn f32(&mut self, v: f32) {
        self.put(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.put(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }
    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }
    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }
    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }
    fn f64(&mut self) -> f64 {
        f64::from_le_bytes(self.take())
    }
}

// ── Encode ────────────────────────────────────────────────────

pub fn encode(cfg: &Config) -> [u8; RECORD_SIZE] {
    let mut image = [0u8; RECORD_SIZE];
    let mut w = Writer {
        buf: &mut image,
        pos: 0,
    };

    w.f32(cfg.offsets.ambient_temp);
    w.f32(cfg.offsets.ambient_humidity);
    w.f32(cfg.offsets.lens_temp);
    w.f32(cfg.offsets.bus_voltage);
    w.f32(cfg.offsets.bus_current);

    w.u32(cfg.intervals.bus_ms);
    w.u32(cfg.intervals.climate_ms);
    w.u32(cfg.intervals.lens_ms);

    for dc in &cfg.startup.dc {
        w.u8(dc.as_u8());
    }
    w.u8(cfg.startup.usbc12.as_u8());
    w.u8(cfg.startup.usb345.as_u8());
    w.u8(cfg.startup.adj.as_u8());

    w.i32(cfg.averaging.ambient_temp);
    w.i32(cfg.averaging.ambient_humidity);
    w.i32(cfg.averaging.lens_temp);
    w.i32(cfg.averaging.bus_voltage);
    w.i32(cfg.averaging.bus_current);

    w.f32(cfg.converter_preset_v);

    w.u8(cfg.auto_dry.enabled as u8);
    w.f32(cfg.auto_dry.humidity_threshold);
    w.u32(cfg.auto_dry.trigger_duration_ms);

    for h in &cfg.heaters {
        let mut name_cell = [0u8; HEATER_NAME_MAX + 1];
        let bytes = h.name.as_bytes();
        let len = bytes.len().min(HEATER_NAME_MAX);
        name_cell[..len].copy_from_slice(&bytes[..len]);
        w.put(&name_cell);

        w.u8(h.enabled_on_startup as u8);
        w.u8(h.mode.as_u8());
        w.u8(h.manual_power);
        w.u8(h.max_power);
        w.f32(h.target_offset);
        w.f64(h.pid_kp);
        w.f64(h.pid_ki);
        w.f64(h.pid_kd);
        w.f32(h.start_delta);
        w.f32(h.end_delta);
        w.f32(h.pid_sync_factor);
        w.f32(h.min_temp);
    }

    debug_assert_eq!(w.pos, RECORD_SIZE);
    image
}

// ── Decode ────────────────────────────────────────────────────

/// Decode a persisted image. Any length other than [`RECORD_SIZE`] is
/// treated as corruption.
pub fn decode(bytes: &[u8]) -> Result<Config, StorageError> {
    if bytes.len() != RECORD_SIZE {
        return Err(StorageError::IoError);
    }
    let mut r = Reader { buf: bytes, pos: 0 };

    let offsets = SensorOffsets {
        ambient_temp: r.f32(),
        ambient_humidity: r.f32(),
        lens_temp: r.f32(),
        bus_voltage: r.f32(),
        bus_current: r.f32(),
    };

    let intervals = UpdateIntervals {
        bus_ms: r.u32(),
        climate_ms: r.u32(),
        lens_ms: r.u32(),
    };

    let startup = StartupStates {
        dc: [
            OutputStartup::from_raw(r.u8()),
            OutputStartup::from_raw(r.u8()),
            OutputStartup::from_raw(r.u8()),
            OutputStartup::from_raw(r.u8()),
            OutputStartup::from_raw(r.u8()),
        ],
        usbc12: OutputStartup::from_raw(r.u8()),
        usb345: OutputStartup::from_raw(r.u8()),
        adj: OutputStartup::from_raw(r.u8()),
    };

    let averaging = AveragingCounts {
        ambient_temp: r.i32(),
        ambient_humidity: r.i32(),
        lens_temp: r.i32(),
        bus_voltage: r.i32(),
        bus_current: r.i32(),
    };

    let converter_preset_v = r.f32();

    let auto_dry = AutoDryConfig {
        enabled: r.u8() != 0,
        humidity_threshold: r.f32(),
        trigger_duration_ms: r.u32(),
    };

    let mut heaters: [HeaterConfig; MAX_HEATERS] = core::array::from_fn(|_| HeaterConfig {
        name: String::new(),
        enabled_on_startup: false,
        mode: HeaterMode::Disabled,
        manual_power: 0,
        target_offset: 0.0,
        pid_kp: 0.0,
        pid_ki: 0.0,
        pid_kd: 0.0,
        start_delta: 0.0,
        end_delta: 0.0,
        max_power: 0,
        pid_sync_factor: 0.0,
        min_temp: 0.0,
    });

    for h in heaters.iter_mut() {
        let cell = r.take::<{ HEATER_NAME_MAX + 1 }>();
        let end = cell.iter().position(|&b| b == 0).unwrap_or(cell.len());
        h.name = String::from_utf8_lossy(&cell[..end]).into_owned();

        h.enabled_on_startup = r.u8() != 0;
        h.mode = HeaterMode::from_raw(r.u8());
        h.manual_power = r.u8();
        h.max_power = r.u8();
        h.target_offset = r.f32();
        h.pid_kp = r.f64();
        h.pid_ki = r.f64();
        h.pid_kd = r.f64();
        h.start_delta = r.f32();
        h.end_delta = r.f32();
        h.pid_sync_factor = r.f32();
        h.min_temp = r.f32();
    }

    debug_assert_eq!(r.pos, RECORD_SIZE);
    Ok(Config {
        offsets,
        intervals,
        startup,
        averaging,
        converter_preset_v,
        auto_dry,
        heaters,
    })
}
