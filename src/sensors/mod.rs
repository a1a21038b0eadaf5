//! Sensor subsystem — shared cache, median filtering, acquisition
//! pipeline and the humidity-sensor auto-dry cycle.
//!
//! The pipeline task is the cache's only writer; every other component
//! takes short try-lock snapshots. "Missing" is a first-class state
//! (`None`), distinct from zero: a disconnected probe must blank its
//! readings, not report 0 °C.

pub mod autodry;
pub mod filter;
pub mod pipeline;

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use crate::ports::HeapStats;

/// Last good value of every derived measurement, or `None` when the
/// source sensor is missing or has not produced a sample yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorReadings {
    pub bus_voltage: Option<f32>,
    pub bus_current: Option<f32>,
    pub bus_power: Option<f32>,
    pub ambient_temp: Option<f32>,
    pub ambient_humidity: Option<f32>,
    pub dew_point: Option<f32>,
    pub lens_temp: Option<f32>,
    pub heap: HeapStats,
}

/// Shared handle to the cache.
///
/// Readers and the writer both use `try_lock` with immediate give-up:
/// a contended reader skips its update cycle rather than stalling a
/// control task.
#[derive(Clone, Default)]
pub struct SharedCache(Arc<Mutex<SensorReadings>>);

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking snapshot; `None` when the cache is contended.
    pub fn snapshot(&self) -> Option<SensorReadings> {
        self.0.try_lock().ok().map(|r| *r)
    }

    /// Blocking snapshot for the serial path, where a short wait is
    /// preferable to an empty reply. Critical sections are tiny.
    pub fn snapshot_blocking(&self) -> SensorReadings {
        *self.0.lock().unwrap()
    }

    /// Mutate the cache under the lock; skipped (returns `None`) when
    /// contended so the writer's blanking stays atomic w.r.t. readers.
    pub fn with<R>(&self, f: impl FnOnce(&mut SensorReadings) -> R) -> Option<R> {
        self.0.try_lock().ok().map(|mut r| f(&mut r))
    }
}

/// Round to one decimal place for the wire.
fn round1(v: f32) -> f64 {
    ((v as f64) * 10.0).round() / 10.0
}

/// Sensor projection: measurement keys only when present, one decimal;
/// live heater powers and heap telemetry always.
pub fn to_wire(r: &SensorReadings, pwm1: u8, pwm2: u8) -> Value {
    let mut doc = Map::new();
    let mut put = |key: &str, v: Option<f32>| {
        if let Some(v) = v {
            doc.insert(key.into(), round1(v).into());
        }
    };
    put("v", r.bus_voltage);
    put("i", r.bus_current);
    put("p", r.bus_power);
    put("t_amb", r.ambient_temp);
    put("h_amb", r.ambient_humidity);
    put("d", r.dew_point);
    put("t_lens", r.lens_temp);

    doc.insert("pwm1".into(), pwm1.into());
    doc.insert("pwm2".into(), pwm2.into());

    doc.insert("hf".into(), r.heap.free.into());
    doc.insert("hmf".into(), r.heap.min_free.into());
    doc.insert("hma".into(), r.heap.max_alloc.into());
    doc.insert("hs".into(), r.heap.size.into());

    Value::Object(doc)
}
