//! Sensor acquisition pipeline.
//!
//! Runs as a ~100 ms periodic task. Each tick takes a config snapshot,
//! polls every sensor whose refresh interval has elapsed, pushes raw
//! samples through the median filters, applies the configured offsets
//! and publishes the results into the shared cache. Disconnects blank
//! the affected cache entries atomically; the auto-dry state machine is
//! advanced every tick.

use std::sync::Arc;

use log::warn;

use crate::config::store::ConfigStore;
use crate::ports::{BusMonitorPort, ClimatePort, LensProbePort, ProtocolOut};

use super::autodry::{DryAction, DryController, DryHandle};
use super::filter::MedianWindow;
use super::SharedCache;

/// Task tick period. Individual sensors refresh on their own configured
/// intervals on top of this.
pub const TICK_MS: u64 = 100;

pub struct SensorPipeline<B, C, L> {
    bus: B,
    climate: C,
    lens: L,

    config: Arc<ConfigStore>,
    cache: SharedCache,
    out: ProtocolOut,
    dry: DryController,

    bus_available: bool,
    climate_available: bool,
    lens_available: bool,

    bus_last: Option<u64>,
    climate_last: Option<u64>,
    lens_last: Option<u64>,

    volt_filter: MedianWindow,
    curr_filter: MedianWindow,
    temp_filter: MedianWindow,
    hum_filter: MedianWindow,
    lens_filter: MedianWindow,
}

impl<B, C, L> SensorPipeline<B, C, L>
where
    B: BusMonitorPort,
    C: ClimatePort,
    L: LensProbePort,
{
    pub fn new(
        bus: B,
        climate: C,
        lens: L,
        config: Arc<ConfigStore>,
        cache: SharedCache,
        out: ProtocolOut,
    ) -> (Self, DryHandle) {
        let (dry, handle) = DryController::new();
        (
            Self {
                bus,
                climate,
                lens,
                config,
                cache,
                out,
                dry,
                bus_available: true,
                climate_available: true,
                lens_available: true,
                bus_last: None,
                climate_last: None,
                lens_last: None,
                volt_filter: MedianWindow::new(),
                curr_filter: MedianWindow::new(),
                temp_filter: MedianWindow::new(),
                hum_filter: MedianWindow::new(),
                lens_filter: MedianWindow::new(),
            },
            handle,
        )
    }

    /// One-shot boot probe. A sensor that does not answer is reported on
    /// the protocol stream and excluded from polling for this session.
    pub fn probe(&mut self) {
        if self.bus.read().is_err() {
            self.bus_available = false;
            self.out.send_line(r#"{"error":"INA219 sensor not found"}"#);
        }
        if self.climate.read().is_err() {
            self.climate_available = false;
            self.out.send_line(r#"{"error":"SHT40 sensor not found"}"#);
        }
        if self.lens.read().is_err() {
            self.lens_available = false;
            self.out.send_line(r#"{"error":"DS18B20 sensor not found"}"#);
        }
    }

    /// Advance the pipeline. `now_ms` is a monotonic millisecond clock.
    pub fn tick(&mut self, now_ms: u64) {
        let cfg = self.config.snapshot();

        if self.bus_available && due(self.bus_last, now_ms, cfg.intervals.bus_ms) {
            self.bus_last = Some(now_ms);
            self.acquire_bus(&cfg);
        }

        let mut fresh_humidity = None;
        if self.climate_available
            && !self.dry.suppressing()
            && due(self.climate_last, now_ms, cfg.intervals.climate_ms)
        {
            self.climate_last = Some(now_ms);
            fresh_humidity = self.acquire_climate(&cfg);
        }

        match self.dry.tick(now_ms, fresh_humidity, &cfg.auto_dry) {
            DryAction::StartBurst => {
                self.out
                    .send_line(r#"{"status":"starting sensor drying cycle"}"#);
                if let Err(e) = self.climate.heater_burst() {
                    warn!("autodry: heater burst failed ({e})");
                }
            }
            DryAction::Finished => {
                self.out
                    .send_line(r#"{"status":"sensor drying cycle complete"}"#);
            }
            DryAction::None => {}
        }

        if self.lens_available && due(self.lens_last, now_ms, cfg.intervals.lens_ms) {
            self.lens_last = Some(now_ms);
            self.acquire_lens(&cfg);
        }
    }

    fn acquire_bus(&mut self, cfg: &crate::config::Config) {
        match self.bus.read() {
            Ok(s) if s.voltage_v.is_finite() && s.current_ma.is_finite() => {
                let v = self.volt_filter.push(s.voltage_v, cfg.averaging.bus_voltage)
                    + cfg.offsets.bus_voltage;
                let i = self.curr_filter.push(s.current_ma, cfg.averaging.bus_current)
                    + cfg.offsets.bus_current;
                self.cache.with(|r| {
                    r.bus_voltage = Some(v);
                    r.bus_current = Some(i);
                    // milliamp input, watt output
                    r.bus_power = Some(v * i / 1000.0);
                });
            }
            _ => {
                self.volt_filter.reset();
                self.curr_filter.reset();
                self.cache.with(|r| {
                    r.bus_voltage = None;
                    r.bus_current = None;
                    r.bus_power = None;
                });
            }
        }
    }

    /// Returns the fresh filtered humidity (pre-offset) for the auto-dry
    /// detector; the configured offset is applied to the cached value only.
    fn acquire_climate(&mut self, cfg: &crate::config::Config) -> Option<f32> {
        match self.climate.read() {
            Ok(s) if s.temperature_c.is_finite() && s.humidity_pct.is_finite() => {
                let t = self
                    .temp_filter
                    .push(s.temperature_c, cfg.averaging.ambient_temp);
                let h = self
                    .hum_filter
                    .push(s.humidity_pct, cfg.averaging.ambient_humidity);

                let t_cal = t + cfg.offsets.ambient_temp;
                let h_cal = h + cfg.offsets.ambient_humidity;
                let dp = dew_point(t_cal, h_cal);
                self.cache.with(|r| {
                    r.ambient_temp = Some(t_cal);
                    r.ambient_humidity = Some(h_cal);
                    r.dew_point = dp;
                });
                Some(h)
            }
            _ => {
                // Assume the sensor left the bus; stop polling it.
                self.climate_available = false;
                self.temp_filter.reset();
                self.hum_filter.reset();
                self.cache.with(|r| {
                    r.ambient_temp = None;
                    r.ambient_humidity = None;
                    r.dew_point = None;
                });
                self.out
                    .send_line(r#"{"error":"SHT40 sensor disconnected"}"#);
                None
            }
        }
    }

    fn acquire_lens(&mut self, cfg: &crate::config::Config) {
        match self.lens.read() {
            Ok(t) if t.is_finite() => {
                let filtered = self.lens_filter.push(t, cfg.averaging.lens_temp);
                self.cache.with(|r| {
                    r.lens_temp = Some(filtered + cfg.offsets.lens_temp);
                });
            }
            _ => {
                self.lens_filter.reset();
                self.cache.with(|r| r.lens_temp = None);
            }
        }
    }
}

fn due(last: Option<u64>, now_ms: u64, interval_ms: u32) -> bool {
    match last {
        None => true,
        Some(last) => now_ms.saturating_sub(last) >= interval_ms as u64,
    }
}

/// Magnus-formula dew point. Humidity at or below zero has no defined dew
/// point and must not leak −∞ into downstream heater math.
pub fn dew_point(temperature_c: f32, humidity_pct: f32) -> Option<f32> {
    if humidity_pct <= 0.0 {
        return None;
    }
    const A: f32 = 17.62;
    const B: f32 = 243.12;
    let gamma = (humidity_pct / 100.0).ln() + (A * temperature_c) / (B + temperature_c);
    let dp = (B * gamma) / (A - gamma);
    dp.is_finite().then_some(dp)
}
