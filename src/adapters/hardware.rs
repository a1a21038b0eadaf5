//! Hardware adapters and their simulation counterparts.
//!
//! The ESP-IDF side talks to the real board: an INA219 power monitor and
//! SHT40 climate sensor on I²C, a DS18B20 probe on a OneWire pin, seven
//! GPIO power switches, LEDC PWM channels for the heaters and the
//! converter, and the UART console for the protocol stream.
//!
//! The simulation side (host builds and tests) implements the same port
//! traits with injectable values, so the whole control plane runs and
//! tests without hardware.

use std::io::{self, BufRead, Write as _};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::ports::{ByteStream, LineSink};

// ── Board constants ───────────────────────────────────────────

/// GPIO per switched output, in power-table order (d1..d5, u12, u34).
pub const SWITCH_GPIOS: [i32; 7] = [13, 12, 14, 27, 26, 19, 18];

pub const CONVERTER_GPIO: i32 = 25;
pub const HEATER_GPIOS: [i32; 2] = [33, 32];

pub const I2C_SDA_GPIO: i32 = 21;
pub const I2C_SCL_GPIO: i32 = 22;
pub const ONE_WIRE_GPIO: i32 = 23;

pub const INA219_ADDR: u8 = 0x40;
pub const SHT40_ADDR: u8 = 0x44;

/// Converter feedback PWM: 5 kHz keeps the RC filter ripple negligible.
pub const CONVERTER_PWM_FREQ_HZ: u32 = 5_000;
pub const CONVERTER_PWM_BITS: u32 = 8;

// ── Console byte stream (both targets) ────────────────────────

/// Serial input via the console. A reader thread drains stdin (the UART
/// console on ESP-IDF) into a channel; `read` polls it with a short
/// timeout so the serial task keeps feeding the watchdog while idle.
pub struct ConsoleByteStream {
    rx: Receiver<u8>,
}

impl ConsoleByteStream {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || {
                let stdin = io::stdin();
                let mut handle = stdin.lock();
                loop {
                    let buf = match handle.fill_buf() {
                        Ok(buf) if !buf.is_empty() => buf.to_vec(),
                        _ => {
                            thread::sleep(Duration::from_millis(10));
                            continue;
                        }
                    };
                    handle.consume(buf.len());
                    for b in buf {
                        if tx.send(b).is_err() {
                            return;
                        }
                    }
                }
            })
            .expect("serial reader thread");
        Self { rx }
    }
}

impl Default for ConsoleByteStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStream for ConsoleByteStream {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        // Block briefly for the first byte, then drain what's queued.
        match self.rx.recv_timeout(Duration::from_millis(10)) {
            Ok(b) => {
                buf[n] = b;
                n += 1;
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return 0,
        }
        while n < buf.len() {
            match self.rx.try_recv() {
                Ok(b) => {
                    buf[n] = b;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        n
    }
}

// ── Serial sink (both targets) ────────────────────────────────

/// Protocol output on the console. The internal mutex is the single
/// serial write lock: a line is emitted whole or not at all.
#[derive(Default)]
pub struct SerialSink {
    write_lock: Mutex<()>,
}

impl SerialSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineSink for SerialSink {
    fn send_line(&self, line: &str) {
        let _guard = self.write_lock.lock().unwrap();
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

// ── ESP-IDF adapters ──────────────────────────────────────────

#[cfg(target_os = "espidf")]
mod esp {
    use std::sync::{Arc, Mutex};

    use esp_idf_svc::hal::delay::FreeRtos;
    use esp_idf_svc::hal::i2c::I2cDriver;
    use esp_idf_svc::sys::*;
    use log::info;

    use super::*;
    use crate::ports::{
        BusMonitorPort, BusSample, ClimatePort, ClimateSample, HeapStats, LensProbePort,
        PwmChannelPort, SensorError, SwitchBankPort, SystemPort,
    };

    /// Shared I²C bus: the INA219 and SHT40 adapters each hold a handle.
    pub type SharedI2c = Arc<Mutex<I2cDriver<'static>>>;

    const I2C_TIMEOUT: u32 = 100;

    // ── INA219 bus monitor ────────────────────────────────────

    const INA_REG_CONFIG: u8 = 0x00;
    const INA_REG_SHUNT_VOLTAGE: u8 = 0x01;
    const INA_REG_BUS_VOLTAGE: u8 = 0x02;

    /// 32 V range, /8 gain (±320 mV), 12-bit conversions, continuous
    /// shunt+bus sampling.
    const INA_CONFIG: u16 = 0x399F;

    /// R005 shunt: I = V_shunt / 0.005.
    const SHUNT_RESISTANCE_OHMS: f32 = 0.005;

    pub struct InaBusMonitor {
        i2c: SharedI2c,
    }

    impl InaBusMonitor {
        pub fn new(i2c: SharedI2c) -> Self {
            let monitor = Self { i2c };
            // Best-effort: a missing chip surfaces on the first read.
            if monitor.write_reg(INA_REG_CONFIG, INA_CONFIG).is_ok() {
                info!("ina219: configured for 0.005 ohm shunt");
            }
            monitor
        }

        fn write_reg(&self, reg: u8, value: u16) -> Result<(), SensorError> {
            let bytes = [reg, (value >> 8) as u8, value as u8];
            self.i2c
                .lock()
                .unwrap()
                .write(INA219_ADDR, &bytes, I2C_TIMEOUT)
                .map_err(|_| SensorError::BusError)
        }

        fn read_reg(&self, reg: u8) -> Result<u16, SensorError> {
            let mut buf = [0u8; 2];
            self.i2c
                .lock()
                .unwrap()
                .write_read(INA219_ADDR, &[reg], &mut buf, I2C_TIMEOUT)
                .map_err(|_| SensorError::NotConnected)?;
            Ok(u16::from_be_bytes(buf))
        }
    }

    impl BusMonitorPort for InaBusMonitor {
        fn read(&mut self) -> Result<BusSample, SensorError> {
            // Bus voltage register: value in bits 15..3, LSB = 4 mV.
            let bus_raw = self.read_reg(INA_REG_BUS_VOLTAGE)?;
            let voltage_v = ((bus_raw >> 3) as f32) * 0.004;

            // Shunt voltage register: signed, LSB = 10 µV.
            // mV across the shunt over ohms gives mA directly.
            let shunt_raw = self.read_reg(INA_REG_SHUNT_VOLTAGE)? as i16;
            let shunt_mv = shunt_raw as f32 * 0.01;
            let current_ma = shunt_mv / SHUNT_RESISTANCE_OHMS;

            Ok(BusSample {
                voltage_v,
                current_ma,
            })
        }
    }

    // ── SHT40 climate sensor ──────────────────────────────────

    /// High-precision measurement, no heater.
    const SHT_CMD_MEASURE: u8 = 0xFD;
    /// 200 mW heater for 1 s, then a high-precision measurement.
    const SHT_CMD_HEAT_HIGH_1S: u8 = 0x39;

    pub struct Sht40Climate {
        i2c: SharedI2c,
    }

    impl Sht40Climate {
        pub fn new(i2c: SharedI2c) -> Self {
            Self { i2c }
        }

        fn command(&self, cmd: u8, wait_ms: u32) -> Result<[u8; 6], SensorError> {
            {
                let mut bus = self.i2c.lock().unwrap();
                bus.write(SHT40_ADDR, &[cmd], I2C_TIMEOUT)
                    .map_err(|_| SensorError::NotConnected)?;
            }
            FreeRtos::delay_ms(wait_ms);
            let mut buf = [0u8; 6];
            self.i2c
                .lock()
                .unwrap()
                .read(SHT40_ADDR, &mut buf, I2C_TIMEOUT)
                .map_err(|_| SensorError::BusError)?;
            Ok(buf)
        }
    }

    impl ClimatePort for Sht40Climate {
        fn read(&mut self) -> Result<ClimateSample, SensorError> {
            let buf = self.command(SHT_CMD_MEASURE, 10)?;
            let raw_t = u16::from_be_bytes([buf[0], buf[1]]) as f32;
            let raw_h = u16::from_be_bytes([buf[3], buf[4]]) as f32;
            Ok(ClimateSample {
                temperature_c: -45.0 + 175.0 * raw_t / 65535.0,
                humidity_pct: -6.0 + 125.0 * raw_h / 65535.0,
            })
        }

        fn heater_burst(&mut self) -> Result<(), SensorError> {
            // The heated measurement completes after ~1.1 s; its reading
            // comes from a hot die and is discarded.
            let _ = self.command(SHT_CMD_HEAT_HIGH_1S, 1100)?;
            Ok(())
        }
    }

    // ── DS18B20 lens probe (bit-banged OneWire) ───────────────

    pub struct Ds18b20Probe {
        pin: i32,
    }

    impl Ds18b20Probe {
        pub fn new(pin: i32) -> Self {
            // Open-drain with pull-up: the bus idles high.
            unsafe {
                gpio_set_direction(pin, gpio_mode_t_GPIO_MODE_INPUT_OUTPUT_OD);
                gpio_set_pull_mode(pin, gpio_pull_mode_t_GPIO_PULLUP_ONLY);
                gpio_set_level(pin, 1);
            }
            Self { pin }
        }

        fn drive_low(&self) {
            unsafe { gpio_set_level(self.pin, 0) };
        }

        fn release(&self) {
            unsafe { gpio_set_level(self.pin, 1) };
        }

        fn sample(&self) -> bool {
            unsafe { gpio_get_level(self.pin) != 0 }
        }

        fn delay_us(us: u32) {
            unsafe { esp_rom_delay_us(us) };
        }

        /// Reset pulse; true when a device answers with presence.
        fn reset(&self) -> bool {
            self.drive_low();
            Self::delay_us(480);
            self.release();
            Self::delay_us(70);
            let present = !self.sample();
            Self::delay_us(410);
            present
        }

        fn write_byte(&self, mut byte: u8) {
            for _ in 0..8 {
                if byte & 1 != 0 {
                    self.drive_low();
                    Self::delay_us(6);
                    self.release();
                    Self::delay_us(64);
                } else {
                    self.drive_low();
                    Self::delay_us(60);
                    self.release();
                    Self::delay_us(10);
                }
                byte >>= 1;
            }
        }

        fn read_byte(&self) -> u8 {
            let mut byte = 0u8;
            for bit in 0..8 {
                self.drive_low();
                Self::delay_us(6);
                self.release();
                Self::delay_us(9);
                if self.sample() {
                    byte |= 1 << bit;
                }
                Self::delay_us(55);
            }
            byte
        }
    }

    impl LensProbePort for Ds18b20Probe {
        fn read(&mut self) -> Result<f32, SensorError> {
            if !self.reset() {
                return Err(SensorError::NotConnected);
            }
            self.write_byte(0xCC); // skip ROM (single device on the bus)
            self.write_byte(0x44); // convert T
            FreeRtos::delay_ms(750); // 12-bit conversion time

            if !self.reset() {
                return Err(SensorError::NotConnected);
            }
            self.write_byte(0xCC);
            self.write_byte(0xBE); // read scratchpad
            let lsb = self.read_byte();
            let msb = self.read_byte();

            let raw = i16::from_le_bytes([lsb, msb]);
            // 0x0550 is the power-on reset value (85 °C): conversion
            // never ran, treat as a failed read. An all-ones bus reads
            // as -0.0625 steps of 0xFFFF; both are implausible here.
            if raw == 0x0550 || raw == -1 {
                return Err(SensorError::InvalidReading);
            }
            Ok(raw as f32 / 16.0)
        }
    }

    // ── GPIO switch bank ──────────────────────────────────────

    pub struct GpioSwitchBank;

    impl GpioSwitchBank {
        pub fn new() -> Self {
            for &pin in &SWITCH_GPIOS {
                // SAFETY: output config on dedicated pins, before tasks start.
                unsafe {
                    gpio_set_direction(pin, gpio_mode_t_GPIO_MODE_OUTPUT);
                    gpio_set_level(pin, 0);
                }
            }
            Self
        }
    }

    impl SwitchBankPort for GpioSwitchBank {
        fn set_output(&mut self, index: usize, on: bool) {
            if let Some(&pin) = SWITCH_GPIOS.get(index) {
                // SAFETY: pin configured as output in new().
                unsafe { gpio_set_level(pin, on as u32) };
            }
        }
    }

    // ── LEDC PWM channel ──────────────────────────────────────

    pub struct LedcPwm {
        channel: u32,
    }

    impl LedcPwm {
        /// Configure one LEDC timer + channel pair. Each PWM consumer
        /// gets its own timer so frequencies stay independent.
        pub fn new(timer: u32, channel: u32, gpio: i32, freq_hz: u32, bits: u32) -> Self {
            // SAFETY: called once per channel from the composition root.
            unsafe {
                ledc_timer_config(&ledc_timer_config_t {
                    speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
                    timer_num: timer,
                    duty_resolution: bits,
                    freq_hz,
                    clk_cfg: soc_periph_ledc_clk_src_legacy_t_LEDC_AUTO_CLK,
                    ..Default::default()
                });
                ledc_channel_config(&ledc_channel_config_t {
                    speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
                    channel,
                    timer_sel: timer,
                    gpio_num: gpio,
                    duty: 0,
                    hpoint: 0,
                    ..Default::default()
                });
            }
            Self { channel }
        }
    }

    impl PwmChannelPort for LedcPwm {
        fn set_duty(&mut self, duty: u32) {
            // SAFETY: channel configured in new(); set+update is the
            // documented glitch-free way to change LEDC duty.
            unsafe {
                ledc_set_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, self.channel, duty);
                ledc_update_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, self.channel);
            }
        }
    }

    // ── System port ───────────────────────────────────────────

    #[derive(Clone)]
    pub struct EspSystem;

    impl SystemPort for EspSystem {
        fn restart(&mut self) {
            unsafe { esp_restart() };
        }

        fn heap_stats(&self) -> HeapStats {
            // SAFETY: read-only heap accounting calls.
            unsafe {
                HeapStats {
                    free: esp_get_free_heap_size(),
                    min_free: esp_get_minimum_free_heap_size(),
                    max_alloc: heap_caps_get_largest_free_block(MALLOC_CAP_8BIT) as u32,
                    size: heap_caps_get_total_size(MALLOC_CAP_8BIT) as u32,
                }
            }
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::{
    Ds18b20Probe, EspSystem, GpioSwitchBank, InaBusMonitor, LedcPwm, SharedI2c, Sht40Climate,
};

// ── Simulation adapters ───────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::ports::{
        BusMonitorPort, BusSample, ClimatePort, ClimateSample, HeapStats, LensProbePort,
        LineSink, PwmChannelPort, SensorError, SwitchBankPort, SystemPort,
    };

    /// Injectable bus monitor.
    #[derive(Clone, Default)]
    pub struct SimBusMonitor {
        state: Arc<Mutex<(f32, f32, bool)>>,
    }

    impl SimBusMonitor {
        pub fn new() -> Self {
            Self::default()
        }
        pub fn set(&self, voltage_v: f32, current_ma: f32) {
            let mut s = self.state.lock().unwrap();
            s.0 = voltage_v;
            s.1 = current_ma;
        }
        pub fn fail(&self, failing: bool) {
            self.state.lock().unwrap().2 = failing;
        }
    }

    impl BusMonitorPort for SimBusMonitor {
        fn read(&mut self) -> Result<BusSample, SensorError> {
            let s = self.state.lock().unwrap();
            if s.2 {
                return Err(SensorError::NotConnected);
            }
            Ok(BusSample {
                voltage_v: s.0,
                current_ma: s.1,
            })
        }
    }

    /// Injectable climate sensor; counts heater bursts for the auto-dry
    /// tests.
    #[derive(Clone, Default)]
    pub struct SimClimate {
        state: Arc<Mutex<(f32, f32, bool)>>,
        bursts: Arc<AtomicUsize>,
    }

    impl SimClimate {
        pub fn new() -> Self {
            Self::default()
        }
        pub fn set(&self, temperature_c: f32, humidity_pct: f32) {
            let mut s = self.state.lock().unwrap();
            s.0 = temperature_c;
            s.1 = humidity_pct;
        }
        pub fn fail(&self, failing: bool) {
            self.state.lock().unwrap().2 = failing;
        }
        pub fn burst_count(&self) -> usize {
            self.bursts.load(Ordering::Relaxed)
        }
    }

    impl ClimatePort for SimClimate {
        fn read(&mut self) -> Result<ClimateSample, SensorError> {
            let s = self.state.lock().unwrap();
            if s.2 {
                return Err(SensorError::NotConnected);
            }
            Ok(ClimateSample {
                temperature_c: s.0,
                humidity_pct: s.1,
            })
        }

        fn heater_burst(&mut self) -> Result<(), SensorError> {
            self.bursts.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Injectable lens probe.
    #[derive(Clone, Default)]
    pub struct SimLensProbe {
        state: Arc<Mutex<(f32, bool)>>,
    }

    impl SimLensProbe {
        pub fn new() -> Self {
            Self::default()
        }
        pub fn set(&self, temperature_c: f32) {
            self.state.lock().unwrap().0 = temperature_c;
        }
        pub fn fail(&self, failing: bool) {
            self.state.lock().unwrap().1 = failing;
        }
    }

    impl LensProbePort for SimLensProbe {
        fn read(&mut self) -> Result<f32, SensorError> {
            let s = self.state.lock().unwrap();
            if s.1 {
                return Err(SensorError::NotConnected);
            }
            Ok(s.0)
        }
    }

    /// Records switch states for inspection.
    #[derive(Clone, Default)]
    pub struct SimSwitchBank {
        states: Arc<Mutex<[bool; 10]>>,
    }

    impl SimSwitchBank {
        pub fn new() -> Self {
            Self::default()
        }
        pub fn is_on(&self, index: usize) -> bool {
            self.states.lock().unwrap()[index]
        }
    }

    impl SwitchBankPort for SimSwitchBank {
        fn set_output(&mut self, index: usize, on: bool) {
            if let Some(slot) = self.states.lock().unwrap().get_mut(index) {
                *slot = on;
            }
        }
    }

    /// Records the last duty written.
    #[derive(Clone, Default)]
    pub struct SimPwm {
        last_duty: Arc<AtomicU32>,
    }

    impl SimPwm {
        pub fn new() -> Self {
            Self::default()
        }
        pub fn duty(&self) -> u32 {
            self.last_duty.load(Ordering::Relaxed)
        }
    }

    impl PwmChannelPort for SimPwm {
        fn set_duty(&mut self, duty: u32) {
            self.last_duty.store(duty, Ordering::Relaxed);
        }
    }

    /// Collects protocol lines for assertions.
    #[derive(Clone, Default)]
    pub struct CollectingSink {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl CollectingSink {
        pub fn new() -> Self {
            Self::default()
        }
        pub fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
        pub fn clear(&self) {
            self.lines.lock().unwrap().clear();
        }
    }

    impl LineSink for CollectingSink {
        fn send_line(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }
    }

    /// Host system port: restart requests are recorded, heap stats are
    /// injectable.
    #[derive(Clone, Default)]
    pub struct SimSystem {
        restarts: Arc<AtomicU32>,
        heap: Arc<Mutex<HeapStats>>,
    }

    impl SimSystem {
        pub fn new() -> Self {
            Self::default()
        }
        pub fn restart_count(&self) -> u32 {
            self.restarts.load(Ordering::Relaxed)
        }
        pub fn set_heap(&self, heap: HeapStats) {
            *self.heap.lock().unwrap() = heap;
        }
    }

    impl SystemPort for SimSystem {
        fn restart(&mut self) {
            self.restarts.fetch_add(1, Ordering::Relaxed);
        }

        fn heap_stats(&self) -> HeapStats {
            *self.heap.lock().unwrap()
        }
    }
}

#[cfg(not(target_os = "espidf"))]
pub use sim::{
    CollectingSink, SimBusMonitor, SimClimate, SimLensProbe, SimPwm, SimSwitchBank, SimSystem,
};
