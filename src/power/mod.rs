//! Power-output arbiter.
//!
//! One ordered table unifies the three kinds of output behind a single
//! command surface and status projection:
//!
//! | index | name        | kind |
//! |-------|-------------|------|
//! | 0–4   | d1 … d5     | GPIO switch |
//! | 5, 6  | u12, u34    | GPIO switch (USB rails) |
//! | 7     | adj         | adjustable converter |
//! | 8, 9  | pwm1, pwm2  | dew-heater channel |
//!
//! Outputs marked Disabled in config refuse every enable request with an
//! error object and no state change; `{"set":{"all":…}}` skips them
//! silently.

pub mod converter;

use std::sync::{Arc, Mutex};

use log::info;
use serde_json::{json, Map, Value};

use crate::config::store::ConfigStore;
use crate::config::{Config, HeaterMode, OutputStartup};
use crate::control::heater::HeaterBank;
use crate::ports::{ProtocolOut, PwmChannelPort, SwitchBankPort};

use converter::VoltageConverter;

pub const OUTPUT_COUNT: usize = 10;

/// Wire names, in table order. These are protocol vocabulary.
pub const OUTPUT_NAMES: [&str; OUTPUT_COUNT] = [
    "d1", "d2", "d3", "d4", "d5", "u12", "u34", "adj", "pwm1", "pwm2",
];

/// Table index of the adjustable converter.
pub const ADJ: usize = 7;
/// Table indices of the heater channels.
pub const PWM1: usize = 8;
pub const PWM2: usize = 9;

pub struct PowerArbiter<S: SwitchBankPort, P: PwmChannelPort> {
    config: Arc<ConfigStore>,
    heaters: Arc<HeaterBank<P>>,
    converter: Arc<VoltageConverter<P>>,
    inner: Mutex<Switches<S>>,
}

struct Switches<S> {
    bank: S,
    /// Live on/off per table entry. Heater and converter status reads go
    /// to their owning components; this array is authoritative for the
    /// plain switches and the converter's on/off bit.
    states: [bool; OUTPUT_COUNT],
}

impl<S: SwitchBankPort, P: PwmChannelPort> PowerArbiter<S, P> {
    pub fn new(
        config: Arc<ConfigStore>,
        heaters: Arc<HeaterBank<P>>,
        converter: Arc<VoltageConverter<P>>,
        switches: S,
    ) -> Self {
        Self {
            config,
            heaters,
            converter,
            inner: Mutex::new(Switches {
                bank: switches,
                states: [false; OUTPUT_COUNT],
            }),
        }
    }

    /// Drive every output to its configured startup state. Disabled means
    /// physically off.
    pub fn apply_startup(&self) {
        let cfg = self.config.snapshot();
        let mut inner = self.inner.lock().unwrap();
        for index in 0..ADJ {
            let on = startup_of(&cfg, index) == OutputStartup::On;
            inner.bank.set_output(index, on);
            inner.states[index] = on;
        }

        let adj_on = cfg.startup.adj == OutputStartup::On;
        self.converter.set_state(adj_on, cfg.converter_preset_v);
        inner.states[ADJ] = adj_on;

        // Heater startup enables were seeded into the bank already.
        inner.states[PWM1] = self.heaters.is_enabled(0);
        inner.states[PWM2] = self.heaters.is_enabled(1);
        info!("power: startup states applied");
    }

    /// Whether a table entry is currently on.
    pub fn output_on(&self, index: usize) -> bool {
        match index {
            PWM1 => self.heaters.is_enabled(0),
            PWM2 => self.heaters.is_enabled(1),
            _ => self.inner.lock().unwrap().states[index],
        }
    }

    /// Switch one output. An enable against a Disabled entry emits the
    /// error object and changes nothing; returns whether it was applied.
    pub fn set_output(&self, index: usize, on: bool, out: &ProtocolOut) -> bool {
        if index >= OUTPUT_COUNT {
            return false;
        }
        if on && self.is_disabled(index) {
            out.send_line(&format!(
                "{{\"error\":\"Cannot enable disabled output: {}\"}}",
                OUTPUT_NAMES[index]
            ));
            return false;
        }

        match index {
            ADJ => {
                let preset = self.config.snapshot().converter_preset_v;
                self.converter.set_state(on, preset);
            }
            PWM1 => self.heaters.set_enabled(0, on),
            PWM2 => self.heaters.set_enabled(1, on),
            _ => self.inner.lock().unwrap().bank.set_output(index, on),
        }
        self.inner.lock().unwrap().states[index] = on;
        true
    }

    /// Apply a `{"set": …}` command object.
    pub fn handle_set(&self, set: &Value, out: &ProtocolOut) {
        let Some(obj) = set.as_object() else {
            return;
        };

        // "all" fans out to every output not marked Disabled.
        if let Some(all) = obj.get("all").and_then(value_flag) {
            for index in 0..OUTPUT_COUNT {
                if self.is_disabled(index) {
                    continue;
                }
                self.set_output(index, all, out);
            }
            return;
        }

        for (index, name) in OUTPUT_NAMES.iter().enumerate() {
            let Some(value) = obj.get(*name) else {
                continue;
            };

            if index == ADJ {
                if let Some(on) = value.as_bool() {
                    self.set_output(index, on, out);
                } else if let Some(volts) = value.as_f64() {
                    if volts <= 0.0 {
                        self.set_output(index, false, out);
                    } else {
                        self.converter.set_ram_target(volts as f32);
                        self.set_output(index, true, out);
                    }
                }
                continue;
            }

            if index == PWM1 || index == PWM2 {
                let heater = index - PWM1;
                if let Some(on) = value.as_bool() {
                    // Boolean-true returns the channel to its configured
                    // behavior: any session override is released.
                    if self.set_output(index, on, out) && on {
                        self.heaters.clear_override(heater);
                    }
                } else if let Some(power) = value.as_f64() {
                    let power = (power as i64).clamp(0, 100) as u8;
                    if self.set_output(index, true, out) {
                        self.heaters.set_override(heater, power);
                    }
                }
                continue;
            }

            // Plain switch: bool or int-as-bool.
            if let Some(on) = value_flag(value) {
                self.set_output(index, on, out);
            }
        }
    }

    /// The status projection returned for `{"get":"status"}` and after
    /// every `set`.
    pub fn status(&self) -> Value {
        let cfg = self.config.snapshot();
        let states = self.inner.lock().unwrap().states;

        let mut status = Map::new();
        for (index, name) in OUTPUT_NAMES.iter().enumerate() {
            let value = match index {
                ADJ => {
                    if states[ADJ] {
                        json!(self.converter.target(cfg.converter_preset_v))
                    } else {
                        json!(false)
                    }
                }
                PWM1 | PWM2 => heater_status(&cfg, self.heaters.as_ref(), index - PWM1),
                _ => json!(states[index] as u8),
            };
            status.insert((*name).into(), value);
        }

        json!({
            "status": status,
            // Live heater modes, for lightweight host-side detection.
            "dm": [cfg.heaters[0].mode.as_u8(), cfg.heaters[1].mode.as_u8()],
        })
    }

    fn is_disabled(&self, index: usize) -> bool {
        let cfg = self.config.snapshot();
        match index {
            PWM1 => cfg.heaters[0].mode == HeaterMode::Disabled,
            PWM2 => cfg.heaters[1].mode == HeaterMode::Disabled,
            _ => startup_of(&cfg, index) == OutputStartup::Disabled,
        }
    }
}

/// Heater entries report `true` while enabled in any automatic mode —
/// even at 0 % instantaneous power, so a host toggle stays on — and the
/// integer live power in manual mode.
fn heater_status<P: PwmChannelPort>(
    cfg: &Config,
    heaters: &HeaterBank<P>,
    heater: usize,
) -> Value {
    let enabled = heaters.is_enabled(heater);
    let mode = cfg.heaters[heater].mode;
    if enabled && mode.is_automatic() {
        json!(true)
    } else if enabled && mode == HeaterMode::Manual {
        json!(heaters.live_power(heater))
    } else {
        json!(false)
    }
}

fn startup_of(cfg: &Config, index: usize) -> OutputStartup {
    match index {
        0..=4 => cfg.startup.dc[index],
        5 => cfg.startup.usbc12,
        6 => cfg.startup.usb345,
        ADJ => cfg.startup.adj,
        _ => OutputStartup::Off,
    }
}

/// Command values for switches arrive as booleans or integers.
fn value_flag(v: &Value) -> Option<bool> {
    v.as_bool().or_else(|| v.as_i64().map(|n| n != 0))
}
