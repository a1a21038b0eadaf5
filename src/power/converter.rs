//! Adjustable buck-boost converter driver.
//!
//! The converter's feedback pin is driven by a filtered PWM: the output
//! voltage follows the duty linearly, with full scale at 15.0 V on an
//! 8-bit channel. A RAM override (sentinel −1.0 = "use the persisted
//! preset") lets the host set a session-only voltage without touching
//! the stored configuration.

use std::sync::Mutex;

use log::info;

use crate::ports::PwmChannelPort;

/// Hardware property of the converter circuit: output at 100 % duty.
pub const MAX_VOLTAGE: f32 = 15.0;

/// 8-bit feedback PWM.
pub const DUTY_MAX: u32 = 255;

/// RAM-override sentinel.
pub const OVERRIDE_NONE: f32 = -1.0;

pub struct VoltageConverter<P: PwmChannelPort> {
    inner: Mutex<Inner<P>>,
}

struct Inner<P> {
    pwm: P,
    ram_target_v: f32,
}

impl<P: PwmChannelPort> VoltageConverter<P> {
    pub fn new(mut pwm: P) -> Self {
        pwm.set_duty(0);
        Self {
            inner: Mutex::new(Inner {
                pwm,
                ram_target_v: OVERRIDE_NONE,
            }),
        }
    }

    /// Drive the converter on at the resolved target, or off (duty 0).
    ///
    /// `preset_v` is the persisted preset from the caller's config
    /// snapshot; a pending RAM override wins over it.
    pub fn set_state(&self, on: bool, preset_v: f32) {
        let mut inner = self.inner.lock().unwrap();
        if on {
            let target = resolve(inner.ram_target_v, preset_v);
            let duty = ((target / MAX_VOLTAGE) * DUTY_MAX as f32) as u32;
            info!("converter: on, target {target:.2} V (duty {duty})");
            inner.pwm.set_duty(duty);
        } else {
            inner.pwm.set_duty(0);
        }
    }

    /// Set a session-only target voltage. Takes effect on the next
    /// `set_state(true, ..)`.
    pub fn set_ram_target(&self, volts: f32) {
        self.inner.lock().unwrap().ram_target_v = volts;
    }

    /// The voltage `set_state(true, ..)` would currently drive.
    pub fn target(&self, preset_v: f32) -> f32 {
        resolve(self.inner.lock().unwrap().ram_target_v, preset_v)
    }
}

fn resolve(ram_target_v: f32, preset_v: f32) -> f32 {
    let target = if ram_target_v >= 0.0 {
        ram_target_v
    } else {
        preset_v
    };
    target.clamp(0.0, MAX_VOLTAGE)
}
