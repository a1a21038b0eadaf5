//! Dew-heater controller.
//!
//! Two PWM channels behind one lock, ticked every 5 s — the heaters have
//! multi-second thermal inertia, so a faster loop only adds CPU load and
//! PID noise. Each tick takes the caller-provided config and sensor
//! snapshots, dispatches per-channel mode logic and emits gamma-corrected
//! duty on the hardware channel.
//!
//! Safety gate: automatic modes require their input sensors to be
//! present. A missing dew point or probe temperature forces 0 % for that
//! tick; the channel stays enabled and recovers as soon as readings
//! return.

use std::sync::Mutex;

use log::info;

use crate::config::{Config, HeaterMode, MAX_HEATERS};
use crate::ports::PwmChannelPort;
use crate::sensors::SensorReadings;

use super::pid::Pid;

/// Control loop period.
pub const TICK_MS: u64 = 5_000;
const TICK_SECS: f64 = TICK_MS as f64 / 1000.0;

/// 100 Hz carrier: slow enough for the MOSFETs, fast enough that a power
/// meter on the rail reads a stable average.
pub const PWM_FREQUENCY_HZ: u32 = 100;
pub const PWM_RESOLUTION_BITS: u32 = 10;
pub const PWM_MAX: u32 = (1 << PWM_RESOLUTION_BITS) - 1;

/// RAM-override sentinel: no override, run the configured mode.
pub const OVERRIDE_NONE: i32 = -1;

/// Gamma-corrected duty for a requested power percentage.
///
/// A resistive load's delivered power goes with the square of the duty
/// voltage, so the duty is corrected with an exponent below one. γ = 2.5
/// centres the measured power curve on the requested percentage.
pub fn gamma_duty(power: u8) -> u32 {
    if power == 0 {
        return 0;
    }
    if power >= 100 {
        return PWM_MAX;
    }
    let ratio = (power as f32 / 100.0).powf(1.0 / 2.5);
    (ratio * PWM_MAX as f32).round() as u32
}

/// Ambient-tracking ramp: full power at `delta <= end_delta`, zero at
/// `delta >= start_delta`, linear in between. Continuous at both ends.
pub fn ambient_track_power(delta: f32, start_delta: f32, end_delta: f32, max_power: u8) -> u8 {
    let max = max_power.min(100) as f32;
    let power = if delta <= end_delta {
        max
    } else if delta < start_delta {
        (start_delta - delta) / (start_delta - end_delta) * max
    } else {
        0.0
    };
    power.round().clamp(0.0, max) as u8
}

struct Channel {
    enabled: bool,
    live_power: u8,
    pwm_override: i32,
    pid: Pid,
}

struct Bank<P> {
    channels: [Channel; MAX_HEATERS],
    pwm: [P; MAX_HEATERS],
}

/// The two heater channels. Enable/override entry points are called from
/// the power arbiter; `tick` runs on the dedicated control task.
pub struct HeaterBank<P: PwmChannelPort> {
    inner: Mutex<Bank<P>>,
}

impl<P: PwmChannelPort> HeaterBank<P> {
    /// Build the bank, seed the PID gains from config and apply the
    /// per-channel startup enables. Both channels start at 0 % until the
    /// first control tick.
    pub fn new(mut pwm: [P; MAX_HEATERS], cfg: &Config) -> Self {
        for p in pwm.iter_mut() {
            p.set_duty(0);
        }
        let channels = core::array::from_fn(|i| {
            let h = &cfg.heaters[i];
            Channel {
                enabled: h.enabled_on_startup,
                live_power: 0,
                pwm_override: OVERRIDE_NONE,
                pid: Pid::new(h.pid_kp, h.pid_ki, h.pid_kd),
            }
        });
        Self {
            inner: Mutex::new(Bank { channels, pwm }),
        }
    }

    /// Enable or disable a channel. Disabling kills the PWM immediately
    /// rather than waiting for the next control tick.
    pub fn set_enabled(&self, index: usize, enabled: bool) {
        if index >= MAX_HEATERS {
            return;
        }
        let mut bank = self.inner.lock().unwrap();
        bank.channels[index].enabled = enabled;
        if !enabled {
            bank.channels[index].live_power = 0;
            bank.pwm[index].set_duty(0);
        }
    }

    pub fn is_enabled(&self, index: usize) -> bool {
        index < MAX_HEATERS && self.inner.lock().unwrap().channels[index].enabled
    }

    /// Live power of the last tick, in percent.
    pub fn live_power(&self, index: usize) -> u8 {
        if index >= MAX_HEATERS {
            return 0;
        }
        self.inner.lock().unwrap().channels[index].live_power
    }

    /// Force the channel to a fixed power, bypassing mode logic until the
    /// override is released.
    pub fn set_override(&self, index: usize, power: u8) {
        if index >= MAX_HEATERS {
            return;
        }
        let power = power.min(100);
        info!("heater {index}: PWM override {power}%");
        self.inner.lock().unwrap().channels[index].pwm_override = power as i32;
    }

    /// Release a RAM override; the configured mode takes back over on the
    /// next tick.
    pub fn clear_override(&self, index: usize) {
        if index >= MAX_HEATERS {
            return;
        }
        self.inner.lock().unwrap().channels[index].pwm_override = OVERRIDE_NONE;
    }

    /// One control tick over both channels.
    ///
    /// The config and sensor snapshots come from the caller's own brief
    /// critical sections; this method holds only the bank's lock.
    pub fn tick(&self, cfg: &Config, readings: &SensorReadings) {
        let mut bank = self.inner.lock().unwrap();
        for index in 0..MAX_HEATERS {
            // Captured before the mutable borrow: the follower reads the
            // leader's power as computed so far this tick.
            let leader_power = bank.channels[1 - index].live_power;

            let hc = &cfg.heaters[index];
            let ch = &mut bank.channels[index];

            let power = if !ch.enabled || hc.mode == HeaterMode::Disabled {
                0
            } else if ch.pwm_override >= 0 {
                ch.pwm_override.clamp(0, 100) as u8
            } else {
                match hc.mode {
                    HeaterMode::Manual => hc.manual_power.min(100),

                    HeaterMode::Pid | HeaterMode::MinTemp => {
                        match (readings.dew_point, readings.lens_temp) {
                            (Some(dew), Some(lens)) => {
                                let mut setpoint = (dew + hc.target_offset) as f64;
                                if hc.mode == HeaterMode::MinTemp {
                                    setpoint = setpoint.max(hc.min_temp as f64);
                                }
                                // Tunings may have changed since last tick.
                                ch.pid.set_tunings(hc.pid_kp, hc.pid_ki, hc.pid_kd);
                                let out = ch.pid.compute(lens as f64, setpoint, TICK_SECS);
                                (out.floor() as i64).clamp(0, 100) as u8
                            }
                            _ => 0,
                        }
                    }

                    HeaterMode::AmbientTrack => {
                        match (readings.dew_point, readings.ambient_temp) {
                            (Some(dew), Some(ambient)) => ambient_track_power(
                                ambient - dew,
                                hc.start_delta,
                                hc.end_delta,
                                hc.max_power,
                            ),
                            _ => 0,
                        }
                    }

                    HeaterMode::Follower => {
                        // Mirroring an open-loop leader could run away; only
                        // a PID leader is followed.
                        if cfg.heaters[1 - index].mode == HeaterMode::Pid {
                            let scaled = leader_power as f32 * hc.pid_sync_factor;
                            (scaled.round() as i64).clamp(0, 100) as u8
                        } else {
                            0
                        }
                    }

                    HeaterMode::Disabled => 0,
                }
            };

            ch.live_power = power;
            bank.pwm[index].set_duty(gamma_duty(power));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::hardware::SimPwm;
    use crate::config::HeaterConfig;

    fn readings(dew: Option<f32>, lens: Option<f32>, ambient: Option<f32>) -> SensorReadings {
        SensorReadings {
            dew_point: dew,
            lens_temp: lens,
            ambient_temp: ambient,
            ..Default::default()
        }
    }

    fn bank_with(
        f: impl FnOnce(&mut [HeaterConfig; MAX_HEATERS]),
    ) -> (HeaterBank<SimPwm>, [SimPwm; 2], Config) {
        let mut cfg = Config::default();
        f(&mut cfg.heaters);
        let pwm = [SimPwm::new(), SimPwm::new()];
        let bank = HeaterBank::new([pwm[0].clone(), pwm[1].clone()], &cfg);
        (bank, pwm, cfg)
    }

    #[test]
    fn gamma_endpoints_are_exact() {
        assert_eq!(gamma_duty(0), 0);
        assert_eq!(gamma_duty(100), PWM_MAX);
    }

    #[test]
    fn gamma_midpoint_matches_curve() {
        // (0.5)^(1/2.5) * 1023 = 775.3
        assert_eq!(gamma_duty(50), 775);
        assert_eq!(gamma_duty(1), 162);
    }

    #[test]
    fn manual_mode_emits_configured_power() {
        let (bank, pwm, cfg) = bank_with(|h| {
            h[0].mode = HeaterMode::Manual;
            h[0].manual_power = 50;
            h[0].enabled_on_startup = true;
        });
        bank.tick(&cfg, &readings(None, None, None));
        assert_eq!(bank.live_power(0), 50);
        assert_eq!(pwm[0].duty(), gamma_duty(50));
    }

    #[test]
    fn disabled_channel_emits_zero() {
        let (bank, pwm, cfg) = bank_with(|h| {
            h[0].mode = HeaterMode::Manual;
            h[0].manual_power = 80;
        });
        // Not enabled on startup.
        bank.tick(&cfg, &readings(None, None, None));
        assert_eq!(bank.live_power(0), 0);
        assert_eq!(pwm[0].duty(), 0);
    }

    #[test]
    fn pid_mode_blanks_on_missing_lens_probe() {
        let (bank, pwm, cfg) = bank_with(|h| {
            h[0].mode = HeaterMode::Pid;
            h[0].enabled_on_startup = true;
        });
        bank.tick(&cfg, &readings(Some(5.0), None, Some(10.0)));
        assert_eq!(bank.live_power(0), 0);
        assert_eq!(pwm[0].duty(), 0);
        assert!(bank.is_enabled(0), "safety gate must not disable the channel");
    }

    #[test]
    fn pid_mode_heats_towards_setpoint() {
        let (bank, pwm, cfg) = bank_with(|h| {
            h[0].mode = HeaterMode::Pid;
            h[0].enabled_on_startup = true;
        });
        // Lens 10 degrees below the setpoint with kp=20 saturates the loop.
        bank.tick(&cfg, &readings(Some(10.0), Some(3.0), None));
        assert_eq!(bank.live_power(0), 100);
        assert_eq!(pwm[0].duty(), PWM_MAX);
    }

    #[test]
    fn min_temp_mode_raises_setpoint_floor() {
        let (bank, _, cfg) = bank_with(|h| {
            h[0].mode = HeaterMode::MinTemp;
            h[0].min_temp = 30.0;
            h[0].enabled_on_startup = true;
        });
        // Dew point target would be 0+3, but min_temp lifts it to 30.
        bank.tick(&cfg, &readings(Some(0.0), Some(20.0), None));
        assert_eq!(bank.live_power(0), 100);
    }

    #[test]
    fn ambient_track_ramp_table() {
        // start_delta=5, end_delta=1, max_power=80
        assert_eq!(ambient_track_power(0.5, 5.0, 1.0, 80), 80);
        assert_eq!(ambient_track_power(1.0, 5.0, 1.0, 80), 80);
        assert_eq!(ambient_track_power(3.0, 5.0, 1.0, 80), 40);
        assert_eq!(ambient_track_power(5.0, 5.0, 1.0, 80), 0);
        assert_eq!(ambient_track_power(6.0, 5.0, 1.0, 80), 0);
    }

    #[test]
    fn ambient_track_requires_both_sensors() {
        let (bank, _, cfg) = bank_with(|h| {
            h[1].mode = HeaterMode::AmbientTrack;
            h[1].enabled_on_startup = true;
        });
        bank.tick(&cfg, &readings(Some(8.0), Some(9.0), None));
        assert_eq!(bank.live_power(1), 0);

        bank.tick(&cfg, &readings(Some(8.0), None, Some(9.0)));
        assert_eq!(bank.live_power(1), 80, "delta 1.0 is full power");
    }

    #[test]
    fn follower_ignores_manual_leader() {
        let (bank, _, cfg) = bank_with(|h| {
            h[0].mode = HeaterMode::Manual;
            h[0].manual_power = 50;
            h[0].enabled_on_startup = true;
            h[1].mode = HeaterMode::Follower;
            h[1].pid_sync_factor = 0.5;
            h[1].enabled_on_startup = true;
        });
        bank.tick(&cfg, &readings(None, None, None));
        assert_eq!(bank.live_power(0), 50);
        // Leader is not closed-loop: follower must stay off, not emit 25.
        assert_eq!(bank.live_power(1), 0);
    }

    #[test]
    fn follower_scales_pid_leader() {
        let (bank, _, cfg) = bank_with(|h| {
            h[0].mode = HeaterMode::Pid;
            h[0].enabled_on_startup = true;
            h[1].mode = HeaterMode::Follower;
            h[1].pid_sync_factor = 0.5;
            h[1].enabled_on_startup = true;
        });
        // Saturate the leader at 100%.
        bank.tick(&cfg, &readings(Some(10.0), Some(3.0), None));
        assert_eq!(bank.live_power(0), 100);
        assert_eq!(bank.live_power(1), 50);
    }

    #[test]
    fn override_bypasses_mode_and_sensor_gate() {
        let (bank, pwm, cfg) = bank_with(|h| {
            h[0].mode = HeaterMode::Pid;
            h[0].enabled_on_startup = true;
        });
        bank.set_override(0, 60);
        bank.tick(&cfg, &readings(None, None, None));
        assert_eq!(bank.live_power(0), 60);
        assert_eq!(pwm[0].duty(), gamma_duty(60));

        bank.clear_override(0);
        bank.tick(&cfg, &readings(None, None, None));
        assert_eq!(bank.live_power(0), 0, "PID gate applies again");
    }

    #[test]
    fn disable_kills_pwm_immediately() {
        let (bank, pwm, cfg) = bank_with(|h| {
            h[0].mode = HeaterMode::Manual;
            h[0].manual_power = 70;
            h[0].enabled_on_startup = true;
        });
        bank.tick(&cfg, &readings(None, None, None));
        assert!(pwm[0].duty() > 0);
        bank.set_enabled(0, false);
        assert_eq!(pwm[0].duty(), 0);
        assert_eq!(bank.live_power(0), 0);
    }
}
