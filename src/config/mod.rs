//! Device configuration
//!
//! One process-wide record covering sensor trims, polling intervals,
//! power-output startup states, filter windows, the converter preset,
//! auto-dry and both dew-heater channels. The record is persisted as a
//! fixed-layout binary image ([`blob`]) and projected to JSON with the
//! short keys the host protocol uses ([`wire`]).

pub mod blob;
pub mod store;
pub mod wire;

/// Number of dew-heater channels. The follower mode's `1 - self` leader
/// lookup assumes exactly two.
pub const MAX_HEATERS: usize = 2;

/// Heater names are stored in a 32-byte cell (31 chars + terminator).
pub const HEATER_NAME_MAX: usize = 31;

/// Additive trim applied to each measurement after filtering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorOffsets {
    pub ambient_temp: f32,
    pub ambient_humidity: f32,
    pub lens_temp: f32,
    pub bus_voltage: f32,
    pub bus_current: f32,
}

/// Per-sensor refresh periods in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateIntervals {
    pub bus_ms: u32,
    pub climate_ms: u32,
    pub lens_ms: u32,
}

/// Startup state of a non-heater power output.
///
/// `Disabled` outputs are physically off and reject any enable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputStartup {
    Off = 0,
    On = 1,
    Disabled = 2,
}

impl OutputStartup {
    /// Decode a persisted byte. Legacy images stored booleans here;
    /// anything outside {0, 1} maps to `Disabled`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Off,
            1 => Self::On,
            _ => Self::Disabled,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Startup states for the eight non-heater outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupStates {
    pub dc: [OutputStartup; 5],
    pub usbc12: OutputStartup,
    pub usb345: OutputStartup,
    pub adj: OutputStartup,
}

/// Filter window length per measurement channel.
///
/// Values are persisted verbatim; anything outside [1, 20] degrades to a
/// window of 1 (pass-through) at the point of use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AveragingCounts {
    pub ambient_temp: i32,
    pub ambient_humidity: i32,
    pub lens_temp: i32,
    pub bus_voltage: i32,
    pub bus_current: i32,
}

/// Automatic humidity-sensor drying.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoDryConfig {
    pub enabled: bool,
    /// Humidity threshold in percent that arms the trigger timer.
    pub humidity_threshold: f32,
    /// How long the threshold must hold before drying starts.
    /// Received in seconds on the wire, capped at 600 s.
    pub trigger_duration_ms: u32,
}

/// Dew-heater operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaterMode {
    Manual = 0,
    Pid = 1,
    AmbientTrack = 2,
    Follower = 3,
    MinTemp = 4,
    Disabled = 5,
}

impl HeaterMode {
    /// Decode a persisted or wire integer. Unknown values map to
    /// `Disabled` so a corrupt mode can never energise a heater.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Manual,
            1 => Self::Pid,
            2 => Self::AmbientTrack,
            3 => Self::Follower,
            4 => Self::MinTemp,
            _ => Self::Disabled,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Closed-loop modes report `true` on the status surface even while
    /// their instantaneous power is 0.
    pub fn is_automatic(self) -> bool {
        matches!(
            self,
            Self::Pid | Self::AmbientTrack | Self::Follower | Self::MinTemp
        )
    }
}

/// Per-channel dew-heater configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaterConfig {
    pub name: String,
    pub enabled_on_startup: bool,
    pub mode: HeaterMode,
    /// Manual-mode power in percent.
    pub manual_power: u8,

    // PID / MinTemp: setpoint = dew point + target_offset
    pub target_offset: f32,
    pub pid_kp: f64,
    pub pid_ki: f64,
    pub pid_kd: f64,

    // Ambient tracking ramp
    pub start_delta: f32,
    pub end_delta: f32,
    pub max_power: u8,

    // Follower: power = leader power × sync factor
    pub pid_sync_factor: f32,

    // MinTemp: lower bound on the PID setpoint
    pub min_temp: f32,
}

/// The complete configuration record.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub offsets: SensorOffsets,
    pub intervals: UpdateIntervals,
    pub startup: StartupStates,
    pub averaging: AveragingCounts,
    /// Adjustable converter preset in volts.
    pub converter_preset_v: f32,
    pub auto_dry: AutoDryConfig,
    pub heaters: [HeaterConfig; MAX_HEATERS],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            offsets: SensorOffsets {
                ambient_temp: 0.0,
                // The sensor sits inside the enclosure and reads high.
                ambient_humidity: -10.0,
                lens_temp: 0.0,
                bus_voltage: 0.0,
                bus_current: 0.0,
            },
            intervals: UpdateIntervals {
                bus_ms: 1000,
                climate_ms: 1000,
                lens_ms: 1000,
            },
            startup: StartupStates {
                dc: [OutputStartup::Off; 5],
                usbc12: OutputStartup::Off,
                usb345: OutputStartup::Off,
                adj: OutputStartup::Off,
            },
            averaging: AveragingCounts {
                ambient_temp: 5,
                ambient_humidity: 5,
                lens_temp: 5,
                bus_voltage: 5,
                bus_current: 5,
            },
            converter_preset_v: 0.0,
            auto_dry: AutoDryConfig {
                enabled: true,
                humidity_threshold: 99.0,
                trigger_duration_ms: 300_000, // 5 minutes
            },
            heaters: [
                default_heater(0, HeaterMode::Pid),
                default_heater(1, HeaterMode::AmbientTrack),
            ],
        }
    }
}

fn default_heater(index: usize, mode: HeaterMode) -> HeaterConfig {
    HeaterConfig {
        name: format!("PWM{}", index + 1),
        enabled_on_startup: false,
        mode,
        manual_power: 0,
        target_offset: 3.0,
        pid_kp: 20.0,
        pid_ki: 1.0,
        pid_kd: 15.0,
        start_delta: 5.0,
        end_delta: 1.0,
        max_power: 80,
        pid_sync_factor: 1.0,
        min_temp: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.offsets.ambient_humidity, -10.0);
        assert_eq!(cfg.intervals.climate_ms, 1000);
        assert_eq!(cfg.averaging.bus_voltage, 5);
        assert!(cfg.auto_dry.enabled);
        assert_eq!(cfg.auto_dry.trigger_duration_ms, 300_000);
        assert_eq!(cfg.heaters[0].mode, HeaterMode::Pid);
        assert_eq!(cfg.heaters[1].mode, HeaterMode::AmbientTrack);
        assert_eq!(cfg.heaters[0].name, "PWM1");
        assert_eq!(cfg.heaters[1].max_power, 80);
    }

    #[test]
    fn legacy_startup_bytes_map_to_disabled() {
        assert_eq!(OutputStartup::from_raw(0), OutputStartup::Off);
        assert_eq!(OutputStartup::from_raw(1), OutputStartup::On);
        assert_eq!(OutputStartup::from_raw(2), OutputStartup::Disabled);
        assert_eq!(OutputStartup::from_raw(255), OutputStartup::Disabled);
    }

    #[test]
    fn unknown_heater_mode_is_disabled() {
        assert_eq!(HeaterMode::from_raw(4), HeaterMode::MinTemp);
        assert_eq!(HeaterMode::from_raw(9), HeaterMode::Disabled);
        assert!(!HeaterMode::Disabled.is_automatic());
        assert!(!HeaterMode::Manual.is_automatic());
        assert!(HeaterMode::Follower.is_automatic());
    }
}
