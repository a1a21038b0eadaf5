//! JSON projection of the configuration record.
//!
//! The short keys are the host protocol's vocabulary and must not change:
//! `so/ui/ps/ac/av/ad/dh` at the top level, with the per-field keys
//! documented on each block below. `apply_patch` implements field-wise
//! merge semantics: keys absent from the patch preserve the prior value.

use serde_json::{json, Map, Value};

use super::{Config, HeaterMode, OutputStartup, HEATER_NAME_MAX};

/// Upper bound on `ad.td` (received in seconds on the wire).
const AUTO_DRY_MAX_SECS: u64 = 600;

// ── Serialize ─────────────────────────────────────────────────

/// Project the record into the wire document.
pub fn serialize(cfg: &Config) -> Value {
    json!({
        // sensor offsets: climate temp/humidity, lens temp, bus volt/current
        "so": {
            "st": cfg.offsets.ambient_temp,
            "sh": cfg.offsets.ambient_humidity,
            "dt": cfg.offsets.lens_temp,
            "iv": cfg.offsets.bus_voltage,
            "ic": cfg.offsets.bus_current,
        },
        "ui": {
            "i": cfg.intervals.bus_ms,
            "s": cfg.intervals.climate_ms,
            "d": cfg.intervals.lens_ms,
        },
        "ps": {
            "d1": cfg.startup.dc[0].as_u8(),
            "d2": cfg.startup.dc[1].as_u8(),
            "d3": cfg.startup.dc[2].as_u8(),
            "d4": cfg.startup.dc[3].as_u8(),
            "d5": cfg.startup.dc[4].as_u8(),
            "u12": cfg.startup.usbc12.as_u8(),
            "u34": cfg.startup.usb345.as_u8(),
            "adj": cfg.startup.adj.as_u8(),
        },
        "ac": {
            "st": cfg.averaging.ambient_temp,
            "sh": cfg.averaging.ambient_humidity,
            "dt": cfg.averaging.lens_temp,
            "iv": cfg.averaging.bus_voltage,
            "ic": cfg.averaging.bus_current,
        },
        "av": cfg.converter_preset_v,
        "ad": {
            "en": cfg.auto_dry.enabled,
            "ht": cfg.auto_dry.humidity_threshold,
            // milliseconds internally, seconds on the wire
            "td": cfg.auto_dry.trigger_duration_ms / 1000,
        },
        "dh": cfg.heaters.iter().map(|h| json!({
            "n": h.name,
            "en": h.enabled_on_startup,
            "m": h.mode.as_u8(),
            "mp": h.manual_power,
            "to": h.target_offset,
            "kp": h.pid_kp,
            "ki": h.pid_ki,
            "kd": h.pid_kd,
            "sd": h.start_delta,
            "ed": h.end_delta,
            "xp": h.max_power,
            "psf": h.pid_sync_factor,
            "mt": h.min_temp,
        })).collect::<Vec<_>>(),
    })
}

// ── Patch helpers ─────────────────────────────────────────────

fn merge_f32(obj: &Map<String, Value>, key: &str, field: &mut f32) {
    if let Some(v) = obj.get(key).and_then(Value::as_f64) {
        *field = v as f32;
    }
}

fn merge_f64(obj: &Map<String, Value>, key: &str, field: &mut f64) {
    if let Some(v) = obj.get(key).and_then(Value::as_f64) {
        *field = v;
    }
}

fn merge_u32(obj: &Map<String, Value>, key: &str, field: &mut u32) {
    if let Some(v) = obj.get(key).and_then(Value::as_u64) {
        *field = v.min(u32::MAX as u64) as u32;
    }
}

fn merge_i32(obj: &Map<String, Value>, key: &str, field: &mut i32) {
    if let Some(v) = obj.get(key).and_then(Value::as_i64) {
        *field = v.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    }
}

/// Booleans arrive as `true`/`false` or 0/1 depending on the host.
fn as_flag(v: &Value) -> Option<bool> {
    v.as_bool().or_else(|| v.as_i64().map(|n| n != 0))
}

fn merge_flag(obj: &Map<String, Value>, key: &str, field: &mut bool) {
    if let Some(v) = obj.get(key).and_then(as_flag) {
        *field = v;
    }
}

fn merge_startup(obj: &Map<String, Value>, key: &str, field: &mut OutputStartup) {
    if let Some(v) = obj.get(key).and_then(Value::as_u64) {
        *field = OutputStartup::from_raw(v.min(255) as u8);
    }
}

fn merge_percent(obj: &Map<String, Value>, key: &str, field: &mut u8) {
    if let Some(v) = obj.get(key).and_then(Value::as_i64) {
        *field = v.clamp(0, 100) as u8;
    }
}

// ── Apply patch ───────────────────────────────────────────────

/// Merge a wire patch into the record. Unknown keys are ignored;
/// absent keys leave the field untouched.
pub fn apply_patch(cfg: &mut Config, patch: &Value) {
    let Some(patch) = patch.as_object() else {
        return;
    };

    if let Some(so) = patch.get("so").and_then(Value::as_object) {
        merge_f32(so, "st", &mut cfg.offsets.ambient_temp);
        merge_f32(so, "sh", &mut cfg.offsets.ambient_humidity);
        merge_f32(so, "dt", &mut cfg.offsets.lens_temp);
        merge_f32(so, "iv", &mut cfg.offsets.bus_voltage);
        merge_f32(so, "ic", &mut cfg.offsets.bus_current);
    }

    if let Some(ui) = patch.get("ui").and_then(Value::as_object) {
        merge_u32(ui, "i", &mut cfg.intervals.bus_ms);
        merge_u32(ui, "s", &mut cfg.intervals.climate_ms);
        merge_u32(ui, "d", &mut cfg.intervals.lens_ms);
    }

    if let Some(ps) = patch.get("ps").and_then(Value::as_object) {
        merge_startup(ps, "d1", &mut cfg.startup.dc[0]);
        merge_startup(ps, "d2", &mut cfg.startup.dc[1]);
        merge_startup(ps, "d3", &mut cfg.startup.dc[2]);
        merge_startup(ps, "d4", &mut cfg.startup.dc[3]);
        merge_startup(ps, "d5", &mut cfg.startup.dc[4]);
        merge_startup(ps, "u12", &mut cfg.startup.usbc12);
        merge_startup(ps, "u34", &mut cfg.startup.usb345);
        merge_startup(ps, "adj", &mut cfg.startup.adj);
    }

    if let Some(ac) = patch.get("ac").and_then(Value::as_object) {
        merge_i32(ac, "st", &mut cfg.averaging.ambient_temp);
        merge_i32(ac, "sh", &mut cfg.averaging.ambient_humidity);
        merge_i32(ac, "dt", &mut cfg.averaging.lens_temp);
        merge_i32(ac, "iv", &mut cfg.averaging.bus_voltage);
        merge_i32(ac, "ic", &mut cfg.averaging.bus_current);
    }

    merge_f32(patch, "av", &mut cfg.converter_preset_v);

    if let Some(ad) = patch.get("ad").and_then(Value::as_object) {
        merge_flag(ad, "en", &mut cfg.auto_dry.enabled);
        merge_f32(ad, "ht", &mut cfg.auto_dry.humidity_threshold);
        if let Some(secs) = ad.get("td").and_then(Value::as_u64) {
            let secs = secs.min(AUTO_DRY_MAX_SECS);
            cfg.auto_dry.trigger_duration_ms = (secs * 1000) as u32;
        }
    }

    if let Some(dh) = patch.get("dh").and_then(Value::as_array) {
        for (heater, entry) in cfg.heaters.iter_mut().zip(dh.iter()) {
            let Some(entry) = entry.as_object() else {
                continue;
            };

            if let Some(name) = entry.get("n").and_then(Value::as_str) {
                heater.name = name.chars().take(HEATER_NAME_MAX).collect();
            }
            merge_flag(entry, "en", &mut heater.enabled_on_startup);

            // Legacy hosts send a bare auto_mode flag; an explicit "m"
            // in the same patch wins.
            if let Some(auto) = entry.get("auto_mode").and_then(as_flag) {
                heater.mode = if auto {
                    HeaterMode::Pid
                } else {
                    HeaterMode::Manual
                };
            }
            if let Some(m) = entry.get("m").and_then(Value::as_u64) {
                heater.mode = HeaterMode::from_raw(m.min(255) as u8);
            }

            merge_percent(entry, "mp", &mut heater.manual_power);

            // Zero or negative offsets would park the setpoint on the dew
            // point itself; only accept strictly positive values.
            if let Some(to) = entry.get("to").and_then(Value::as_f64) {
                if to > 0.0 {
                    heater.target_offset = to as f32;
                }
            }

            merge_f64(entry, "kp", &mut heater.pid_kp);
            merge_f64(entry, "ki", &mut heater.pid_ki);
            merge_f64(entry, "kd", &mut heater.pid_kd);
            merge_f32(entry, "sd", &mut heater.start_delta);
            merge_f32(entry, "ed", &mut heater.end_delta);
            merge_percent(entry, "xp", &mut heater.max_power);
            merge_f32(entry, "psf", &mut heater.pid_sync_factor);
            merge_f32(entry, "mt", &mut heater.min_temp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patched(patch: Value) -> Config {
        let mut cfg = Config::default();
        apply_patch(&mut cfg, &patch);
        cfg
    }

    #[test]
    fn serialize_then_apply_is_identity() {
        let mut cfg = Config::default();
        cfg.offsets.lens_temp = 1.5;
        cfg.converter_preset_v = 12.0;
        cfg.heaters[1].name = "Guide scope".into();
        cfg.heaters[1].mode = HeaterMode::Follower;
        cfg.startup.dc[2] = OutputStartup::Disabled;

        let mut back = Config::default();
        apply_patch(&mut back, &serialize(&cfg));
        assert_eq!(back, cfg);
    }

    #[test]
    fn absent_keys_preserve_values() {
        let cfg = patched(json!({"so": {"st": 2.5}}));
        assert_eq!(cfg.offsets.ambient_temp, 2.5);
        // Untouched siblings keep their defaults.
        assert_eq!(cfg.offsets.ambient_humidity, -10.0);
        assert_eq!(cfg.intervals.bus_ms, 1000);
        assert_eq!(cfg.heaters[0].pid_kp, 20.0);
    }

    #[test]
    fn trigger_duration_is_capped_at_600s() {
        let cfg = patched(json!({"ad": {"td": 4000}}));
        assert_eq!(cfg.auto_dry.trigger_duration_ms, 600_000);

        let cfg = patched(json!({"ad": {"td": 30}}));
        assert_eq!(cfg.auto_dry.trigger_duration_ms, 30_000);
    }

    #[test]
    fn non_positive_target_offset_is_ignored() {
        let cfg = patched(json!({"dh": [{"to": -2.0}]}));
        assert_eq!(cfg.heaters[0].target_offset, 3.0);

        let cfg = patched(json!({"dh": [{"to": 0.0}]}));
        assert_eq!(cfg.heaters[0].target_offset, 3.0);

        let cfg = patched(json!({"dh": [{"to": 4.5}]}));
        assert_eq!(cfg.heaters[0].target_offset, 4.5);
    }

    #[test]
    fn legacy_auto_mode_flag_maps_to_pid() {
        let cfg = patched(json!({"dh": [{"auto_mode": true}]}));
        assert_eq!(cfg.heaters[0].mode, HeaterMode::Pid);

        let cfg = patched(json!({"dh": [{"auto_mode": false}]}));
        assert_eq!(cfg.heaters[0].mode, HeaterMode::Manual);

        // Explicit mode wins over the legacy flag.
        let cfg = patched(json!({"dh": [{"auto_mode": true, "m": 2}]}));
        assert_eq!(cfg.heaters[0].mode, HeaterMode::AmbientTrack);
    }

    #[test]
    fn second_heater_patch_reaches_second_channel() {
        let cfg = patched(json!({"dh": [{}, {"m": 3, "psf": 0.5}]}));
        assert_eq!(cfg.heaters[0].mode, HeaterMode::Pid);
        assert_eq!(cfg.heaters[1].mode, HeaterMode::Follower);
        assert_eq!(cfg.heaters[1].pid_sync_factor, 0.5);
    }

    #[test]
    fn heater_name_is_capped_at_31_chars() {
        let cfg = patched(json!({"dh": [{"n": "a".repeat(40)}]}));
        assert_eq!(cfg.heaters[0].name.len(), 31);
    }

    #[test]
    fn percent_fields_are_clamped() {
        let cfg = patched(json!({"dh": [{"mp": 150, "xp": -5}]}));
        assert_eq!(cfg.heaters[0].manual_power, 100);
        assert_eq!(cfg.heaters[0].max_power, 0);
    }

    #[test]
    fn wire_uses_seconds_for_trigger_duration() {
        let doc = serialize(&Config::default());
        assert_eq!(doc["ad"]["td"], 300);
        assert_eq!(doc["ad"]["en"], true);
    }
}
