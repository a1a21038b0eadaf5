//! End-to-end protocol tests: serial bytes in, JSON lines out, against
//! the fully wired control plane with simulation adapters.

#![cfg(not(target_os = "espidf"))]

use std::sync::Arc;

use serde_json::{json, Value};

use dewbox::adapters::hardware::{
    CollectingSink, SimBusMonitor, SimClimate, SimLensProbe, SimPwm, SimSwitchBank, SimSystem,
};
use dewbox::adapters::nvs::MemBlobStore;
use dewbox::config::store::ConfigStore;
use dewbox::control::heater::HeaterBank;
use dewbox::ports::ProtocolOut;
use dewbox::power::{converter::VoltageConverter, PowerArbiter};
use dewbox::sensors::pipeline::SensorPipeline;
use dewbox::sensors::SharedCache;
use dewbox::serial::CommandDispatcher;

/// A fully wired device core on simulation adapters.
struct Device {
    dispatcher: CommandDispatcher<SimSwitchBank, SimPwm>,
    pipeline: SensorPipeline<SimBusMonitor, SimClimate, SimLensProbe>,
    heaters: Arc<HeaterBank<SimPwm>>,
    config: Arc<ConfigStore>,
    cache: SharedCache,
    switches: SimSwitchBank,
    climate: SimClimate,
    lens: SimLensProbe,
    bus: SimBusMonitor,
    system: SimSystem,
    sink: CollectingSink,
    out: ProtocolOut,
    now_ms: u64,
}

impl Device {
    fn boot() -> Self {
        Self::boot_with(MemBlobStore::shared(), Value::Null)
    }

    fn boot_with(backing: MemBlobStore, patch: Value) -> Self {
        let (config, _) = ConfigStore::init(Box::new(backing));
        if !patch.is_null() {
            config.apply_patch(&patch);
        }

        let cache = SharedCache::new();
        let sink = CollectingSink::new();
        let out = ProtocolOut::new(Arc::new(sink.clone()));

        let cfg = config.snapshot();
        let heaters = Arc::new(HeaterBank::new([SimPwm::new(), SimPwm::new()], &cfg));
        let converter = Arc::new(VoltageConverter::new(SimPwm::new()));
        let switches = SimSwitchBank::new();
        let arbiter = Arc::new(PowerArbiter::new(
            config.clone(),
            heaters.clone(),
            converter.clone(),
            switches.clone(),
        ));
        arbiter.apply_startup();

        let bus = SimBusMonitor::new();
        let climate = SimClimate::new();
        let lens = SimLensProbe::new();
        climate.set(18.0, 75.0);
        bus.set(12.8, 500.0);
        lens.set(12.0);

        let (pipeline, dry) = SensorPipeline::new(
            bus.clone(),
            climate.clone(),
            lens.clone(),
            config.clone(),
            cache.clone(),
            out.clone(),
        );

        let dispatcher = CommandDispatcher::new(
            config.clone(),
            cache.clone(),
            arbiter,
            converter,
            heaters.clone(),
            dry,
        );

        Self {
            dispatcher,
            pipeline,
            heaters,
            config,
            cache,
            switches,
            climate,
            lens,
            bus,
            system: SimSystem::new(),
            sink,
            out,
            now_ms: 0,
        }
    }

    /// Send one line, return the replies it produced.
    fn send(&mut self, line: &str) -> Vec<String> {
        self.sink.clear();
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.dispatcher.feed(&bytes, &self.out, &mut self.system);
        self.sink.lines()
    }

    fn send_json(&mut self, line: &str) -> Value {
        let replies = self.send(line);
        assert_eq!(replies.len(), 1, "expected one reply, got {replies:?}");
        serde_json::from_str(&replies[0]).expect("reply is valid JSON")
    }

    /// Advance wall time, ticking the sensor pipeline every 100 ms.
    fn run_sensors_for(&mut self, ms: u64) {
        let target = self.now_ms + ms;
        while self.now_ms < target {
            self.pipeline.tick(self.now_ms);
            self.now_ms += 100;
        }
    }

    /// One heater control tick from the current cache and config, the
    /// same way the heater task runs it.
    fn heater_tick(&mut self) {
        let cfg = self.config.snapshot();
        let readings = self.cache.snapshot_blocking();
        self.heaters.tick(&cfg, &readings);
    }
}

#[test]
fn factory_boot_reports_default_config() {
    let mut dev = Device::boot();
    let cfg = dev.send_json(r#"{"get":"config"}"#);

    assert_eq!(cfg["av"], 0.0);
    assert_eq!(cfg["ad"]["en"], true);
    assert_eq!(cfg["ad"]["ht"], 99.0);
    assert_eq!(cfg["ad"]["td"], 300);
    assert_eq!(cfg["dh"][0]["m"], 1, "heater 0 defaults to PID");
    assert_eq!(cfg["dh"][1]["m"], 2, "heater 1 defaults to ambient tracking");
    assert_eq!(cfg["so"]["sh"], -10.0);
    assert_eq!(cfg["ps"]["d1"], 0);
}

#[test]
fn disabled_output_refusal_end_to_end() {
    let mut dev = Device::boot_with(MemBlobStore::shared(), json!({"ps": {"d1": 2}}));

    let replies = dev.send(r#"{"set":{"d1":1}}"#);
    assert_eq!(
        replies[0],
        r#"{"error":"Cannot enable disabled output: d1"}"#
    );
    assert!(!dev.switches.is_on(0));

    let status = dev.send_json(r#"{"get":"status"}"#);
    assert_eq!(status["status"]["d1"], 0);
}

#[test]
fn heater_safety_blanking_end_to_end() {
    let mut dev = Device::boot_with(
        MemBlobStore::shared(),
        json!({"dh": [{"m": 1, "en": 1}]}),
    );
    // Lens probe never connected.
    dev.lens.fail(true);
    dev.run_sensors_for(2_000);
    dev.heater_tick();

    assert_eq!(dev.heaters.live_power(0), 0);

    // Status keeps the UI toggle on: enabled + automatic mode.
    let status = dev.send_json(r#"{"get":"status"}"#);
    assert_eq!(status["status"]["pwm1"], true);

    // The sensor projection omits the missing lens temperature.
    let sensors = dev.send_json(r#"{"get":"sensors"}"#);
    assert!(sensors.get("t_lens").is_none());
    assert!(sensors.get("t_amb").is_some());
    assert_eq!(sensors["pwm1"], 0);
}

#[test]
fn set_replies_with_status_and_dm() {
    let mut dev = Device::boot();
    let status = dev.send_json(r#"{"set":{"d2":1,"u34":true}}"#);
    assert_eq!(status["status"]["d2"], 1);
    assert_eq!(status["status"]["u34"], 1);
    assert_eq!(status["status"]["d1"], 0);
    assert_eq!(status["dm"], json!([1, 2]));
    assert!(dev.switches.is_on(1));
    assert!(dev.switches.is_on(6));
}

#[test]
fn converter_voltage_set_and_status() {
    let mut dev = Device::boot();
    dev.send(r#"{"sc":{"av": 9.0}}"#);

    let status = dev.send_json(r#"{"set":{"adj":true}}"#);
    assert_eq!(status["status"]["adj"], 9.0);

    // Numeric set installs a RAM override without touching the preset.
    let status = dev.send_json(r#"{"set":{"adj":5.5}}"#);
    assert_eq!(status["status"]["adj"], 5.5);
    let cfg = dev.send_json(r#"{"get":"config"}"#);
    assert_eq!(cfg["av"], 9.0);

    let status = dev.send_json(r#"{"set":{"adj":0}}"#);
    assert_eq!(status["status"]["adj"], false);
}

#[test]
fn sc_patch_persists_and_echoes_config() {
    let backing = MemBlobStore::shared();
    let mut dev = Device::boot_with(backing.clone(), Value::Null);

    let cfg = dev.send_json(r#"{"sc":{"ui":{"s":2500},"dh":[{"n":"Main scope"}]}}"#);
    assert_eq!(cfg["ui"]["s"], 2500);
    assert_eq!(cfg["dh"][0]["n"], "Main scope");
    // Untouched fields survive the merge.
    assert_eq!(cfg["dh"][0]["kp"], 20.0);

    // The patch was persisted: a rebooted device sees it.
    let mut dev2 = Device::boot_with(backing, Value::Null);
    let cfg2 = dev2.send_json(r#"{"get":"config"}"#);
    assert_eq!(cfg2["ui"]["s"], 2500);
    assert_eq!(cfg2["dh"][0]["n"], "Main scope");
}

#[test]
fn version_and_error_taxonomy() {
    let mut dev = Device::boot();

    let version = dev.send_json(r#"{"get":"version"}"#);
    assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));

    let replies = dev.send("this is not json");
    assert_eq!(replies, vec![r#"{"error":"invalid command"}"#.to_string()]);

    let replies = dev.send(r#"{"frobnicate": 1}"#);
    assert_eq!(
        replies,
        vec![r#"{"error":"unknown command in valid JSON"}"#.to_string()]
    );

    // Valid JSON that is not an object is still "unknown", not a parse error.
    let replies = dev.send("42");
    assert_eq!(
        replies,
        vec![r#"{"error":"unknown command in valid JSON"}"#.to_string()]
    );
}

#[test]
fn oversized_line_fails_safe() {
    let mut dev = Device::boot();
    // A 5000-byte line overflows the 4096-byte buffer; the truncated
    // text no longer parses and the device answers with a parse error.
    let mut line = String::from(r#"{"set":{"d1":1},"padding":""#);
    line.push_str(&"x".repeat(5000));
    line.push_str("\"}");
    let replies = dev.send(&line);
    assert_eq!(replies, vec![r#"{"error":"invalid command"}"#.to_string()]);
    assert!(!dev.switches.is_on(0), "truncated command must not execute");
}

#[test]
fn reboot_emits_status_then_restarts() {
    let mut dev = Device::boot();
    let replies = dev.send(r#"{"command":"reboot"}"#);
    assert_eq!(replies, vec![r#"{"status":"rebooting"}"#.to_string()]);
    assert_eq!(dev.system.restart_count(), 1);
}

#[test]
fn factory_reset_restores_defaults_and_restarts() {
    let backing = MemBlobStore::shared();
    let mut dev = Device::boot_with(backing.clone(), Value::Null);
    dev.send(r#"{"sc":{"av": 11.0}}"#);

    let replies = dev.send(r#"{"command":"factory_reset"}"#);
    assert_eq!(
        replies,
        vec![r#"{"status":"performing factory reset"}"#.to_string()]
    );
    assert_eq!(dev.system.restart_count(), 1);

    // After the (simulated) reboot the defaults are back.
    let mut dev2 = Device::boot_with(backing, Value::Null);
    let cfg = dev2.send_json(r#"{"get":"config"}"#);
    assert_eq!(cfg["av"], 0.0);
}

#[test]
fn sensors_projection_rounds_to_one_decimal() {
    let mut dev = Device::boot();
    dev.climate.set(18.06, 75.0);
    dev.bus.set(12.84, 503.0);
    dev.run_sensors_for(1_000);

    let sensors = dev.send_json(r#"{"get":"sensors"}"#);
    assert_eq!(sensors["v"], 12.8);
    assert_eq!(sensors["t_amb"], 18.1);
    assert_eq!(sensors["i"], 503.0);
    // p = 12.84 * 503 / 1000 ≈ 6.5 W
    assert_eq!(sensors["p"], 6.5);
    assert!(sensors.get("hf").is_some());
}

#[test]
fn dry_sensor_command_runs_cycle_via_pipeline() {
    let mut dev = Device::boot();
    dev.run_sensors_for(500);

    let replies = dev.send(r#"{"command":"dry_sensor"}"#);
    assert!(replies.is_empty(), "ack comes from the pipeline");

    dev.sink.clear();
    dev.run_sensors_for(200);
    assert_eq!(dev.climate.burst_count(), 1);
    assert!(dev
        .sink
        .lines()
        .iter()
        .any(|l| l.contains("starting sensor drying cycle")));

    // 45 s later the cycle reports completion.
    dev.run_sensors_for(46_000);
    assert!(dev
        .sink
        .lines()
        .iter()
        .any(|l| l.contains("sensor drying cycle complete")));
}

#[test]
fn follower_fallback_end_to_end() {
    let mut dev = Device::boot_with(
        MemBlobStore::shared(),
        json!({"dh": [
            {"m": 0, "mp": 50, "en": 1},
            {"m": 3, "psf": 0.5, "en": 1}
        ]}),
    );
    dev.run_sensors_for(1_000);
    dev.heater_tick();

    assert_eq!(dev.heaters.live_power(0), 50);
    // Leader is manual, not PID: the follower stays dark.
    assert_eq!(dev.heaters.live_power(1), 0);

    let status = dev.send_json(r#"{"get":"status"}"#);
    assert_eq!(status["status"]["pwm1"], 50);
    assert_eq!(status["status"]["pwm2"], true, "follower is an automatic mode");
    assert_eq!(status["dm"], json!([0, 3]));
}

#[test]
fn heater_enable_via_set_uses_manual_power() {
    let mut dev = Device::boot_with(
        MemBlobStore::shared(),
        json!({"dh": [{"m": 0, "mp": 30}]}),
    );
    // Heater starts disabled; numeric set enables with override.
    let status = dev.send_json(r#"{"set":{"pwm1": 70}}"#);
    assert_ne!(status["status"]["pwm1"], false);
    dev.heater_tick();
    assert_eq!(dev.heaters.live_power(0), 70);

    // Boolean-true releases the override back to configured power.
    dev.send(r#"{"set":{"pwm1": true}}"#);
    dev.heater_tick();
    assert_eq!(dev.heaters.live_power(0), 30);

    let status = dev.send_json(r#"{"set":{"pwm1": false}}"#);
    assert_eq!(status["status"]["pwm1"], false);
    assert_eq!(dev.heaters.live_power(0), 0);
}
