//! dewbox firmware — main entry point.
//!
//! Composition root: builds the owned state records, wires the hardware
//! (or simulation) adapters into the control components, applies the
//! configured startup states and spawns the periodic tasks.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ serial task (PRO, 10 ms)        control tasks (APP)         │
//! │                                                             │
//! │  ConsoleByteStream          SensorPipeline (100 ms)         │
//! │    → CommandDispatcher        → SharedCache ← telemetry 60s │
//! │        │        │                    │                      │
//! │        ▼        ▼                    ▼                      │
//! │  ConfigStore  PowerArbiter ──▶ HeaterBank (5 s)             │
//! │     (mutex)     │    │            → LEDC PWM                │
//! │                 │    └──▶ VoltageConverter → LEDC PWM       │
//! │                 └──▶ GPIO switch bank                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every task subscribes to the 90 s task watchdog and feeds it each
//! iteration; protocol output goes through the single serial write lock
//! inside `SerialSink`.

#![deny(unused_must_use)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use log::info;

use dewbox::adapters::hardware::{ConsoleByteStream, SerialSink};
use dewbox::config::store::ConfigStore;
use dewbox::control::heater::{self, HeaterBank};
use dewbox::drivers::task_pin::{spawn_on_core, Core};
use dewbox::drivers::watchdog::{self, Watchdog};
use dewbox::ports::{
    BlobStore, BusMonitorPort, ByteStream, ClimatePort, LensProbePort, ProtocolOut,
    PwmChannelPort, SwitchBankPort, SystemPort,
};
use dewbox::power::{converter::VoltageConverter, PowerArbiter};
use dewbox::sensors::{pipeline, pipeline::SensorPipeline, SharedCache};
use dewbox::serial::CommandDispatcher;
use dewbox::telemetry;

fn main() -> Result<()> {
    // ── 1. Platform bootstrap ─────────────────────────────────
    #[cfg(target_os = "espidf")]
    {
        esp_idf_svc::sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
    }
    #[cfg(not(target_os = "espidf"))]
    env_logger::init();

    info!("--- dewbox v{} ---", env!("CARGO_PKG_VERSION"));

    // ── 2. Watchdog ───────────────────────────────────────────
    watchdog::configure();

    // ── 3. Target-specific adapters, then the shared core ─────
    #[cfg(target_os = "espidf")]
    return espidf_main();

    #[cfg(not(target_os = "espidf"))]
    host_main()
}

// ── ESP-IDF wiring ────────────────────────────────────────────

#[cfg(target_os = "espidf")]
fn espidf_main() -> Result<()> {
    use std::sync::Mutex;

    use dewbox::adapters::hardware::{
        Ds18b20Probe, EspSystem, GpioSwitchBank, InaBusMonitor, LedcPwm, Sht40Climate,
        CONVERTER_GPIO, CONVERTER_PWM_BITS, CONVERTER_PWM_FREQ_HZ, HEATER_GPIOS, ONE_WIRE_GPIO,
    };
    use dewbox::adapters::nvs::NvsBlobStore;
    use esp_idf_svc::hal::i2c::{I2cConfig, I2cDriver};
    use esp_idf_svc::hal::peripherals::Peripherals;
    use esp_idf_svc::hal::units::FromValueType;

    let peripherals = Peripherals::take()?;
    let i2c_config = I2cConfig::new().baudrate(100u32.kHz().into());
    let i2c = Arc::new(Mutex::new(I2cDriver::new(
        peripherals.i2c0,
        peripherals.pins.gpio21,
        peripherals.pins.gpio22,
        &i2c_config,
    )?));

    let blob = NvsBlobStore::new().map_err(|e| anyhow::anyhow!("nvs init: {e}"))?;

    // LEDC timer 0: converter feedback; timer 1: both heater channels.
    let converter_pwm = LedcPwm::new(
        0,
        0,
        CONVERTER_GPIO,
        CONVERTER_PWM_FREQ_HZ,
        CONVERTER_PWM_BITS,
    );
    let heater_pwm = [
        LedcPwm::new(
            1,
            2,
            HEATER_GPIOS[0],
            heater::PWM_FREQUENCY_HZ,
            heater::PWM_RESOLUTION_BITS,
        ),
        LedcPwm::new(
            1,
            3,
            HEATER_GPIOS[1],
            heater::PWM_FREQUENCY_HZ,
            heater::PWM_RESOLUTION_BITS,
        ),
    ];

    run(
        Box::new(blob),
        GpioSwitchBank::new(),
        heater_pwm,
        converter_pwm,
        InaBusMonitor::new(i2c.clone()),
        Sht40Climate::new(i2c),
        Ds18b20Probe::new(ONE_WIRE_GPIO),
        EspSystem,
    )
}

// ── Host simulation wiring ────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
fn host_main() -> Result<()> {
    use dewbox::adapters::hardware::{
        SimBusMonitor, SimClimate, SimLensProbe, SimPwm, SimSwitchBank, SimSystem,
    };
    use dewbox::adapters::nvs::MemBlobStore;

    info!("host simulation: fixed sensor values, volatile config store");

    let bus = SimBusMonitor::new();
    bus.set(12.8, 450.0);
    let climate = SimClimate::new();
    climate.set(18.5, 72.0);
    let lens = SimLensProbe::new();
    lens.set(14.0);

    run(
        Box::new(MemBlobStore::shared()),
        SimSwitchBank::new(),
        [SimPwm::new(), SimPwm::new()],
        SimPwm::new(),
        bus,
        climate,
        lens,
        SimSystem::new(),
    )
}

// ── Shared core ───────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn run<S, P, B, C, L, Y>(
    blob: Box<dyn BlobStore + Send>,
    switches: S,
    heater_pwm: [P; 2],
    converter_pwm: P,
    bus: B,
    climate: C,
    lens: L,
    system: Y,
) -> Result<()>
where
    S: SwitchBankPort + Send + 'static,
    P: PwmChannelPort + Send + 'static,
    B: BusMonitorPort + Send + 'static,
    C: ClimatePort + Send + 'static,
    L: LensProbePort + Send + 'static,
    Y: SystemPort + Clone + Send + 'static,
{
    // ── 4. Configuration ──────────────────────────────────────
    let (config, defaulted) = ConfigStore::init(blob);
    if defaulted {
        info!("default configuration created");
    } else {
        info!("existing configuration loaded");
    }

    // ── 5. Shared records + protocol output ───────────────────
    let cache = SharedCache::new();
    let out = ProtocolOut::new(Arc::new(SerialSink::new()));

    // ── 6. Control components ─────────────────────────────────
    let startup_cfg = config.snapshot();
    let heaters = Arc::new(HeaterBank::new(heater_pwm, &startup_cfg));
    let converter = Arc::new(VoltageConverter::new(converter_pwm));
    let arbiter = Arc::new(PowerArbiter::new(
        config.clone(),
        heaters.clone(),
        converter.clone(),
        switches,
    ));
    arbiter.apply_startup();

    let (mut sensor_pipeline, dry) = SensorPipeline::new(
        bus,
        climate,
        lens,
        config.clone(),
        cache.clone(),
        out.clone(),
    );
    sensor_pipeline.probe();

    // ── 7. Periodic tasks ─────────────────────────────────────
    let boot = Instant::now();

    let _sensor_task = spawn_on_core(Core::App, 5, 8, "sensors\0", move || {
        let wdt = Watchdog::subscribe();
        loop {
            sensor_pipeline.tick(boot.elapsed().as_millis() as u64);
            wdt.feed();
            thread::sleep(Duration::from_millis(pipeline::TICK_MS));
        }
    });

    {
        let config = config.clone();
        let cache = cache.clone();
        let heaters = heaters.clone();
        let _heater_task = spawn_on_core(Core::App, 5, 8, "heaters\0", move || {
            let wdt = Watchdog::subscribe();
            loop {
                let cfg = config.snapshot();
                // A contended cache means we skip one 5 s cycle; the next
                // tick re-reads everything.
                if let Some(readings) = cache.snapshot() {
                    heaters.tick(&cfg, &readings);
                }
                wdt.feed();
                thread::sleep(Duration::from_millis(heater::TICK_MS));
            }
        });
    }

    {
        let system = system.clone();
        let cache = cache.clone();
        let _telemetry_task = spawn_on_core(Core::App, 2, 4, "telemetry\0", move || {
            let wdt = Watchdog::subscribe();
            loop {
                telemetry::tick(&system, &cache);
                wdt.feed();
                thread::sleep(Duration::from_millis(telemetry::TICK_MS));
            }
        });
    }

    {
        let mut dispatcher = CommandDispatcher::new(
            config.clone(),
            cache.clone(),
            arbiter.clone(),
            converter.clone(),
            heaters.clone(),
            dry,
        );
        let out = out.clone();
        let mut system = system.clone();
        let _serial_task = spawn_on_core(Core::Pro, 4, 12, "serial\0", move || {
            let wdt = Watchdog::subscribe();
            let mut stream = ConsoleByteStream::new();
            let mut buf = [0u8; 256];
            loop {
                // read() blocks at most ~10 ms, which paces the loop.
                let n = stream.read(&mut buf);
                if n > 0 {
                    dispatcher.feed(&buf[..n], &out, &mut system);
                }
                wdt.feed();
            }
        });
    }

    // ── 8. Park the main task ─────────────────────────────────
    info!("setup complete, ready for JSON commands");
    let wdt = Watchdog::subscribe();
    loop {
        wdt.feed();
        thread::sleep(Duration::from_secs(1));
    }
}
