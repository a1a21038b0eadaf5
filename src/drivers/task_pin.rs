//! Core-pinned task spawning for the ESP32 dual-core.
//!
//! ESP-IDF implements `std::thread` as pthreads over FreeRTOS tasks.
//! `esp_pthread_set_cfg()` stores a thread-local template applied to the
//! *next* `pthread_create()` from the calling thread, which is how core
//! affinity, priority and stack size reach `std::thread::spawn`. The
//! config→spawn pair must therefore not interleave with other thread
//! creation on the same thread.
//!
//! The control tasks (sensor pipeline, heater loop, telemetry) run on the
//! APP core; the serial dispatcher shares the PRO core with the system
//! services, so PWM and sensor timing never wait behind a slow host
//! writing long lines.

/// CPU core identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Core {
    /// Core 0 — serial/command handling.
    Pro = 0,
    /// Core 1 — sensor and heater control loops.
    App = 1,
}

/// Spawn a thread pinned to `core` with the given priority and stack.
///
/// `name` must be null-terminated (e.g. `"sensors\0"`); FreeRTOS keeps a
/// pointer to it for the task's lifetime.
#[cfg(target_os = "espidf")]
pub fn spawn_on_core(
    core: Core,
    priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> std::thread::JoinHandle<()> {
    use esp_idf_svc::sys;

    unsafe {
        let mut cfg = sys::esp_create_default_pthread_config();
        cfg.pin_to_core = core as i32;
        cfg.prio = priority as i32;
        cfg.stack_size = (stack_kb * 1024) as i32;
        cfg.thread_name = name.as_ptr() as *const _;
        let ret = sys::esp_pthread_set_cfg(&cfg);
        assert!(
            ret == sys::ESP_OK as i32,
            "esp_pthread_set_cfg failed: {ret}"
        );
    }

    let display_name = name.trim_end_matches('\0');
    log::info!(
        "spawning '{}' on {:?} (pri={}, stack={}KB)",
        display_name,
        core,
        priority,
        stack_kb
    );

    std::thread::Builder::new()
        .name(display_name.into())
        .spawn(f)
        .expect("spawn_on_core: thread creation failed")
}

/// Host fallback — ignores core affinity and priority.
#[cfg(not(target_os = "espidf"))]
pub fn spawn_on_core(
    _core: Core,
    _priority: u8,
    stack_kb: usize,
    name: &'static str,
    f: impl FnOnce() + Send + 'static,
) -> std::thread::JoinHandle<()> {
    let display_name = name.trim_end_matches('\0');
    log::info!("spawning '{}' (host, no core pinning)", display_name);

    std::thread::Builder::new()
        .name(display_name.into())
        .stack_size(stack_kb * 1024)
        .spawn(f)
        .expect("spawn_on_core(host): thread creation failed")
}
