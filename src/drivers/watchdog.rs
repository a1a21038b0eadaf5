//! Task Watchdog Timer (TWDT).
//!
//! Every periodic task subscribes itself and must feed within 90 s or
//! the whole device resets. The timeout is deliberately generous: the
//! drying settle window and a slow DS18B20 conversion both have to fit
//! inside it with margin.

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

/// Watchdog deadline.
pub const TIMEOUT_MS: u32 = 90_000;

/// One-time TWDT (re)configuration; call from the composition root
/// before the tasks subscribe.
pub fn configure() {
    #[cfg(target_os = "espidf")]
    {
        // SAFETY: called once from the main task during bootstrap.
        let cfg = esp_task_wdt_config_t {
            timeout_ms: TIMEOUT_MS,
            idle_core_mask: 0,
            trigger_panic: true,
        };
        let ret = unsafe { esp_task_wdt_reconfigure(&cfg) };
        if ret != ESP_OK {
            log::warn!("twdt: reconfigure returned {ret} (may already be configured)");
        }
    }

    #[cfg(not(target_os = "espidf"))]
    log::info!("twdt(host): no-op");
}

/// Per-task watchdog subscription. Construct inside the task that will
/// do the feeding.
pub struct Watchdog {
    #[cfg(target_os = "espidf")]
    subscribed: bool,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::subscribe()
    }
}

impl Watchdog {
    /// Subscribe the current task.
    pub fn subscribe() -> Self {
        #[cfg(target_os = "espidf")]
        {
            // SAFETY: NULL means "the calling task".
            let ret = unsafe { esp_task_wdt_add(core::ptr::null_mut()) };
            let subscribed = ret == ESP_OK;
            if !subscribed {
                log::warn!("twdt: subscribe failed ({ret})");
            }
            Self { subscribed }
        }

        #[cfg(not(target_os = "espidf"))]
        Self {}
    }

    /// Feed the watchdog. Call once per task iteration.
    pub fn feed(&self) {
        #[cfg(target_os = "espidf")]
        if self.subscribed {
            // SAFETY: resets the calling task's TWDT entry.
            unsafe {
                esp_task_wdt_reset();
            }
        }
    }
}
