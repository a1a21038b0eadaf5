//! Humidity-sensor auto-dry cycle.
//!
//! When condensation pushes the measured humidity above a configured
//! threshold for long enough, the sensor's on-chip heater is fired to
//! evaporate it. The cycle is a cooperative state machine ticked by the
//! sensor pipeline — the 45 s thermal settle is a timed transition, not a
//! blocking sleep, so the owning task keeps feeding the watchdog.
//!
//! | State  | Transition |
//! |--------|------------|
//! | Idle   | humidity ≥ threshold → Arming (timestamp recorded) |
//! | Arming | humidity < threshold → Idle; threshold held for the trigger duration → Drying |
//! | Drying | burst fired on entry; settle deadline reached → Idle |
//!
//! While Drying, scheduled humidity-sensor updates are suppressed via the
//! shared `active` flag, which doubles as the re-entry guard for explicit
//! `dry_sensor` requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;

use crate::config::AutoDryConfig;

/// Cool-down after the heater burst before normal sampling resumes.
pub const SETTLE_MS: u64 = 45_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DryState {
    Idle,
    Arming { since_ms: u64 },
    Drying { done_ms: u64 },
}

/// What the pipeline must do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DryAction {
    None,
    /// Fire the heater burst now; the settle timer is already running.
    StartBurst,
    /// The settle window elapsed; normal sampling resumes.
    Finished,
}

/// Clonable handle for on-demand drying (held by the command dispatcher).
#[derive(Clone)]
pub struct DryHandle {
    request: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
}

impl DryHandle {
    /// Request a drying cycle. Returns `false` (and does nothing) when a
    /// cycle is already in progress.
    pub fn request(&self) -> bool {
        if self.active.load(Ordering::Acquire) {
            return false;
        }
        self.request.store(true, Ordering::Release);
        true
    }

    pub fn is_drying(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// The state machine itself, owned by the sensor pipeline.
pub struct DryController {
    state: DryState,
    request: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
}

impl DryController {
    pub fn new() -> (Self, DryHandle) {
        let request = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicBool::new(false));
        let handle = DryHandle {
            request: request.clone(),
            active: active.clone(),
        };
        (
            Self {
                state: DryState::Idle,
                request,
                active,
            },
            handle,
        )
    }

    /// True while the burst/settle sequence runs; the pipeline must not
    /// take scheduled climate samples in this window.
    pub fn suppressing(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Advance the machine. `humidity` carries this tick's fresh filtered
    /// sample, or `None` when the climate sensor was not due.
    pub fn tick(&mut self, now_ms: u64, humidity: Option<f32>, cfg: &AutoDryConfig) -> DryAction {
        // Explicit request; the active flag rejects stacked invocations.
        if self.request.swap(false, Ordering::AcqRel) && !self.active.load(Ordering::Acquire) {
            return self.begin_drying(now_ms);
        }

        match self.state {
            DryState::Idle => {
                if cfg.enabled {
                    if let Some(h) = humidity {
                        if h >= cfg.humidity_threshold {
                            self.state = DryState::Arming { since_ms: now_ms };
                        }
                    }
                }
                DryAction::None
            }

            DryState::Arming { since_ms } => {
                if !cfg.enabled || matches!(humidity, Some(h) if h < cfg.humidity_threshold) {
                    self.state = DryState::Idle;
                    return DryAction::None;
                }
                if now_ms.saturating_sub(since_ms) >= cfg.trigger_duration_ms as u64 {
                    info!(
                        "autodry: humidity held >= {:.1}% for {} ms, drying",
                        cfg.humidity_threshold, cfg.trigger_duration_ms
                    );
                    return self.begin_drying(now_ms);
                }
                DryAction::None
            }

            DryState::Drying { done_ms } => {
                if now_ms >= done_ms {
                    self.state = DryState::Idle;
                    self.active.store(false, Ordering::Release);
                    return DryAction::Finished;
                }
                DryAction::None
            }
        }
    }

    fn begin_drying(&mut self, now_ms: u64) -> DryAction {
        self.active.store(true, Ordering::Release);
        self.state = DryState::Drying {
            done_ms: now_ms + SETTLE_MS,
        };
        DryAction::StartBurst
    }
}
