//! Heap telemetry.
//!
//! A slow periodic task copies the allocator statistics into the sensor
//! cache, from where they ride along in every `{"get":"sensors"}` reply
//! as `hf`/`hmf`/`hma`/`hs`. Watching `hmf` over days of runtime is how
//! slow leaks on the device get caught.

use crate::ports::SystemPort;
use crate::sensors::SharedCache;

/// Refresh period. Heap numbers move slowly; once a minute is plenty.
pub const TICK_MS: u64 = 60_000;

/// One telemetry refresh.
pub fn tick(system: &impl SystemPort, cache: &SharedCache) {
    let stats = system.heap_stats();
    cache.with(|r| r.heap = stats);
}
