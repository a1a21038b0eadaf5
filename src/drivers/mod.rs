//! Low-level execution-environment glue: core-pinned task spawning and
//! the task watchdog.

pub mod task_pin;
pub mod watchdog;
