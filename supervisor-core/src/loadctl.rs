//! Adaptive concurrency controller.
//!
//! A pure decision over one host sample. The dispatcher consults this before
//! *each* dispatch attempt, not once per pulse, so a long dispatch loop
//! throttles mid-flight as other jobs raise the load.

use crate::sysinfo::{MemoryPressure, SystemSample};

/// Effective concurrency budget for a batch under the observed load.
///
/// - High memory pressure wins everything: budget 1.
/// - Load beyond `max_load_factor` busy cores per core: budget 1.
/// - Load above one busy core per core: half the base budget (rounded up).
/// - Otherwise: the base budget.
pub fn effective_concurrency(base: u32, max_load_factor: u32, sample: &SystemSample) -> u32 {
    if base == 0 {
        return 0;
    }
    if sample.memory_pressure == MemoryPressure::High {
        return 1;
    }
    let ratio = sample.load_ratio();
    if ratio > max_load_factor as f64 * 100.0 {
        return 1;
    }
    if ratio > 100.0 {
        return base.div_ceil(2);
    }
    base
}
