use wasmtime::ResourceLimiter;

use crate::TRACE_TARGET_BRIDGE;

/// Bounds linear-memory growth for one session.
///
/// Also serves as the session's view of how much guest memory is committed.
pub struct MemoryLimiter {
    max_memory: usize,
    max_table_elements: usize,
    current: usize,
    peak: usize,
}

impl MemoryLimiter {
    pub fn new(max_memory: usize) -> Self {
        // Interpreter function tables scale with heap size; cap them on the
        // same budget so a guest cannot grow host memory through tables.
        const TABLE_ELEMENT_BUDGET_BYTES: usize = 64;
        const MIN_TABLE_ELEMENTS: usize = 1024;

        Self {
            max_memory,
            max_table_elements: core::cmp::max(
                max_memory / TABLE_ELEMENT_BUDGET_BYTES,
                MIN_TABLE_ELEMENTS,
            ),
            current: 0,
            peak: 0,
        }
    }

    pub const fn current(&self) -> usize {
        self.current
    }

    pub const fn peak(&self) -> usize {
        self.peak
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_memory {
            tracing::debug!(
                target: TRACE_TARGET_BRIDGE,
                current,
                desired,
                max_memory = self.max_memory,
                "guest memory growth denied"
            );
            return Ok(false);
        }
        self.current = desired;
        self.peak = self.peak.max(desired);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }
}
