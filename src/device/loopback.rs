use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{DeviceError, TransformDevice};

/// In-process stand-in for the transform device: every round trip echoes its
/// input. Used for `stub://` device paths so the full service runs without
/// the accelerator attached.
#[derive(Default)]
pub struct LoopbackDevice {
    counters: LoopbackCounters,
}

/// Shared view of what a `LoopbackDevice` has been asked to do.
#[derive(Clone, Default)]
pub struct LoopbackCounters {
    enabled: Arc<AtomicBool>,
    mode_changes: Arc<AtomicU64>,
    round_trips: Arc<AtomicU64>,
}

impl LoopbackCounters {
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn mode_changes(&self) -> u64 {
        self.mode_changes.load(Ordering::SeqCst)
    }

    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> LoopbackCounters {
        self.counters.clone()
    }
}

impl TransformDevice for LoopbackDevice {
    fn set_mode(&mut self, enabled: bool) -> Result<(), DeviceError> {
        self.counters.enabled.store(enabled, Ordering::SeqCst);
        self.counters.mode_changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn round_trip(&mut self, input: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.counters.round_trips.fetch_add(1, Ordering::SeqCst);
        Ok(input.to_vec())
    }
}
