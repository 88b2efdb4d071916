use std::sync::atomic::{AtomicBool, Ordering};

/// Compare-and-swap busy flag for long-running bulk operations. Owned by
/// the component instance, in-process only: a second concurrent caller gets
/// None back instead of queuing. Not a cross-process guarantee.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag. The returned guard releases it on drop, including
    /// on early error returns.
    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flag: &self.busy })
    }
}

pub struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
