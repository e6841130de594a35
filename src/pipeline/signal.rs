use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-way failure flag raised outside the controller's call stack.
///
/// Once raised it stays raised; only the first reason is kept.
#[derive(Clone, Default)]
pub struct AsyncErrorFlag {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    raised: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl AsyncErrorFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.inner.raised.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        if !self.is_raised() {
            return None;
        }
        self.inner.reason.lock().clone()
    }
}

impl std::fmt::Debug for AsyncErrorFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncErrorFlag")
            .field("raised", &self.is_raised())
            .finish()
    }
}
