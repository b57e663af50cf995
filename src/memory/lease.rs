//! Single-writer lease for the portfolio snapshot. The orchestrator holds
//! the guard for the duration of the execution stage; a second acquisition
//! fails instead of blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct PortfolioLease {
    held: Arc<AtomicBool>,
}

pub struct LeaseGuard {
    held: Arc<AtomicBool>,
}

impl PortfolioLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> Option<LeaseGuard> {
        if self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Some(LeaseGuard {
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}
