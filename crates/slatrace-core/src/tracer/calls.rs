//! Per-call state carried between a call-site hit and its return-site hit.

use std::{any::Any, collections::HashMap, rc::Rc};

use crate::{Driver, SyscallHandler, Va};

/// A pending call/return pair.
///
/// The key — the guest stack pointer at the call site — lives in the owning
/// table. `user_state` is whatever the call callback returned; the return
/// callback takes ownership of it.
pub(crate) struct CallInFlight {
    pub handler: Rc<dyn SyscallHandler>,
    pub user_state: Option<Box<dyn Any>>,
}

/// Calls whose return slots are currently hijacked, keyed by thread id.
#[derive(Default)]
pub(crate) struct CallTable {
    entries: HashMap<Va, CallInFlight>,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, thread_id: Va, call: CallInFlight) {
        self.entries.insert(thread_id, call);
    }

    pub fn remove(&mut self, thread_id: Va) -> Option<CallInFlight> {
        self.entries.remove(&thread_id)
    }

    /// Rewrites every hijacked return slot back to `return_addr` and drops
    /// the table.
    ///
    /// Without this, a guest thread returning after the engine is gone
    /// would jump into a trampoline nobody services. Runs under guest
    /// pause. Returns the number of slots that could not be restored.
    pub fn restore_all<D>(&mut self, driver: &D, return_addr: Va) -> usize
    where
        D: Driver,
    {
        let mut failures = 0;

        for (thread_id, _) in self.entries.drain() {
            let pa = match driver.translate_kernel(thread_id) {
                Ok(pa) => pa,
                Err(err) => {
                    tracing::error!(
                        %thread_id, %err,
                        "failed to restore return slot, guest will likely fault"
                    );
                    failures += 1;
                    continue;
                }
            };

            if let Err(err) = driver.write_u64(pa, return_addr.0) {
                tracing::error!(
                    %thread_id, %err,
                    "failed to restore return slot, guest will likely fault"
                );
                failures += 1;
            } else {
                tracing::debug!(%thread_id, "return slot restored");
            }
        }

        failures
    }
}
