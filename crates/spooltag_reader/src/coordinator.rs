//! Single-slot hand-off of write requests to the poll loop.
//!
//! Callers block until their request was written or the timeout elapsed.
//! A newer request replaces a pending one; the replaced caller returns
//! [`WriteOutcome::Superseded`] right away instead of waiting it out.

use spooltag_protocol::WriteRequest;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    TimedOut,
    Superseded,
}

#[derive(Debug, Default)]
struct SlotState {
    pending: Option<WriteRequest>,
    /// Number of the most recent submission
    generation: u64,
    /// Highest submission number written to a card
    completed: u64,
}

#[derive(Debug, Default)]
pub struct WriteSlot {
    state: Mutex<SlotState>,
    done: Condvar,
}

impl WriteSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `request` and wait for the poll loop to write it.
    pub fn submit(&self, request: WriteRequest, timeout: Duration) -> WriteOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        state.generation += 1;
        state.pending = Some(request);
        let generation = state.generation;
        // Wake a caller whose request this one replaced
        self.done.notify_all();

        loop {
            if state.completed >= generation {
                return WriteOutcome::Written;
            }
            if state.generation != generation {
                debug!(?request, "write request superseded");
                return WriteOutcome::Superseded;
            }
            let now = Instant::now();
            if now >= deadline {
                state.pending = None;
                return WriteOutcome::TimedOut;
            }
            state = self
                .done
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Take the pending request. Called by the poll loop only.
    pub fn take(&self) -> Option<(u64, WriteRequest)> {
        let mut state = self.lock();
        let generation = state.generation;
        state.pending.take().map(|request| (generation, request))
    }

    /// Mark submission `generation` as written.
    pub fn complete(&self, generation: u64) {
        let mut state = self.lock();
        state.completed = state.completed.max(generation);
        self.done.notify_all();
    }

    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }
}

/// Cloneable handle used by application threads to request writes.
#[derive(Debug, Clone)]
pub struct TagWriter {
    slot: Arc<WriteSlot>,
    status: Arc<Mutex<String>>,
    timeout: Duration,
}

impl TagWriter {
    pub(crate) fn new(slot: Arc<WriteSlot>, status: Arc<Mutex<String>>, timeout: Duration) -> Self {
        Self { slot, status, timeout }
    }

    /// Write the pair onto the next presented card. False on timeout.
    pub fn write_to_tag(&self, spool: u64, filament: u64) -> bool {
        self.write(WriteRequest::new(spool, filament)) == WriteOutcome::Written
    }

    pub fn write(&self, request: WriteRequest) -> WriteOutcome {
        self.slot.submit(request, self.timeout)
    }

    /// Last write failure, empty when none.
    pub fn status(&self) -> String {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
