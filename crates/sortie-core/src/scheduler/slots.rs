//! Execution slot accounting
//!
//! Exclusive modules get a single-slot gate each, shared-limited modules
//! draw from one gate, unlimited modules take no slot. A [`SlotGuard`] holds
//! whatever it acquired and releases it on drop, so a slot is freed on every
//! exit path including panics inside a module task.
//!
//! A freed slot goes to the waiter with the highest [`Priority`], oldest
//! first within a priority.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::action::Priority;
use crate::registry::{ConcurrencyClass, ModuleDescriptor};

/// The pool was closed while waiting for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotsClosed;

#[derive(Debug)]
struct Waiter {
    priority: Priority,
    seq: u64,
    wake: oneshot::Sender<()>,
}

// Max-heap: higher priority first, then lower sequence number
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

#[derive(Debug, Default)]
struct GateState {
    in_use: usize,
    closed: bool,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

/// Counting gate with priority hand-over.
///
/// Invariant: waiters are only queued while every slot is taken, so a
/// release either hands its slot to a waiter or frees it.
#[derive(Debug)]
struct Gate {
    capacity: usize,
    state: Mutex<GateState>,
}

impl Gate {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(GateState::default()),
        })
    }

    async fn acquire(self: &Arc<Self>, priority: Priority) -> Result<Permit, SlotsClosed> {
        let rx = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SlotsClosed);
            }
            if state.in_use < self.capacity && state.waiters.is_empty() {
                state.in_use += 1;
                return Ok(Permit { gate: self.clone() });
            }
            let (wake, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { priority, seq, wake });
            rx
        };

        let mut waiting = Waiting {
            gate: self.clone(),
            rx,
            granted: false,
        };
        match (&mut waiting.rx).await {
            Ok(()) => {
                waiting.granted = true;
                Ok(Permit { gate: self.clone() })
            }
            Err(_) => Err(SlotsClosed),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop() {
            // A dropped receiver is a waiter that gave up
            if waiter.wake.send(()).is_ok() {
                return;
            }
        }
        state.in_use = state.in_use.saturating_sub(1);
    }

    fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    fn waiting(&self) -> usize {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.wake.is_closed())
            .count()
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiters.clear();
    }
}

/// A queued acquisition; gives the slot back if it is dropped after the
/// hand-over but before the slot was taken
struct Waiting {
    gate: Arc<Gate>,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.gate.release();
        }
    }
}

#[derive(Debug)]
struct Permit {
    gate: Arc<Gate>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[derive(Debug)]
pub struct SlotPool {
    shared: Arc<Gate>,
    shared_size: usize,
    exclusive: DashMap<String, Arc<Gate>>,
    active: DashMap<String, Arc<AtomicUsize>>,
}

impl SlotPool {
    pub fn new(shared_size: usize) -> Self {
        Self {
            shared: Gate::new(shared_size),
            shared_size,
            exclusive: DashMap::new(),
            active: DashMap::new(),
        }
    }

    /// Wait for a slot matching the descriptor's concurrency class
    pub async fn acquire(&self, descriptor: &ModuleDescriptor, priority: Priority) -> Result<SlotGuard, SlotsClosed> {
        let permit = match descriptor.concurrency {
            ConcurrencyClass::Exclusive => {
                let gate = self
                    .exclusive
                    .entry(descriptor.action.clone())
                    .or_insert_with(|| Gate::new(1))
                    .clone();
                Some(gate.acquire(priority).await?)
            }
            ConcurrencyClass::SharedLimited => Some(self.shared.acquire(priority).await?),
            ConcurrencyClass::Unlimited => None,
        };

        let counter = self.counter(&descriptor.action);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(SlotGuard {
            _permit: permit,
            counter,
        })
    }

    /// Number of slots currently held by an action
    pub fn active(&self, action: &str) -> usize {
        self.active
            .get(action)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Shared-pool slots currently held
    pub fn shared_in_use(&self) -> usize {
        self.shared.in_use()
    }

    pub fn shared_size(&self) -> usize {
        self.shared_size
    }

    /// Acquisitions blocked on a taken slot, across all gates
    pub fn waiting(&self) -> usize {
        self.shared.waiting() + self.exclusive.iter().map(|g| g.waiting()).sum::<usize>()
    }

    /// Fail all pending and future acquisitions
    pub fn close(&self) {
        self.shared.close();
        for gate in self.exclusive.iter() {
            gate.close();
        }
    }

    fn counter(&self, action: &str) -> Arc<AtomicUsize> {
        self.active
            .entry(action.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }
}

/// RAII handle on one execution slot
#[derive(Debug)]
pub struct SlotGuard {
    _permit: Option<Permit>,
    counter: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
