//! Response rendezvous between BLE callbacks and the engine.
//!
//! Control and buttonless responses arrive on a transport-owned thread,
//! out of band from the write that provoked them. The [`ResponseSlot`] is
//! a single-capacity handoff: the subscription callback deposits the raw
//! frame through a [`SlotProducer`], the engine blocks on [`take`] until
//! it appears. When every producer is gone (the transport dropped the
//! subscription), waiting consumers unblock with [`SlotError::LinkLost`]
//! instead of hanging.
//!
//! [`take`]: ResponseSlot::take

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Errors surfaced by the response slot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    /// All producers dropped while a consumer was waiting.
    #[error("peripheral link lost while waiting for a response")]
    LinkLost,

    /// A second frame arrived before the first was consumed. The protocol
    /// allows at most one response in flight.
    #[error("a second response arrived before the first was consumed")]
    Overrun,
}

#[derive(Default)]
struct SlotState {
    frame: Option<Vec<u8>>,
    overrun: bool,
    producers: usize,
}

struct Shared {
    state: Mutex<SlotState>,
    ready: Condvar,
}

fn lock(shared: &Shared) -> MutexGuard<'_, SlotState> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumer side of the rendezvous. Owned by the engine.
pub struct ResponseSlot {
    shared: Arc<Shared>,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SlotState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Create a producer handle for a subscription callback.
    pub fn producer(&self) -> SlotProducer {
        let mut state = lock(&self.shared);
        state.producers += 1;
        SlotProducer {
            shared: self.shared.clone(),
        }
    }

    /// Block until a frame is deposited.
    pub fn take(&self) -> Result<Vec<u8>, SlotError> {
        let mut state = lock(&self.shared);
        loop {
            if state.overrun {
                state.overrun = false;
                return Err(SlotError::Overrun);
            }
            if let Some(frame) = state.frame.take() {
                return Ok(frame);
            }
            if state.producers == 0 {
                return Err(SlotError::LinkLost);
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for ResponseSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of the rendezvous. Cloneable; the slot reports
/// `LinkLost` once the last producer is dropped.
pub struct SlotProducer {
    shared: Arc<Shared>,
}

impl SlotProducer {
    /// Deposit a raw response frame. Depositing over an unconsumed frame
    /// poisons the slot with [`SlotError::Overrun`].
    pub fn deposit(&self, frame: &[u8]) {
        let mut state = lock(&self.shared);
        if state.frame.is_some() || state.overrun {
            state.overrun = true;
            state.frame = None;
        } else {
            state.frame = Some(frame.to_vec());
        }
        self.shared.ready.notify_one();
    }
}

impl Clone for SlotProducer {
    fn clone(&self) -> Self {
        let mut state = lock(&self.shared);
        state.producers += 1;
        SlotProducer {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for SlotProducer {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        state.producers -= 1;
        if state.producers == 0 {
            self.shared.ready.notify_all();
        }
    }
}
