use super::{Stack, StackError};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

#[derive(Debug, Default)]
struct Slot {
    sent: Vec<Bytes>,
    disconnect_requests: u32,
    timeout: Option<Duration>,
    refuse_sends: bool,
}

/// In-memory stack: records what a connection issues and lets the embedder
/// (usually a test) play the event-driven side by dispatching registry
/// callbacks by hand.
#[derive(Debug, Default)]
pub struct MemoryStack {
    slots: Mutex<HashMap<SlotId, Slot>>,
    next_id: AtomicU32,
}

impl MemoryStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh handle, as the stack would on accept.
    pub fn open_slot(&self) -> SlotId {
        let id = SlotId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots.lock().unwrap().insert(id, Slot::default());
        id
    }

    /// Drop the slot, as the stack does once a disconnect completes.
    pub fn close_slot(&self, slot: SlotId) {
        self.slots.lock().unwrap().remove(&slot);
    }

    /// Every buffer issued for `slot`, in issue order.
    pub fn sent_frames(&self, slot: SlotId) -> Vec<Bytes> {
        self.slots.lock().unwrap().get(&slot).map(|s| s.sent.clone()).unwrap_or_default()
    }

    pub fn disconnect_requests(&self, slot: SlotId) -> u32 {
        self.slots.lock().unwrap().get(&slot).map(|s| s.disconnect_requests).unwrap_or(0)
    }

    pub fn timeout_for(&self, slot: SlotId) -> Option<Duration> {
        self.slots.lock().unwrap().get(&slot).and_then(|s| s.timeout)
    }

    /// Make subsequent sends on `slot` fail, as a saturated stack would.
    pub fn refuse_sends(&self, slot: SlotId, refuse: bool) {
        if let Some(slot) = self.slots.lock().unwrap().get_mut(&slot) {
            slot.refuse_sends = refuse;
        }
    }
}

impl Stack for MemoryStack {
    type Raw = SlotId;

    fn send(&self, raw: SlotId, data: &[u8]) -> Result<(), StackError> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(&raw).ok_or(StackError::Disconnected)?;
        if slot.refuse_sends {
            return Err(StackError::Internal("send refused".into()));
        }
        slot.sent.push(Bytes::copy_from_slice(data));
        Ok(())
    }

    fn disconnect(&self, raw: SlotId) {
        if let Some(slot) = self.slots.lock().unwrap().get_mut(&raw) {
            slot.disconnect_requests += 1;
        }
    }

    fn set_timeout(&self, raw: SlotId, timeout: Duration) {
        if let Some(slot) = self.slots.lock().unwrap().get_mut(&raw) {
            slot.timeout = Some(timeout);
        }
    }
}
