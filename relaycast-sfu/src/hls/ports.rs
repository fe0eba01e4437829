//! Bridge slot and relay port allocation
//!
//! Slot `n` (starting at 1) owns relay port `base + (n - 1) * stride`. The
//! lowest free slot is always handed out first, so a slot released by a
//! finished bridge is reused before the port range grows.

use std::collections::BTreeSet;

#[derive(Debug)]
pub struct SlotAllocator {
    base_port: u16,
    stride: u16,
    capacity: u32,
    in_use: BTreeSet<u32>,
}

impl SlotAllocator {
    /// `max_slots == 0` means as many slots as fit below port 65535
    #[must_use]
    pub fn new(base_port: u16, stride: u16, max_slots: u32) -> Self {
        let stride = stride.max(1);
        let fit = (u32::from(u16::MAX) - u32::from(base_port)) / u32::from(stride) + 1;
        let capacity = if max_slots == 0 { fit } else { max_slots.min(fit) };

        Self {
            base_port,
            stride,
            capacity,
            in_use: BTreeSet::new(),
        }
    }

    /// Reserve the lowest free slot, returning it with its port
    pub fn acquire(&mut self) -> Option<(u32, u16)> {
        let slot = (1..=self.capacity).find(|n| !self.in_use.contains(n))?;
        let port = self.port_for(slot)?;
        self.in_use.insert(slot);
        Some((slot, port))
    }

    /// Give a slot back; returns false if it was not reserved
    pub fn release(&mut self, slot: u32) -> bool {
        self.in_use.remove(&slot)
    }

    #[must_use]
    pub fn port_for(&self, slot: u32) -> Option<u16> {
        if slot == 0 || slot > self.capacity {
            return None;
        }
        let offset = (slot - 1).checked_mul(u32::from(self.stride))?;
        u16::try_from(u32::from(self.base_port) + offset).ok()
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.len()
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }
}
