use std::fmt;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// One of the two buffer sets used for double buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    Zero,
    One,
}

impl Slot {
    pub const BOTH: [Slot; 2] = [Slot::Zero, Slot::One];

    pub fn index(self) -> usize {
        match self {
            Slot::Zero => 0,
            Slot::One => 1,
        }
    }

    /// Slot used by iteration `i` of an alternating schedule (`i mod 2`).
    pub fn for_iteration(i: usize) -> Self {
        if i % 2 == 0 {
            Slot::Zero
        } else {
            Slot::One
        }
    }

    pub fn flip(self) -> Self {
        match self {
            Slot::Zero => Slot::One,
            Slot::One => Slot::Zero,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.index())
    }
}

/// A fixed arena of two values addressed by [`Slot`].
///
/// The two entries are distinct allocations; nothing hands out a reference
/// that spans both except [`SlotPair::split_mut`], which borrows them
/// disjointly.
#[derive(Debug, Clone, Default)]
pub struct SlotPair<T> {
    slots: [T; 2],
}

impl<T> SlotPair<T> {
    pub fn new(zero: T, one: T) -> Self {
        Self { slots: [zero, one] }
    }

    /// Build both entries from a constructor called once per slot.
    pub fn try_from_fn<E>(mut f: impl FnMut(Slot) -> Result<T, E>) -> Result<Self, E> {
        let zero = f(Slot::Zero)?;
        let one = f(Slot::One)?;
        Ok(Self::new(zero, one))
    }

    pub fn get(&self, slot: Slot) -> &T {
        &self.slots[slot.index()]
    }

    pub fn get_mut(&mut self, slot: Slot) -> &mut T {
        &mut self.slots[slot.index()]
    }

    /// Shared access to `read` and exclusive access to the other slot.
    pub fn split_mut(&mut self, read: Slot) -> (&T, &mut T) {
        let [zero, one] = &mut self.slots;
        match read {
            Slot::Zero => (&*zero, one),
            Slot::One => (&*one, zero),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &T)> {
        Slot::BOTH.into_iter().zip(self.slots.iter())
    }

    pub fn map<U>(self, mut f: impl FnMut(Slot, T) -> U) -> SlotPair<U> {
        let [zero, one] = self.slots;
        SlotPair::new(f(Slot::Zero, zero), f(Slot::One, one))
    }
}

impl<T> Index<Slot> for SlotPair<T> {
    type Output = T;

    fn index(&self, slot: Slot) -> &T {
        self.get(slot)
    }
}

impl<T> IndexMut<Slot> for SlotPair<T> {
    fn index_mut(&mut self, slot: Slot) -> &mut T {
        self.get_mut(slot)
    }
}

/// Ping-pong state for iterative kernels: read from `current`, write to
/// the other slot, then [`swap`](PingPong::swap) by flipping the index.
#[derive(Debug, Clone)]
pub struct PingPong<T> {
    pair: SlotPair<T>,
    current: Slot,
}

impl<T> PingPong<T> {
    pub fn new(pair: SlotPair<T>) -> Self {
        Self {
            pair,
            current: Slot::Zero,
        }
    }

    pub fn current_slot(&self) -> Slot {
        self.current
    }

    pub fn current(&self) -> &T {
        self.pair.get(self.current)
    }

    /// (current, next) for one step.
    pub fn step_mut(&mut self) -> (&T, &mut T) {
        self.pair.split_mut(self.current)
    }

    pub fn swap(&mut self) {
        self.current = self.current.flip();
    }
}
