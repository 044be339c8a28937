//! Generational slab used to hand out stable, checkable keys.
//!
//! Every slot carries a generation that is bumped when the slot is vacated, so a
//! stale key that still points at a reused index is rejected instead of
//! resolving to somebody else's value.

/// Key into a [`Slab`]: slot index plus the generation it was issued for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    /// Highest index a slab will ever hand out. `u32::MAX` stays free so that
    /// `u64::MAX` can never be a valid raw key.
    const MAX_INDEX: u32 = u32::MAX - 1;

    pub(crate) fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub(crate) struct Slab<T> {
    items: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Slab<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `item` and returns the key that addresses it.
    ///
    /// # Panics
    /// Panics if the slab already holds `u32::MAX - 1` items.
    pub(crate) fn insert(&mut self, item: T) -> Key {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.items.len();
                assert!(index <= Key::MAX_INDEX as usize, "slab capacity exhausted");

                self.items.push(Entry::Vacant { generation: 0 });
                index as u32
            }
        };

        let slot = &mut self.items[index as usize];
        let generation = match *slot {
            Entry::Vacant { generation } => generation,
            Entry::Occupied { .. } => unreachable!("free list points at an occupied slot"),
        };

        *slot = Entry::Occupied {
            generation,
            value: item,
        };
        self.len += 1;

        Key { index, generation }
    }

    /// Removes and returns the item stored under `key`, if it is still there.
    pub(crate) fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.items.get_mut(key.index as usize)?;

        match slot {
            Entry::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }

        let next_generation = key.generation.wrapping_add(1);
        let previous = std::mem::replace(
            slot,
            Entry::Vacant {
                generation: next_generation,
            },
        );

        self.free.push(key.index);
        self.len -= 1;

        match previous {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: Key) -> Option<&T> {
        match self.items.get(key.index as usize)? {
            Entry::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match self.items.get_mut(key.index as usize)? {
            Entry::Occupied { generation, value } if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    /// Removes every stored item, in slot order.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.len);

        for (index, slot) in self.items.iter_mut().enumerate() {
            if let Entry::Occupied { generation, .. } = *slot {
                let previous = std::mem::replace(
                    slot,
                    Entry::Vacant {
                        generation: generation.wrapping_add(1),
                    },
                );

                if let Entry::Occupied { value, .. } = previous {
                    drained.push(value);
                }

                self.free.push(index as u32);
            }
        }

        self.len = 0;
        drained
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}
