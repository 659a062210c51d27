//! Generational arena. Handles stay unique across reuse of a slot, so a stale
//! handle held by the engine can never reach a newer entry.

use core::fmt;

/// Opaque handle naming one session or transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Correlation {
    index: u32,
    generation: u32,
}

impl Correlation {
    /// Packed form for engines that carry a plain integer.
    pub const fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub(crate) struct Arena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> Correlation {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.entries[index as usize];
            let generation = match slot {
                Entry::Vacant { generation } => generation.wrapping_add(1),
                Entry::Occupied { .. } => unreachable!("free list names an occupied slot"),
            };
            *slot = Entry::Occupied { generation, value };
            return Correlation { index, generation };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry::Occupied {
            generation: 0,
            value,
        });
        Correlation {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: Correlation) -> Option<&T> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: Correlation) -> Option<&mut T> {
        match self.entries.get_mut(id.index as usize)? {
            Entry::Occupied { generation, value } if *generation == id.generation => Some(value),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: Correlation) -> Option<T> {
        let slot = self.entries.get_mut(id.index as usize)?;
        match slot {
            Entry::Occupied { generation, .. } if *generation == id.generation => {}
            _ => return None,
        }
        let old = core::mem::replace(
            slot,
            Entry::Vacant {
                generation: id.generation,
            },
        );
        self.free.push(id.index);
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<(Correlation, T)> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.entries.iter_mut().enumerate() {
            if let Entry::Occupied { generation, .. } = slot {
                let generation = *generation;
                if let Entry::Occupied { value, .. } =
                    core::mem::replace(slot, Entry::Vacant { generation })
                {
                    out.push((
                        Correlation {
                            index: index as u32,
                            generation,
                        },
                        value,
                    ));
                }
                self.free.push(index as u32);
            }
        }
        self.len = 0;
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
